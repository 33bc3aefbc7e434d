//! A configured dataset ready to run

use std::sync::Arc;

use super::fetcher::SourceUnit;
use crate::config::DatasetDefinition;
use crate::error::ExtractionError;
use crate::extract::{HtmlTableLocator, ShapeExtractor, TableLocator};
use crate::schema::GuardPolicy;

/// Definition plus the compiled extractor and table locator
#[derive(Clone)]
pub struct DatasetPipeline {
    definition: DatasetDefinition,
    extractor: ShapeExtractor,
    locator: Arc<dyn TableLocator>,
}

impl std::fmt::Debug for DatasetPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DatasetPipeline")
            .field("definition", &self.definition)
            .field("extractor", &self.extractor)
            .finish_non_exhaustive()
    }
}

impl DatasetPipeline {
    /// Compile handlers and build an HTML locator for the definition's table id
    pub fn from_definition(definition: DatasetDefinition) -> Result<Self, ExtractionError> {
        let extractor = ShapeExtractor::from_specs(
            definition.name.clone(),
            &definition.handlers,
            definition.fallback_handler.as_ref(),
            &definition.required_columns,
        )?;
        let locator = Arc::new(HtmlTableLocator::new(definition.table_id.clone()));
        Ok(Self {
            definition,
            extractor,
            locator,
        })
    }

    pub fn with_locator(mut self, locator: Arc<dyn TableLocator>) -> Self {
        self.locator = locator;
        self
    }

    pub fn with_extractor(mut self, extractor: ShapeExtractor) -> Self {
        self.extractor = extractor;
        self
    }

    pub fn name(&self) -> &str {
        &self.definition.name
    }

    pub fn definition(&self) -> &DatasetDefinition {
        &self.definition
    }

    pub fn extractor(&self) -> &ShapeExtractor {
        &self.extractor
    }

    pub fn locator(&self) -> &dyn TableLocator {
        self.locator.as_ref()
    }

    pub fn policy(&self) -> GuardPolicy {
        GuardPolicy {
            auto_add: self.definition.auto_add,
        }
    }

    pub fn destination_table(&self) -> String {
        self.definition.destination_table()
    }

    pub fn intermediate_table(&self) -> String {
        self.definition.intermediate_table()
    }

    pub fn unit(&self, key: &str) -> SourceUnit {
        SourceUnit::from_template(&self.definition.name, key, &self.definition.url_template)
    }
}
