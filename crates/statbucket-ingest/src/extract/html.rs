//! Page-to-table locators

use scraper::{ElementRef, Html, Node, Selector};

use super::types::{Cell, TabularUnit};
use crate::error::ExtractionError;

/// Finds the tabular unit inside a fetched page
pub trait TableLocator: Send + Sync {
    fn locate(&self, page: &str) -> Result<TabularUnit, ExtractionError>;
}

/// Locates an HTML `<table>` by id, or the first table on the page.
///
/// Stats sites often ship secondary tables inside HTML comments, so comments
/// are searched when the live document has no match.
#[derive(Debug, Clone, Default)]
pub struct HtmlTableLocator {
    table_id: Option<String>,
}

impl HtmlTableLocator {
    pub fn new(table_id: Option<String>) -> Self {
        Self { table_id }
    }

    fn table_selector(&self) -> Result<Selector, ExtractionError> {
        let css = match &self.table_id {
            Some(id) => format!("table#{}", id),
            None => "table".to_string(),
        };
        selector(&css)
    }

    fn find_in(&self, document: &Html, table: &Selector) -> Result<Option<TabularUnit>, ExtractionError> {
        match document.select(table).next() {
            Some(element) => read_table(element).map(Some),
            None => Ok(None),
        }
    }
}

fn selector(css: &str) -> Result<Selector, ExtractionError> {
    Selector::parse(css).map_err(|e| ExtractionError::Malformed(format!("bad selector '{}': {:?}", css, e)))
}

fn cell_text(element: ElementRef<'_>) -> String {
    element.text().collect::<String>().trim().to_string()
}

fn is_header_row(row: ElementRef<'_>, td: &Selector) -> bool {
    let class = row.value().attr("class").unwrap_or_default();
    class.split_whitespace().any(|c| c == "thead" || c == "over_header") || row.select(td).next().is_none()
}

fn read_table(table: ElementRef<'_>) -> Result<TabularUnit, ExtractionError> {
    let header_rows = selector("thead tr")?;
    let body_rows = selector("tbody tr")?;
    let any_row = selector("tr")?;
    let th = selector("th")?;
    let td = selector("td")?;
    let cells = selector("th, td")?;
    let anchor = selector("a[href]")?;

    // Multi-row headers put group labels first; the last row names the columns.
    let header_row = table
        .select(&header_rows)
        .last()
        .or_else(|| table.select(&any_row).find(|r| r.select(&th).next().is_some()))
        .ok_or_else(|| ExtractionError::Malformed("table has no header row".into()))?;

    let headers = header_row
        .select(&th)
        .map(|h| {
            h.value()
                .attr("data-stat")
                .map(str::to_string)
                .unwrap_or_else(|| cell_text(h))
        })
        .collect::<Vec<_>>();

    let mut body: Vec<ElementRef<'_>> = table.select(&body_rows).collect();
    if body.is_empty() {
        body = table.select(&any_row).filter(|r| *r != header_row).collect();
    }

    let rows = body
        .into_iter()
        .filter(|r| !is_header_row(*r, &td))
        .map(|r| {
            r.select(&cells)
                .map(|c| Cell {
                    text: cell_text(c),
                    link: c
                        .select(&anchor)
                        .next()
                        .and_then(|a| a.value().attr("href"))
                        .map(str::to_string),
                })
                .collect()
        })
        .collect();

    Ok(TabularUnit { headers, rows })
}

impl TableLocator for HtmlTableLocator {
    fn locate(&self, page: &str) -> Result<TabularUnit, ExtractionError> {
        let table = self.table_selector()?;
        let document = Html::parse_document(page);
        if let Some(unit) = self.find_in(&document, &table)? {
            return Ok(unit);
        }

        for node in document.tree.values() {
            if let Node::Comment(comment) = node {
                if !comment.comment.contains("<table") {
                    continue;
                }
                let fragment = Html::parse_fragment(&comment.comment);
                if let Some(unit) = self.find_in(&fragment, &table)? {
                    return Ok(unit);
                }
            }
        }

        Err(ExtractionError::TableNotFound(self.table_id.clone()))
    }
}
