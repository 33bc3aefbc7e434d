//! Shape extraction
//!
//! Turns a located table (header labels plus rows of cells) into named
//! values. Each header resolves to a [`ColumnHandler`]: an exact match in the
//! dataset's handler map, else the dataset fallback, else identity. Output
//! columns follow header order and then handler expansion order, so the
//! column list only depends on the headers.

pub mod extractor;
pub mod handlers;
pub mod html;
pub mod types;

pub use extractor::{normalize_headers, normalize_label, ShapeExtractor};
pub use handlers::{
    ColumnHandler, HandlerSpec, IdentityHandler, LinkSplitHandler, NumericHandler, OneToManyHandler,
};
pub use html::{HtmlTableLocator, TableLocator};
pub use types::{Cell, ExtractedRow, Extraction, Provenance, RejectedRow, TabularUnit};
