//! Schema catalog, drift detection and guard policy
//!
//! The catalog owns one current [`SchemaSnapshot`] per dataset plus every
//! prior one, and the log of [`SchemaChange`]s. Observing an extraction diffs
//! its columns against the current snapshot and decides whether the run may
//! persist rows:
//!
//! - removed columns always halt
//! - added columns halt unless the dataset allows auto-add, in which case an
//!   approved change is recorded for a migration to apply
//! - operator rejections are remembered so the same drift does not halt again

pub mod catalog;
pub mod diff;
pub mod guard;
pub mod types;

pub use catalog::{plan_structure, SchemaCatalog};
pub use diff::SchemaDiff;
pub use guard::{GuardOutcome, GuardPolicy};
pub use types::{ChangeKind, ChangeStatus, ColumnDescriptor, SchemaChange, SchemaSnapshot};
