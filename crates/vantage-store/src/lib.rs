//! The embedded single-file transactional store: schema migrations, the
//! `links`/`inbound_slots` data model, and every query used by the
//! collector, pipeline, and batch test engine.

mod error;
mod grouping;
mod model;
mod records;
mod schema;
mod slots;
mod store;
mod tester;

pub use error::StoreError;
pub use model::{Record, Slot, TestOutcome};
pub use records::TagColumn;
pub use schema::{SchemaReport, TableReport};
pub use store::Store;
