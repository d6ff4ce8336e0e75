//! Concurrent subscription fetcher: downloads each source URL, extracts
//! proxy URIs from plain text, base64 blobs, or structured JSON, and
//! inserts them into the store (§4.2).

mod collector;
mod error;
mod extract;
mod sources;

pub use collector::{CollectRunSummary, SubscriptionCollector};
pub use error::CollectorError;
pub use sources::SourceList;
