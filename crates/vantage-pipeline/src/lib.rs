//! Normalize → build → fingerprint → group pipeline that turns a raw
//! collected URI into a tested-ready, deduplicated record (§4.3–§4.8).

mod builder;
mod error;
mod fingerprint;
mod pipeline;
mod repair;
mod split;
mod tag_allocator;

pub use builder::JsonBuilder;
pub use error::PipelineError;
pub use fingerprint::fingerprint_config;
pub use pipeline::{Pipeline, PipelineRunSummary};
pub use repair::{detect_protocol, repair_uri, RepairOutcome};
pub use split::split_multi_uri;
pub use tag_allocator::{TagAllocator, DEFAULT_TAG_PREFIX};
