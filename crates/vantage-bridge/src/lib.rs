//! Client for the external line-oriented link-parser process that turns
//! one proxy URI into one JSON outbound config (§4.5).

mod bridge;
mod error;

pub use bridge::{BridgeClient, BridgeConfig};
pub use error::BridgeError;
