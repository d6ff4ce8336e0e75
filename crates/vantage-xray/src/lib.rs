//! CLI-based control client for a running Xray instance's API server:
//! list/add/remove inbounds and outbounds, apply routing rules (§4.9).

mod client;
mod error;

pub use client::{AddResult, CmdResult, XrayClient};
pub use error::XrayError;
