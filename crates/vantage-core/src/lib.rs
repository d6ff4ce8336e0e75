//! Shared domain types for the vantage workspace: the supported-protocol
//! enum, the error taxonomy, canonical JSON helpers, and the cooperative
//! cancellation token used by every long-running component.

mod b64;
mod canon;
mod error;
mod protocol;
mod stop;

pub use b64::{decode_repaired, looks_like_base64};
pub use canon::{canonicalize_json, canonicalize_value, sha256_hex};
pub use error::{classify_add_outbound_stderr, CoreError, TestErrorCode};
pub use protocol::Protocol;
pub use stop::StopToken;
