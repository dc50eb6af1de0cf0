#![doc = include_str!("../README.md")]
#![forbid(unsafe_code)]

mod cache;
mod envelope;
mod error;
mod key;
mod response;
mod wire;

pub use cache::*;
pub use envelope::*;
pub use error::*;
pub use key::*;
pub use response::*;
pub use wire::*;

// Re-exported so downstream crates agree on the exact versions used in public signatures.
pub use bytes::Bytes;
pub use http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
pub use serde_json::Value;
