#![doc = include_str!("../README.md")]
#![forbid(unsafe_code)]

mod config;
mod context;
mod dispatcher;
pub mod http;
mod resource;

pub use config::*;
pub use context::*;
pub use dispatcher::*;
pub use resource::*;
