#![doc = include_str!("../README.md")]
#![forbid(unsafe_code)]

mod call;
mod client;
mod invocation;
mod reply;
mod transport;

pub use call::*;
pub use client::*;
pub use invocation::*;
pub use reply::*;

pub use futures::future::{AbortHandle, AbortRegistration};
