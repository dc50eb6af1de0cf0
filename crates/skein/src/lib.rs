#![doc = include_str!("../README.md")]
#![forbid(unsafe_code)]

pub use skein_core::*;

#[cfg(feature = "client")]
pub use skein_client as client;

#[cfg(feature = "server")]
pub use skein_server as server;

/// Prelude module for convenient imports.
///
/// ```ignore
/// use skein::prelude::*;
/// ```
pub mod prelude {
    pub use skein_core::{CacheDirective, EphemeralCache, ResponseType, RpcError, RpcResponse};

    #[cfg(feature = "client")]
    pub use skein_client::{Batch, Call, CallOptions, Client, ClientConfig, Payload, Reply};

    #[cfg(feature = "server")]
    pub use skein_server::{Args, CallContext, Dispatcher, DispatcherConfig, Namespace};
}
