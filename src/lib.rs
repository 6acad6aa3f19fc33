//! Orpc: an asynchronous, connection-oriented RPC runtime.
//!
//! A server dispatches requests to registered services over a framed,
//! self-describing codec; a pipelining client multiplexes many in-flight
//! calls over one connection; a heartbeat-based registry and discovery
//! layer let a [`smart_client::SmartClient`] find and load-balance across
//! a changing set of servers.
//!
//! See `service` for registration, `server`/`client` for the connection
//! protocol, and `registry`/`discovery`/`smart_client` for the discovery
//! layer built on top of it.

pub mod client;
pub mod codec;
pub mod discovery;
pub mod error;
pub mod registry;
pub mod server;
pub mod service;
pub mod smart_client;

pub use codec::{CodecType, ConnOptions, Header, MAGIC_NUMBER};
pub use error::{DiscoveryError, OrpcError, Result};
pub use service::{ServiceBuilder, ServiceDescriptor, ServiceRegistrar};
