//! DSI runtime: a client/server RPC engine over which typed, versioned
//! service interfaces communicate across process and machine boundaries.
//!
//! Proxies and stubs are attached to a [`CommEngine`], which owns the event
//! loop, multiplexes all I/O and brokers connections through the external
//! servicebroker daemon.

pub mod broker;
pub mod channel;
pub mod client;
pub mod config;
pub mod connect;
pub mod dispatch;
pub mod engine;
pub mod error;
pub mod frame;
pub mod server;
pub mod sys;

#[cfg(test)]
pub(crate) mod testutil;

pub use crate::client::{ClientCtx, ClientState, Proxy, ResponseHandle};
pub use crate::config::Config;
pub use crate::dispatch::StopHandle;
pub use crate::engine::{CommEngine, DataDirection, EngineCore, IoResult};
pub use crate::error::{ErrorType, NetError, NetResult};
pub use crate::server::{RequestHandle, ServerCtx, ServerState, Stub};

/// Index of a client or server within its engine.
pub type EndpointId = usize;
