//! Isolated subprocess execution for components that cannot safely share the
//! parent process (metadata parsers linked against thread-unsafe native
//! code, chiefly).
//!
//! A `RemoteObject` names its calls, return value, and callback events as
//! explicit serde types; `ChildProcess` ships each call to a host over a
//! framed pipe protocol and mirrors the object's state both ways. The host
//! is normally a spawned process (`ProcessTransport`) speaking on stdio; an
//! in-process `ThreadTransport` serves the same protocol over a socket pair
//! when isolation is not wanted.

mod client;
mod fetch_service;
mod host;
mod proto;

pub use client::{
    ChildError, ChildProcess, Connection, ConnectionGuard, HostCommand, ProcessTransport,
    Transport,
};
#[cfg(unix)]
pub use client::ThreadTransport;
pub use fetch_service::{FetchCall, FetchEvent, FetchService};
pub use host::{serve, serve_stdio, Outbox};
pub use proto::LogLevel;

use serde::de::DeserializeOwned;
use serde::Serialize;

/// An object whose calls run in a host, one at a time.
///
/// The object's serialized form IS the protocol's state record: fields that
/// cannot serialize (locks, sockets, handles) cannot be part of a
/// `RemoteObject` in the first place.
pub trait RemoteObject: Serialize + DeserializeOwned + Send + 'static {
    /// Enumerated calls; one variant per remote method.
    type Call: Serialize + DeserializeOwned + Send + 'static;
    type Value: Serialize + DeserializeOwned + Send + 'static;
    /// Parent-side callback payload (progress reports and the like).
    type Event: Serialize + DeserializeOwned + Send + 'static;

    fn dispatch(&mut self, call: Self::Call, outbox: &Outbox<Self::Event>)
        -> Result<Self::Value, String>;
}
