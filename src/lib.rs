//! Worker-side request engine of a sharded analytic database.
//!
//! The engine accepts typed administrative requests from a central
//! controller and executes them against the worker's local state: a
//! MySQL/MariaDB instance and a data directory of partitioned chunk files.
//! Requests are scheduled by priority on a fixed pool of OS threads,
//! executed in bounded re-entrant steps, and exposed through a uniform
//! submit / status / track / stop / dispose surface.
//!
//! The database client itself is out of scope: the embedder supplies a
//! [`db::Connection`] implementation through a [`db::Connector`].

pub mod catalog;
pub mod checksum;
pub mod config;
pub mod context;
pub mod db;
pub mod error;
pub mod expiry;
pub mod factory;
pub mod fileclient;
pub mod fileproto;
pub mod fsname;
pub mod namedlock;
pub mod processor;
pub mod proto;
pub mod replica;
pub mod request;
pub mod transfer;

pub use config::{Config, ConnectionParams, Technology};
pub use context::EngineContext;
pub use error::{Error, Result, ServerError};
pub use processor::Processor;
pub use proto::{QueuedRequestHdr, ServiceState, SqlRequestType, Status, StatusExt};
pub use replica::{FileInfo, ReplicaInfo, ReplicaStatus};
pub use request::Request;
pub use request::payload::RequestSpec;

#[cfg(test)]
mod fsname_test;
