//! A client-side driver core for a replicated document database organized as
//! a replica set: one primary accepting writes, secondaries replicating it,
//! and optional voting-only arbiters.
//!
//! Given a seed list of endpoints, [`ReplicaSetClient`] presents a single
//! logical connection that:
//!
//! - continuously discovers and tracks the true membership and roles of the
//!   set through a background monitor;
//! - routes each operation to a member consistent with the caller's
//!   [`ReadPreference`], retrying across members on transient failures;
//! - maintains a connection pool per member, with per-task socket affinity
//!   inside a [`Request`](crate::Request) bracket.
//!
//! Message construction and document encoding are collaborators' concerns:
//! the router accepts already-framed [`RawMessage`] bytes and delegates
//! payloads to the `bson` crate.
//!
//! ```no_run
//! use replset_client::{ClientOptions, ReplicaSetClient};
//!
//! # async fn example() -> replset_client::Result<()> {
//! let options = ClientOptions::parse("db0:27017,db1:27017", "rs0")?;
//! let client = ReplicaSetClient::connect(options).await?;
//! println!("primary: {:?}", client.primary());
//! client.close().await;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::cast_possible_truncation)]

#[macro_use]
pub mod read_preference;

mod auth;
mod client;
pub mod error;
mod options;
mod pool;
mod runtime;
#[cfg(test)]
pub(crate) mod testutil;
mod topology;
mod wire;

pub use auth::Credential;
pub use client::{ReplicaSetClient, Request, UseConnection};
pub use error::{CommandError, Error, ErrorKind, Result};
pub use options::{Acknowledgment, ClientOptions, ServerAddress, TlsOptions, WriteConcern};
pub use read_preference::{ReadMode, ReadPreference, TagSet};
pub use topology::monitor::shutdown_monitors;
pub use wire::RawMessage;
