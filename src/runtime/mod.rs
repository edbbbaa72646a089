//! Thin wrappers over the ambient async runtime: task identity, spawning,
//! timeouts, and the TCP/TLS stream type used by the connection pools.

mod stream;
mod tls;

use std::{future::Future, time::Duration};

use tokio::task::JoinHandle;

pub(crate) use self::{stream::AsyncStream, tls::TlsConfig};
use crate::error::Result;

/// Spawn a task in the background to run a future.
pub(crate) fn spawn<F, O>(fut: F) -> JoinHandle<O>
where
    F: Future<Output = O> + Send + 'static,
    O: Send + 'static,
{
    tokio::task::spawn(fut)
}

/// The identity of the running task, used for request and pin affinity.
/// Returns `None` outside of a task, in which case affinity features
/// degrade to no-ops.
pub(crate) fn task_id() -> Option<tokio::task::Id> {
    tokio::task::try_id()
}

/// Await `fut`, bounding it by `duration` when one is given. An elapsed
/// timeout surfaces as a network timeout error.
pub(crate) async fn timeout<F, T>(duration: Option<Duration>, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match duration {
        Some(duration) => tokio::time::timeout(duration, fut).await?,
        None => fut.await,
    }
}
