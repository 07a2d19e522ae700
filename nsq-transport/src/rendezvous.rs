//! Blocking bounded waits over asynchronous broker operations
//!
//! Transport methods are synchronous. Each transport owns a current-thread
//! runtime and drives broker futures to completion on the calling thread.
//! Calling into a [`Rendezvous`] from inside another async runtime panics.

use crate::{Error, Result};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::{Builder, Runtime};

/// Runtime plus the upper bound for a single broker round trip
#[derive(Clone)]
pub struct Rendezvous {
    runtime: Arc<Runtime>,
    operation_timeout: Duration,
}

impl Rendezvous {
    /// Start a dedicated runtime
    pub fn new(operation_timeout: Duration) -> Result<Self> {
        let runtime = Builder::new_current_thread()
            .enable_all()
            .thread_name("nsq-transport")
            .build()
            .map_err(|e| Error::TransportUnavailable(format!("Failed to start runtime: {}", e)))?;

        Ok(Self {
            runtime: Arc::new(runtime),
            operation_timeout,
        })
    }

    /// Upper bound applied by [`Rendezvous::wait`]
    pub fn operation_timeout(&self) -> Duration {
        self.operation_timeout
    }

    /// Drive a future that bounds itself
    pub fn block_on<F: Future>(&self, future: F) -> F::Output {
        self.runtime.block_on(future)
    }

    /// Drive a broker round trip, failing with [`Error::TransportUnavailable`]
    /// once the operation timeout elapses
    pub fn wait<T, F>(&self, operation: &str, future: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        let timeout = self.operation_timeout;
        self.runtime.block_on(async move {
            match tokio::time::timeout(timeout, future).await {
                Ok(result) => result,
                Err(_) => Err(Error::TransportUnavailable(format!(
                    "{} timed out after {:?}",
                    operation, timeout
                ))),
            }
        })
    }
}
