//! # Execution Bridge
//!
//! Lets plain threads and async tasks drive the same device. All device work runs
//! on one tokio runtime; blocking callers hand their operation to that runtime and
//! park until the result comes back.
//!
//! When a device is created inside a runtime it joins that runtime. Otherwise it
//! owns a small multi threaded runtime of its own which is shut down when the
//! bridge is dropped.

pub mod gate;

pub use gate::{Gate, Signals};

use std::future::Future;
use thiserror::Error;
use tokio::runtime::{Builder, Handle, Runtime};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::debug;

#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("Runtime error: {0}")]
    Runtime(String),

    #[error("Operation was cancelled before it completed")]
    Cancelled,
}

pub struct Bridge {
    handle: Handle,
    runtime: Option<Runtime>,
}

impl Bridge {
    /// Joins the current runtime, or starts an owned one outside of any runtime.
    pub fn current_or_owned() -> Result<Self, BridgeError> {
        match Handle::try_current() {
            Ok(handle) => Ok(Self::attached(handle)),
            Err(_) => Self::owned(),
        }
    }

    pub fn attached(handle: Handle) -> Self {
        Self {
            handle,
            runtime: None,
        }
    }

    pub fn owned() -> Result<Self, BridgeError> {
        let runtime = Builder::new_multi_thread()
            .worker_threads(2)
            .thread_name("device-scheduler")
            .enable_all()
            .build()
            .map_err(|e| BridgeError::Runtime(e.to_string()))?;
        debug!("Started owned device runtime");
        Ok(Self {
            handle: runtime.handle().clone(),
            runtime: Some(runtime),
        })
    }

    pub fn handle(&self) -> &Handle {
        &self.handle
    }

    pub fn is_owned(&self) -> bool {
        self.runtime.is_some()
    }

    pub fn spawn<F>(&self, future: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.handle.spawn(future)
    }

    /// Runs `future` on the bridge runtime and parks the calling thread until it
    /// finishes. Must not be called from an async context.
    pub fn block_on<F>(&self, future: F) -> Result<F::Output, BridgeError>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        block_on(&self.handle, future)
    }
}

impl Drop for Bridge {
    fn drop(&mut self) {
        if let Some(runtime) = self.runtime.take() {
            debug!("Shutting down owned device runtime");
            runtime.shutdown_background();
        }
    }
}

/// Runs `future` on `handle` and waits for its output from a plain thread.
pub fn block_on<F>(handle: &Handle, future: F) -> Result<F::Output, BridgeError>
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
{
    let (response_tx, response_rx) = oneshot::channel();
    handle.spawn(async move {
        let _ = response_tx.send(future.await);
    });
    response_rx.blocking_recv().map_err(|_| BridgeError::Cancelled)
}
