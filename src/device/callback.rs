//! User callbacks in their two flavours.
//!
//! A blocking callback is a plain function; it runs on tokio's blocking pool and
//! may call the `blocking_` device operations. A cooperative callback returns a
//! future that runs on the device runtime and uses the async operations.

use super::DeviceHandle;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::error;

type BoxFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

pub enum Handler<A> {
    Blocking(Arc<dyn Fn(DeviceHandle, A) + Send + Sync>),
    Cooperative(Arc<dyn Fn(DeviceHandle, A) -> BoxFuture + Send + Sync>),
}

/// Runs on connect and on every interval tick.
pub type Callback = Handler<()>;

/// Receives the payload of a command message.
pub type CommandHandler = Handler<String>;

impl<A: Send + 'static> Handler<A> {
    pub fn blocking<F>(callback: F) -> Self
    where
        F: Fn(DeviceHandle, A) + Send + Sync + 'static,
    {
        Handler::Blocking(Arc::new(callback))
    }

    pub fn cooperative<F, Fut>(callback: F) -> Self
    where
        F: Fn(DeviceHandle, A) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        Handler::Cooperative(Arc::new(move |device, argument| {
            Box::pin(callback(device, argument)) as BoxFuture
        }))
    }

    /// Runs the callback to completion. A panicking callback is logged.
    pub async fn run(&self, device: DeviceHandle, argument: A) {
        let outcome = match self {
            Handler::Blocking(callback) => {
                let callback = callback.clone();
                tokio::task::spawn_blocking(move || callback(device, argument)).await
            }
            Handler::Cooperative(callback) => tokio::spawn(callback(device, argument)).await,
        };
        if let Err(e) = outcome {
            error!("Callback failed: {}", e);
        }
    }

    /// Starts the callback without waiting for it.
    pub fn dispatch(&self, device: DeviceHandle, argument: A) -> JoinHandle<()> {
        let handler = self.clone();
        tokio::spawn(async move { handler.run(device, argument).await })
    }
}

impl<A> Clone for Handler<A> {
    fn clone(&self) -> Self {
        match self {
            Handler::Blocking(callback) => Handler::Blocking(callback.clone()),
            Handler::Cooperative(callback) => Handler::Cooperative(callback.clone()),
        }
    }
}

impl<A> fmt::Debug for Handler<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Handler::Blocking(_) => f.write_str("Handler::Blocking"),
            Handler::Cooperative(_) => f.write_str("Handler::Cooperative"),
        }
    }
}
