//! Completion gates shared between async tasks and blocking threads.
//!
//! A [`Gate`] is a settable flag. Async waiters park on a [`Notify`], blocking
//! waiters on a [`Condvar`]; `signal` wakes both kinds.

use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tokio::sync::Notify;

#[derive(Debug, Default)]
pub struct Gate {
    set: Mutex<bool>,
    condvar: Condvar,
    notify: Notify,
}

impl Gate {
    pub fn new() -> Self {
        Self::default()
    }

    fn flag(&self) -> MutexGuard<'_, bool> {
        self.set.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn signal(&self) {
        *self.flag() = true;
        self.condvar.notify_all();
        self.notify.notify_waiters();
    }

    pub fn reset(&self) {
        *self.flag() = false;
    }

    pub fn is_set(&self) -> bool {
        *self.flag()
    }

    /// Waits until the gate is set.
    pub async fn wait(&self) {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.is_set() {
                return;
            }
            notified.await;
        }
    }

    /// Waits until the gate is set, then clears it for the next round.
    pub async fn wait_and_reset(&self) {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let mut set = self.flag();
                if *set {
                    *set = false;
                    return;
                }
            }
            notified.await;
        }
    }

    pub fn wait_blocking(&self) {
        let mut set = self.flag();
        while !*set {
            set = self
                .condvar
                .wait(set)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    pub fn wait_blocking_and_reset(&self) {
        let mut set = self.flag();
        while !*set {
            set = self
                .condvar
                .wait(set)
                .unwrap_or_else(PoisonError::into_inner);
        }
        *set = false;
    }

    /// Returns whether the gate was set before `limit` elapsed.
    pub fn wait_blocking_timeout(&self, limit: Duration) -> bool {
        let deadline = Instant::now() + limit;
        let mut set = self.flag();
        while !*set {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            let (guard, _) = self
                .condvar
                .wait_timeout(set, deadline - now)
                .unwrap_or_else(PoisonError::into_inner);
            set = guard;
        }
        true
    }
}

/// The gates of one device.
#[derive(Debug, Default)]
pub struct Signals {
    /// Broker accepted the session.
    pub connected: Gate,
    /// Discovery published and device announced online.
    pub available: Gate,
    /// The broker echoed a status publish back.
    pub status_ack: Gate,
    /// Stop completed.
    pub stopped: Gate,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn async_waiter_wakes_on_signal() {
        let gate = Arc::new(Gate::new());
        let waiter = {
            let gate = gate.clone();
            tokio::spawn(async move { gate.wait().await })
        };
        tokio::task::yield_now().await;
        gate.signal();
        waiter.await.unwrap();
        assert!(gate.is_set());
    }

    #[test]
    fn blocking_waiter_wakes_on_signal() {
        let gate = Arc::new(Gate::new());
        let signaller = {
            let gate = gate.clone();
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(10));
                gate.signal();
            })
        };
        gate.wait_blocking_and_reset();
        assert!(!gate.is_set());
        signaller.join().unwrap();
    }

    #[test]
    fn blocking_timeout_expires() {
        let gate = Gate::new();
        assert!(!gate.wait_blocking_timeout(Duration::from_millis(5)));
        gate.signal();
        assert!(gate.wait_blocking_timeout(Duration::from_millis(5)));
    }

    #[tokio::test]
    async fn wait_and_reset_consumes_one_signal() {
        let gate = Gate::new();
        gate.signal();
        gate.wait_and_reset().await;
        assert!(!gate.is_set());
    }
}
