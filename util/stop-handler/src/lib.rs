//! Shutdown plumbing for Evochora background services.
//!
//! A service thread owns a signal receiver; the [`StopHandler`] owns the
//! matching sender plus the join handle. Dropping or stopping the handler
//! signals the thread and, for owned handlers, joins it. Stopping twice is
//! harmless.

use evochora_channel::Sender;
use evochora_logger::warn;
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

/// The inner state shared between clones of one [`StopHandler`].
struct Inner<T> {
    signal: Sender<T>,
    thread: Option<JoinHandle<()>>,
}

/// Stops a background service thread through its signal channel.
pub struct StopHandler<T> {
    name: String,
    inner: Arc<Mutex<Option<Inner<T>>>>,
    stop_on_drop: bool,
}

impl<T> Clone for StopHandler<T> {
    fn clone(&self) -> Self {
        StopHandler {
            name: self.name.clone(),
            inner: Arc::clone(&self.inner),
            stop_on_drop: false,
        }
    }
}

impl<T: Send + 'static> StopHandler<T> {
    /// Creates a handler owning `signal` and the service thread.
    ///
    /// The handler returned from `new` stops the service when dropped;
    /// clones never do.
    pub fn new(name: &str, signal: Sender<T>, thread: JoinHandle<()>) -> StopHandler<T> {
        StopHandler {
            name: name.to_owned(),
            inner: Arc::new(Mutex::new(Some(Inner {
                signal,
                thread: Some(thread),
            }))),
            stop_on_drop: true,
        }
    }

    /// Sends the stop signal and joins the service thread. Idempotent.
    pub fn try_stop(&self, signal: T) {
        let inner = {
            let mut guard = match self.inner.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            guard.take()
        };
        if let Some(inner) = inner {
            if inner.signal.send(signal).is_err() {
                warn!("StopHandler {}: service already exited", self.name);
            }
            if let Some(thread) = inner.thread {
                if thread.join().is_err() {
                    warn!("StopHandler {}: service thread panicked", self.name);
                }
            }
        }
    }
}

impl<T: Send + Default + 'static> StopHandler<T> {
    /// `try_stop` with the default signal value.
    pub fn stop(&self) {
        self.try_stop(T::default());
    }
}

impl<T> Drop for StopHandler<T> {
    fn drop(&mut self) {
        if !self.stop_on_drop {
            return;
        }
        let inner = {
            let mut guard = match self.inner.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            guard.take()
        };
        if let Some(inner) = inner {
            // Drop cannot construct a T; closing the signal channel is
            // enough for services selecting on the receiver.
            drop(inner.signal);
            if let Some(thread) = inner.thread {
                if thread.join().is_err() {
                    warn!("StopHandler {}: service thread panicked", self.name);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::StopHandler;
    use evochora_channel::{bounded, RecvError};
    use std::thread;

    #[test]
    fn stop_joins_the_service_thread() {
        let (tx, rx) = bounded::<()>(1);
        let thread = thread::Builder::new()
            .name("svc".into())
            .spawn(move || {
                let _ = rx.recv();
            })
            .expect("spawn service");
        let handler = StopHandler::new("svc", tx, thread);
        handler.stop();
        // second stop is a no-op
        handler.stop();
    }

    #[test]
    fn drop_closes_the_signal_channel() {
        let (tx, rx) = bounded::<()>(1);
        let (done_tx, done_rx) = bounded::<()>(1);
        let thread = thread::Builder::new()
            .name("svc".into())
            .spawn(move || {
                assert_eq!(rx.recv(), Err(RecvError));
                let _ = done_tx.send(());
            })
            .expect("spawn service");
        let handler = StopHandler::new("svc", tx, thread);
        drop(handler);
        done_rx.recv().expect("service observed channel close");
    }
}
