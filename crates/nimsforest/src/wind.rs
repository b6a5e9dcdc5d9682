//! Wind: ephemeral publish/subscribe over the broker bus.
//!
//! Leaves dropped on a subject are delivered to every subscription whose
//! pattern matches. Each subscription owns a handler thread fed by an
//! order-preserving channel, so a single publisher's drops arrive in order
//! per subject per subscription. Nothing is persisted; a leaf published with
//! no matching subscription is gone.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use anyhow::Result;
use nimsforest_types::{ForestError, Leaf, subject};
use tracing::warn;

use crate::cancel::CancelToken;

/// Handler invoked once per matching leaf. Errors are logged at the
/// subscription boundary and never break the subscription.
pub type LeafHandler = Box<dyn FnMut(Leaf) -> Result<()> + Send>;

/// The in-process subject bus behind [`Wind`].
#[derive(Default, Debug)]
pub(crate) struct Bus {
    subs: Mutex<Vec<SubEntry>>,
    next_id: AtomicU64,
    running: AtomicBool,
}

#[derive(Debug)]
struct SubEntry {
    id: u64,
    pattern: String,
    tx: crossbeam_channel::Sender<Leaf>,
}

impl Bus {
    pub(crate) fn new() -> Arc<Self> {
        let bus = Arc::new(Self::default());
        bus.running.store(true, Ordering::SeqCst);
        bus
    }

    pub(crate) fn publish(&self, leaf: Leaf) -> Result<(), ForestError> {
        if !self.running.load(Ordering::SeqCst) {
            return Err(ForestError::Stopped);
        }
        let subs = self.subs.lock().unwrap();
        for entry in subs.iter() {
            if subject::matches(&entry.pattern, &leaf.subject) {
                // A disconnected receiver means the subscription is tearing
                // down; skip it.
                let _ = entry.tx.send(leaf.clone());
            }
        }
        Ok(())
    }

    fn subscribe(self: &Arc<Self>, pattern: &str, mut handler: LeafHandler) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = crossbeam_channel::unbounded::<Leaf>();
        self.subs.lock().unwrap().push(SubEntry {
            id,
            pattern: pattern.to_string(),
            tx,
        });

        let pattern_owned = pattern.to_string();
        let handle = thread::spawn(move || {
            for leaf in rx.iter() {
                if let Err(e) = handler(leaf) {
                    warn!(pattern = %pattern_owned, "leaf handler failed: {:#}", e);
                }
            }
        });

        Subscription {
            id,
            bus: Arc::clone(self),
            thread: Some(handle),
        }
    }

    fn unsubscribe(&self, id: u64) {
        self.subs.lock().unwrap().retain(|e| e.id != id);
    }

    /// Stop accepting publishes and drop every subscription sender. Handler
    /// threads drain their queues and exit.
    pub(crate) fn shutdown(&self) {
        self.running.store(false, Ordering::SeqCst);
        self.subs.lock().unwrap().clear();
    }
}

/// A live wind subscription. Cancelling (or dropping) unsubscribes; the
/// handler thread drains already-queued leaves before exiting.
pub struct Subscription {
    id: u64,
    bus: Arc<Bus>,
    thread: Option<JoinHandle<()>>,
}

impl Subscription {
    /// Unsubscribe and wait for the handler thread to drain.
    pub fn unsubscribe(mut self) {
        self.teardown();
    }

    fn teardown(&mut self) {
        self.bus.unsubscribe(self.id);
        if let Some(handle) = self.thread.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.teardown();
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription").field("id", &self.id).finish()
    }
}

/// Handle to the ephemeral pub/sub layer.
#[derive(Clone)]
pub struct Wind {
    bus: Arc<Bus>,
}

impl Wind {
    pub(crate) fn new(bus: Arc<Bus>) -> Self {
        Self { bus }
    }

    /// Publish a leaf. The subject must be a valid concrete subject; the
    /// timestamp is stamped by the caller via [`Leaf::new`].
    pub fn drop_leaf(&self, leaf: Leaf) -> Result<()> {
        leaf.validate()?;
        self.bus.publish(leaf)?;
        Ok(())
    }

    /// Cancellation-aware publish: fails with the transient `stopped` error
    /// when the token is cancelled or the bus is down.
    pub fn whisper(&self, cancel: &CancelToken, leaf: Leaf) -> Result<()> {
        if cancel.is_cancelled() {
            return Err(ForestError::Stopped.into());
        }
        self.drop_leaf(leaf)
    }

    /// Subscribe to a subject pattern. The handler is invoked on a dedicated
    /// thread, in publish order per subject.
    pub fn catch(
        &self,
        pattern: &str,
        handler: impl FnMut(Leaf) -> Result<()> + Send + 'static,
    ) -> Result<Subscription> {
        subject::validate_pattern(pattern)?;
        Ok(self.bus.subscribe(pattern, Box::new(handler)))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::Mutex;
    use std::time::Duration;

    use super::*;

    fn test_wind() -> Wind {
        Wind::new(Bus::new())
    }

    fn wait_for<F: Fn() -> bool>(cond: F) {
        for _ in 0..200 {
            if cond() {
                return;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        panic!("condition not reached in time");
    }

    #[test]
    fn drop_reaches_matching_subscription() {
        let wind = test_wind();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let _sub = wind
            .catch("lead.scored", move |leaf| {
                sink.lock().unwrap().push(leaf.subject);
                Ok(())
            })
            .expect("catch");

        wind.drop_leaf(Leaf::new("lead.scored", b"{}".to_vec(), "test"))
            .expect("drop");
        wait_for(|| !seen.lock().unwrap().is_empty());
        assert_eq!(seen.lock().unwrap().as_slice(), ["lead.scored"]);
    }

    #[test]
    fn wildcard_subscription_sees_all_tokens() {
        let wind = test_wind();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let _sub = wind
            .catch("bedrock.>", move |leaf| {
                sink.lock().unwrap().push(leaf.subject);
                Ok(())
            })
            .expect("catch");

        wind.drop_leaf(Leaf::new("bedrock.docs.file.created", b"{}".to_vec(), "t"))
            .expect("drop");
        wind.drop_leaf(Leaf::new("other.subject", b"{}".to_vec(), "t"))
            .expect("drop");
        wait_for(|| seen.lock().unwrap().len() == 1);
        assert_eq!(
            seen.lock().unwrap().as_slice(),
            ["bedrock.docs.file.created"]
        );
    }

    #[test]
    fn publish_order_is_preserved_per_subject() {
        let wind = test_wind();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let _sub = wind
            .catch("seq.test", move |leaf| {
                sink.lock().unwrap().push(String::from_utf8_lossy(&leaf.data).to_string());
                Ok(())
            })
            .expect("catch");

        for i in 0..50 {
            wind.drop_leaf(Leaf::new("seq.test", format!("{}", i).into_bytes(), "t"))
                .expect("drop");
        }
        wait_for(|| seen.lock().unwrap().len() == 50);
        let expected: Vec<String> = (0..50).map(|i| format!("{}", i)).collect();
        assert_eq!(*seen.lock().unwrap(), expected);
    }

    #[test]
    fn handler_errors_do_not_break_subscription() {
        let wind = test_wind();
        let seen = Arc::new(Mutex::new(0u32));
        let sink = Arc::clone(&seen);
        let _sub = wind
            .catch("err.test", move |_| {
                let mut n = sink.lock().unwrap();
                *n += 1;
                anyhow::bail!("handler always fails")
            })
            .expect("catch");

        wind.drop_leaf(Leaf::new("err.test", b"{}".to_vec(), "t")).unwrap();
        wind.drop_leaf(Leaf::new("err.test", b"{}".to_vec(), "t")).unwrap();
        wait_for(|| *seen.lock().unwrap() == 2);
    }

    #[test]
    fn unsubscribe_stops_delivery() {
        let wind = test_wind();
        let seen = Arc::new(Mutex::new(0u32));
        let sink = Arc::clone(&seen);
        let sub = wind
            .catch("gone.test", move |_| {
                *sink.lock().unwrap() += 1;
                Ok(())
            })
            .expect("catch");

        wind.drop_leaf(Leaf::new("gone.test", b"{}".to_vec(), "t")).unwrap();
        wait_for(|| *seen.lock().unwrap() == 1);
        sub.unsubscribe();
        wind.drop_leaf(Leaf::new("gone.test", b"{}".to_vec(), "t")).unwrap();
        std::thread::sleep(Duration::from_millis(30));
        assert_eq!(*seen.lock().unwrap(), 1);
    }

    #[test]
    fn publish_after_shutdown_is_transient_error() {
        let bus = Bus::new();
        let wind = Wind::new(Arc::clone(&bus));
        bus.shutdown();
        let err = wind
            .drop_leaf(Leaf::new("a.b", b"{}".to_vec(), "t"))
            .unwrap_err();
        assert_eq!(
            err.downcast_ref::<ForestError>(),
            Some(&ForestError::Stopped)
        );
    }

    #[test]
    fn whisper_fails_when_cancelled() {
        let wind = test_wind();
        let cancel = CancelToken::new();
        cancel.cancel();
        let err = wind
            .whisper(&cancel, Leaf::new("a.b", b"{}".to_vec(), "t"))
            .unwrap_err();
        assert_eq!(
            err.downcast_ref::<ForestError>(),
            Some(&ForestError::Stopped)
        );
    }

    #[test]
    fn invalid_subject_is_rejected() {
        let wind = test_wind();
        assert!(wind.drop_leaf(Leaf::new("", vec![], "t")).is_err());
        assert!(wind.catch("a..b", |_| Ok(())).is_err());
    }
}
