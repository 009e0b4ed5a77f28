//! Single-flight execution of expensive operations
//!
//! Concurrent callers asking for the same key share one execution: the first
//! one in becomes the leader and runs the operation, everyone else waits for
//! the leader's outcome. Nothing is cached, so the next caller after the
//! outcome has been published starts over.

use std::{collections::HashMap, future::Future, sync::Arc};

use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::{debug, Level};

use crate::{
    observability::{CoordinatorRole, METRICS},
    Error, Result,
};

/// Terminal outcome of a shared execution, `None` until it is known
type Outcome<V> = Option<Result<V, Arc<Error>>>;

pub(crate) struct Coordinator<V> {
    /// Used for logs and metrics, should be unique per instance
    name: &'static str,
    active: Mutex<HashMap<String, watch::Sender<Outcome<V>>>>,
}

enum Role<V> {
    Leader,
    Follower(watch::Receiver<Outcome<V>>),
}

/// Publishes the leader's outcome and retires the key
///
/// If the leader is dropped before it finishes, followers are told the
/// operation was canceled.
struct Publisher<'a, V> {
    coordinator: &'a Coordinator<V>,
    key: Option<String>,
}

impl<V> Publisher<'_, V> {
    fn publish(&mut self, outcome: Result<V, Arc<Error>>) {
        let Some(key) = self.key.take() else {
            return;
        };

        // Broadcast and removal happen under the same lock, so a new caller
        // either sees the finished entry or no entry at all
        let mut active = self.coordinator.active.lock();
        if let Some(sender) = active.remove(&key) {
            sender.send_replace(Some(outcome));
        }
    }
}

impl<V> Drop for Publisher<'_, V> {
    fn drop(&mut self) {
        if self.key.is_some() {
            debug!(
                name = self.coordinator.name,
                "leader dropped before finishing"
            );
            self.publish(Err(Arc::new(Error::Canceled)));
        }
    }
}

impl<V> Coordinator<V>
where
    V: Clone,
{
    pub(crate) fn new(name: &'static str) -> Self {
        Self {
            name,
            active: Mutex::new(HashMap::new()),
        }
    }

    /// Runs `producer` unless an execution for `key` is already in flight, in
    /// which case its outcome is awaited instead
    ///
    /// Errors are wrapped in [`Error::Shared`] for every caller, including
    /// the one that ran `producer`.
    #[tracing::instrument(
        level = Level::DEBUG,
        skip(self, producer),
        fields(name = self.name),
    )]
    pub(crate) async fn run<F, Fut>(&self, key: String, producer: F) -> Result<V>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V>>,
    {
        let role = {
            let mut active = self.active.lock();
            if let Some(sender) = active.get(&key) {
                Role::Follower(sender.subscribe())
            } else {
                active.insert(key.clone(), watch::channel(None).0);
                Role::Leader
            }
        };

        match role {
            Role::Leader => {
                METRICS.record_coordinator_call(self.name, CoordinatorRole::Leader);
                debug!("running as leader");

                let mut publisher = Publisher {
                    coordinator: self,
                    key: Some(key),
                };
                let outcome = producer().await.map_err(Arc::new);
                publisher.publish(outcome.clone());

                outcome.map_err(Error::Shared)
            }
            Role::Follower(mut receiver) => {
                METRICS
                    .record_coordinator_call(self.name, CoordinatorRole::Follower);
                debug!("waiting for leader");

                let outcome = match receiver.wait_for(Option::is_some).await {
                    Ok(outcome) => outcome.clone(),
                    // The sender only goes away after publishing, but don't
                    // hang if that ever changes
                    Err(_) => return Err(Error::Canceled),
                };

                match outcome {
                    Some(outcome) => outcome.map_err(Error::Shared),
                    None => Err(Error::Canceled),
                }
            }
        }
    }

    /// Number of callers currently waiting on the execution for `key`
    #[cfg(test)]
    pub(crate) fn followers(&self, key: &str) -> usize {
        self.active.lock().get(key).map_or(0, watch::Sender::receiver_count)
    }
}
