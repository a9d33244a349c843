use crate::error::{ProxyError, Result};
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex};

type FlightResult<T> = Arc<Result<T>>;

/// Coalesces concurrent fills of the same cache key into one upstream fetch.
///
/// The first caller for a key becomes the leader: its fill runs in a spawned
/// task, so it completes (and lands in the cache) even when the leader's
/// client disconnects. Every caller, leader included, waits on a broadcast
/// of the single result.
pub struct SingleFlight<T> {
    in_flight: Arc<Mutex<HashMap<String, broadcast::Sender<FlightResult<T>>>>>,
}

impl<T> Default for SingleFlight<T> {
    fn default() -> Self {
        Self {
            in_flight: Arc::new(Mutex::new(HashMap::new())),
        }
    }
}

impl<T> SingleFlight<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `fill` for `key` unless a fill for it is already running, in which
    /// case wait for that one instead.
    pub async fn run<F, Fut>(&self, key: &str, fill: F) -> Result<T>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        // Subscribe while holding the lock so the result cannot be sent
        // between registering and listening
        let (mut rx, leader) = {
            let mut in_flight = self.in_flight.lock().await;
            match in_flight.entry(key.to_string()) {
                Entry::Occupied(entry) => (entry.get().subscribe(), false),
                Entry::Vacant(entry) => {
                    let (tx, rx) = broadcast::channel(1);
                    entry.insert(tx);
                    (rx, true)
                }
            }
        };

        if leader {
            let key = key.to_string();
            let in_flight = self.in_flight.clone();
            tokio::spawn(async move {
                let result = Arc::new(fill().await);
                let tx = in_flight.lock().await.remove(&key);
                if let Some(tx) = tx {
                    let _ = tx.send(result);
                }
            });
        } else {
            tracing::debug!(key = %key, "Joining in-flight fill");
        }

        match rx.recv().await {
            Ok(result) => match result.as_ref() {
                Ok(value) => Ok(value.clone()),
                Err(e) => Err(e.replay()),
            },
            Err(e) => Err(ProxyError::Cache(format!(
                "fill for {} ended without a result: {}",
                key, e
            ))),
        }
    }

    /// Number of keys currently being filled
    pub async fn in_flight(&self) -> usize {
        self.in_flight.lock().await.len()
    }
}
