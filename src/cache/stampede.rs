// Cache stampede prevention.
//
// A promise table deduplicates concurrent origin fetches for the same
// key: the first caller becomes the leader and runs the origin, every
// concurrent caller becomes a follower and awaits the leader's result.
// Table checks happen under one lock; awaiting happens outside it.

use serde_json::Value as Json;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use tracing::debug;

use crate::error::ClientError;

struct InflightEntry {
    waiters: Vec<oneshot::Sender<Result<Json, String>>>,
    created_at: Instant,
}

/// Promise table keyed by cache key.
pub struct StampedeGuard {
    inflight: parking_lot::Mutex<HashMap<String, InflightEntry>>,
    cleanup_interval: Duration,
    last_cleanup: parking_lot::Mutex<Instant>,
    prevented: AtomicU64,
}

impl Default for StampedeGuard {
    fn default() -> Self {
        Self::new(Duration::from_secs(300))
    }
}

impl StampedeGuard {
    pub fn new(cleanup_interval: Duration) -> Self {
        Self {
            inflight: parking_lot::Mutex::new(HashMap::new()),
            cleanup_interval,
            last_cleanup: parking_lot::Mutex::new(Instant::now()),
            prevented: AtomicU64::new(0),
        }
    }

    /// Run `origin` for `key`, deduplicating with any inflight run.
    ///
    /// Returns the result and whether this caller was a follower (a
    /// prevented stampede). The leader's failure propagates to every
    /// follower; the entry is removed before the error is returned.
    pub async fn get_or_run<F, Fut>(&self, key: &str, origin: F) -> (crate::Result<Json>, bool)
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = crate::Result<Json>>,
    {
        self.sweep_stale();

        // Follower: attach to the inflight run.
        let receiver = {
            let mut inflight = self.inflight.lock();
            match inflight.get_mut(key) {
                Some(entry) => {
                    let (tx, rx) = oneshot::channel();
                    entry.waiters.push(tx);
                    Some(rx)
                }
                None => {
                    inflight.insert(
                        key.to_string(),
                        InflightEntry {
                            waiters: Vec::new(),
                            created_at: Instant::now(),
                        },
                    );
                    None
                }
            }
        };

        if let Some(rx) = receiver {
            self.prevented.fetch_add(1, Ordering::Relaxed);
            debug!(key, "stampede prevented; awaiting inflight origin call");
            let result = match rx.await {
                Ok(Ok(value)) => Ok(value),
                Ok(Err(message)) => Err(ClientError::Internal(format!(
                    "shared origin call failed: {}",
                    message
                ))),
                Err(_) => Err(ClientError::Internal(
                    "shared origin call was abandoned".to_string(),
                )),
            };
            return (result, true);
        }

        // Leader: run the origin, then fan the outcome out.
        let result = origin().await;

        let waiters = {
            let mut inflight = self.inflight.lock();
            inflight
                .remove(key)
                .map(|entry| entry.waiters)
                .unwrap_or_default()
        };

        let shared = match &result {
            Ok(value) => Ok(value.clone()),
            Err(err) => Err(err.to_string()),
        };
        for waiter in waiters {
            let _ = waiter.send(shared.clone());
        }

        (result, false)
    }

    /// Number of calls that attached to an existing inflight run.
    pub fn prevented_count(&self) -> u64 {
        self.prevented.load(Ordering::Relaxed)
    }

    /// Number of currently inflight origin calls.
    pub fn active_count(&self) -> usize {
        self.inflight.lock().len()
    }

    /// Drop entries older than the cleanup interval. A dropped entry's
    /// waiters observe an abandonment error.
    fn sweep_stale(&self) {
        {
            let mut last = self.last_cleanup.lock();
            if last.elapsed() < self.cleanup_interval {
                return;
            }
            *last = Instant::now();
        }

        let mut inflight = self.inflight.lock();
        let before = inflight.len();
        inflight.retain(|_, entry| entry.created_at.elapsed() < self.cleanup_interval);
        let removed = before - inflight.len();
        if removed > 0 {
            debug!(removed, "stampede guard swept stale promises");
        }
    }

    /// Drop every inflight entry. Waiters observe abandonment errors.
    pub fn clear(&self) {
        self.inflight.lock().clear();
    }
}
