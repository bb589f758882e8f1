//! Request admission queue.
//!
//! Requests bound for upstream wait here until a key is available for their
//! shard and the shard is not locked out. A single dispatcher task pops
//! entries in priority order and hands each a key snapshot through a oneshot
//! channel. Heartbeat timing for queued streaming clients is defined here;
//! the SSE writer consumes it.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::{oneshot, Notify};

use crate::core::cancel::CancelHandle;
use crate::core::error::{ProxyError, Result};
use crate::core::families::{ModelFamily, Service};
use crate::core::metrics::QUEUE_DEPTH;
use crate::services::key_pool::{KeyPool, KeySnapshot};

/// Queued streaming clients start receiving keep-alive comments after this
/// long.
pub const HEARTBEAT_AFTER: Duration = Duration::from_secs(10);
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(10);

/// Automatic re-enqueues after upstream 429s; past this the 429 surfaces.
pub const MAX_RETRIES: u32 = 3;

// Idle poll floor for the dispatcher when nothing is waiting.
const DISPATCH_IDLE: Duration = Duration::from_millis(500);

/// Partition over which key selection and queueing are independent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Shard {
    pub service: Service,
    pub family: ModelFamily,
}

pub(crate) struct Entry {
    rank: u8,
    streaming: bool,
    arrival: Instant,
    seq: u64,
    tx: oneshot::Sender<KeySnapshot>,
    cancel: CancelHandle,
}

impl Entry {
    // Smaller is dispatched first: privileged users, then streaming clients,
    // then FIFO by arrival (seq disambiguates identical instants).
    fn priority_key(&self) -> (u8, u8, Instant, u64) {
        (self.rank, !self.streaming as u8, self.arrival, self.seq)
    }
}

pub(crate) fn best_entry_index(entries: &[Entry]) -> Option<usize> {
    entries
        .iter()
        .enumerate()
        .min_by_key(|(_, e)| e.priority_key())
        .map(|(i, _)| i)
}

pub struct RequestQueue {
    pool: Arc<KeyPool>,
    shards: Mutex<HashMap<Shard, Vec<Entry>>>,
    notify: Notify,
    accepting: AtomicBool,
    seq: AtomicU64,
}

impl RequestQueue {
    pub fn new(pool: Arc<KeyPool>) -> Arc<Self> {
        Arc::new(Self {
            pool,
            shards: Mutex::new(HashMap::new()),
            notify: Notify::new(),
            accepting: AtomicBool::new(true),
            seq: AtomicU64::new(0),
        })
    }

    /// Admit a request. The returned receiver resolves with the selected key
    /// once the dispatcher reaches this entry; it fails if the proxy shuts
    /// down first.
    pub fn enqueue(
        &self,
        shard: Shard,
        rank: u8,
        streaming: bool,
        cancel: CancelHandle,
    ) -> Result<oneshot::Receiver<KeySnapshot>> {
        if !self.accepting.load(Ordering::SeqCst) {
            return Err(ProxyError::ShuttingDown);
        }
        // No enabled key serves this shard at all: fail admission cleanly
        // rather than stalling the client in the queue.
        if self.pool.available_for(shard.service, shard.family) == 0 {
            return Err(ProxyError::NoAvailableKey {
                service: shard.service,
                family: shard.family,
            });
        }

        let (tx, rx) = oneshot::channel();
        let entry = Entry {
            rank,
            streaming,
            arrival: Instant::now(),
            seq: self.seq.fetch_add(1, Ordering::Relaxed),
            tx,
            cancel,
        };

        let mut shards = self.shards.lock().unwrap();
        let entries = shards.entry(shard).or_default();
        entries.push(entry);
        set_depth_gauge(shard, entries.len());
        drop(shards);

        self.notify.notify_one();
        Ok(rx)
    }

    pub fn depth(&self, shard: Shard) -> usize {
        let shards = self.shards.lock().unwrap();
        shards.get(&shard).map(|e| e.len()).unwrap_or(0)
    }

    pub fn total_depth(&self) -> usize {
        let shards = self.shards.lock().unwrap();
        shards.values().map(|e| e.len()).sum()
    }

    pub fn is_accepting(&self) -> bool {
        self.accepting.load(Ordering::SeqCst)
    }

    /// Deny new admissions and fail every queued entry. Waiters observe a
    /// closed channel and surface 503 Shutting Down.
    pub fn shutdown(&self) {
        self.accepting.store(false, Ordering::SeqCst);
        let mut shards = self.shards.lock().unwrap();
        for (shard, entries) in shards.iter_mut() {
            entries.clear();
            set_depth_gauge(*shard, 0);
        }
        drop(shards);
        self.notify.notify_one();
    }

    /// Run the dispatch loop until the process exits. Woken by admissions,
    /// key-pool changes, and lockout expiries.
    pub fn spawn_dispatcher(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let queue = Arc::clone(self);
        let pool_events = queue.pool.events();
        tokio::spawn(async move {
            loop {
                let sleep_for = queue.dispatch_pass();
                tokio::select! {
                    _ = queue.notify.notified() => {}
                    _ = pool_events.notified() => {}
                    _ = tokio::time::sleep(sleep_for) => {}
                }
            }
        })
    }

    // One pass over all shards; returns how long to sleep absent other
    // wakeups (the nearest lockout expiry, capped by the idle floor).
    fn dispatch_pass(&self) -> Duration {
        let mut sleep_for = DISPATCH_IDLE;
        let mut shards = self.shards.lock().unwrap();

        for (shard, entries) in shards.iter_mut() {
            entries.retain(|e| !e.cancel.is_cancelled() && !e.tx.is_closed());

            while !entries.is_empty() {
                let lockout = self.pool.lockout_period(shard.service, shard.family);
                if !lockout.is_zero() {
                    sleep_for = sleep_for.min(lockout);
                    break;
                }
                match self.pool.get(shard.service, shard.family) {
                    Ok(snapshot) => {
                        let best = best_entry_index(entries).expect("non-empty");
                        let entry = entries.swap_remove(best);
                        if entry.tx.send(snapshot).is_err() {
                            // Receiver gone between retain and send; the key
                            // stays throttled by its reuse delay but unused.
                            continue;
                        }
                    }
                    // No key right now; leave the head in place.
                    Err(_) => break,
                }
            }

            set_depth_gauge(*shard, entries.len());
        }

        shards.retain(|_, entries| !entries.is_empty());
        sleep_for
    }
}

fn set_depth_gauge(shard: Shard, depth: usize) {
    QUEUE_DEPTH
        .with_label_values(&[shard.service.as_str(), shard.family.as_str()])
        .set(depth as i64);
}

/// Await the dispatcher's key handoff for a blocking (non-streaming) client.
pub async fn wait_for_key(rx: oneshot::Receiver<KeySnapshot>) -> Result<KeySnapshot> {
    rx.await.map_err(|_| ProxyError::ShuttingDown)
}
