//! Fire-and-forget routing of envelopes to their recipients.
//!
//! Producers push into a bounded `broadcast` ring and return immediately.
//! One worker drains it. When producers outrun the worker the oldest events
//! are overwritten and the worker counts what it missed.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{debug, info, warn};

use super::{Envelope, SessionRegistry};

#[derive(Debug, Clone)]
pub struct DispatchConfig {
    /// Envelopes held before the oldest is overwritten
    pub queue_capacity: usize,
    /// How long the worker waits on one recipient's outbox
    pub delivery_timeout: Duration,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 100,
            delivery_timeout: Duration::from_secs(10),
        }
    }
}

impl DispatchConfig {
    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity;
        self
    }

    pub fn with_delivery_timeout(mut self, timeout: Duration) -> Self {
        self.delivery_timeout = timeout;
        self
    }
}

/// Counters snapshot
#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct DispatchStats {
    pub enqueued: u64,
    pub delivered: u64,
    pub dropped_offline: u64,
    pub dropped_failed: u64,
    pub dropped_lagged: u64,
    pub dropped_unaddressed: u64,
}

#[derive(Default)]
struct AtomicDispatchStats {
    enqueued: AtomicU64,
    delivered: AtomicU64,
    dropped_offline: AtomicU64,
    dropped_failed: AtomicU64,
    dropped_lagged: AtomicU64,
    dropped_unaddressed: AtomicU64,
}

impl AtomicDispatchStats {
    fn snapshot(&self) -> DispatchStats {
        DispatchStats {
            enqueued: self.enqueued.load(Ordering::Relaxed),
            delivered: self.delivered.load(Ordering::Relaxed),
            dropped_offline: self.dropped_offline.load(Ordering::Relaxed),
            dropped_failed: self.dropped_failed.load(Ordering::Relaxed),
            dropped_lagged: self.dropped_lagged.load(Ordering::Relaxed),
            dropped_unaddressed: self.dropped_unaddressed.load(Ordering::Relaxed),
        }
    }
}

/// Producer handle; cheap to clone
#[derive(Clone)]
pub struct Dispatcher {
    queue: broadcast::Sender<Envelope>,
    stats: Arc<AtomicDispatchStats>,
}

/// The single consumer of the dispatch queue
pub struct DispatchWorker {
    queue: broadcast::Receiver<Envelope>,
    registry: Arc<SessionRegistry>,
    stats: Arc<AtomicDispatchStats>,
    delivery_timeout: Duration,
}

impl Dispatcher {
    pub fn new(registry: Arc<SessionRegistry>, config: DispatchConfig) -> (Self, DispatchWorker) {
        let (queue, rx) = broadcast::channel(config.queue_capacity.max(1));
        let stats = Arc::new(AtomicDispatchStats::default());

        let dispatcher = Self {
            queue,
            stats: stats.clone(),
        };
        let worker = DispatchWorker {
            queue: rx,
            registry,
            stats,
            delivery_timeout: config.delivery_timeout,
        };
        (dispatcher, worker)
    }

    /// Enqueue for delivery. Never blocks and never fails the caller.
    pub fn send(&self, envelope: Envelope) {
        if envelope.recipient.is_none() {
            self.stats.dropped_unaddressed.fetch_add(1, Ordering::Relaxed);
            warn!("Dropping {} event without recipient", envelope.kind);
            return;
        }

        let kind = envelope.kind;
        match self.queue.send(envelope) {
            Ok(_) => {
                self.stats.enqueued.fetch_add(1, Ordering::Relaxed);
            }
            Err(_) => {
                // Worker has exited; we are shutting down.
                self.stats.dropped_failed.fetch_add(1, Ordering::Relaxed);
                debug!("Dispatch worker gone, dropped {} event", kind);
            }
        }
    }

    pub fn stats(&self) -> DispatchStats {
        self.stats.snapshot()
    }
}

impl DispatchWorker {
    /// Drain the queue until shutdown is signalled
    pub async fn run(mut self, mut shutdown: broadcast::Receiver<()>) {
        info!("Dispatch worker started");
        loop {
            tokio::select! {
                next = self.queue.recv() => match next {
                    Ok(envelope) => self.deliver(envelope).await,
                    Err(RecvError::Lagged(missed)) => {
                        self.stats.dropped_lagged.fetch_add(missed, Ordering::Relaxed);
                        warn!("Dispatch queue overflowed, {} oldest events dropped", missed);
                    }
                    Err(RecvError::Closed) => break,
                },
                _ = shutdown.recv() => break,
            }
        }
        info!("Dispatch worker shutting down");
    }

    async fn deliver(&self, envelope: Envelope) {
        let Some(recipient) = envelope.recipient else {
            self.stats.dropped_unaddressed.fetch_add(1, Ordering::Relaxed);
            return;
        };
        let kind = envelope.kind;

        let Some(session) = self.registry.get(recipient) else {
            self.stats.dropped_offline.fetch_add(1, Ordering::Relaxed);
            debug!(user_id = %recipient, "Recipient offline, dropped {} event", kind);
            return;
        };

        match session.deliver(envelope, self.delivery_timeout).await {
            Ok(()) => {
                self.stats.delivered.fetch_add(1, Ordering::Relaxed);
                debug!(user_id = %recipient, "Delivered {} event", kind);
            }
            Err(e) => {
                self.stats.dropped_failed.fetch_add(1, Ordering::Relaxed);
                warn!(user_id = %recipient, "Dropped {} event: {}; tearing session down", kind, e);
                self.registry.release(&session);
            }
        }
    }
}
