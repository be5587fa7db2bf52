//! Explicit queue registry for pipeline introspection.
//!
//! Owned by whatever composes a pipeline and dropped with it. Holds only weak
//! references, so registering a queue never extends its lifetime.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use dashmap::DashMap;
use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::core::queue::Queue;

/// Read-only view of a queue, independent of its item type.
pub trait QueueProbe: Send + Sync {
    fn name(&self) -> &str;
    fn size(&self) -> usize;
    fn is_finished(&self) -> bool;
}

/// Point-in-time state of one registered queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QueueSnapshot {
    pub name: String,
    pub size: usize,
    pub finished: bool,
}

#[derive(Debug, Default)]
pub struct QueueRegistry {
    next_id: AtomicU64,
    /// Registration order → weak probe.
    probes: DashMap<u64, Weak<dyn QueueProbe>>,
}

impl QueueRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<T: Send + 'static>(&self, queue: &Queue<T>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.probes.insert(id, queue.probe());
    }

    /// Live queues in registration order. Dropped queues are pruned.
    pub fn snapshot(&self) -> Vec<QueueSnapshot> {
        self.probes.retain(|_, probe| probe.strong_count() > 0);

        let mut live: Vec<(u64, QueueSnapshot)> = self
            .probes
            .iter()
            .filter_map(|entry| {
                let probe = entry.value().upgrade()?;
                Some((
                    *entry.key(),
                    QueueSnapshot {
                        name: probe.name().to_string(),
                        size: probe.size(),
                        finished: probe.is_finished(),
                    },
                ))
            })
            .collect();
        live.sort_by_key(|(id, _)| *id);
        live.into_iter().map(|(_, snapshot)| snapshot).collect()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.probes.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.probes.is_empty()
    }

    /// Logs a snapshot every `period` until the returned task is aborted.
    pub fn spawn_reporter(self: &Arc<Self>, period: Duration) -> JoinHandle<()> {
        let registry = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                ticker.tick().await;
                for queue in registry.snapshot() {
                    debug!(
                        target: "backflow::registry",
                        queue = %queue.name,
                        size = queue.size,
                        finished = queue.finished,
                        "queue state"
                    );
                }
            }
        })
    }
}
