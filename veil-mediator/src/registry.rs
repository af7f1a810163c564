//! Registry of in-flight items awaiting a tester verdict.
//!
//! The registry is an id → suspension-handle lookup, never a queue. A
//! parked pipeline owns its entry for the entry's whole lifetime: the
//! entry is created on suspension and removed by the resolving call (or
//! by [`PendingRegistry::drain`] at shutdown), so nothing lingers once a
//! verdict is observed.

use std::collections::HashMap;
use std::sync::Mutex;

use serde_json::Value;
use tokio::sync::oneshot;
use uuid::Uuid;
use veil_common::{CaptureKind, Verdict};

struct PendingEntry {
    kind: CaptureKind,
    tx: oneshot::Sender<Verdict>,
    snapshot: Value,
}

/// Id → suspension handle lookup for suspended pipeline instances.
#[derive(Default)]
pub struct PendingRegistry {
    items: Mutex<HashMap<Uuid, PendingEntry>>,
}

impl PendingRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<Uuid, PendingEntry>> {
        self.items
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Insert a suspended item and return the handle its pipeline waits
    /// on. The receiver resolves with the verdict, or errs if the
    /// registry drains first (mediator shutdown, treated as Drop).
    pub fn park(
        &self,
        id: Uuid,
        kind: CaptureKind,
        snapshot: Value,
    ) -> oneshot::Receiver<Verdict> {
        let (tx, rx) = oneshot::channel();
        self.lock().insert(id, PendingEntry { kind, tx, snapshot });
        rx
    }

    /// Deliver a verdict. Returns false when no such id is parked,
    /// covering unknown ids and second verdicts alike. Resolution is a pure
    /// signal: no network I/O happens here.
    pub fn resolve(&self, id: Uuid, verdict: Verdict) -> bool {
        match self.lock().remove(&id) {
            Some(entry) => {
                // A dropped receiver means the pipeline already unwound;
                // the verdict was still accepted.
                let _ = entry.tx.send(verdict);
                true
            }
            None => false,
        }
    }

    pub fn exists(&self, id: Uuid) -> bool {
        self.lock().contains_key(&id)
    }

    pub fn get(&self, id: Uuid) -> Option<Value> {
        self.lock().get(&id).map(|entry| entry.snapshot.clone())
    }

    pub fn kind(&self, id: Uuid) -> Option<CaptureKind> {
        self.lock().get(&id).map(|entry| entry.kind)
    }

    /// Wake every parked item with a synthetic Drop. Used when the
    /// mediator shuts down while pipelines are still suspended.
    pub fn drain(&self) {
        for (_, entry) in self.lock().drain() {
            let _ = entry.tx.send(Verdict::Drop);
        }
    }
}
