use std::collections::HashSet;
use std::mem;
use std::sync::{Arc, Mutex, PoisonError};
use tlf_core::{NodeChange, TlfHandle, WriteRange};
use tokio::sync::RwLock;

/// Receives change notifications from a folder engine.
#[async_trait::async_trait]
pub trait Observer: Send + Sync + 'static {
    /// A local write to a file that has not been flushed yet.
    async fn local_change(&self, change: &NodeChange, write: WriteRange);

    /// Paths whose cached state is stale, after a local operation, a
    /// remote update, a fast-forward or an unstage.
    async fn batch_changes(&self, changes: &[NodeChange]);

    async fn tlf_handle_change(&self, handle: &TlfHandle);
}

/// Drops repeated changes, keeping the first occurrence of each.
pub(crate) fn dedup(changes: impl IntoIterator<Item = NodeChange>) -> Vec<NodeChange> {
    let mut seen = HashSet::new();
    changes
        .into_iter()
        .filter(|c| seen.insert(c.clone()))
        .collect()
}

enum Deferred {
    Batch(Vec<NodeChange>),
    Handle(TlfHandle),
}

/// Registered observers, plus the notifications produced while
/// `md_writer` was held. Those are queued with the `defer_*` methods and
/// delivered by [`Observers::flush`] once the lock is released, so an
/// observer may call back into the engine.
#[derive(Default)]
pub(crate) struct Observers {
    list: RwLock<Vec<Arc<dyn Observer>>>,
    deferred: Mutex<Vec<Deferred>>,
}

impl Observers {
    pub async fn register(&self, observer: Arc<dyn Observer>) {
        self.list.write().await.push(observer);
    }

    async fn snapshot(&self) -> Vec<Arc<dyn Observer>> {
        self.list.read().await.clone()
    }

    pub async fn local_change(&self, change: &NodeChange, write: WriteRange) {
        for o in self.snapshot().await {
            o.local_change(change, write).await;
        }
    }

    pub async fn batch_changes(&self, changes: Vec<NodeChange>) {
        let changes = dedup(changes);
        if changes.is_empty() {
            return;
        }
        for o in self.snapshot().await {
            o.batch_changes(&changes).await;
        }
    }

    pub async fn tlf_handle_change(&self, handle: &TlfHandle) {
        for o in self.snapshot().await {
            o.tlf_handle_change(handle).await;
        }
    }

    fn defer(&self, item: Deferred) {
        self.deferred
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(item);
    }

    pub fn defer_batch(&self, changes: Vec<NodeChange>) {
        self.defer(Deferred::Batch(changes));
    }

    pub fn defer_handle_change(&self, handle: TlfHandle) {
        self.defer(Deferred::Handle(handle));
    }

    /// Delivers the deferred notifications in the order they were queued.
    /// Call with no engine lock held.
    pub async fn flush(&self) {
        let pending = mem::take(
            &mut *self
                .deferred
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
        );
        for item in pending {
            match item {
                Deferred::Batch(changes) => self.batch_changes(changes).await,
                Deferred::Handle(handle) => self.tlf_handle_change(&handle).await,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<String>>,
    }

    #[async_trait::async_trait]
    impl Observer for Recorder {
        async fn local_change(&self, _change: &NodeChange, _write: WriteRange) {}

        async fn batch_changes(&self, changes: &[NodeChange]) {
            let mut seen = self.seen.lock().unwrap();
            seen.extend(changes.iter().map(|c| c.dir.clone()));
        }

        async fn tlf_handle_change(&self, handle: &TlfHandle) {
            self.seen.lock().unwrap().push(handle.canonical_name());
        }
    }

    #[tokio::test]
    async fn deferred_notifications_wait_for_flush() {
        let observers = Observers::default();
        let recorder = Arc::new(Recorder::default());
        observers.register(recorder.clone()).await;

        let change = |dir: &str| NodeChange {
            dir: dir.into(),
            name: None,
        };
        observers.defer_batch(vec![change("/a")]);
        observers.defer_batch(Vec::new());
        observers.defer_batch(vec![change("/b")]);
        assert!(recorder.seen.lock().unwrap().is_empty());

        observers.flush().await;
        assert_eq!(*recorder.seen.lock().unwrap(), vec!["/a", "/b"]);
        observers.flush().await;
        assert_eq!(recorder.seen.lock().unwrap().len(), 2);
    }

    #[test]
    fn dedup_keeps_first_occurrence() {
        let c = |dir: &str, name: Option<&str>| NodeChange {
            dir: dir.into(),
            name: name.map(Into::into),
        };
        let out = dedup(vec![
            c("/", None),
            c("/", Some("a")),
            c("/", None),
            c("/d", None),
        ]);
        assert_eq!(out, vec![c("/", None), c("/", Some("a")), c("/d", None)]);
    }
}
