use std::collections::{HashMap, HashSet};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::record::MemberRecord;
use crate::store::CoordinationStore;

type Callback = Arc<dyn Fn(&MemberRecord) + Send + Sync>;

/// Lets `members()` hand out a stable snapshot without locking the membership map for the
/// whole duration of a caller's iteration. While at least one [`BlockGuard`] is alive, the
/// notification worker finishes any callback it is mid-way through and then waits before
/// dequeuing the next child-set delta, so the map it would otherwise mutate stays put.
pub struct CallbackBlocker {
    count: AtomicUsize,
    notify: Notify,
}

impl CallbackBlocker {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            count: AtomicUsize::new(0),
            notify: Notify::new(),
        })
    }

    fn block(self: &Arc<Self>) -> BlockGuard {
        self.count.fetch_add(1, Ordering::SeqCst);
        BlockGuard { blocker: self.clone() }
    }

    async fn wait_until_clear(&self) {
        loop {
            let notified = self.notify.notified();
            if self.count.load(Ordering::SeqCst) == 0 {
                return;
            }
            notified.await;
        }
    }
}

struct BlockGuard {
    blocker: Arc<CallbackBlocker>,
}

impl Drop for BlockGuard {
    fn drop(&mut self) {
        if self.blocker.count.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.blocker.notify.notify_waiters();
        }
    }
}

/// A stable view of the membership map, held open for as long as the caller keeps iterating
/// it. Rust extends the guard's lifetime through a `for m in watcher.members().iter() { .. }`
/// loop, so the notification worker stays paused for the whole body.
pub struct MembersSnapshot {
    members: Vec<MemberRecord>,
    _guard: BlockGuard,
}

impl MembersSnapshot {
    pub fn iter(&self) -> impl Iterator<Item = &MemberRecord> {
        self.members.iter()
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}

/// Watches a coordination-store path's child set and maintains a cached membership map,
/// firing `on_join`/`on_leave` callbacks serially on a dedicated worker as members appear and
/// disappear.
pub struct MembershipWatcher {
    store: Arc<dyn CoordinationStore>,
    path: String,
    members: Mutex<HashMap<String, MemberRecord>>,
    on_join: Mutex<Vec<Callback>>,
    on_leave: Mutex<Vec<Callback>>,
    blocker: Arc<CallbackBlocker>,
}

impl MembershipWatcher {
    /// Creates the watcher and starts its notification worker. Children already present under
    /// `path` are fetched and delivered as an initial batch of `on_join` events, same as any
    /// later join.
    pub async fn start(
        store: Arc<dyn CoordinationStore>,
        path: impl Into<String>,
    ) -> Result<Arc<Self>, crate::store::WatcherError> {
        let path = path.into();
        let rx = store.watch_children(&path).await?;
        let watcher = Arc::new(Self {
            store,
            path,
            members: Mutex::new(HashMap::new()),
            on_join: Mutex::new(Vec::new()),
            on_leave: Mutex::new(Vec::new()),
            blocker: CallbackBlocker::new(),
        });
        tokio::spawn(watcher.clone().run(rx));
        Ok(watcher)
    }

    pub fn on_join(&self, callback: impl Fn(&MemberRecord) + Send + Sync + 'static) {
        self.on_join.lock().push(Arc::new(callback));
    }

    pub fn on_leave(&self, callback: impl Fn(&MemberRecord) + Send + Sync + 'static) {
        self.on_leave.lock().push(Arc::new(callback));
    }

    /// Returns a stable snapshot of the currently known members. The notification worker
    /// pauses (between callbacks) for as long as the snapshot is alive.
    pub fn members(self: &Arc<Self>) -> MembersSnapshot {
        let guard = self.blocker.block();
        let members = self.members.lock().values().cloned().collect();
        MembersSnapshot { members, _guard: guard }
    }

    async fn run(self: Arc<Self>, mut rx: tokio::sync::mpsc::UnboundedReceiver<Vec<String>>) {
        let mut known: HashSet<String> = HashSet::new();
        loop {
            self.blocker.wait_until_clear().await;
            let Some(snapshot) = rx.recv().await else {
                break;
            };
            let current: HashSet<String> = snapshot.into_iter().collect();

            let joined: Vec<String> = current.difference(&known).cloned().collect();
            let left: Vec<String> = known.difference(&current).cloned().collect();

            for child in &joined {
                let child_path = format!("{}/{}", self.path, child);
                let data = match self.store.get_data(&child_path).await {
                    Ok(data) => data,
                    Err(_) => continue,
                };
                let record = match MemberRecord::from_json(&data) {
                    Ok(record) => record,
                    Err(err) => {
                        tracing::error!(child = %child, error = %err, "malformed member record, skipping");
                        continue;
                    }
                };
                self.members.lock().insert(child.clone(), record.clone());
                self.fire(&self.on_join, &record);
            }

            for child in &left {
                let removed = self.members.lock().remove(child);
                if let Some(record) = removed {
                    self.fire(&self.on_leave, &record);
                }
            }

            known = current;
        }
    }

    fn fire(&self, callbacks: &Mutex<Vec<Callback>>, record: &MemberRecord) {
        let callbacks = callbacks.lock().clone();
        for callback in callbacks {
            let result = catch_unwind(AssertUnwindSafe(|| callback(record)));
            if let Err(_) = result {
                tracing::error!("membership callback panicked, continuing");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryCoordinationStore;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn sample_json(port: u16) -> String {
        format!(r#"{{"serviceEndpoint": {{"host": "h", "port": {port}}}, "status": "ALIVE"}}"#)
    }

    #[tokio::test]
    async fn fires_on_join_for_an_already_present_child() {
        let store = InMemoryCoordinationStore::new();
        store.put_child("/services/foo", "a", sample_json(1));

        let joins = Arc::new(AtomicUsize::new(0));
        let watcher = MembershipWatcher::start(store, "/services/foo").await.unwrap();
        let j = joins.clone();
        watcher.on_join(move |_| {
            j.fetch_add(1, Ordering::SeqCst);
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(joins.load(Ordering::SeqCst), 1);
        assert_eq!(watcher.members().len(), 1);
    }

    #[tokio::test]
    async fn fires_on_join_then_on_leave_as_children_change() {
        let store = InMemoryCoordinationStore::new();
        let watcher = MembershipWatcher::start(store.clone(), "/services/foo").await.unwrap();

        let joins = Arc::new(AtomicUsize::new(0));
        let leaves = Arc::new(AtomicUsize::new(0));
        let j = joins.clone();
        watcher.on_join(move |_| {
            j.fetch_add(1, Ordering::SeqCst);
        });
        let l = leaves.clone();
        watcher.on_leave(move |_| {
            l.fetch_add(1, Ordering::SeqCst);
        });

        store.put_child("/services/foo", "a", sample_json(1));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(joins.load(Ordering::SeqCst), 1);

        store.remove_child("/services/foo", "a");
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(leaves.load(Ordering::SeqCst), 1);
        assert_eq!(watcher.members().len(), 0);
    }

    #[tokio::test]
    async fn a_child_that_vanishes_before_its_data_is_fetched_is_skipped() {
        let store = InMemoryCoordinationStore::new();
        let watcher = MembershipWatcher::start(store.clone(), "/services/foo").await.unwrap();

        let joins = Arc::new(AtomicUsize::new(0));
        let j = joins.clone();
        watcher.on_join(move |_| {
            j.fetch_add(1, Ordering::SeqCst);
        });

        store.put_child("/services/foo", "a", sample_json(1));
        store.remove_data_only("/services/foo", "a");

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(joins.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn a_panicking_callback_does_not_halt_later_notifications() {
        let store = InMemoryCoordinationStore::new();
        let watcher = MembershipWatcher::start(store.clone(), "/services/foo").await.unwrap();

        watcher.on_join(|_| panic!("boom"));
        let joins = Arc::new(AtomicUsize::new(0));
        let j = joins.clone();
        watcher.on_join(move |_| {
            j.fetch_add(1, Ordering::SeqCst);
        });

        store.put_child("/services/foo", "a", sample_json(1));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(joins.load(Ordering::SeqCst), 1);

        store.put_child("/services/foo", "b", sample_json(2));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(joins.load(Ordering::SeqCst), 2);
    }
}
