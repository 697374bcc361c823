use parking_lot::Mutex;
use tokio::sync::broadcast;

struct Inner {
    tx: broadcast::Sender<String>,
    cached: Option<String>,
}

/// A "fires exactly once, replays to late subscribers" latch. Used by every transport sink
/// to announce the reason it closed, so a pool watching `wait()` learns about a fault whether
/// it was already watching or starts watching after the fact.
pub struct FaultObservable {
    inner: Mutex<Inner>,
}

impl FaultObservable {
    pub fn new() -> Self {
        let (tx, _rx) = broadcast::channel(1);
        Self {
            inner: Mutex::new(Inner { tx, cached: None }),
        }
    }

    /// Idempotent: the first call wins, every later call is a no-op.
    pub fn fire(&self, reason: impl Into<String>) {
        let mut inner = self.inner.lock();
        if inner.cached.is_some() {
            return;
        }
        let reason = reason.into();
        inner.cached = Some(reason.clone());
        let _ = inner.tx.send(reason);
    }

    pub fn is_fired(&self) -> bool {
        self.inner.lock().cached.is_some()
    }

    /// Resolves immediately with the cached reason if the fault already fired, otherwise
    /// waits for the next (and only) fire.
    pub async fn wait(&self) -> String {
        let mut rx = {
            let inner = self.inner.lock();
            if let Some(reason) = &inner.cached {
                return reason.clone();
            }
            inner.tx.subscribe()
        };
        rx.recv().await.unwrap_or_default()
    }
}

impl Default for FaultObservable {
    fn default() -> Self {
        Self::new()
    }
}
