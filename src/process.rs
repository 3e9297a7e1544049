//! Arena owning every backend child process.
//!
//! Backends never hold a [`Child`] directly. They keep an opaque
//! [`ProcessHandle`] and act on the process through the arena, so shutdown
//! can reach every process from one place.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::process::Child;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ProcessHandle(u64);

impl std::fmt::Display for ProcessHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "proc#{}", self.0)
    }
}

struct Slot {
    owner: String,
    child: Child,
}

#[derive(Default)]
struct ArenaInner {
    next: u64,
    slots: HashMap<ProcessHandle, Slot>,
}

/// Shared, cloneable handle to the process table.
#[derive(Clone, Default)]
pub struct ProcessArena {
    inner: Arc<Mutex<ArenaInner>>,
}

impl ProcessArena {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, ArenaInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Takes ownership of a freshly spawned child.
    pub fn insert(&self, owner: &str, child: Child) -> ProcessHandle {
        let mut inner = self.lock();
        inner.next += 1;
        let handle = ProcessHandle(inner.next);
        tracing::debug!(
            backend = %owner,
            handle = %handle,
            pid = ?child.id(),
            "process registered"
        );
        inner.slots.insert(
            handle,
            Slot {
                owner: owner.to_string(),
                child,
            },
        );
        handle
    }

    /// True while the process exists and has not exited.
    pub fn is_running(&self, handle: ProcessHandle) -> bool {
        let mut inner = self.lock();
        match inner.slots.get_mut(&handle) {
            Some(slot) => matches!(slot.child.try_wait(), Ok(None)),
            None => false,
        }
    }

    /// Number of live slots owned by `owner`.
    pub fn count_for(&self, owner: &str) -> usize {
        self.lock()
            .slots
            .values()
            .filter(|slot| slot.owner == owner)
            .count()
    }

    pub fn len(&self) -> usize {
        self.lock().slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Kills the process and releases its slot. Returns false when the
    /// handle was already released.
    pub async fn terminate(&self, handle: ProcessHandle) -> bool {
        let slot = self.lock().slots.remove(&handle);
        match slot {
            Some(slot) => {
                kill_slot(handle, slot).await;
                true
            }
            None => false,
        }
    }

    /// Kills every remaining process, returning how many were stopped.
    pub async fn terminate_all(&self) -> usize {
        let slots: Vec<(ProcessHandle, Slot)> = self.lock().slots.drain().collect();
        let count = slots.len();
        for (handle, slot) in slots {
            kill_slot(handle, slot).await;
        }
        count
    }
}

async fn kill_slot(handle: ProcessHandle, mut slot: Slot) {
    if let Ok(Some(status)) = slot.child.try_wait() {
        tracing::debug!(backend = %slot.owner, handle = %handle, %status, "process already exited");
        return;
    }
    if let Err(e) = slot.child.kill().await {
        tracing::warn!(backend = %slot.owner, handle = %handle, error = %e, "failed to kill process");
    } else {
        tracing::debug!(backend = %slot.owner, handle = %handle, "process terminated");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::process::Command;

    fn spawn_sleeper() -> Child {
        Command::new("sleep")
            .arg("30")
            .kill_on_drop(true)
            .spawn()
            .expect("spawn sleep")
    }

    #[tokio::test]
    async fn terminate_releases_slot() {
        let arena = ProcessArena::new();
        let handle = arena.insert("alpha", spawn_sleeper());

        assert!(arena.is_running(handle));
        assert_eq!(arena.count_for("alpha"), 1);

        assert!(arena.terminate(handle).await);
        assert!(!arena.is_running(handle));
        assert!(!arena.terminate(handle).await, "second terminate is a no-op");
        assert!(arena.is_empty());
    }

    #[tokio::test]
    async fn terminate_all_drains_everything() {
        let arena = ProcessArena::new();
        arena.insert("a", spawn_sleeper());
        arena.insert("b", spawn_sleeper());

        assert_eq!(arena.terminate_all().await, 2);
        assert_eq!(arena.len(), 0);
    }
}
