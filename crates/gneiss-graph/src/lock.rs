use crate::errors::{GraphError, Result};
use crate::node_id::NodeId;
use crate::stamp::Stamp;
use crate::store::{Column, GraphStore};

use crossbeam::channel::{bounded, RecvTimeoutError, Sender};
use std::thread::JoinHandle;
use std::time::Duration;

/// Lease written on each lock cell. A dedicated ticker renews it at half-life while the edit
/// runs, so the lease only has to outlive a stall, not the whole edit.
pub const LOCK_LEASE: Duration = Duration::from_secs(60);

const MAX_ACQUIRE_ATTEMPTS: u32 = 5;
const ACQUIRE_BACKOFF: Duration = Duration::from_millis(100);

/// Exclusive, time-bounded locks over a set of roots; the write gate of every edit.
///
/// Roots are locked in sorted ID order so that concurrent multi-root edits cannot deadlock. On
/// any acquisition failure all partial locks are released and the whole set is retried with
/// backoff, a bounded number of times. The largest lock-cell stamp is the logical timestamp of
/// the edit; every mutation it emits is stamped with it.
///
/// Locks are released on every exit path by `Drop`.
pub struct RootLock {
    store: GraphStore,
    operation_id: u64,
    locked: Vec<NodeId>,
    stamp: Stamp,
    renewer: Option<(Sender<()>, JoinHandle<()>)>,
}

impl RootLock {
    pub fn acquire(store: &GraphStore, roots: &[NodeId], operation_id: u64) -> Result<Self> {
        let mut roots = roots.to_vec();
        roots.sort_unstable();
        roots.dedup();

        let mut attempt = 0;
        loop {
            attempt += 1;
            match Self::try_acquire_all(store, &roots, operation_id)? {
                Some(stamp) => {
                    // Holding the locks freezes the roots; nobody else can retire them, so this
                    // check cannot go stale.
                    for &root in &roots {
                        if store.latest_cell(root, Column::NewIds, Stamp::MAX)?.is_some() {
                            release_all(store, &roots, operation_id);
                            return Err(GraphError::Precondition(format!(
                                "root {root:?} is no longer current"
                            )));
                        }
                    }
                    let mut lock = Self {
                        store: store.clone(),
                        operation_id,
                        locked: roots,
                        stamp,
                        renewer: None,
                    };
                    lock.spawn_renewer();
                    return Ok(lock);
                }
                None if attempt < MAX_ACQUIRE_ATTEMPTS => {
                    std::thread::sleep(ACQUIRE_BACKOFF * attempt);
                }
                None => {
                    return Err(GraphError::Locking(format!(
                        "could not lock roots {roots:?} within {MAX_ACQUIRE_ATTEMPTS} attempts"
                    )))
                }
            }
        }
    }

    /// One pass over the sorted roots. `Ok(None)` means contention: everything acquired so far
    /// was released again.
    fn try_acquire_all(
        store: &GraphStore,
        roots: &[NodeId],
        operation_id: u64,
    ) -> Result<Option<Stamp>> {
        let mut acquired = Vec::with_capacity(roots.len());
        let mut stamp = Stamp::ZERO;
        for &root in roots {
            match store.lock_root(root, operation_id, LOCK_LEASE) {
                Ok(lock_stamp) => {
                    stamp = stamp.max(lock_stamp);
                    acquired.push(root);
                }
                Err(GraphError::Locking(_)) => {
                    release_all(store, &acquired, operation_id);
                    return Ok(None);
                }
                Err(other) => {
                    release_all(store, &acquired, operation_id);
                    return Err(other);
                }
            }
        }
        Ok(Some(stamp))
    }

    pub fn operation_id(&self) -> u64 {
        self.operation_id
    }

    /// The logical timestamp of the edit holding this lock.
    pub fn stamp(&self) -> Stamp {
        self.stamp
    }

    pub fn roots(&self) -> &[NodeId] {
        &self.locked
    }

    fn spawn_renewer(&mut self) {
        let (stop_tx, stop_rx) = bounded::<()>(1);
        let store = self.store.clone();
        let roots = self.locked.clone();
        let operation_id = self.operation_id;
        let handle = std::thread::spawn(move || loop {
            match stop_rx.recv_timeout(LOCK_LEASE / 2) {
                Err(RecvTimeoutError::Timeout) => {
                    for &root in &roots {
                        if let Err(err) = store.renew_lock(root, operation_id, LOCK_LEASE) {
                            log::warn!(
                                "lease renewal failed for root {root:?} (operation {operation_id}): {err}"
                            );
                            return;
                        }
                    }
                }
                Ok(()) | Err(RecvTimeoutError::Disconnected) => return,
            }
        });
        self.renewer = Some((stop_tx, handle));
    }
}

impl Drop for RootLock {
    fn drop(&mut self) {
        if let Some((stop_tx, handle)) = self.renewer.take() {
            let _ = stop_tx.send(());
            let _ = handle.join();
        }
        release_all(&self.store, &self.locked, self.operation_id);
    }
}

fn release_all(store: &GraphStore, roots: &[NodeId], operation_id: u64) {
    for &root in roots {
        if let Err(err) = store.unlock_root(root, operation_id) {
            log::warn!("failed to unlock root {root:?} (operation {operation_id}): {err}");
        }
    }
}

// ████████╗███████╗███████╗████████╗
// ╚══██╔══╝██╔════╝██╔════╝╚══██╔══╝
//    ██║   █████╗  ███████╗   ██║
//    ██║   ██╔══╝  ╚════██║   ██║
//    ██║   ███████╗███████║   ██║
//    ╚═╝   ╚══════╝╚══════╝   ╚═╝

#[cfg(test)]
mod tests {
    use super::*;

    fn test_store() -> GraphStore {
        let db = sled::Config::default().temporary(true).open().unwrap();
        GraphStore::open(&db, "mytable").unwrap()
    }

    #[test]
    fn locks_release_on_drop() {
        let store = test_store();
        let roots = [NodeId(10), NodeId(11)];

        {
            let lock = RootLock::acquire(&store, &roots, 1).unwrap();
            assert_eq!(lock.roots(), &roots);
            assert!(store.read_lock(NodeId(10)).unwrap().is_some());
        }
        assert!(store.read_lock(NodeId(10)).unwrap().is_none());
        assert!(store.read_lock(NodeId(11)).unwrap().is_none());
    }

    #[test]
    fn contended_root_fails_and_leaves_nothing_behind() {
        let store = test_store();
        let _held = RootLock::acquire(&store, &[NodeId(11)], 1).unwrap();

        // Operation 2 can take root 10 but must give it back when 11 is refused.
        let result = RootLock::acquire(&store, &[NodeId(10), NodeId(11)], 2);
        assert!(matches!(result, Err(GraphError::Locking(_))));
        assert!(store.read_lock(NodeId(10)).unwrap().is_none());
        assert_eq!(store.read_lock(NodeId(11)).unwrap().unwrap().operation_id, 1);
    }

    #[test]
    fn stamp_is_the_newest_lock_cell() {
        let store = test_store();
        let lock = RootLock::acquire(&store, &[NodeId(10), NodeId(11)], 1).unwrap();
        let cell_stamps = [
            store.read_lock(NodeId(10)).unwrap().unwrap().stamp,
            store.read_lock(NodeId(11)).unwrap().unwrap().stamp,
        ];
        assert_eq!(lock.stamp(), *cell_stamps.iter().max().unwrap());
    }

    #[test]
    fn duplicate_roots_collapse() {
        let store = test_store();
        let lock = RootLock::acquire(&store, &[NodeId(10), NodeId(10)], 1).unwrap();
        assert_eq!(lock.roots(), &[NodeId(10)]);
    }
}
