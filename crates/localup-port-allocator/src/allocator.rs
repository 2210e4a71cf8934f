//! Allocation engine
//!
//! Owns the authoritative client -> port table. Every decision runs under a
//! single lock that spans the lookup, the commit and the write to the store,
//! so two concurrent callers can never be handed the same port and a
//! successful allocation is on disk before the caller hears about it.

use std::sync::{Arc, Mutex, MutexGuard};

use thiserror::Error;
use tracing::{error, info, warn};

use crate::error::AllocatorError;
use crate::range::PortRange;
use crate::store::AllocationStore;
use crate::table::{AllocationTable, ClientKey};

/// How a port came to be assigned
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocationKind {
    /// The client asked for any port and the lowest free one was picked
    Automatic,
    /// The client asked for a specific port and got it
    Requested,
}

/// Reasons a tunnel is refused a port. The message is the reason string
/// reported back to the proxy core.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    #[error("All available ports already taken")]
    Exhausted,

    #[error("Port already taken by another proxy")]
    Conflict,

    #[error("Illegal port number")]
    IllegalPort,
}

/// Outcome of [`PortAllocator::decide`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// The client already holds this port, nothing was written
    Unchanged(u16),
    /// The table changed and was persisted
    Modified { port: u16, kind: AllocationKind },
    /// The request was refused, nothing was written
    Rejected(Rejection),
}

struct AllocatorState {
    table: AllocationTable,
    /// Set once a write to the store fails. No further decisions are made
    /// because the table could no longer be kept in step with disk.
    halted: bool,
}

/// Persistent port allocator for TCP/UDP tunnels
pub struct PortAllocator {
    range: PortRange,
    store: Arc<dyn AllocationStore>,
    state: Mutex<AllocatorState>,
}

impl PortAllocator {
    /// Load the persisted table from `store` and build an allocator over it
    pub fn open(range: PortRange, store: Arc<dyn AllocationStore>) -> Result<Self, AllocatorError> {
        let table = store.load(&range)?;
        Ok(Self::with_table(range, store, table))
    }

    /// Build an allocator over an already loaded table
    pub fn with_table(
        range: PortRange,
        store: Arc<dyn AllocationStore>,
        table: AllocationTable,
    ) -> Self {
        Self {
            range,
            store,
            state: Mutex::new(AllocatorState {
                table,
                halted: false,
            }),
        }
    }

    pub fn range(&self) -> PortRange {
        self.range
    }

    /// Decide which port `key` may use.
    ///
    /// `requested_port == 0` asks for any port; any other value asks for that
    /// exact port. Values that do not fit a port number are illegal.
    pub fn decide(&self, key: &ClientKey, requested_port: i64) -> Result<Decision, AllocatorError> {
        let mut state = self.lock()?;
        if state.halted {
            return Err(AllocatorError::Halted);
        }

        if requested_port == 0 {
            self.allocate_any(&mut state, key)
        } else {
            self.reserve(&mut state, key, requested_port)
        }
    }

    /// Port currently held by `key`
    pub fn port_of(&self, key: &ClientKey) -> Result<Option<u16>, AllocatorError> {
        Ok(self.lock()?.table.port_of(key))
    }

    /// Copy of the current table
    pub fn snapshot(&self) -> Result<AllocationTable, AllocatorError> {
        Ok(self.lock()?.table.clone())
    }

    fn lock(&self) -> Result<MutexGuard<'_, AllocatorState>, AllocatorError> {
        self.state.lock().map_err(|_| AllocatorError::LockPoisoned)
    }

    fn allocate_any(
        &self,
        state: &mut AllocatorState,
        key: &ClientKey,
    ) -> Result<Decision, AllocatorError> {
        if let Some(port) = state.table.port_of(key) {
            info!("[{}] Known client, using port {}", key, port);
            return Ok(Decision::Unchanged(port));
        }

        let Some(port) = self.range.ports().find(|port| !state.table.is_taken(*port)) else {
            warn!(
                "[{}] Unable to allocate port, all ports in {} already taken",
                key, self.range
            );
            return Ok(Decision::Rejected(Rejection::Exhausted));
        };

        self.commit(state, key, port)?;
        info!("[{}] New client, allocated port {}", key, port);
        Ok(Decision::Modified {
            port,
            kind: AllocationKind::Automatic,
        })
    }

    fn reserve(
        &self,
        state: &mut AllocatorState,
        key: &ClientKey,
        requested_port: i64,
    ) -> Result<Decision, AllocatorError> {
        let Ok(port) = u16::try_from(requested_port) else {
            warn!("[{}] Illegal port number {} requested", key, requested_port);
            return Ok(Decision::Rejected(Rejection::IllegalPort));
        };

        match state.table.owner_of(port) {
            Some(owner) if owner == key => {
                info!("[{}] Known client, keeping requested port {}", key, port);
                return Ok(Decision::Unchanged(port));
            }
            Some(owner) => {
                warn!(
                    "[{}] Cannot allocate port {}, already taken by {}",
                    key, port, owner
                );
                return Ok(Decision::Rejected(Rejection::Conflict));
            }
            None => {}
        }

        if !self.range.contains(port) {
            warn!(
                "[{}] Illegal port number {} requested, allowed range is {}",
                key, port, self.range
            );
            return Ok(Decision::Rejected(Rejection::IllegalPort));
        }

        self.commit(state, key, port)?;
        info!("[{}] Allocated requested port {}", key, port);
        Ok(Decision::Modified {
            port,
            kind: AllocationKind::Requested,
        })
    }

    /// Assign and persist. On a failed write the assignment is rolled back and
    /// the allocator stops taking decisions.
    fn commit(
        &self,
        state: &mut AllocatorState,
        key: &ClientKey,
        port: u16,
    ) -> Result<(), AllocatorError> {
        let previous = state.table.assign(key.clone(), port);

        if let Err(e) = self.store.save(&state.table) {
            state.table.revert(key, previous);
            state.halted = true;
            error!("[{}] Failed to persist port {}: {}", key, port, e);
            return Err(e.into());
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StoreError;
    use crate::store::FilePortStore;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;
    use tempfile::TempDir;

    /// Keeps the last saved table in memory and counts writes
    #[derive(Default)]
    struct MemoryStore {
        saved: Mutex<Option<AllocationTable>>,
        writes: AtomicUsize,
    }

    impl AllocationStore for MemoryStore {
        fn load(&self, _range: &PortRange) -> Result<AllocationTable, StoreError> {
            Ok(self.saved.lock().unwrap().clone().unwrap_or_default())
        }

        fn save(&self, table: &AllocationTable) -> Result<(), StoreError> {
            *self.saved.lock().unwrap() = Some(table.clone());
            self.writes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct FailingStore;

    impl AllocationStore for FailingStore {
        fn load(&self, _range: &PortRange) -> Result<AllocationTable, StoreError> {
            Ok(AllocationTable::new())
        }

        fn save(&self, _table: &AllocationTable) -> Result<(), StoreError> {
            Err(StoreError::Unavailable("disk full".to_string()))
        }
    }

    fn small_allocator() -> (PortAllocator, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::default());
        let range = PortRange::new(30000, 30002).unwrap();
        let allocator = PortAllocator::open(range, store.clone()).unwrap();
        (allocator, store)
    }

    fn key(name: &str) -> ClientKey {
        ClientKey::new(name, "tcp")
    }

    fn auto(port: u16) -> Decision {
        Decision::Modified {
            port,
            kind: AllocationKind::Automatic,
        }
    }

    #[test]
    fn test_three_port_scenario() {
        let (allocator, _store) = small_allocator();

        assert_eq!(allocator.decide(&key("A"), 0).unwrap(), auto(30000));
        assert_eq!(allocator.decide(&key("B"), 0).unwrap(), auto(30001));
        assert_eq!(allocator.decide(&key("C"), 0).unwrap(), auto(30002));
        assert_eq!(
            allocator.decide(&key("D"), 0).unwrap(),
            Decision::Rejected(Rejection::Exhausted)
        );
        assert_eq!(
            allocator.decide(&key("A"), 30000).unwrap(),
            Decision::Unchanged(30000)
        );
        assert_eq!(
            allocator.decide(&key("E"), 30000).unwrap(),
            Decision::Rejected(Rejection::Conflict)
        );
        assert_eq!(
            allocator.decide(&key("F"), 40000).unwrap(),
            Decision::Rejected(Rejection::IllegalPort)
        );
    }

    #[test]
    fn test_rejection_reasons() {
        assert_eq!(
            Rejection::Exhausted.to_string(),
            "All available ports already taken"
        );
        assert_eq!(
            Rejection::Conflict.to_string(),
            "Port already taken by another proxy"
        );
        assert_eq!(Rejection::IllegalPort.to_string(), "Illegal port number");
    }

    #[test]
    fn test_auto_allocation_is_idempotent() {
        let (allocator, store) = small_allocator();

        assert_eq!(allocator.decide(&key("web"), 0).unwrap(), auto(30000));
        assert_eq!(
            allocator.decide(&key("web"), 0).unwrap(),
            Decision::Unchanged(30000)
        );
        assert_eq!(store.writes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_explicit_reservation_is_idempotent() {
        let (allocator, store) = small_allocator();

        assert_eq!(
            allocator.decide(&key("db"), 30001).unwrap(),
            Decision::Modified {
                port: 30001,
                kind: AllocationKind::Requested
            }
        );
        assert_eq!(
            allocator.decide(&key("db"), 30001).unwrap(),
            Decision::Unchanged(30001)
        );
        assert_eq!(store.writes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_auto_allocation_fills_lowest_gap() {
        let (allocator, _store) = small_allocator();

        allocator.decide(&key("high"), 30002).unwrap();
        assert_eq!(allocator.decide(&key("a"), 0).unwrap(), auto(30000));
        assert_eq!(allocator.decide(&key("b"), 0).unwrap(), auto(30001));
    }

    #[test]
    fn test_same_name_different_type_are_distinct_clients() {
        let (allocator, _store) = small_allocator();

        assert_eq!(
            allocator.decide(&ClientKey::new("dns", "tcp"), 0).unwrap(),
            auto(30000)
        );
        assert_eq!(
            allocator.decide(&ClientKey::new("dns", "udp"), 0).unwrap(),
            auto(30001)
        );
    }

    #[test]
    fn test_conflict_does_not_mutate() {
        let (allocator, store) = small_allocator();
        allocator.decide(&key("owner"), 30001).unwrap();
        let before = allocator.snapshot().unwrap();

        assert_eq!(
            allocator.decide(&key("intruder"), 30001).unwrap(),
            Decision::Rejected(Rejection::Conflict)
        );
        assert_eq!(allocator.snapshot().unwrap(), before);
        assert_eq!(allocator.port_of(&key("intruder")).unwrap(), None);
        assert_eq!(store.writes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_exhaustion_does_not_mutate() {
        let (allocator, store) = small_allocator();
        for name in ["a", "b", "c"] {
            allocator.decide(&key(name), 0).unwrap();
        }
        let before = allocator.snapshot().unwrap();

        assert_eq!(
            allocator.decide(&key("late"), 0).unwrap(),
            Decision::Rejected(Rejection::Exhausted)
        );
        assert_eq!(allocator.snapshot().unwrap(), before);
        assert_eq!(store.writes.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_illegal_ports() {
        let (allocator, store) = small_allocator();

        for port in [29999, 30003, -1, 70000, i64::MAX] {
            assert_eq!(
                allocator.decide(&key("x"), port).unwrap(),
                Decision::Rejected(Rejection::IllegalPort),
                "port {}",
                port
            );
        }
        assert!(allocator.snapshot().unwrap().is_empty());
        assert_eq!(store.writes.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_explicit_reservation_moves_client() {
        let (allocator, _store) = small_allocator();

        allocator.decide(&key("mover"), 0).unwrap();
        allocator.decide(&key("mover"), 30002).unwrap();

        let table = allocator.snapshot().unwrap();
        assert_eq!(table.port_of(&key("mover")), Some(30002));
        assert!(!table.is_taken(30000));
        assert_eq!(allocator.decide(&key("next"), 0).unwrap(), auto(30000));
    }

    #[test]
    fn test_persisted_table_round_trips() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("ports.map");
        let range = PortRange::new(30000, 30010).unwrap();

        let allocator =
            PortAllocator::open(range, Arc::new(FilePortStore::new(&path))).unwrap();
        allocator.decide(&ClientKey::new("ssh", "tcp"), 0).unwrap();
        allocator.decide(&ClientKey::new("dns", "udp"), 30007).unwrap();
        allocator.decide(&ClientKey::new("web", "tcp"), 0).unwrap();
        let expected = allocator.snapshot().unwrap();
        drop(allocator);

        let reloaded =
            PortAllocator::open(range, Arc::new(FilePortStore::new(&path))).unwrap();
        assert_eq!(reloaded.snapshot().unwrap(), expected);
        assert_eq!(
            reloaded.decide(&ClientKey::new("ssh", "tcp"), 0).unwrap(),
            Decision::Unchanged(30000)
        );
    }

    #[test]
    fn test_reload_with_narrower_range_drops_entries() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("ports.map");

        let wide = PortRange::new(30000, 30010).unwrap();
        let allocator = PortAllocator::open(wide, Arc::new(FilePortStore::new(&path))).unwrap();
        allocator.decide(&key("low"), 30000).unwrap();
        allocator.decide(&key("high"), 30010).unwrap();
        drop(allocator);

        let narrow = PortRange::new(30000, 30005).unwrap();
        let reloaded =
            PortAllocator::open(narrow, Arc::new(FilePortStore::new(&path))).unwrap();
        let table = reloaded.snapshot().unwrap();
        assert_eq!(table.len(), 1);
        assert_eq!(table.port_of(&key("low")), Some(30000));
    }

    #[test]
    fn test_failed_write_rolls_back_and_halts() {
        let range = PortRange::new(30000, 30002).unwrap();
        let allocator = PortAllocator::open(range, Arc::new(FailingStore)).unwrap();

        let err = allocator.decide(&key("a"), 0).unwrap_err();
        assert!(matches!(err, AllocatorError::Storage(_)));
        assert!(allocator.snapshot().unwrap().is_empty());

        let err = allocator.decide(&key("b"), 30001).unwrap_err();
        assert!(matches!(err, AllocatorError::Halted));
    }

    #[test]
    fn test_concurrent_allocations_are_unique() {
        let store = Arc::new(MemoryStore::default());
        let range = PortRange::new(30000, 30063).unwrap();
        let allocator = Arc::new(PortAllocator::open(range, store.clone()).unwrap());

        let handles: Vec<_> = (0..8)
            .map(|worker| {
                let allocator = allocator.clone();
                thread::spawn(move || {
                    let mut ports = Vec::new();
                    for i in 0..10 {
                        let key = ClientKey::new(&format!("w{}-{}", worker, i), "tcp");
                        match allocator.decide(&key, 0).unwrap() {
                            Decision::Modified { port, .. } => ports.push(port),
                            Decision::Rejected(Rejection::Exhausted) => {}
                            other => panic!("unexpected decision {:?}", other),
                        }
                    }
                    ports
                })
            })
            .collect();

        let ports: Vec<u16> = handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect();
        let unique: HashSet<u16> = ports.iter().copied().collect();

        assert_eq!(ports.len(), 64);
        assert_eq!(unique.len(), 64);
        assert!(ports.iter().all(|p| range.contains(*p)));
        assert_eq!(store.writes.load(Ordering::SeqCst), 64);
        assert_eq!(store.load(&range).unwrap(), allocator.snapshot().unwrap());
    }
}
