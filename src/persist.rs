//! Persistence backend seam (spec.md §1: "the persistence backend ...
//! the core asks for read/write/commit only") and the blackout property
//! (spec.md §9, §8 invariant 8).
//!
//! The core never touches a file path, NVRAM register, or checksum
//! algorithm directly — it calls [`PersistenceBackend::commit`] with an
//! opaque blob and trusts the backend's atomicity. What the core *does*
//! own is the three-step blackout protocol layered on top: set
//! "pending" before the write, clear it after a confirmed commit, and
//! on boot with "pending" still set, silently drop the next modifying
//! NM command.

use async_trait::async_trait;
use tracing::{error, info, warn};

use crate::error::PersistError;

/// What the core asks an external backend for (spec.md §1, §6
/// "Persistent state layout").
#[async_trait]
pub trait PersistenceBackend: Send + Sync {
    async fn read(&self, object: &str) -> Result<Option<Vec<u8>>, PersistError>;
    async fn write(&self, object: &str, data: &[u8]) -> Result<(), PersistError>;
    /// Commit a write atomically (spec.md §9: "write-tmp + fsync +
    /// rename, or the platform's equivalent").
    async fn commit(&self, object: &str) -> Result<(), PersistError>;
}

/// An in-memory backend for tests and the CLI demo. `fail_next_commit`
/// simulates a torn write for the blackout scenario (spec.md §8
/// invariant 8).
#[derive(Default)]
pub struct MemoryBackend {
    objects: tokio::sync::Mutex<std::collections::HashMap<String, Vec<u8>>>,
    fail_next_commit: std::sync::atomic::AtomicBool,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn simulate_torn_write(&self) {
        self.fail_next_commit.store(true, std::sync::atomic::Ordering::SeqCst);
    }
}

#[async_trait]
impl PersistenceBackend for MemoryBackend {
    async fn read(&self, object: &str) -> Result<Option<Vec<u8>>, PersistError> {
        Ok(self.objects.lock().await.get(object).cloned())
    }

    async fn write(&self, object: &str, data: &[u8]) -> Result<(), PersistError> {
        self.objects.lock().await.insert(object.to_string(), data.to_vec());
        Ok(())
    }

    async fn commit(&self, object: &str) -> Result<(), PersistError> {
        if self.fail_next_commit.swap(false, std::sync::atomic::Ordering::SeqCst) {
            return Err(PersistError::Commit(format!("simulated torn write on {object}")));
        }
        Ok(())
    }
}

/// Tracks the blackout "pending write" flag across the node's
/// lifetime (spec.md §9: "before any write, set a pending flag ... on
/// boot, if the flag is set, go UNCONFIGURED and silently drop the
/// *next* modifying NM command").
#[derive(Debug, Default)]
pub struct BlackoutGuard {
    pending: bool,
    /// Set once on boot if the backend reported a pending write; armed
    /// until exactly one modifying command has been dropped.
    armed: bool,
}

impl BlackoutGuard {
    /// Call once at startup with whatever the backend persisted for
    /// the pending flag.
    pub fn boot(pending_flag_was_set: bool) -> Self {
        if pending_flag_was_set {
            warn!("blackout: pending write flag set on boot, arming drop-next-command");
        }
        BlackoutGuard { pending: false, armed: pending_flag_was_set }
    }

    /// Before issuing a write: mark pending.
    pub fn begin_write(&mut self) {
        self.pending = true;
    }

    /// After a confirmed commit: clear pending.
    pub fn end_write(&mut self) {
        self.pending = false;
    }

    pub fn is_pending(&self) -> bool {
        self.pending
    }

    /// Spec.md §4.6 "Blackout gate": if armed, silently drop the very
    /// next modifying command and disarm.
    pub fn should_drop_next_modifying_command(&mut self) -> bool {
        if self.armed {
            self.armed = false;
            info!("blackout: dropping next modifying NM command");
            true
        } else {
            false
        }
    }
}

/// Commits `data` under `object` through the full blackout protocol:
/// mark pending, write, commit, clear pending. Returns the mapped
/// `NmStatus`-compatible error on any backend failure, logging
/// `EEPROM_WRITE_FAILURE` per spec.md §7 ("Errors affecting persistent
/// state always write the single-byte error log before surfacing").
pub async fn commit_with_blackout(
    backend: &dyn PersistenceBackend,
    guard: &mut BlackoutGuard,
    object: &str,
    data: &[u8],
) -> Result<(), PersistError> {
    guard.begin_write();
    backend.write(object, data).await?;
    let result = backend.commit(object).await;
    match &result {
        Ok(()) => guard.end_write(),
        Err(e) => error!(error = %e, "commit failed, blackout flag remains set"),
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn commit_clears_pending_on_success() {
        let backend = MemoryBackend::new();
        let mut guard = BlackoutGuard::default();
        commit_with_blackout(&backend, &mut guard, "domains", &[1, 2, 3]).await.unwrap();
        assert!(!guard.is_pending());
    }

    #[tokio::test]
    async fn torn_write_leaves_pending_set() {
        let backend = MemoryBackend::new();
        backend.simulate_torn_write();
        let mut guard = BlackoutGuard::default();
        let err = commit_with_blackout(&backend, &mut guard, "domains", &[1]).await;
        assert!(err.is_err());
        assert!(guard.is_pending());
    }

    #[test]
    fn s8_blackout_drops_exactly_one_command() {
        let mut guard = BlackoutGuard::boot(true);
        assert!(guard.should_drop_next_modifying_command());
        assert!(!guard.should_drop_next_modifying_command());
    }

    #[test]
    fn no_blackout_on_clean_boot() {
        let mut guard = BlackoutGuard::boot(false);
        assert!(!guard.should_drop_next_modifying_command());
    }
}
