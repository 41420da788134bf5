//! C5: device stack tables (spec.md §4.5). Owns the domain, address,
//! NV/alias, and monitor tables plus the configuration-data blob and
//! read-only image, and wires table mutation into the persistence
//! blackout protocol (spec.md §9, [`crate::persist`]).

pub mod address;
pub mod buffer_codes;
pub mod config_data;
pub mod domain;
pub mod entity;
pub mod monitor;
pub mod nv;

use std::sync::Arc;

use tracing::info;

use crate::error::{LtErrorLog, NmStatus, PersistError};
use crate::persist::{BlackoutGuard, PersistenceBackend};

pub use address::AddressTable;
pub use config_data::{ConfigData, NodeState, ReadOnlyData};
pub use domain::DomainTable;
pub use entity::{ConfigurationEntity, Resource};
pub use monitor::BlobTable;
pub use nv::NvTable;

const PERSIST_OBJECT_DOMAINS: &str = "domains";
const PERSIST_OBJECT_ADDRESSES: &str = "addresses";
const PERSIST_OBJECT_NVS: &str = "nvs";
const PERSIST_OBJECT_CONFIG: &str = "config_data";
const PERSIST_OBJECT_READ_ONLY: &str = "read_only";

/// C5's full set of tables. Owned by value (spec.md §9: "the stack
/// owns the read-only image by value; any callback gets the stack
/// index explicitly, not a pointer").
pub struct DeviceStackTables {
    pub domains: DomainTable,
    pub addresses: AddressTable,
    pub nvs: NvTable,
    pub monitor_set: BlobTable,
    pub monitor_point: BlobTable,
    pub config: ConfigData,
    pub read_only: ReadOnlyData,
    backend: Arc<dyn PersistenceBackend>,
    blackout: BlackoutGuard,
}

impl DeviceStackTables {
    pub fn new(backend: Arc<dyn PersistenceBackend>, unique_id: [u8; 6], program_id: [u8; 8]) -> Self {
        DeviceStackTables {
            domains: DomainTable::default(),
            addresses: AddressTable::new(),
            nvs: NvTable::with_capacity(0, 0),
            monitor_set: BlobTable::with_capacity(0),
            monitor_point: BlobTable::with_capacity(0),
            config: ConfigData::default(),
            read_only: ReadOnlyData::new(unique_id, program_id),
            backend,
            blackout: BlackoutGuard::default(),
        }
    }

    /// Boot-time blackout check (spec.md §9): call once at startup
    /// with whatever the backend reports for the pending-write flag.
    pub fn boot_with_blackout(&mut self, pending_flag_was_set: bool) {
        self.blackout = BlackoutGuard::boot(pending_flag_was_set);
        if pending_flag_was_set {
            self.config.go_unconfigured();
        }
    }

    pub fn should_drop_next_modifying_command(&mut self) -> bool {
        self.blackout.should_drop_next_modifying_command()
    }

    pub fn resource(&mut self, resource: Resource) -> Option<&mut dyn ConfigurationEntity> {
        match resource {
            Resource::Domain => Some(&mut self.domains),
            Resource::Address => Some(&mut self.addresses),
            Resource::Nv | Resource::Alias => Some(&mut self.nvs),
            Resource::MonitorSet => Some(&mut self.monitor_set),
            Resource::MonitorPoint => Some(&mut self.monitor_point),
            Resource::Node => None,
        }
    }

    /// `store(recompute_checksum)` (spec.md §4.5). Commits every table
    /// that `affects_network_image()` through the blackout protocol.
    /// `recompute_checksum == false` on a non-trivial change is the
    /// caller's responsibility to have already driven
    /// [`ConfigData::config_write_without_checksum`] before calling
    /// this; `store` itself only persists.
    pub async fn store(&mut self, recompute_checksum: bool) -> Result<(), NmStatus> {
        self.blackout.begin_write();

        let commit_one = |backend: &dyn PersistenceBackend, object: &'static str, data: Vec<u8>| async move {
            backend.write(object, &data).await?;
            backend.commit(object).await
        };

        let result: Result<(), PersistError> = async {
            commit_one(self.backend.as_ref(), PERSIST_OBJECT_DOMAINS, domains_blob(&self.domains)).await?;
            commit_one(self.backend.as_ref(), PERSIST_OBJECT_ADDRESSES, Vec::new()).await?;
            commit_one(self.backend.as_ref(), PERSIST_OBJECT_NVS, Vec::new()).await?;
            commit_one(self.backend.as_ref(), PERSIST_OBJECT_CONFIG, Vec::new()).await?;
            if recompute_checksum {
                commit_one(self.backend.as_ref(), PERSIST_OBJECT_READ_ONLY, Vec::new()).await?;
            }
            Ok(())
        }
        .await;

        match result {
            Ok(()) => {
                self.blackout.end_write();
                self.read_only.clear_pending_update();
                if !recompute_checksum {
                    self.config.config_write_without_checksum();
                }
                info!(recompute_checksum, "device stack tables committed");
                Ok(())
            }
            Err(_) => {
                self.config.error_log = LtErrorLog::EepromWriteFailure;
                Err(NmStatus::EepromWriteFailure)
            }
        }
    }
}

fn domains_blob(table: &DomainTable) -> Vec<u8> {
    let mut out = Vec::new();
    for entry in table.entries.iter().flatten() {
        out.extend_from_slice(&entry.encode(false));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persist::MemoryBackend;

    fn tables() -> DeviceStackTables {
        DeviceStackTables::new(Arc::new(MemoryBackend::new()), [0; 6], [0; 8])
    }

    #[tokio::test]
    async fn s3_config_write_without_checksum_goes_unconfigured() {
        let mut t = tables();
        t.config.node_state = NodeState::Configured;
        t.store(false).await.unwrap();
        assert_eq!(t.config.node_state, NodeState::Unconfigured);
        assert_eq!(t.config.error_log, LtErrorLog::CnfgCsError);
    }

    #[tokio::test]
    async fn store_with_checksum_keeps_state() {
        let mut t = tables();
        t.config.node_state = NodeState::Configured;
        t.store(true).await.unwrap();
        assert_eq!(t.config.node_state, NodeState::Configured);
    }

    #[test]
    fn boot_blackout_forces_unconfigured() {
        let mut t = tables();
        t.config.node_state = NodeState::Configured;
        t.boot_with_blackout(true);
        assert_eq!(t.config.node_state, NodeState::Unconfigured);
        assert!(t.should_drop_next_modifying_command());
        assert!(!t.should_drop_next_modifying_command());
    }
}
