//! `ConfigurationEntity`: the common shape every C5 table implements
//! (spec.md §4.5). The network-management dispatcher (C6) drives all of
//! `domain`, `address`, `nv`, `alias` and `monitor` through this one
//! interface for the generic ECS sub-commands (`NM_INITIALIZE`,
//! `NM_CREATE`, `NM_REMOVE`, `NM_UPDATE`, `NM_ENUMERATE`); legacy
//! per-table commands call the table's own typed methods directly.

use crate::error::NmStatus;
use crate::link::sicb::Apdu;

/// Resource tag carried in a generic ECS command, selecting which
/// table the sub-command applies to (`getConfigurationEntity(resource)`
/// in the source).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resource {
    Domain,
    Address,
    Nv,
    Alias,
    MonitorSet,
    MonitorPoint,
    Node,
}

pub trait ConfigurationEntity: Send + Sync {
    /// Wipe/reset `[start, end]`, per `domain_index` where relevant.
    fn initialize(&mut self, start: u16, end: u16, data: &[u8], domain_index: u8) -> Result<(), NmStatus>;
    fn create(&mut self, start: u16, data: &[u8]) -> Result<(), NmStatus>;
    fn remove(&mut self, start: u16, end: u16) -> Result<(), NmStatus>;
    fn update(&mut self, start: u16, data: &[u8]) -> Result<(), NmStatus>;
    /// Paginate a wire image of the table starting at `start` into
    /// `out`; `authenticated` gates whether secrets (domain keys, OMA
    /// keys) are included.
    fn enumerate(&self, start: u16, authenticated: bool, out: &mut Apdu) -> Result<(), NmStatus>;
    fn resource_specific(
        &mut self,
        cmd: u8,
        start: u16,
        data: &[u8],
        authenticated: bool,
        out: &mut Apdu,
    ) -> Result<(), NmStatus>;
    fn check_limits(&self, cmd: u8, data: &[u8]) -> Result<(), NmStatus>;
    /// Whether a successful mutation must be persisted by the
    /// dispatcher (spec.md §4.5).
    fn affects_network_image(&self) -> bool {
        true
    }
}
