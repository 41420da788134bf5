//! NSS (Network Services Server) device-escape subset (spec.md §4.7
//! "`ESCAPE_NSS` subset supports changing NSS MIP mode, triggering a
//! reset, storing/retrieving 50 bytes of NSS-local data, and returning
//! the `NmNsMipEevars` record"). Grounded on `LtMipApp.cpp`'s
//! NSS-escape branch; this crate keeps only the subset the core
//! actually interoperates with (spec.md §1 excludes the full NSS
//! self-installation overlay).

pub const NSS_LOCAL_DATA_LEN: usize = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NssMipMode {
    Normal,
    Bridge,
    Repeater,
}

impl NssMipMode {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(NssMipMode::Normal),
            1 => Some(NssMipMode::Bridge),
            2 => Some(NssMipMode::Repeater),
            _ => None,
        }
    }

    pub fn as_u8(self) -> u8 {
        match self {
            NssMipMode::Normal => 0,
            NssMipMode::Bridge => 1,
            NssMipMode::Repeater => 2,
        }
    }
}

/// `NmNsMipEevars`: the small record of NVRAM-resident MIP variables
/// NSS queries over the escape channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NmNsMipEevars {
    pub mode: NssMipMode,
    pub xcvr_id: u8,
    pub channel_id: u8,
}

/// NSS-local scratch store plus the mode/reset-pending bits the escape
/// commands manipulate.
#[derive(Debug)]
pub struct NssState {
    pub mode: NssMipMode,
    pub reset_pending: bool,
    local_data: [u8; NSS_LOCAL_DATA_LEN],
}

impl Default for NssState {
    fn default() -> Self {
        NssState { mode: NssMipMode::Normal, reset_pending: false, local_data: [0u8; NSS_LOCAL_DATA_LEN] }
    }
}

impl NssState {
    pub fn set_mode(&mut self, mode: NssMipMode) {
        self.mode = mode;
    }

    pub fn trigger_reset(&mut self) {
        self.reset_pending = true;
    }

    pub fn take_reset_pending(&mut self) -> bool {
        std::mem::take(&mut self.reset_pending)
    }

    pub fn store_local_data(&mut self, data: &[u8]) {
        let n = data.len().min(NSS_LOCAL_DATA_LEN);
        self.local_data[..n].copy_from_slice(&data[..n]);
    }

    pub fn local_data(&self) -> &[u8; NSS_LOCAL_DATA_LEN] {
        &self.local_data
    }

    pub fn eevars(&self, xcvr_id: u8, channel_id: u8) -> NmNsMipEevars {
        NmNsMipEevars { mode: self.mode, xcvr_id, channel_id }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_and_retrieve_local_data() {
        let mut nss = NssState::default();
        nss.store_local_data(&[1, 2, 3]);
        assert_eq!(&nss.local_data()[..3], &[1, 2, 3]);
        assert_eq!(nss.local_data()[3], 0);
    }

    #[test]
    fn reset_pending_consumed_once() {
        let mut nss = NssState::default();
        nss.trigger_reset();
        assert!(nss.take_reset_pending());
        assert!(!nss.take_reset_pending());
    }
}
