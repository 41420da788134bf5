//! Node state, configuration-data blob, and the read-only data image
//! (spec.md §3 "Read-only data", §4.5 "Configuration data blob").
//!
//! Grounded on `LtReadOnlyData.h` (UID at offset 0, program ID at
//! offset 13 — confirmed against spec.md §8 S1's 14-byte reply) and
//! `LtNetworkImage::configData`. The exact byte offsets beyond those
//! two fields are this crate's own layout (spec.md Non-goals exclude
//! bit-exact on-wire framing beyond documented formats); callers reach
//! fields through accessors, never raw offsets.

use crate::error::{LtErrorLog, NmStatus};
use crate::tables::buffer_codes::{self, BufferCount};

pub const READ_ONLY_IMAGE_LEN: usize = 41;

/// spec.md §4.5 "Configuration data blob ... node state".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum NodeState {
    Unconfigured = 0,
    Applicationless = 1,
    Configured = 2,
    HardOffline = 3,
}

impl NodeState {
    pub fn from_u8(v: u8) -> Self {
        match v & 0x3 {
            0 => NodeState::Unconfigured,
            1 => NodeState::Applicationless,
            2 => NodeState::Configured,
            _ => NodeState::HardOffline,
        }
    }
}

/// A program id: 8 bytes (spec.md §8 S1).
pub type ProgramId = [u8; 8];

/// spec.md §4.5: node state, NM auth flag, channel id, priority slot,
/// transceiver id, plus the bookkeeping flags §4.6/§9 describe
/// (`hasBeenEcsChanged`, `eepromLock`, blackout's `pending` flag,
/// `resetRequested`).
#[derive(Debug, Clone)]
pub struct ConfigData {
    pub node_state: NodeState,
    pub nm_auth: bool,
    pub channel_id: u8,
    pub priority_slot: u8,
    pub transceiver_id: i32,
    pub has_been_ecs_changed: bool,
    pub eeprom_lock: bool,
    pub reset_requested: bool,
    /// Blackout's "pending" flag (spec.md §9): set before any write,
    /// cleared only once the write is known to have landed.
    pub write_pending: bool,
    pub error_log: LtErrorLog,
    pub is_mip: bool,
    pub is_router: bool,
    /// `QUERY_ID` selector 1/2 qualifier (spec.md §4.6, §8 S1).
    pub respond_to_query: bool,
}

impl Default for ConfigData {
    fn default() -> Self {
        ConfigData {
            node_state: NodeState::Unconfigured,
            nm_auth: false,
            channel_id: 0,
            priority_slot: 0,
            transceiver_id: -1,
            has_been_ecs_changed: false,
            eeprom_lock: false,
            reset_requested: false,
            write_pending: false,
            error_log: LtErrorLog::NoError,
            is_mip: false,
            is_router: false,
            respond_to_query: false,
        }
    }
}

impl ConfigData {
    pub fn unconfigured(&self) -> bool {
        self.node_state == NodeState::Unconfigured
    }

    /// `CHANGE_STATE`/`LEAVE_DOMAIN`'s "go unconfigured" path (spec.md
    /// §4.6 `NODE_MODE`, §4.5 persistence contract). Clears the ECS
    /// lockout too, matching the source's `domainTable.goUnconfigured`
    /// ("go unconfigured clears the lock").
    pub fn go_unconfigured(&mut self) {
        self.node_state = NodeState::Unconfigured;
        self.has_been_ecs_changed = false;
    }

    /// spec.md §4.5: "recompute==false with non-trivial config change
    /// ⇒ the node goes UNCONFIGURED and logs CNFG_CS_ERROR".
    pub fn config_write_without_checksum(&mut self) {
        self.node_state = NodeState::Unconfigured;
        self.error_log = LtErrorLog::CnfgCsError;
    }
}

/// The 41-byte read-only image (spec.md §3 "Read-only data").
#[derive(Debug, Clone)]
pub struct ReadOnlyData {
    pub unique_id: [u8; 6],
    pub model_number: u8,
    pub minor_model_number: u8,
    pub program_id: ProgramId,
    pub net_out_size: u16,
    pub net_in_size: u16,
    pub num_net_out_bufs: u8,
    pub num_net_out_priority_bufs: u8,
    pub num_net_in_bufs: u8,
    pub address_table_size: u16,
    pub nv_table_size: u16,
    pub alias_table_size: u16,
    /// Dirty-cache flag (spec.md §3: "writes go through a cache; a
    /// pending-update flag indicates dirty data that must be committed
    /// before reset").
    pending_update: bool,
}

impl ReadOnlyData {
    pub fn new(unique_id: [u8; 6], program_id: ProgramId) -> Self {
        ReadOnlyData {
            unique_id,
            model_number: 0,
            minor_model_number: 0,
            program_id,
            net_out_size: 114,
            net_in_size: 114,
            num_net_out_bufs: 2,
            num_net_out_priority_bufs: 1,
            num_net_in_bufs: 2,
            address_table_size: 15,
            nv_table_size: 0,
            alias_table_size: 0,
            pending_update: false,
        }
    }

    pub fn pending_update(&self) -> bool {
        self.pending_update
    }

    pub fn clear_pending_update(&mut self) {
        self.pending_update = false;
    }

    /// S1 reply payload: UID then program ID, 14 bytes.
    pub fn query_id_payload(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(14);
        out.extend_from_slice(&self.unique_id);
        out.extend_from_slice(&self.program_id);
        out
    }

    pub fn set_network_buffers(&mut self, out_size: u16, out_bufs: u8, out_priority_bufs: u8) {
        self.net_out_size = out_size;
        self.num_net_out_bufs = out_bufs;
        self.num_net_out_priority_bufs = out_priority_bufs;
        self.pending_update = true;
    }

    pub fn set_app_buffers(&mut self, _in_size: u16, _in_bufs: u8) {
        self.pending_update = true;
    }

    /// `toLonTalk(offset, length)`: read a window of the 41-byte image.
    pub fn to_wire(&self, offset: usize, length: usize) -> Result<Vec<u8>, NmStatus> {
        let image = self.encode();
        if offset + length > READ_ONLY_IMAGE_LEN {
            return Err(NmStatus::InvalidParameter);
        }
        Ok(image[offset..offset + length].to_vec())
    }

    /// `fromLonTalk(offset, length, data)`: write a window, going
    /// through the pending-update cache (spec.md §3 invariant).
    pub fn from_wire(&mut self, offset: usize, data: &[u8]) -> Result<(), NmStatus> {
        let mut image = self.encode();
        if offset + data.len() > READ_ONLY_IMAGE_LEN {
            return Err(NmStatus::InvalidParameter);
        }
        image[offset..offset + data.len()].copy_from_slice(data);
        self.decode_into(&image);
        self.pending_update = true;
        Ok(())
    }

    fn encode(&self) -> [u8; READ_ONLY_IMAGE_LEN] {
        let mut out = [0u8; READ_ONLY_IMAGE_LEN];
        out[0..6].copy_from_slice(&self.unique_id);
        out[6] = self.model_number;
        out[7] = self.minor_model_number;
        out[13..21].copy_from_slice(&self.program_id);
        out[21..23].copy_from_slice(&self.address_table_size.to_be_bytes());
        out[23..25].copy_from_slice(&self.nv_table_size.to_be_bytes());
        out[25..27].copy_from_slice(&self.alias_table_size.to_be_bytes());
        out[27] = buffer_codes::pack_nibble_pair(
            buffer_codes::encode_size(self.net_out_size),
            buffer_codes::encode_count(BufferCount::Direct(self.num_net_out_bufs.min(14))),
        );
        out[28] = buffer_codes::pack_nibble_pair(
            buffer_codes::encode_size(self.net_in_size),
            buffer_codes::encode_count(BufferCount::Direct(self.num_net_in_bufs.min(14))),
        );
        out[29] = buffer_codes::pack_nibble_pair(0, self.num_net_out_priority_bufs.min(14));
        out
    }

    fn decode_into(&mut self, image: &[u8; READ_ONLY_IMAGE_LEN]) {
        self.unique_id.copy_from_slice(&image[0..6]);
        self.model_number = image[6];
        self.minor_model_number = image[7];
        self.program_id.copy_from_slice(&image[13..21]);
        self.address_table_size = u16::from_be_bytes([image[21], image[22]]);
        self.nv_table_size = u16::from_be_bytes([image[23], image[24]]);
        self.alias_table_size = u16::from_be_bytes([image[25], image[26]]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> ReadOnlyData {
        ReadOnlyData::new([0x00, 0x02, 0x47, 0x94, 0x89, 0x00], *b"SIGNAL\x00\x01")
    }

    #[test]
    fn s1_query_id_payload() {
        let rod = sample();
        let payload = rod.query_id_payload();
        assert_eq!(payload, vec![0x00, 0x02, 0x47, 0x94, 0x89, 0x00, b'S', b'I', b'G', b'N', b'A', b'L', 0x00, 0x01]);
        assert_eq!(payload.len(), 14);
    }

    #[test]
    fn wire_round_trip_window() {
        let rod = sample();
        let window = rod.to_wire(0, 6).unwrap();
        assert_eq!(window, rod.unique_id);
    }

    #[test]
    fn from_wire_sets_pending_update() {
        let mut rod = sample();
        assert!(!rod.pending_update());
        rod.from_wire(6, &[0x42]).unwrap();
        assert!(rod.pending_update());
        assert_eq!(rod.model_number, 0x42);
    }

    #[test]
    fn config_write_without_checksum_goes_unconfigured() {
        let mut cfg = ConfigData { node_state: NodeState::Configured, ..Default::default() };
        cfg.config_write_without_checksum();
        assert_eq!(cfg.node_state, NodeState::Unconfigured);
        assert_eq!(cfg.error_log, LtErrorLog::CnfgCsError);
    }
}
