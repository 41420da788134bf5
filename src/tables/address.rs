//! Address table (C5, spec.md §3 "Address table entry (outgoing)",
//! §4.5 "Address table encoding is versioned"). Legacy tables hold up
//! to 15 entries, EAT (Extended Address Table) tables up to 256.
//! Grounded on `LtNetworkManager::processUpdateAddress` (`fromLonTalk`
//! style 1, legacy index bound `MAX_EAT_ADDRESS_TABLE_ENTRIES`).

use crate::error::{NmStatus, TableError};
use crate::link::sicb::{Apdu, OutgoingAddress};
use crate::tables::entity::ConfigurationEntity;

pub const LEGACY_ADDRESS_TABLE_SIZE: usize = 15;
pub const MAX_EAT_ADDRESS_TABLE_ENTRIES: usize = 256;

#[derive(Debug, Default)]
pub struct AddressTable {
    entries: Vec<OutgoingAddress>,
}

impl AddressTable {
    pub fn new() -> Self {
        AddressTable { entries: vec![OutgoingAddress::Unbound; LEGACY_ADDRESS_TABLE_SIZE] }
    }

    pub fn get(&self, index: usize) -> Result<OutgoingAddress, TableError> {
        self.entries.get(index).copied().ok_or(TableError::IndexOutOfRange)
    }

    pub fn set(&mut self, index: usize, addr: OutgoingAddress) -> Result<(), TableError> {
        if index >= MAX_EAT_ADDRESS_TABLE_ENTRIES {
            return Err(TableError::IndexOutOfRange);
        }
        if index >= self.entries.len() {
            self.entries.resize(index + 1, OutgoingAddress::Unbound);
        }
        self.entries[index] = addr;
        Ok(())
    }

    /// `processUpdateAddress`: legacy index is bounded to the EAT max
    /// even though the legacy table itself only has 15 slots — a
    /// legacy tool addressing beyond the EAT max fails outright.
    pub fn update_legacy(&mut self, index: u8, data: &[u8]) -> Result<(), NmStatus> {
        let index = index as usize;
        if index >= MAX_EAT_ADDRESS_TABLE_ENTRIES {
            return Err(NmStatus::InvalidAddrTableIndex);
        }
        if data.len() != 5 {
            return Err(NmStatus::NvLengthMismatch);
        }
        let mut raw = [0u8; 5];
        raw.copy_from_slice(data);
        let addr = OutgoingAddress::decode_classic(raw).map_err(|_| NmStatus::InvalidParameter)?;
        self.set(index, addr).map_err(Into::into)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl ConfigurationEntity for AddressTable {
    fn initialize(&mut self, start: u16, end: u16, _data: &[u8], _domain_index: u8) -> Result<(), NmStatus> {
        for i in start..=end {
            self.set(i as usize, OutgoingAddress::Unbound)?;
        }
        Ok(())
    }

    fn create(&mut self, start: u16, data: &[u8]) -> Result<(), NmStatus> {
        self.update(start, data)
    }

    fn remove(&mut self, start: u16, end: u16) -> Result<(), NmStatus> {
        for i in start..=end {
            self.set(i as usize, OutgoingAddress::Unbound)?;
        }
        Ok(())
    }

    fn update(&mut self, start: u16, data: &[u8]) -> Result<(), NmStatus> {
        self.update_legacy(start as u8, data)
    }

    fn enumerate(&self, start: u16, _authenticated: bool, out: &mut Apdu) -> Result<(), NmStatus> {
        let entry = self.get(start as usize)?;
        out.data.extend_from_slice(&entry.encode_classic());
        Ok(())
    }

    fn resource_specific(
        &mut self,
        _cmd: u8,
        _start: u16,
        _data: &[u8],
        _authenticated: bool,
        _out: &mut Apdu,
    ) -> Result<(), NmStatus> {
        Err(NmStatus::NotImplemented)
    }

    fn check_limits(&self, _cmd: u8, _data: &[u8]) -> Result<(), NmStatus> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn update_and_get_subnet_node_entry() {
        let mut table = AddressTable::new();
        let addr = OutgoingAddress::SubnetNode { subnet: 1, node: 4, retry: 3, tx_timer: 6 };
        table.update_legacy(0, &addr.encode_classic()).unwrap();
        assert_eq!(table.get(0).unwrap(), addr);
    }

    #[test]
    fn index_within_eat_range_but_wrong_length_rejected() {
        let mut table = AddressTable::new();
        let err = table.update_legacy(0, &[0u8; 4]).unwrap_err();
        assert_eq!(err, NmStatus::NvLengthMismatch);
    }

    #[test]
    fn growing_table_past_legacy_size() {
        let mut table = AddressTable::new();
        table.update_legacy(100, &OutgoingAddress::Unbound.encode_classic()).unwrap();
        assert_eq!(table.len(), 101);
    }
}
