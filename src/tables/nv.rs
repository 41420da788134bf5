//! Network-variable and alias tables (C5, spec.md §3 "NV configuration
//! entry", §4.5 "NV table stores both NVs and aliases in one logical
//! sequence partitioned by count").
//!
//! Grounded on `LtNetworkManager::determineNvIndex` /
//! `processUpdateNetworkVariable`: legacy commands see one flat index
//! space covering static+dynamic NVs followed by aliases, with the
//! monitor-NV region hidden in between. `determine_nv_index` below is
//! the direct port of `determineNvIndex`'s "skip the monitor NVs" rule.

use crate::error::NmStatus;
use crate::link::sicb::Apdu;
use crate::tables::entity::ConfigurationEntity;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Input,
    Output,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceType {
    Acknowledged,
    Unacknowledged,
    Request,
}

/// spec.md §3 "NV configuration entry".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NvConfigEntry {
    pub selector: u16, // 14-bit
    pub direction: Direction,
    pub priority: bool,
    pub service_type: ServiceType,
    pub authenticated: bool,
    pub address_table_index: u8,
    pub turnaround: bool,
}

impl Default for NvConfigEntry {
    fn default() -> Self {
        NvConfigEntry {
            selector: 0x3FFF, // unbound selector
            direction: Direction::Input,
            priority: false,
            service_type: ServiceType::Acknowledged,
            authenticated: false,
            address_table_index: 0,
            turnaround: false,
        }
    }
}

impl NvConfigEntry {
    pub fn encode(&self) -> [u8; 4] {
        let sel = self.selector & 0x3FFF;
        let mut b0 = (sel >> 8) as u8 & 0x3F;
        if self.direction == Direction::Output {
            b0 |= 0x80;
        }
        if self.turnaround {
            b0 |= 0x40;
        }
        let b1 = sel as u8;
        let mut b2 = self.address_table_index;
        if self.priority {
            b2 |= 0x80;
        }
        if self.authenticated {
            b2 |= 0x40;
        }
        let b3 = match self.service_type {
            ServiceType::Acknowledged => 0,
            ServiceType::Unacknowledged => 1,
            ServiceType::Request => 2,
        };
        [b0, b1, b2, b3]
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, NmStatus> {
        if bytes.len() < 4 {
            return Err(NmStatus::NvLengthMismatch);
        }
        let selector = (((bytes[0] & 0x3F) as u16) << 8) | bytes[1] as u16;
        Ok(NvConfigEntry {
            selector,
            direction: if bytes[0] & 0x80 != 0 { Direction::Output } else { Direction::Input },
            turnaround: bytes[0] & 0x40 != 0,
            priority: bytes[2] & 0x80 != 0,
            authenticated: bytes[2] & 0x40 != 0,
            address_table_index: bytes[2] & 0x3F,
            service_type: match bytes[3] {
                1 => ServiceType::Unacknowledged,
                2 => ServiceType::Request,
                _ => ServiceType::Acknowledged,
            },
        })
    }
}

/// An alias points back at a primary NV index plus an override of any
/// of the above fields (spec.md §3).
#[derive(Debug, Clone, Copy, Default)]
pub struct AliasConfigEntry {
    pub primary: u16,
    pub selector_override: Option<u16>,
    pub address_table_index_override: Option<u8>,
    pub service_type_override: Option<ServiceType>,
}

impl AliasConfigEntry {
    /// Resolve this alias against its primary NV to produce the
    /// effective `NvConfigEntry` a caller would see.
    pub fn resolve(&self, primaries: &[NvConfigEntry]) -> Result<NvConfigEntry, NmStatus> {
        let mut base = *primaries.get(self.primary as usize).ok_or(NmStatus::InvalidNvIndex)?;
        if let Some(sel) = self.selector_override {
            base.selector = sel;
        }
        if let Some(ati) = self.address_table_index_override {
            base.address_table_index = ati;
        }
        if let Some(st) = self.service_type_override {
            base.service_type = st;
        }
        Ok(base)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NvKind {
    Nv,
    Alias,
}

/// C5's combined NV/alias table.
#[derive(Debug, Default)]
pub struct NvTable {
    nvs: Vec<NvConfigEntry>,
    aliases: Vec<AliasConfigEntry>,
    /// Monitor NVs exist in the underlying store but are hidden from
    /// legacy-indexed commands (spec.md §4.5).
    pub monitor_nv_count: u16,
}

impl NvTable {
    pub fn with_capacity(nv_count: usize, alias_count: usize) -> Self {
        NvTable {
            nvs: vec![NvConfigEntry::default(); nv_count],
            aliases: vec![AliasConfigEntry::default(); alias_count],
            monitor_nv_count: 0,
        }
    }

    pub fn nv_count(&self) -> u16 {
        self.nvs.len() as u16
    }

    pub fn alias_count(&self) -> u16 {
        self.aliases.len() as u16
    }

    /// `LtNetworkManager::determineNvIndex`: legacy commands only see
    /// static+dynamic NVs directly; an index that would land in the
    /// alias region is shifted by the hidden monitor-NV count.
    pub fn determine_nv_index(&self, raw_index: u16) -> u16 {
        if raw_index >= self.nv_count() {
            raw_index + self.monitor_nv_count
        } else {
            raw_index
        }
    }

    pub fn get(&self, index: u16, kind: NvKind) -> Result<NvConfigEntry, NmStatus> {
        match kind {
            NvKind::Nv => self.nvs.get(index as usize).copied().ok_or(NmStatus::InvalidNvIndex),
            NvKind::Alias => {
                let alias = self.aliases.get(index as usize).ok_or(NmStatus::InvalidNvIndex)?;
                alias.resolve(&self.nvs)
            }
        }
    }

    pub fn set(&mut self, index: u16, entry: NvConfigEntry, kind: NvKind) -> Result<(), NmStatus> {
        match kind {
            NvKind::Nv => {
                let slot = self.nvs.get_mut(index as usize).ok_or(NmStatus::InvalidNvIndex)?;
                *slot = entry;
            }
            NvKind::Alias => {
                let slot = self.aliases.get_mut(index as usize).ok_or(NmStatus::InvalidNvIndex)?;
                slot.selector_override = Some(entry.selector);
                slot.address_table_index_override = Some(entry.address_table_index);
                slot.service_type_override = Some(entry.service_type);
            }
        }
        Ok(())
    }

    /// Legacy `UPDATE_NETWORK_VARIABLE`/`QUERY_NETWORK_VARIABLE`: one
    /// flat index space spanning NVs then aliases, monitor NVs hidden.
    pub fn get_legacy(&self, raw_index: u16) -> Result<NvConfigEntry, NmStatus> {
        let idx = self.determine_nv_index(raw_index);
        if idx < self.nv_count() {
            self.get(idx, NvKind::Nv)
        } else {
            let alias_idx = idx - self.nv_count() - self.monitor_nv_count;
            self.get(alias_idx, NvKind::Alias)
        }
    }

    pub fn set_legacy(&mut self, raw_index: u16, entry: NvConfigEntry) -> Result<(), NmStatus> {
        let idx = self.determine_nv_index(raw_index);
        if idx < self.nv_count() {
            self.set(idx, entry, NvKind::Nv)
        } else {
            let alias_idx = idx - self.nv_count() - self.monitor_nv_count;
            self.set(alias_idx, entry, NvKind::Alias)
        }
    }
}

impl ConfigurationEntity for NvTable {
    fn initialize(&mut self, start: u16, end: u16, _data: &[u8], _domain_index: u8) -> Result<(), NmStatus> {
        for i in start..=end {
            self.set(i, NvConfigEntry::default(), NvKind::Nv)?;
        }
        Ok(())
    }

    fn create(&mut self, start: u16, data: &[u8]) -> Result<(), NmStatus> {
        let entry = NvConfigEntry::decode(data)?;
        if start as usize >= self.nvs.len() {
            self.nvs.resize(start as usize + 1, NvConfigEntry::default());
        }
        self.set(start, entry, NvKind::Nv)
    }

    fn remove(&mut self, start: u16, end: u16) -> Result<(), NmStatus> {
        for i in start..=end {
            self.set(i, NvConfigEntry::default(), NvKind::Nv)?;
        }
        Ok(())
    }

    fn update(&mut self, start: u16, data: &[u8]) -> Result<(), NmStatus> {
        let entry = NvConfigEntry::decode(data)?;
        self.set(start, entry, NvKind::Nv)
    }

    fn enumerate(&self, start: u16, _authenticated: bool, out: &mut Apdu) -> Result<(), NmStatus> {
        let entry = self.get(start, NvKind::Nv)?;
        out.data.extend_from_slice(&entry.encode());
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

    fn check_limits(&self, _cmd: u8, data: &[u8]) -> Result<(), NmStatus> {
        if data.len() > 64 {
            return Err(NmStatus::NvLengthMismatch);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_decode_round_trip() {
        let entry = NvConfigEntry {
            selector: 1234,
            direction: Direction::Output,
            priority: true,
            service_type: ServiceType::Unacknowledged,
            authenticated: true,
            address_table_index: 5,
            turnaround: false,
        };
        let decoded = NvConfigEntry::decode(&entry.encode()).unwrap();
        assert_eq!(entry, decoded);
    }

    #[test]
    fn legacy_index_skips_monitor_region() {
        let mut table = NvTable::with_capacity(4, 2);
        table.monitor_nv_count = 3;
        // raw index 4 (first alias) must resolve to the alias region,
        // not into the hidden monitor NVs.
        let entry = NvConfigEntry { selector: 99, ..Default::default() };
        table.set_legacy(4, entry).unwrap();
        let back = table.get_legacy(4).unwrap();
        assert_eq!(back.selector, 99);
    }

    #[test]
    fn alias_resolves_against_primary_with_overrides() {
        let mut table = NvTable::with_capacity(2, 1);
        table.nvs[0] = NvConfigEntry { selector: 10, address_table_index: 1, ..Default::default() };
        table.aliases[0] = AliasConfigEntry { primary: 0, selector_override: Some(20), ..Default::default() };
        let resolved = table.get(0, NvKind::Alias).unwrap();
        assert_eq!(resolved.selector, 20);
        assert_eq!(resolved.address_table_index, 1); // inherited, not overridden
    }
}
