//! Domain table (spec.md §3 "Domain", "Domain configuration entry").
//!
//! Wire layout grounded on `LtDomainConfiguration::fromLonTalk`/
//! `toLonTalk` as exercised by spec.md §8 scenario S2: `id[6], length,
//! subnet, node, key[6]` (15 bytes, classic/non-OMA style). The OMA
//! variant doubles the key to 12 bytes (spec.md §3).

use crate::error::{NmStatus, TableError};
use crate::link::sicb::Apdu;
use crate::tables::entity::ConfigurationEntity;

pub const MAX_NODE_ID: u8 = 127;
pub const MAX_SUBNET_ID: u8 = 255;
pub const FLEX_DOMAIN_INDEX: usize = 2;

/// A domain identifier: up to 6 bytes of id plus a length tag. Length 0
/// is the "flex domain" wildcard (spec.md §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct DomainId {
    pub id: [u8; 6],
    pub length: u8,
}

impl DomainId {
    pub fn new(id: [u8; 6], length: u8) -> Self {
        DomainId { id, length }
    }

    pub fn flex() -> Self {
        DomainId { id: [0; 6], length: 0 }
    }

    pub fn is_flex(&self) -> bool {
        self.length == 0
    }

    /// A flex domain entry matches any incoming domain for
    /// authentication only (spec.md §3 invariant).
    pub fn matches(&self, incoming: &DomainId) -> bool {
        if self.is_flex() {
            return true;
        }
        self.length == incoming.length && self.id[..self.length as usize] == incoming.id[..self.length as usize]
    }
}

/// Key material: 6 bytes normally, 12 when OMA is enabled (spec.md §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DomainKey {
    Standard([u8; 6]),
    Oma([u8; 12]),
}

impl Default for DomainKey {
    fn default() -> Self {
        DomainKey::Standard([0; 6])
    }
}

impl DomainKey {
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            DomainKey::Standard(k) => k,
            DomainKey::Oma(k) => k,
        }
    }

    pub fn is_oma(&self) -> bool {
        matches!(self, DomainKey::Oma(_))
    }

    /// `updateKey(increment, data)`: either replace outright, or add
    /// `data` to the existing key byte-by-byte with carry (the OMA
    /// "increment" mode used by `EXP_UPDATE_OMA_KEY` and `SECURITY`).
    pub fn update(&mut self, increment: bool, data: &[u8]) {
        match self {
            DomainKey::Standard(k) => Self::apply(k, increment, data),
            DomainKey::Oma(k) => Self::apply(k, increment, data),
        }
    }

    fn apply(key: &mut [u8], increment: bool, data: &[u8]) {
        if !increment {
            let n = key.len().min(data.len());
            key[..n].copy_from_slice(&data[..n]);
            return;
        }
        let mut carry = 0u16;
        for (k, d) in key.iter_mut().zip(data.iter()) {
            let sum = *k as u16 + *d as u16 + carry;
            *k = sum as u8;
            carry = sum >> 8;
        }
    }
}

/// One of a device's 0-2 domain memberships (spec.md §3 "Domain
/// configuration entry").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DomainConfigEntry {
    pub index: u8,
    pub domain: DomainId,
    pub subnet_id: u8,
    pub node_id: u8,
    pub clone_flag: bool,
    pub key: DomainKey,
}

/// Store size for the classic (non-OMA) wire form: `id[6] + length(1) +
/// subnet(1) + node(1) + key[6]` (spec.md §8 S2).
pub const BASE_DOMAIN_STORE_SIZE: usize = 15;
pub const OMA_DOMAIN_STORE_SIZE: usize = 21;

impl DomainConfigEntry {
    /// `fromLonTalk`: decode the wire form written by `UPDATE_DOMAIN`/
    /// `EXP_JOIN_DOMAIN_NO_KEY`. `index` is supplied separately by the
    /// caller (it precedes this struct on the wire but isn't part of
    /// the struct itself).
    pub fn decode(index: u8, data: &[u8], oma: bool) -> Result<Self, TableError> {
        let expected = if oma { OMA_DOMAIN_STORE_SIZE } else { BASE_DOMAIN_STORE_SIZE };
        if data.len() < expected {
            return Err(TableError::LengthMismatch);
        }
        let mut id = [0u8; 6];
        id.copy_from_slice(&data[0..6]);
        let length = data[6];
        let subnet_id = data[7];
        let node_id = data[8];
        let key = if oma {
            let mut k = [0u8; 12];
            k.copy_from_slice(&data[9..21]);
            DomainKey::Oma(k)
        } else {
            let mut k = [0u8; 6];
            k.copy_from_slice(&data[9..15]);
            DomainKey::Standard(k)
        };
        Ok(DomainConfigEntry { index, domain: DomainId { id, length }, subnet_id, node_id, clone_flag: false, key })
    }

    /// `toLonTalk`: the same 15/21-byte layout, used for `QUERY_DOMAIN`
    /// replies. `keyless` drops the key for the "no key" expanded
    /// variant (`EXP_QUERY_DOMAIN_NO_KEY`).
    pub fn encode(&self, keyless: bool) -> Vec<u8> {
        let mut out = Vec::with_capacity(OMA_DOMAIN_STORE_SIZE);
        out.extend_from_slice(&self.domain.id);
        out.push(self.domain.length);
        out.push(self.subnet_id);
        out.push(self.node_id);
        if !keyless {
            out.extend_from_slice(self.key.as_bytes());
        }
        out
    }
}

/// Up to two device domain memberships plus a flex-domain slot used
/// only for authentication matching (spec.md §3: "A device belongs to
/// 0-2 domains by index").
#[derive(Debug, Clone, Default)]
pub struct DomainTable {
    pub entries: [Option<DomainConfigEntry>; 2],
}

impl DomainTable {
    pub fn get(&self, index: usize) -> Result<DomainConfigEntry, TableError> {
        self.entries.get(index).and_then(|e| *e).ok_or(TableError::IndexOutOfRange)
    }

    pub fn update(&mut self, index: usize, entry: DomainConfigEntry) -> Result<(), TableError> {
        let slot = self.entries.get_mut(index).ok_or(TableError::IndexOutOfRange)?;
        *slot = Some(entry);
        Ok(())
    }

    pub fn leave(&mut self, index: usize) -> Result<(), TableError> {
        let slot = self.entries.get_mut(index).ok_or(TableError::IndexOutOfRange)?;
        *slot = None;
        Ok(())
    }

    /// True if any entry (a real membership, or a flex-domain entry)
    /// matches the incoming domain for authentication purposes.
    pub fn matches_any(&self, incoming: &DomainId) -> bool {
        self.entries.iter().flatten().any(|e| e.domain.matches(incoming))
    }
}

impl ConfigurationEntity for DomainTable {
    fn initialize(&mut self, _start: u16, _end: u16, _data: &[u8], _domain_index: u8) -> Result<(), NmStatus> {
        self.entries = Default::default();
        Ok(())
    }

    fn create(&mut self, _start: u16, _data: &[u8]) -> Result<(), NmStatus> {
        Err(NmStatus::NotImplemented)
    }

    fn remove(&mut self, start: u16, _end: u16) -> Result<(), NmStatus> {
        self.leave(start as usize).map_err(Into::into)
    }

    fn update(&mut self, start: u16, data: &[u8]) -> Result<(), NmStatus> {
        let entry = DomainConfigEntry::decode(start as u8, data, data.len() >= OMA_DOMAIN_STORE_SIZE)?;
        self.update(start as usize, entry).map_err(Into::into)
    }

    fn enumerate(&self, start: u16, _authenticated: bool, out: &mut Apdu) -> Result<(), NmStatus> {
        let entry = self.get(start as usize)?;
        out.data.extend_from_slice(&entry.encode(false));
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
    fn flex_domain_matches_anything() {
        let flex = DomainId::flex();
        let other = DomainId::new([1, 2, 3, 0, 0, 0], 3);
        assert!(flex.matches(&other));
    }

    #[test]
    fn non_flex_requires_exact_match() {
        let a = DomainId::new([1, 2, 3, 0, 0, 0], 3);
        let b = DomainId::new([1, 2, 4, 0, 0, 0], 3);
        assert!(!a.matches(&b));
        assert!(a.matches(&a.clone()));
    }

    #[test]
    fn s2_update_domain_wire_format() {
        // spec.md §8 S2: APDU data after the 0x63 code and index byte.
        let data = [0x49, 0x53, 0x49, 0x00, 0x00, 0x00, 0x03, 0x01, 0x04, 0x4B, 0xE6, 0xDA, 0x7A, 0x1F, 0x3A];
        let entry = DomainConfigEntry::decode(0, &data, false).unwrap();
        assert_eq!(entry.domain.length, 3);
        assert_eq!(&entry.domain.id[..3], b"ISI");
        assert_eq!(entry.subnet_id, 1);
        assert_eq!(entry.node_id, 4);
        assert_eq!(entry.key.as_bytes(), &[0x4B, 0xE6, 0xDA, 0x7A, 0x1F, 0x3A]);
        assert_eq!(entry.encode(false), data);
    }

    #[test]
    fn update_and_leave_domain() {
        let mut table = DomainTable::default();
        let entry = DomainConfigEntry { index: 0, subnet_id: 1, node_id: 4, ..Default::default() };
        table.update(0, entry).unwrap();
        assert_eq!(table.get(0).unwrap().node_id, 4);
        table.leave(0).unwrap();
        assert!(table.get(0).is_err());
    }
}
