//! Monitor-set / monitor-point tables (C5, spec.md §4.5: "Each table
//! (`domain`, `address`, `nv`, `alias`, `monitor-set`, `monitor-point`,
//! and 'node') is a `ConfigurationEntity`"). The source's monitor NV
//! support lives in the VNI layer (outside this core's module
//! boundary, spec.md §1); what this crate needs is the generic
//! ECS-indexed blob storage contract so `monitor_nv_count` in
//! [`crate::tables::nv::NvTable`] has somewhere to point. Each entry is
//! an opaque variable-length record the dispatcher never interprets.

use crate::error::NmStatus;
use crate::link::sicb::Apdu;
use crate::tables::entity::ConfigurationEntity;

#[derive(Debug, Default)]
pub struct BlobTable {
    entries: Vec<Vec<u8>>,
}

impl BlobTable {
    pub fn with_capacity(n: usize) -> Self {
        BlobTable { entries: vec![Vec::new(); n] }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, index: usize) -> Result<&[u8], NmStatus> {
        self.entries.get(index).map(|v| v.as_slice()).ok_or(NmStatus::InvalidParameter)
    }
}

impl ConfigurationEntity for BlobTable {
    fn initialize(&mut self, start: u16, end: u16, _data: &[u8], _domain_index: u8) -> Result<(), NmStatus> {
        for i in start..=end {
            let slot = self.entries.get_mut(i as usize).ok_or(NmStatus::InvalidParameter)?;
            slot.clear();
        }
        Ok(())
    }

    fn create(&mut self, start: u16, data: &[u8]) -> Result<(), NmStatus> {
        if start as usize >= self.entries.len() {
            self.entries.resize(start as usize + 1, Vec::new());
        }
        self.entries[start as usize] = data.to_vec();
        Ok(())
    }

    fn remove(&mut self, start: u16, end: u16) -> Result<(), NmStatus> {
        for i in start..=end {
            let slot = self.entries.get_mut(i as usize).ok_or(NmStatus::InvalidParameter)?;
            slot.clear();
        }
        Ok(())
    }

    fn update(&mut self, start: u16, data: &[u8]) -> Result<(), NmStatus> {
        let slot = self.entries.get_mut(start as usize).ok_or(NmStatus::InvalidParameter)?;
        *slot = data.to_vec();
        Ok(())
    }

    fn enumerate(&self, start: u16, _authenticated: bool, out: &mut Apdu) -> Result<(), NmStatus> {
        let data = self.get(start as usize)?;
        out.data.extend_from_slice(data);
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
    fn create_and_enumerate() {
        let mut table = BlobTable::with_capacity(2);
        table.create(0, &[1, 2, 3]).unwrap();
        let mut out = Apdu::new(0, Vec::new());
        table.enumerate(0, false, &mut out).unwrap();
        assert_eq!(out.data, vec![1, 2, 3]);
    }
}
