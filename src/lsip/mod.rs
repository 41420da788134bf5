//! C3: LS/IP address map (spec.md §4.3).
//!
//! Tracks per-(domain,subnet,node) whether the target uses an
//! LS-derived IP address or an arbitrary one, aging out arbitrary
//! mappings that haven't been refreshed by an announcement. Grounded
//! on `original_source/LonTalkStack/Source/LonLinkIzoT/IzoTLsIpMapping.cpp`,
//! re-expressed with an ordered map instead of the original's
//! hand-rolled linked list of per-domain subnet arrays (spec.md §9).

use std::collections::HashMap;
use std::sync::Mutex;

use tracing::trace;

use crate::tables::domain::{DomainId, MAX_NODE_ID, MAX_SUBNET_ID};

/// Number of aging ticks an arbitrary mapping survives without a
/// refresh (spec.md §4.3: "default 2 ticks ... after two ticks we
/// should have seen an announcement").
pub const AGE_LIMIT: u8 = 2;

pub type IpBytes = [u8; 4];

#[derive(Debug, Clone, Copy)]
struct ArbitraryEntry {
    bytes: IpBytes,
    age: u8,
}

/// Per-subnet mapping info for all 128 nodes: a bitmap of "uses derived
/// IP" plus a sparse map of arbitrary addresses. `NodeInfo` for a
/// subnet is allocated lazily on first write (spec.md §4.3 invariant:
/// "unused subnets/nodes allocate no storage").
#[derive(Debug, Default)]
struct NodeInfo {
    derived_bitmap: [u8; 16], // 128 bits, one per node id
    arbitrary: HashMap<u8, ArbitraryEntry>,
}

impl NodeInfo {
    fn get_derived(&self, node: u8) -> bool {
        self.derived_bitmap[(node / 8) as usize] & (1 << (node % 8)) != 0
    }

    fn set_derived(&mut self, node: u8, derived: bool) {
        let mask = 1u8 << (node % 8);
        if derived {
            self.derived_bitmap[(node / 8) as usize] |= mask;
            self.arbitrary.remove(&node); // derived-bit set ⇒ no arbitrary entry
        } else {
            self.derived_bitmap[(node / 8) as usize] &= !mask;
        }
    }

    fn set_all_derived(&mut self) {
        self.derived_bitmap = [0xFF; 16];
        self.arbitrary.clear();
    }

    fn get_arbitrary(&self, node: u8) -> Option<IpBytes> {
        self.arbitrary.get(&node).map(|e| e.bytes)
    }

    fn set_arbitrary(&mut self, node: u8, addr: Option<IpBytes>) {
        match addr {
            Some(bytes) => {
                self.set_derived_bit_only(node, false);
                self.arbitrary.insert(node, ArbitraryEntry { bytes, age: 0 });
            }
            None => {
                self.arbitrary.remove(&node);
            }
        }
    }

    fn set_derived_bit_only(&mut self, node: u8, derived: bool) {
        let mask = 1u8 << (node % 8);
        if derived {
            self.derived_bitmap[(node / 8) as usize] |= mask;
        } else {
            self.derived_bitmap[(node / 8) as usize] &= !mask;
        }
    }

    fn tick_aging(&mut self) {
        self.arbitrary.retain(|node, entry| {
            entry.age += 1;
            let keep = entry.age < AGE_LIMIT;
            if !keep {
                trace!(node, "arbitrary IP mapping aged out");
            }
            keep
        });
    }
}

/// Per-domain subnet table, allocated lazily per subnet.
#[derive(Debug, Default)]
struct SubnetInfo {
    subnets: HashMap<u8, NodeInfo>,
}

impl SubnetInfo {
    fn node_mut(&mut self, subnet: u8) -> &mut NodeInfo {
        self.subnets.entry(subnet).or_default()
    }
}

/// The LS/IP address map (C3). One instance per link; internally
/// keyed by domain so multiple domain memberships don't collide.
#[derive(Default)]
pub struct LsIpMap {
    domains: Mutex<HashMap<DomainId, SubnetInfo>>,
}

fn valid(subnet: u8, node: u8) -> bool {
    subnet <= MAX_SUBNET_ID && node <= MAX_NODE_ID
}

impl LsIpMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_derived(&self, domain: DomainId, subnet: u8, node: u8) -> bool {
        if !valid(subnet, node) {
            return false;
        }
        let domains = self.domains.lock().unwrap();
        domains
            .get(&domain)
            .and_then(|s| s.subnets.get(&subnet))
            .map(|n| n.get_derived(node))
            .unwrap_or(false)
    }

    /// Sets or clears the derived bit. Setting it clears any arbitrary
    /// mapping (spec.md §4.3 invariant: derived XOR arbitrary).
    pub fn set_derived(&self, domain: DomainId, subnet: u8, node: u8, derived: bool) {
        if !valid(subnet, node) {
            return;
        }
        let mut domains = self.domains.lock().unwrap();
        domains.entry(domain).or_default().node_mut(subnet).set_derived(node, derived);
    }

    pub fn get_arbitrary(&self, domain: DomainId, subnet: u8, node: u8) -> Option<IpBytes> {
        if !valid(subnet, node) {
            return None;
        }
        let domains = self.domains.lock().unwrap();
        domains.get(&domain).and_then(|s| s.subnets.get(&subnet)).and_then(|n| n.get_arbitrary(node))
    }

    /// Sets, refreshes (age reset to 0), or clears an arbitrary mapping.
    /// Setting one clears the derived bit (spec.md §4.3 invariant).
    pub fn set_arbitrary(&self, domain: DomainId, subnet: u8, node: u8, addr: Option<IpBytes>) {
        if !valid(subnet, node) {
            return;
        }
        let mut domains = self.domains.lock().unwrap();
        domains.entry(domain).or_default().node_mut(subnet).set_arbitrary(node, addr);
    }

    /// Bulk set/clear the derived bit for every node on each subnet
    /// named in `subnet_bitmap` (spec.md §4.3).
    pub fn set_derived_subnets(&self, domain: DomainId, subnet_bitmap: &[u8; 32], set: bool) {
        let mut domains = self.domains.lock().unwrap();
        let entry = domains.entry(domain).or_default();
        for subnet in 0u16..=(MAX_SUBNET_ID as u16) {
            let byte = subnet_bitmap[(subnet / 8) as usize];
            if byte & (1 << (subnet % 8)) == 0 {
                continue;
            }
            if set {
                entry.node_mut(subnet as u8).set_all_derived();
            } else {
                entry.subnets.remove(&(subnet as u8));
            }
        }
    }

    /// Advances the aging clock for every arbitrary mapping across all
    /// domains/subnets (spec.md §4.3).
    pub fn tick_aging(&self) {
        let mut domains = self.domains.lock().unwrap();
        for subnet_info in domains.values_mut() {
            for node_info in subnet_info.subnets.values_mut() {
                node_info.tick_aging();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d() -> DomainId {
        DomainId::new([0; 6], 0)
    }

    #[test]
    fn derived_and_arbitrary_are_mutually_exclusive() {
        let map = LsIpMap::new();
        map.set_derived(d(), 1, 5, true);
        assert!(map.get_derived(d(), 1, 5));
        map.set_arbitrary(d(), 1, 5, Some([192, 168, 1, 10]));
        assert!(!map.get_derived(d(), 1, 5));
        assert_eq!(map.get_arbitrary(d(), 1, 5), Some([192, 168, 1, 10]));
        map.set_derived(d(), 1, 5, true);
        assert_eq!(map.get_arbitrary(d(), 1, 5), None);
    }

    #[test]
    fn aging_idempotence_s6() {
        let map = LsIpMap::new();
        map.set_arbitrary(d(), 1, 5, Some([192, 168, 1, 10]));
        for _ in 0..(AGE_LIMIT as u32 + 1) {
            map.tick_aging();
        }
        assert_eq!(map.get_arbitrary(d(), 1, 5), None);
        assert!(!map.get_derived(d(), 1, 5));
    }

    #[test]
    fn refreshing_resets_age() {
        let map = LsIpMap::new();
        map.set_arbitrary(d(), 1, 5, Some([10, 0, 0, 1]));
        map.tick_aging(); // age = 1
        map.set_arbitrary(d(), 1, 5, Some([10, 0, 0, 2])); // refreshed, age = 0
        map.tick_aging(); // age = 1
        assert_eq!(map.get_arbitrary(d(), 1, 5), Some([10, 0, 0, 2]));
    }

    #[test]
    fn out_of_range_rejected_silently() {
        let map = LsIpMap::new();
        map.set_derived(d(), 1, 200, true); // node id out of range
        assert!(!map.get_derived(d(), 1, 200));
    }

    #[test]
    fn unused_subnet_allocates_no_storage() {
        let map = LsIpMap::new();
        assert!(!map.get_derived(d(), 7, 1));
        let domains = map.domains.lock().unwrap();
        assert!(domains.is_empty());
    }

    #[test]
    fn bulk_set_derived_subnets() {
        let map = LsIpMap::new();
        let mut bitmap = [0u8; 32];
        bitmap[0] = 0b0000_0011; // subnets 0 and 1
        map.set_derived_subnets(d(), &bitmap, true);
        assert!(map.get_derived(d(), 0, 10));
        assert!(map.get_derived(d(), 1, 10));
        assert!(!map.get_derived(d(), 2, 10));
    }
}
