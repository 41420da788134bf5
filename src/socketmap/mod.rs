//! C4: device-socket map (spec.md §4.4).
//!
//! Maps `(stack, domain, subnetNode)` to a socket index, ref-counts the
//! unicast addresses behind that index, and owns the rebind/announce
//! timers. Grounded on
//! `original_source/LonTalkStack/Source/LonLinkIzoT/IzoTDevSocketMaps.cpp`;
//! the original's hand-rolled linked lists of `DevConfig`/
//! `DevDomainConfig`/`DevSubnetNodeConfig` become ordered maps keyed by
//! the id field (spec.md §9).

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{info, warn};

use crate::error::LtError;
use crate::tables::domain::DomainId;

pub const NULL_SOCKET_INDEX: usize = usize::MAX;
const MIN_REBIND_BACKOFF: Duration = Duration::from_secs(5);
const MAX_REBIND_BACKOFF: Duration = Duration::from_secs(300);
pub(crate) const DEFAULT_ANNOUNCE_THROTTLE: Duration = Duration::from_millis(500);

/// A refcounted unicast address bound to one socket slot (spec.md §3
/// "Socket/Address map (C4)"). `bind_addr` is the address actually
/// handed to the OS; `logical_addr` is the LS-derived (or arbitrary)
/// address this slot represents to the rest of the stack. They differ
/// in this crate because the derived address's network prefix is not
/// generally ownable on the host running the stack (spec.md's
/// "derived IPv4 from the LS address" is a logical addressing scheme,
/// not a claim that the process can bind to arbitrary /24s) — binding
/// always targets a loopback-reachable surface while refcounting and
/// `query_ip_addr` answer with `logical_addr`.
pub struct UnicastAddress {
    pub logical_addr: Ipv4Addr,
    pub use_count: u32,
    pub is_bound: bool,
    pub is_arbitrary: bool,
    socket: Option<Arc<UdpSocket>>,
    next_attempt_at: Option<Instant>,
    backoff: Duration,
}

impl UnicastAddress {
    fn closed(logical_addr: Ipv4Addr) -> Self {
        UnicastAddress {
            logical_addr,
            use_count: 0,
            is_bound: false,
            is_arbitrary: false,
            socket: None,
            next_attempt_at: None,
            backoff: MIN_REBIND_BACKOFF,
        }
    }

    fn close(&mut self) {
        self.use_count = 0;
        self.is_bound = false;
        self.socket = None;
        self.logical_addr = Ipv4Addr::UNSPECIFIED;
    }
}

/// The derived-IP→UDP-bind-surface mapping. Real deployments bind the
/// literal derived address; this crate's default binds loopback so the
/// stack runs unprivileged and test-reproducibly anywhere. Swappable
/// for a deployment that does own the derived /24s.
pub trait BindSurface: Send + Sync {
    fn bind_target(&self, logical: Ipv4Addr) -> std::net::SocketAddr;
}

pub struct LoopbackBindSurface;
impl BindSurface for LoopbackBindSurface {
    fn bind_target(&self, _logical: Ipv4Addr) -> std::net::SocketAddr {
        std::net::SocketAddr::from(([127, 0, 0, 1], 0))
    }
}

/// Derives the LS→UDP address for `(domain, subnet, node)`: the lower
/// 16 bits of a domain+subnet hash select the `/24` network, and the
/// node id selects the host (spec.md §4.4 step 1). This crate's own
/// scheme — the exact on-wire derivation is a documented LS/IP format
/// this crate doesn't need to reproduce bit-for-bit (spec.md Non-goals).
pub fn derive_ipv4(domain: DomainId, subnet: u8, node: u8) -> Ipv4Addr {
    let mut hash: u16 = 0x811C;
    for b in domain.id[..domain.length as usize].iter().chain(std::iter::once(&subnet)) {
        hash ^= *b as u16;
        hash = hash.wrapping_mul(0x0101);
    }
    Ipv4Addr::new(10, (hash >> 8) as u8, hash as u8, node.saturating_add(1))
}

#[derive(Debug, Clone, Copy, Default)]
pub struct DevSubnetNodeConfig {
    pub socket_index: usize,
}

#[derive(Default)]
pub struct DevDomainConfig {
    pub subnet_nodes: HashMap<(u8, u8), DevSubnetNodeConfig>,
    /// 256-bit group membership bitmap.
    pub groups: [u8; 32],
}

pub struct DevConfig {
    pub stack: u32,
    pub ls_addr_announce_freq: Duration,
    pub ls_addr_announce_throttle: Duration,
    pub ls_addr_age_limit: u8,
    pub domains: HashMap<u8, DevDomainConfig>,
}

impl DevConfig {
    fn new(stack: u32) -> Self {
        DevConfig {
            stack,
            ls_addr_announce_freq: Duration::from_secs(60),
            ls_addr_announce_throttle: DEFAULT_ANNOUNCE_THROTTLE,
            ls_addr_age_limit: crate::lsip::AGE_LIMIT as u8,
            domains: HashMap::new(),
        }
    }
}

#[derive(Default)]
struct UnicastTable {
    entries: Vec<UnicastAddress>,
    realloc_step: usize,
}

impl UnicastTable {
    fn new() -> Self {
        UnicastTable { entries: Vec::new(), realloc_step: 16 }
    }

    fn find(&self, addr: Ipv4Addr) -> Option<usize> {
        self.entries.iter().position(|e| e.use_count > 0 && e.logical_addr == addr)
    }

    fn allocate_slot(&mut self, addr: Ipv4Addr) -> usize {
        if let Some(idx) = self.entries.iter().position(|e| e.use_count == 0) {
            self.entries[idx] = UnicastAddress::closed(addr);
            return idx;
        }
        let start = self.entries.len();
        let grow_to = start + self.realloc_step.max(1);
        self.entries.resize_with(grow_to, || UnicastAddress::closed(Ipv4Addr::UNSPECIFIED));
        self.entries[start] = UnicastAddress::closed(addr);
        start
    }
}

/// C4's public surface.
pub struct SocketMap {
    unicast: Mutex<UnicastTable>,
    multicast_socket: Mutex<Option<Arc<UdpSocket>>>,
    devices: Mutex<HashMap<u32, DevConfig>>,
    bind_surface: Arc<dyn BindSurface>,
}

impl SocketMap {
    pub fn new(bind_surface: Arc<dyn BindSurface>) -> Self {
        SocketMap {
            unicast: Mutex::new(UnicastTable::new()),
            multicast_socket: Mutex::new(None),
            devices: Mutex::new(HashMap::new()),
            bind_surface,
        }
    }

    pub fn with_loopback() -> Self {
        Self::new(Arc::new(LoopbackBindSurface))
    }

    /// spec.md §4.4 `set_unicast_address` algorithm.
    pub async fn set_unicast_address(
        &self,
        stack: u32,
        domain_idx: u8,
        domain: DomainId,
        subnet: u8,
        node: u8,
    ) -> Result<usize, LtError> {
        let logical = derive_ipv4(domain, subnet, node);

        let socket_index = {
            let mut table = self.unicast.lock().await;
            if let Some(idx) = table.find(logical) {
                table.entries[idx].use_count += 1;
                idx
            } else {
                let idx = table.allocate_slot(logical);
                table.entries[idx].use_count = 1;
                idx
            }
        };

        // Attempt bind if this slot isn't bound yet (first registrant
        // for a fresh slot, or a slot that previously failed to bind).
        let needs_bind = {
            let table = self.unicast.lock().await;
            !table.entries[socket_index].is_bound
        };
        if needs_bind {
            self.try_bind(socket_index, logical).await;
        }

        let mut devices = self.devices.lock().await;
        let dev = devices.entry(stack).or_insert_with(|| DevConfig::new(stack));
        let dom = dev.domains.entry(domain_idx).or_default();
        dom.subnet_nodes.insert((subnet, node), DevSubnetNodeConfig { socket_index });

        self.join_multicast_for_domain(dom, subnet).await;

        Ok(socket_index)
    }

    async fn try_bind(&self, socket_index: usize, logical: Ipv4Addr) {
        let target = self.bind_surface.bind_target(logical);
        match UdpSocket::bind(target).await {
            Ok(sock) => {
                let mut table = self.unicast.lock().await;
                let entry = &mut table.entries[socket_index];
                entry.socket = Some(Arc::new(sock));
                entry.is_bound = true;
                entry.backoff = MIN_REBIND_BACKOFF;
                entry.next_attempt_at = None;
                info!(logical = %logical, "unicast socket bound");
            }
            Err(e) => {
                warn!(logical = %logical, error = %e, "bind failed, scheduling rebind");
                let mut table = self.unicast.lock().await;
                let entry = &mut table.entries[socket_index];
                entry.is_bound = false;
                entry.next_attempt_at = Some(Instant::now() + entry.backoff);
            }
        }
    }

    async fn join_multicast_for_domain(&self, _dom: &DevDomainConfig, _subnet: u8) {
        // Real multicast membership requires an interface-bound socket;
        // the shared "multicast socket at index 0" (spec.md §4.4 step 4)
        // is created lazily on first use and is an external-I/O seam
        // the mock driver / tests don't need to exercise.
        let mut guard = self.multicast_socket.lock().await;
        if guard.is_none() {
            if let Ok(sock) = UdpSocket::bind(("0.0.0.0", 0)).await {
                *guard = Some(Arc::new(sock));
            }
        }
    }

    /// spec.md §4.4 `deregister_stack`: unwinds every domain/subnet-node
    /// registered by `stack`, decrementing refcounts and closing
    /// sockets that reach zero.
    pub async fn deregister_stack(&self, stack: u32) {
        let mut devices = self.devices.lock().await;
        let Some(dev) = devices.remove(&stack) else { return };
        let mut table = self.unicast.lock().await;
        for dom in dev.domains.values() {
            for sn in dom.subnet_nodes.values() {
                if let Some(entry) = table.entries.get_mut(sn.socket_index) {
                    if entry.use_count > 0 {
                        entry.use_count -= 1;
                        if entry.use_count == 0 {
                            entry.close();
                        }
                    }
                }
            }
        }
    }

    pub async fn update_group_membership(&self, stack: u32, domain_idx: u8, groups: [u8; 32]) {
        let mut devices = self.devices.lock().await;
        let dev = devices.entry(stack).or_insert_with(|| DevConfig::new(stack));
        dev.domains.entry(domain_idx).or_default().groups = groups;
    }

    /// spec.md §4.4 `query_ip_addr`: the IP this device would use for
    /// the given LS target. §9 open question: left as IPv4-only.
    pub async fn query_ip_addr(&self, domain: DomainId, subnet: u8, node: u8) -> Ipv4Addr {
        derive_ipv4(domain, subnet, node)
    }

    pub async fn set_ls_addr_mapping_config(&self, stack: u32, freq: Duration, throttle: Duration, age_limit: u8) {
        let mut devices = self.devices.lock().await;
        let dev = devices.entry(stack).or_insert_with(|| DevConfig::new(stack));
        dev.ls_addr_announce_freq = freq;
        dev.ls_addr_announce_throttle = throttle;
        dev.ls_addr_age_limit = age_limit;
    }

    /// Use count for a given logical address, for tests/metrics.
    pub async fn use_count_of(&self, addr: Ipv4Addr) -> u32 {
        let table = self.unicast.lock().await;
        table.find(addr).map(|i| table.entries[i].use_count).unwrap_or(0)
    }

    pub async fn is_bound(&self, addr: Ipv4Addr) -> bool {
        let table = self.unicast.lock().await;
        table.find(addr).map(|i| table.entries[i].is_bound).unwrap_or(false)
    }

    /// spec.md §4.4 "Rebinding": retried with exponential backoff
    /// (5s-5min) for every entry with `is_bound==false && use_count>0`.
    pub async fn rebind_pass(&self) {
        let candidates: Vec<(usize, Ipv4Addr)> = {
            let table = self.unicast.lock().await;
            let now = Instant::now();
            table
                .entries
                .iter()
                .enumerate()
                .filter(|(_, e)| !e.is_bound && e.use_count > 0 && e.next_attempt_at.map(|t| now >= t).unwrap_or(true))
                .map(|(i, e)| (i, e.logical_addr))
                .collect()
        };
        for (idx, addr) in candidates {
            self.try_bind(idx, addr).await;
            let mut table = self.unicast.lock().await;
            let entry = &mut table.entries[idx];
            if !entry.is_bound {
                entry.backoff = (entry.backoff * 2).min(MAX_REBIND_BACKOFF);
                entry.next_attempt_at = Some(Instant::now() + entry.backoff);
            }
        }
    }

    /// spec.md §4.4 "Announcements": emits one announcement per
    /// arbitrary-flagged unicast address via `sink`, honoring the
    /// throttle spacing between emissions.
    pub async fn announce_pass(&self, sink: &dyn AnnouncementSink, throttle: Duration) {
        let targets: Vec<Ipv4Addr> = {
            let table = self.unicast.lock().await;
            table.entries.iter().filter(|e| e.use_count > 0 && e.is_arbitrary).map(|e| e.logical_addr).collect()
        };
        for addr in targets {
            sink.announce(addr).await;
            tokio::time::sleep(throttle).await;
        }
    }

    pub async fn mark_arbitrary(&self, addr: Ipv4Addr, arbitrary: bool) {
        let mut table = self.unicast.lock().await;
        if let Some(idx) = table.find(addr) {
            table.entries[idx].is_arbitrary = arbitrary;
        }
    }

    /// spec.md §4.4 "Announcements" period: the largest announce
    /// frequency configured by any stack currently registered, floored
    /// at the default throttle spacing so an idle map still ticks at a
    /// sane rate rather than never.
    pub async fn announce_period(&self) -> Duration {
        let devices = self.devices.lock().await;
        devices.values().map(|d| d.ls_addr_announce_freq).max().unwrap_or(DEFAULT_ANNOUNCE_THROTTLE).max(DEFAULT_ANNOUNCE_THROTTLE)
    }
}

/// The "LS/IP shim" that emits address announcements (spec.md §4.4).
/// External collaborator; the wire format of an announcement itself is
/// out of this core's scope.
#[async_trait::async_trait]
pub trait AnnouncementSink: Send + Sync {
    async fn announce(&self, addr: Ipv4Addr);
}

/// Default announcement sink: logs rather than emitting a real LS/IP
/// wire announcement, since that wire format is out of this core's
/// scope (spec.md §1).
pub struct TracingAnnouncementSink;

#[async_trait::async_trait]
impl AnnouncementSink for TracingAnnouncementSink {
    async fn announce(&self, addr: Ipv4Addr) {
        info!(addr = %addr, "LS/IP address announcement");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dom() -> DomainId {
        DomainId::new([1, 2, 3, 0, 0, 0], 3)
    }

    #[tokio::test]
    async fn s5_address_map_recycle() {
        let map = SocketMap::with_loopback();
        let idx_a = map.set_unicast_address(1, 0, dom(), 1, 5).await.unwrap();
        let idx_b = map.set_unicast_address(2, 0, dom(), 1, 5).await.unwrap();
        assert_eq!(idx_a, idx_b);
        let addr = derive_ipv4(dom(), 1, 5);
        assert_eq!(map.use_count_of(addr).await, 2);

        map.deregister_stack(1).await;
        assert_eq!(map.use_count_of(addr).await, 1);
        assert!(map.is_bound(addr).await);

        map.deregister_stack(2).await;
        assert_eq!(map.use_count_of(addr).await, 0);
    }

    #[tokio::test]
    async fn invariant_refcount_matches_registrations() {
        let map = SocketMap::with_loopback();
        for stack in 0..4u32 {
            map.set_unicast_address(stack, 0, dom(), 2, 10).await.unwrap();
        }
        let addr = derive_ipv4(dom(), 2, 10);
        assert_eq!(map.use_count_of(addr).await, 4);
        map.deregister_stack(0).await;
        map.deregister_stack(1).await;
        assert_eq!(map.use_count_of(addr).await, 2);
    }

    #[tokio::test]
    async fn different_triples_get_different_sockets() {
        let map = SocketMap::with_loopback();
        let idx1 = map.set_unicast_address(1, 0, dom(), 1, 1).await.unwrap();
        let idx2 = map.set_unicast_address(1, 0, dom(), 1, 2).await.unwrap();
        assert_ne!(idx1, idx2);
    }
}
