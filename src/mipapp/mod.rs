//! C7: MIP-app translator (spec.md §4.7).
//!
//! Bidirectional translation between the SICB byte stream a host
//! application sees and the internal message/response/completion
//! callbacks, with request/response correlation by a 4-bit tag.
//! Grounded on `LtMipApp.cpp`'s `toLonTalk`/`fromLonTalk`/
//! `msgCompletes` trio; the hand-rolled tag table there becomes
//! [`TagPool`] here (spec.md §9 "ordered map keyed by id").

pub mod nss;

use std::collections::HashMap;

use tracing::{debug, warn};

use crate::link::sicb::{svc, AddressBlock, Apdu, OutgoingAddress, Sicb, SicbFlags, cmd};

/// Pool capacity: one slot per possible 4-bit tag (spec.md §4.7 "a
/// bounded pool of request slots keyed by 4-bit tags").
pub const TAG_POOL_CAPACITY: usize = 16;

/// A request held for later response correlation.
#[derive(Debug, Clone)]
pub struct StoredRequest {
    pub apdu: Apdu,
    pub address: Option<AddressBlock>,
    pub flags: SicbFlags,
}

/// Opaque handle returned by [`TagPool::allocate`]; a completion must
/// present the same handle for the stored request to resolve (spec.md
/// §8 property 7: "any late response for the evicted tag MUST be
/// dropped").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TagHandle {
    pub tag: u8,
    instance: u32,
}

struct TagSlot {
    request: StoredRequest,
    instance: u32,
}

/// Bounded pool of request slots keyed by a 4-bit tag. On exhaustion,
/// evicts whichever slot has the oldest `instance` by unsigned
/// difference against the running counter (spec.md §4.7).
#[derive(Default)]
pub struct TagPool {
    slots: HashMap<u8, TagSlot>,
    next_instance: u32,
}

impl TagPool {
    pub fn new() -> Self {
        TagPool::default()
    }

    /// Allocate a tag for `request`. Returns the handle for the new
    /// occupant and, if a prior occupant was evicted to make room, the
    /// handle that must now be treated as stale.
    pub fn allocate(&mut self, request: StoredRequest) -> (TagHandle, Option<TagHandle>) {
        let instance = self.next_instance;
        self.next_instance = self.next_instance.wrapping_add(1);

        if let Some(free_tag) = (0..TAG_POOL_CAPACITY as u8).find(|t| !self.slots.contains_key(t)) {
            self.slots.insert(free_tag, TagSlot { request, instance });
            return (TagHandle { tag: free_tag, instance }, None);
        }

        let (&oldest_tag, oldest_slot) = self
            .slots
            .iter()
            .min_by_key(|(_, slot)| instance.wrapping_sub(slot.instance))
            .expect("capacity > 0 implies at least one occupied slot");
        let evicted = TagHandle { tag: oldest_tag, instance: oldest_slot.instance };
        self.slots.insert(oldest_tag, TagSlot { request, instance });
        (TagHandle { tag: oldest_tag, instance }, Some(evicted))
    }

    /// Resolve a completion: only succeeds if `handle` still matches
    /// the slot's current occupant (not evicted and replaced since).
    pub fn take(&mut self, handle: TagHandle) -> Option<StoredRequest> {
        match self.slots.get(&handle.tag) {
            Some(slot) if slot.instance == handle.instance => self.slots.remove(&handle.tag).map(|s| s.request),
            _ => None,
        }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

/// spec.md §4.7 "local/broadcast NM escape": `ESCAPE_GENERAL /
/// PRODUCT_QUERY` sub-command.
pub const ESCAPE_GENERAL_PRODUCT_QUERY: u8 = 0x00;
pub const ESCAPE_NSS: u8 = 0x01;

pub const MIPAPP_VERSION: u8 = 4;

/// A downlink APDU `send`/`sendMsg` classifies into, before it's
/// turned into wire bytes (spec.md §4.7).
pub enum DownlinkOutcome {
    /// Forward as a normal outgoing SICB.
    Forward(Sicb),
    /// NSA-relative write at the well-known stack-error slot: logged
    /// locally, short-circuited with a success NM response, nothing
    /// goes on the wire.
    NsaStackErrorLogged,
    /// A local-NM response was resolved from the tag pool and should
    /// be delivered directly, bypassing the link.
    LocalResponse(Sicb),
}

pub struct MipAppTranslator {
    pub tag_pool: TagPool,
    /// Saved outgoing explicit address from the last downlink wink, so
    /// a zero-data uplink wink on turnaround can restore it (spec.md
    /// §4.7).
    last_wink_address: Option<OutgoingAddress>,
    /// Most recent unanswered incoming request's tag, keyed by APDU
    /// code, so a later downlink reply to that same code can be routed
    /// back without the caller re-supplying the requester's address.
    pending_by_code: HashMap<u8, TagHandle>,
    pub nss: nss::NssState,
    xcvr_id: u8,
}

impl MipAppTranslator {
    pub fn new(xcvr_id: u8) -> Self {
        MipAppTranslator {
            tag_pool: TagPool::new(),
            last_wink_address: None,
            pending_by_code: HashMap::new(),
            nss: nss::NssState::default(),
            xcvr_id,
        }
    }

    /// SICB ← wire (uplink, spec.md §4.7 `incoming_sicb`). Request-class
    /// application messages are stashed in the tag pool so a later
    /// downlink reply can be resolved back to the requester without the
    /// caller re-supplying the address (spec.md §4.7 "local response").
    pub fn incoming_sicb(&mut self, mut sicb: Sicb) -> Sicb {
        if let Some(AddressBlock::Incoming(addr)) = &mut sicb.address {
            if addr.group_format {
                // GROUP_ACK: rewrite to SUBNET_NODE with grp=0, per spec.
                addr.group_format = false;
                addr.dest_node_or_group = 0;
            }
        }

        if sicb.apdu.is_empty() && self.is_wink(&sicb) {
            if let Some(saved) = self.last_wink_address.take() {
                sicb.address = Some(AddressBlock::Outgoing(saved));
            }
        }

        if self.is_request_class(&sicb) {
            let code = sicb.apdu.code;
            let request = StoredRequest { apdu: sicb.apdu.clone(), address: sicb.address, flags: sicb.flags };
            let (handle, evicted) = self.tag_pool.allocate(request);
            if let Some(evicted) = evicted {
                warn!(tag = evicted.tag, "evicted stale request awaiting a local response");
                self.pending_by_code.retain(|_, h| *h != evicted);
            }
            self.pending_by_code.insert(code, handle);
        }

        sicb
    }

    /// spec.md §4.7: an incoming application message whose `svc` asks
    /// for a reply and isn't itself a reply.
    fn is_request_class(&self, sicb: &Sicb) -> bool {
        sicb.command == cmd::MI_COMM && sicb.flags.svc == svc::REQUEST && !sicb.flags.rsp
    }

    fn is_wink(&self, sicb: &Sicb) -> bool {
        sicb.command == cmd::MI_NETMGMT && sicb.apdu.code == 0x7F
    }

    /// APDU → wire (downlink, spec.md §4.7 `send`/`sendMsg`).
    pub fn send(&mut self, mut outgoing: Sicb) -> DownlinkOutcome {
        if let Some(AddressBlock::Outgoing(addr)) = &outgoing.address {
            if self.is_wink(&outgoing) {
                self.last_wink_address = Some(*addr);
            }
        }

        if self.is_nsa_stack_error_write(&outgoing) {
            warn!("NSA-relative write logged as stack error, response short-circuited");
            return DownlinkOutcome::NsaStackErrorLogged;
        }

        if outgoing.flags.rsp {
            if let Some(resolved) = self.resolve_local_response(&mut outgoing) {
                return DownlinkOutcome::LocalResponse(resolved);
            }
        }

        DownlinkOutcome::Forward(outgoing)
    }

    /// `WRITE_MEMORY mode=ABSOLUTE addr=0xF1FD len=1` (spec.md §4.7).
    fn is_nsa_stack_error_write(&self, sicb: &Sicb) -> bool {
        const WRITE_MEMORY: u8 = 0x6E;
        const NSA_STACK_ERROR_ADDR: u16 = 0xF1FD;
        const ABSOLUTE_MODE: u8 = 3;
        sicb.apdu.code == WRITE_MEMORY
            && sicb.apdu.len() >= 4
            && sicb.apdu.get(0) == ABSOLUTE_MODE
            && u16::from_be_bytes([sicb.apdu.get(1), sicb.apdu.get(2)]) == NSA_STACK_ERROR_ADDR
            && sicb.apdu.get(3) == 1
    }

    /// Resolve a downlink reply against the matching stored uplink
    /// request (by APDU code), addressing it back to the original
    /// requester instead of requiring the caller to supply an address.
    fn resolve_local_response(&mut self, outgoing: &mut Sicb) -> Option<Sicb> {
        let code = outgoing.apdu.code;
        let handle = self.pending_by_code.remove(&code)?;
        let stored = self.tag_pool.take(handle)?;
        debug!(tag = handle.tag, code, "resolved local response from stored request");
        Some(Sicb {
            command: cmd::MI_COMM,
            flags: outgoing.flags,
            address: stored.address,
            apdu: std::mem::replace(&mut outgoing.apdu, Apdu::new(code, Vec::new())),
        })
    }

    /// `msgCompletes(tag, success)` (spec.md §4.7): reconstructs the
    /// original SICB and delivers it uplink as a completion event.
    pub fn msg_completes(&mut self, handle: TagHandle, success: bool) -> Option<Sicb> {
        let stored = self.tag_pool.take(handle)?;
        debug!(tag = handle.tag, success, "mip-app completion");
        Some(Sicb {
            command: cmd::MI_COMM,
            flags: SicbFlags { rsp: true, ..SicbFlags::default() },
            address: stored.address,
            apdu: Apdu::new(stored.apdu.code, vec![success as u8, 0]),
        })
    }

    /// `ESCAPE_GENERAL / PRODUCT_QUERY` (spec.md §4.7): `{3, 4,
    /// MIPAPP_VERSION, 0, xcvr_id, 0}`.
    pub fn product_query_response(&self, channel_id: u8) -> Vec<u8> {
        vec![3, 4, MIPAPP_VERSION, 0, self.xcvr_id, channel_id]
    }

    /// Dispatch a device-escape APDU (`0x7D`) to either the product
    /// query or the NSS subset.
    pub fn handle_device_escape(&mut self, apdu: &Apdu, channel_id: u8) -> Option<Vec<u8>> {
        match apdu.get(0) {
            ESCAPE_GENERAL_PRODUCT_QUERY => Some(self.product_query_response(channel_id)),
            ESCAPE_NSS => self.handle_nss_escape(&apdu.data[1..], channel_id),
            _ => None,
        }
    }

    fn handle_nss_escape(&mut self, data: &[u8], channel_id: u8) -> Option<Vec<u8>> {
        const SET_MODE: u8 = 0x00;
        const TRIGGER_RESET: u8 = 0x01;
        const STORE_LOCAL: u8 = 0x02;
        const RETRIEVE_LOCAL: u8 = 0x03;
        const QUERY_EEVARS: u8 = 0x04;

        match data.first().copied()? {
            SET_MODE => {
                let mode = nss::NssMipMode::from_u8(*data.get(1)?)?;
                self.nss.set_mode(mode);
                Some(vec![])
            }
            TRIGGER_RESET => {
                self.nss.trigger_reset();
                Some(vec![])
            }
            STORE_LOCAL => {
                self.nss.store_local_data(&data[1..]);
                Some(vec![])
            }
            RETRIEVE_LOCAL => Some(self.nss.local_data().to_vec()),
            QUERY_EEVARS => {
                let vars = self.nss.eevars(self.xcvr_id, channel_id);
                Some(vec![vars.mode.as_u8(), vars.xcvr_id, vars.channel_id])
            }
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stored(code: u8) -> StoredRequest {
        StoredRequest { apdu: Apdu::new(code, Vec::new()), address: None, flags: SicbFlags::default() }
    }

    #[test]
    fn property7_tag_eviction_drops_late_response() {
        let mut pool = TagPool::new();
        let mut handles = Vec::new();
        for i in 0..TAG_POOL_CAPACITY as u8 {
            let (handle, evicted) = pool.allocate(stored(i));
            assert!(evicted.is_none());
            handles.push(handle);
        }
        assert_eq!(pool.len(), TAG_POOL_CAPACITY);

        // (M - K) + 1'th request evicts the oldest (tag 0's handle).
        let (new_handle, evicted) = pool.allocate(stored(99));
        let evicted = evicted.expect("pool was full, an eviction must occur");
        assert_eq!(evicted.tag, handles[0].tag);

        // The late response for the evicted handle must be dropped.
        assert!(pool.take(evicted).is_none());
        // The new occupant resolves fine.
        assert!(pool.take(new_handle).is_some());
    }

    #[test]
    fn allocate_reuses_freed_tag_before_evicting() {
        let mut pool = TagPool::new();
        let (first, _) = pool.allocate(stored(1));
        pool.take(first).unwrap();
        let (second, evicted) = pool.allocate(stored(2));
        assert!(evicted.is_none());
        assert_eq!(second.tag, first.tag);
    }

    #[test]
    fn product_query_response_shape() {
        let translator = MipAppTranslator::new(42);
        assert_eq!(translator.product_query_response(7), vec![3, 4, MIPAPP_VERSION, 0, 42, 7]);
    }

    #[test]
    fn nsa_stack_error_write_short_circuits() {
        let mut translator = MipAppTranslator::new(1);
        let sicb = Sicb {
            command: cmd::MI_NETMGMT,
            flags: SicbFlags::default(),
            address: None,
            apdu: Apdu::new(0x6E, vec![3, 0xF1, 0xFD, 1, 0x55]),
        };
        assert!(matches!(translator.send(sicb), DownlinkOutcome::NsaStackErrorLogged));
    }

    #[test]
    fn incoming_request_resolves_into_addressed_local_response() {
        let mut translator = MipAppTranslator::new(1);
        let incoming = Sicb {
            command: cmd::MI_COMM,
            flags: SicbFlags { svc: svc::REQUEST, ..SicbFlags::default() },
            address: Some(AddressBlock::Outgoing(OutgoingAddress::SubnetNode {
                subnet: 1,
                node: 9,
                retry: 0,
                tx_timer: 0,
            })),
            apdu: Apdu::new(0x42, vec![1, 2, 3]),
        };
        translator.incoming_sicb(incoming);
        assert_eq!(translator.tag_pool.len(), 1);

        let reply = Sicb {
            command: cmd::MI_COMM,
            flags: SicbFlags { rsp: true, ..SicbFlags::default() },
            address: None,
            apdu: Apdu::new(0x42, vec![0xAA]),
        };
        match translator.send(reply) {
            DownlinkOutcome::LocalResponse(resolved) => {
                assert_eq!(
                    resolved.address,
                    Some(AddressBlock::Outgoing(OutgoingAddress::SubnetNode {
                        subnet: 1,
                        node: 9,
                        retry: 0,
                        tx_timer: 0
                    }))
                );
                assert_eq!(resolved.apdu.data, vec![0xAA]);
            }
            _ => panic!("expected a resolved local response"),
        }
        assert!(translator.tag_pool.is_empty());
    }

    #[test]
    fn nss_store_and_retrieve_round_trip() {
        let mut translator = MipAppTranslator::new(1);
        let store_apdu = Apdu::new(0x7D, vec![ESCAPE_NSS, 0x02, 1, 2, 3]);
        translator.handle_device_escape(&store_apdu, 0).unwrap();
        let retrieve_apdu = Apdu::new(0x7D, vec![ESCAPE_NSS, 0x03]);
        let reply = translator.handle_device_escape(&retrieve_apdu, 0).unwrap();
        assert_eq!(&reply[..3], &[1, 2, 3]);
    }
}
