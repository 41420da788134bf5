//! Top-level wiring: C1 (link) through C7 (MIP-app translation) threaded
//! together behind explicit `Arc` handles (spec.md §9 "Global mutable
//! state" redesign note — no process-wide singleton, every task gets the
//! handles it needs from the constructor).
//!
//! Grounded on the teacher's `App`/client-task wiring in
//! `src/network/client.rs`: one long-lived receive loop `tokio::select!`s
//! over a shutdown `Notify` and the link driver's read, following the
//! same select-loop shape.

use std::collections::VecDeque;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use tokio::sync::{mpsc, oneshot, Mutex, Notify};
use tracing::{debug, error, info, warn};

use crate::error::LtError;
use crate::link::driver::LinkDriver;
use crate::link::sicb::{cmd, queue_field, AddressBlock, Apdu, IncomingFrameType, Sicb};
use crate::lsip::LsIpMap;
use crate::mipapp::{DownlinkOutcome, MipAppTranslator};
use crate::netmgmt::{NetworkManager, NmRequest, DEFAULT_QUEUE_DEPTH};
use crate::socketmap::{AnnouncementSink, BindSurface, LoopbackBindSurface, SocketMap, TracingAnnouncementSink};
use crate::tables::DeviceStackTables;

type NmChannel = mpsc::Sender<(NmRequest, oneshot::Sender<Option<Apdu>>)>;

fn jittered_retransmit_tick() -> Duration {
    let spread = RETRANSMIT_JITTER.as_millis() as i64;
    let offset = rand::rng().random_range(-spread..=spread);
    let base = RETRANSMIT_TICK.as_millis() as i64;
    Duration::from_millis((base + offset).max(1) as u64)
}

/// spec.md §4.2 send path: a single long-running ~20 ms (jittered) sleep
/// loop plays the role of the per-packet retransmit timer, rather than a
/// one-shot timer started and cancelled per queue-full event (this
/// crate's own simplification — see [`DeviceStack::retransmit_loop`]).
const RETRANSMIT_TICK: Duration = Duration::from_millis(20);
/// +/- spread applied to each retransmit tick so that many stacks on the
/// same channel don't retry in lockstep (spec.md §4.2's "retransmit
/// timer" doesn't pin a fixed period; this crate's own jitter choice).
const RETRANSMIT_JITTER: Duration = Duration::from_millis(4);
/// spec.md §4.3 "default ~5-minute aging interval".
const AGING_TICK: Duration = Duration::from_secs(300);
/// spec.md §4.4 "Rebinding": retried at this cadence; each candidate's
/// own exponential backoff (`SocketMap::rebind_pass`) decides whether a
/// given tick actually attempts it.
const REBIND_TICK: Duration = Duration::from_secs(5);

/// Optional protocol-analyser hook (spec.md §4.2 "reports to a
/// protocol-analyser sink if registered"), mirroring the
/// `AnnouncementSink` external-collaborator pattern in `socketmap`.
#[async_trait]
pub trait ProtocolAnalyserSink: Send + Sync {
    async fn on_sent(&self, sicb: &Sicb);
}

/// Priority/normal transmit queues (spec.md §4.2 send path). A failed
/// `try_transmit` re-queues at the head of whichever queue the packet
/// came from, so it's retried ahead of anything enqueued after it.
#[derive(Default)]
struct SendQueue {
    priority: VecDeque<Sicb>,
    normal: VecDeque<Sicb>,
}

impl SendQueue {
    fn is_empty(&self) -> bool {
        self.priority.is_empty() && self.normal.is_empty()
    }

    fn push_back(&mut self, sicb: Sicb, priority: bool) {
        if priority {
            self.priority.push_back(sicb);
        } else {
            self.normal.push_back(sicb);
        }
    }

    fn push_front(&mut self, sicb: Sicb, priority: bool) {
        if priority {
            self.priority.push_front(sicb);
        } else {
            self.normal.push_front(sicb);
        }
    }

    fn pop_front(&mut self) -> Option<(Sicb, bool)> {
        if let Some(s) = self.priority.pop_front() {
            return Some((s, true));
        }
        self.normal.pop_front().map(|s| (s, false))
    }
}

/// The assembled device stack. Owns the link driver, the NM worker's
/// channel (the worker itself runs on its own task), the MIP-app
/// translator, the LS/IP map and the device-socket map.
pub struct DeviceStack {
    pub link: Arc<dyn LinkDriver>,
    nm_tx: NmChannel,
    translator: Mutex<MipAppTranslator>,
    pub ls_ip_map: Arc<LsIpMap>,
    pub socket_map: Arc<SocketMap>,
    send_queue: Mutex<SendQueue>,
    analyser_sink: Mutex<Option<Arc<dyn ProtocolAnalyserSink>>>,
    announcement_sink: Arc<dyn AnnouncementSink>,
    shutdown: Notify,
}

impl DeviceStack {
    /// Assemble the stack and spawn the NM worker task (spec.md §5
    /// "Net-manager worker": single task owning C5/C6 state, driven by a
    /// bounded mpsc queue).
    pub fn new(link: Arc<dyn LinkDriver>, tables: DeviceStackTables, xcvr_id: u8) -> Arc<Self> {
        Self::with_bind_surface(link, tables, xcvr_id, Arc::new(LoopbackBindSurface))
    }

    pub fn with_bind_surface(
        link: Arc<dyn LinkDriver>,
        tables: DeviceStackTables,
        xcvr_id: u8,
        bind_surface: Arc<dyn BindSurface>,
    ) -> Arc<Self> {
        let socket_map = Arc::new(SocketMap::new(bind_surface));
        let (nm_tx, nm_rx) = mpsc::channel(DEFAULT_QUEUE_DEPTH);
        let mut manager = NetworkManager::new(tables).with_socket_map(socket_map.clone());
        tokio::spawn(async move {
            manager.run(nm_rx).await;
        });

        let stack = Arc::new(DeviceStack {
            link,
            nm_tx,
            translator: Mutex::new(MipAppTranslator::new(xcvr_id)),
            ls_ip_map: Arc::new(LsIpMap::new()),
            socket_map,
            send_queue: Mutex::new(SendQueue::default()),
            analyser_sink: Mutex::new(None),
            announcement_sink: Arc::new(TracingAnnouncementSink),
            shutdown: Notify::new(),
        });
        stack.clone().spawn_background_loops();
        stack
    }

    /// Registers (or replaces) the protocol-analyser sink (spec.md §4.2
    /// "if registered").
    pub async fn register_analyser_sink(&self, sink: Arc<dyn ProtocolAnalyserSink>) {
        *self.analyser_sink.lock().await = Some(sink);
    }

    /// Spawns the background maintenance loops (retransmit, device-socket
    /// rebind/announce, LS/IP aging) that keep running for the stack's
    /// lifetime, all exiting on [`DeviceStack::request_shutdown`].
    fn spawn_background_loops(self: Arc<Self>) {
        let retransmit = self.clone();
        tokio::spawn(async move { retransmit.retransmit_loop().await });
        let rebind = self.clone();
        tokio::spawn(async move { rebind.rebind_loop().await });
        let announce = self.clone();
        tokio::spawn(async move { announce.announce_loop().await });
        let aging = self.clone();
        tokio::spawn(async move { aging.aging_loop().await });
    }

    async fn retransmit_loop(self: Arc<Self>) {
        loop {
            tokio::select! {
                _ = self.shutdown.notified() => break,
                _ = tokio::time::sleep(jittered_retransmit_tick()) => {
                    let next = { self.send_queue.lock().await.pop_front() };
                    if let Some((sicb, priority)) = next {
                        self.try_transmit(sicb, priority).await;
                    }
                }
            }
        }
    }

    async fn rebind_loop(self: Arc<Self>) {
        let mut interval = tokio::time::interval(REBIND_TICK);
        loop {
            tokio::select! {
                _ = self.shutdown.notified() => break,
                _ = interval.tick() => self.socket_map.rebind_pass().await,
            }
        }
    }

    async fn announce_loop(self: Arc<Self>) {
        loop {
            let period = self.socket_map.announce_period().await;
            tokio::select! {
                _ = self.shutdown.notified() => break,
                _ = tokio::time::sleep(period) => {
                    self.socket_map
                        .announce_pass(self.announcement_sink.as_ref(), crate::socketmap::DEFAULT_ANNOUNCE_THROTTLE)
                        .await;
                }
            }
        }
    }

    async fn aging_loop(self: Arc<Self>) {
        let mut interval = tokio::time::interval(AGING_TICK);
        loop {
            tokio::select! {
                _ = self.shutdown.notified() => break,
                _ = interval.tick() => self.ls_ip_map.tick_aging(),
            }
        }
    }

    /// Submit an NM request and await its reply (spec.md §5: "requests
    /// cross into the NM worker only through this queue; the worker
    /// never reaches back out for state").
    pub async fn submit_nm(&self, apdu: Apdu, authenticated: bool) -> Result<Option<Apdu>, LtError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.nm_tx
            .send((NmRequest { apdu, authenticated }, reply_tx))
            .await
            .map_err(|_| LtError::QueueFull)?;
        reply_rx.await.map_err(|_| LtError::QueueFull)
    }

    /// Wakes every background loop (receive loop plus the four
    /// maintenance loops spawned by [`Self::spawn_background_loops`]),
    /// not just one waiter (spec.md §5: shutdown is device-wide).
    pub fn request_shutdown(&self) {
        self.shutdown.notify_waiters();
    }

    /// Long-lived receive loop (spec.md §5): reads frames off the link,
    /// routes `MI_NETMGMT` into the NM worker and `MI_COMM` through the
    /// MIP-app translator, and writes back whatever reply results.
    pub async fn run_receive_loop(self: Arc<Self>) {
        loop {
            tokio::select! {
                _ = self.shutdown.notified() => {
                    info!("device stack receive loop shutting down");
                    break;
                }
                frame = self.link.read(crate::link::sicb::guaranteed_apdu_len(), std::time::Duration::from_millis(200)) => {
                    match frame {
                        Ok(Some(bytes)) => self.handle_incoming_frame(&bytes).await,
                        Ok(None) => {}
                        Err(e) => {
                            warn!(error = %e, "link read failed");
                        }
                    }
                }
            }
        }
    }

    /// Uplink frame-type dispatch (spec.md §4.2 table): the first byte
    /// off the link is the frame type, not a SICB command byte — that
    /// only appears once the frame body is handed to
    /// [`Self::deliver_packet`].
    async fn handle_incoming_frame(&self, bytes: &[u8]) {
        let Some((&first, body)) = bytes.split_first() else {
            warn!("empty frame from link");
            return;
        };

        match IncomingFrameType::from_first_byte(first) {
            IncomingFrameType::L2Traditional => self.deliver_packet(body).await,
            IncomingFrameType::Mode1Phase => {
                // Phase byte is consumed and discarded: phase-mode
                // tracking has no consumer in this core (spec.md §1,
                // no physical transceiver to steer).
                if body.is_empty() {
                    warn!("truncated mode-1 phase frame");
                    return;
                }
                self.deliver_packet(&body[1..]).await;
            }
            IncomingFrameType::Mode2PhaseSsi => {
                // This crate's own choice: a fixed 2-byte SSI tail,
                // since spec.md doesn't pin an exact width.
                const SSI_TAIL_LEN: usize = 2;
                if body.len() < 1 + SSI_TAIL_LEN {
                    warn!("truncated mode-2 phase/SSI frame");
                    return;
                }
                let end = body.len() - SSI_TAIL_LEN;
                self.deliver_packet(&body[1..end]).await;
            }
            IncomingFrameType::LocalNmResponse => {
                debug!("local NM response frame received");
            }
            IncomingFrameType::FrequencyReport => {
                debug!("line-frequency report received");
            }
            IncomingFrameType::Reset => {
                info!("link reset frame received");
            }
            IncomingFrameType::NetworkError(code) => {
                warn!(code, "network error frame received");
            }
            IncomingFrameType::Unknown(other) => {
                debug!(first_byte = other, "unhandled incoming frame type");
            }
        }
    }

    /// Decodes the SICB carried by a traditional/phase/SSI frame body
    /// and routes it by SICB command byte (spec.md §4.2: `MI_NETMGMT`
    /// into C6, `MI_COMM` into C7).
    async fn deliver_packet(&self, bytes: &[u8]) {
        let decoded = match Sicb::decode(bytes, false, false) {
            Ok(s) => s,
            Err(e) => {
                warn!(error = %e, "failed to decode incoming SICB");
                return;
            }
        };

        match decoded.command {
            c if c == cmd::MI_NETMGMT => self.handle_netmgmt_frame(decoded).await,
            c if c == cmd::MI_COMM => self.handle_comm_frame(decoded).await,
            c if c == cmd::MI_RESET => {
                info!("comm-layer reset frame received");
            }
            other => debug!(command = other, "unhandled SICB command"),
        }
    }

    async fn handle_netmgmt_frame(&self, sicb: Sicb) {
        let authenticated = sicb.flags.auth;
        match self.submit_nm(sicb.apdu, authenticated).await {
            Ok(Some(reply)) => {
                let reply_sicb =
                    Sicb { command: cmd::MI_NETMGMT, flags: sicb.flags, address: sicb.address, apdu: reply };
                if let Ok(bytes) = reply_sicb.encode() {
                    if let Err(e) = self.link.write(&bytes).await {
                        warn!(error = %e, "failed to write NM reply");
                    }
                }
            }
            Ok(None) => {}
            Err(e) => error!(error = %e, "NM worker unavailable"),
        }
    }

    async fn handle_comm_frame(&self, sicb: Sicb) {
        if sicb.apdu.code == 0x7D {
            let mut translator = self.translator.lock().await;
            let channel_id = match &sicb.address {
                Some(AddressBlock::Incoming(a)) => a.domain_index,
                _ => 0,
            };
            if let Some(payload) = translator.handle_device_escape(&sicb.apdu, channel_id) {
                let reply = Sicb {
                    command: cmd::MI_COMM,
                    flags: sicb.flags,
                    address: sicb.address,
                    apdu: Apdu::new(sicb.apdu.code, payload),
                };
                if let Ok(bytes) = reply.encode() {
                    let _ = self.link.write(&bytes).await;
                }
            }
            return;
        }

        let mut translator = self.translator.lock().await;
        let uplink = translator.incoming_sicb(sicb);
        drop(translator);
        debug!(code = uplink.apdu.code, "application message delivered uplink");
    }

    /// Downlink send path (spec.md §4.7 `send`/`sendMsg` feeding §4.2's
    /// `sendPacket`): run the translator, then queue-or-transmit
    /// whatever it produces. Priority is carried on `Sicb::flags.prio`
    /// rather than a separate parameter, so this keeps `sendPacket`'s
    /// `(refId, flags, data, len, priority)` shape without widening the
    /// signature.
    pub async fn send(&self, sicb: Sicb) -> Result<(), LtError> {
        let mut translator = self.translator.lock().await;
        let outcome = translator.send(sicb);
        drop(translator);
        match outcome {
            DownlinkOutcome::Forward(out) => self.enqueue_or_transmit(out).await,
            DownlinkOutcome::NsaStackErrorLogged => Ok(()),
            DownlinkOutcome::LocalResponse(reply) => self.enqueue_or_transmit(reply).await,
        }
    }

    /// spec.md §4.2: `try_transmit` immediately if the queue is empty,
    /// otherwise enqueue behind whatever's already backed up.
    async fn enqueue_or_transmit(&self, sicb: Sicb) -> Result<(), LtError> {
        let priority = sicb.flags.prio;
        let empty = { self.send_queue.lock().await.is_empty() };
        if empty {
            self.try_transmit(sicb, priority).await;
        } else {
            self.send_queue.lock().await.push_back(sicb, priority);
        }
        Ok(())
    }

    /// spec.md §4.2 `try_transmit`: frame, set the SICB queue field to
    /// TQ/TQP per priority, write to the driver. Queue-full re-queues at
    /// the head for the retransmit loop to retry; any other error bumps
    /// the transmission-error counter; success reports to the
    /// protocol-analyser sink if one is registered.
    async fn try_transmit(&self, mut sicb: Sicb, priority: bool) {
        sicb.flags.queue = if priority { queue_field::TQP } else { queue_field::TQ };
        let bytes = match sicb.encode() {
            Ok(b) => b,
            Err(e) => {
                warn!(error = %e, "failed to encode outgoing SICB");
                return;
            }
        };

        match self.link.write(&bytes).await {
            Ok(()) => {
                if let Some(sink) = self.analyser_sink.lock().await.as_ref() {
                    sink.on_sent(&sicb).await;
                }
            }
            Err(LtError::QueueFull) => {
                self.send_queue.lock().await.push_front(sicb, priority);
                self.link.record_backoff().await;
            }
            Err(e) => {
                warn!(error = %e, "transmit failed");
                self.link.record_transmission_error().await;
            }
        }
    }

    pub async fn query_ip_addr(&self, domain: crate::tables::domain::DomainId, subnet: u8, node: u8) -> Ipv4Addr {
        self.socket_map.query_ip_addr(domain, subnet, node).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::driver::MockLinkDriver;
    use crate::link::sicb::{SicbFlags, OutgoingAddress};
    use crate::netmgmt::codes;
    use crate::persist::MemoryBackend;

    fn tables() -> DeviceStackTables {
        DeviceStackTables::new(Arc::new(MemoryBackend::new()), [0x00, 0x02, 0x47, 0x94, 0x89, 0x00], *b"SIGNAL\x00\x01")
    }

    #[tokio::test]
    async fn submit_nm_round_trip_query_id() {
        let link: Arc<dyn LinkDriver> = Arc::new(MockLinkDriver::new(4, [0; 6]));
        let stack = DeviceStack::new(link, tables(), 4);
        let reply = stack.submit_nm(Apdu::new(codes::QUERY_ID, vec![0x00]), false).await.unwrap().unwrap();
        assert_eq!(reply.code, codes::success_reply(codes::QUERY_ID));
    }

    #[tokio::test]
    async fn receive_loop_routes_netmgmt_frame_and_replies() {
        let driver = Arc::new(MockLinkDriver::new(4, [0; 6]));
        let link: Arc<dyn LinkDriver> = driver.clone();
        link.open("mock0").await.unwrap();
        let stack = DeviceStack::new(link.clone(), tables(), 4);

        let request = Sicb {
            command: cmd::MI_NETMGMT,
            flags: SicbFlags::default(),
            address: None,
            apdu: Apdu::new(codes::QUERY_ID, vec![0x00]),
        };
        let mut frame = vec![0x1A]; // IncomingFrameType::L2Traditional
        frame.extend_from_slice(&request.encode().unwrap());
        driver.inject_incoming(frame).await;

        let stack_for_loop = stack.clone();
        let handle = tokio::spawn(async move { stack_for_loop.run_receive_loop().await });
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        stack.request_shutdown();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn send_forwards_normal_message() {
        let link: Arc<dyn LinkDriver> = Arc::new(MockLinkDriver::new(4, [0; 6]));
        link.open("mock0").await.unwrap();
        let stack = DeviceStack::new(link, tables(), 4);
        let sicb = Sicb {
            command: cmd::MI_COMM,
            flags: SicbFlags::default(),
            address: Some(AddressBlock::Outgoing(OutgoingAddress::SubnetNode {
                subnet: 1,
                node: 2,
                retry: 0,
                tx_timer: 0,
            })),
            apdu: Apdu::new(0x01, vec![9, 9]),
        };
        stack.send(sicb).await.unwrap();
    }

    struct RecordingAnalyserSink {
        seen: Arc<std::sync::Mutex<Vec<u8>>>,
    }

    #[async_trait::async_trait]
    impl ProtocolAnalyserSink for RecordingAnalyserSink {
        async fn on_sent(&self, sicb: &Sicb) {
            self.seen.lock().unwrap().push(sicb.apdu.code);
        }
    }

    #[tokio::test]
    async fn send_reports_to_registered_analyser_sink_on_success() {
        let link: Arc<dyn LinkDriver> = Arc::new(MockLinkDriver::new(4, [0; 6]));
        link.open("mock0").await.unwrap();
        let stack = DeviceStack::new(link, tables(), 4);
        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
        stack.register_analyser_sink(Arc::new(RecordingAnalyserSink { seen: seen.clone() })).await;

        let sicb = Sicb {
            command: cmd::MI_COMM,
            flags: SicbFlags::default(),
            address: Some(AddressBlock::Outgoing(OutgoingAddress::SubnetNode {
                subnet: 1,
                node: 2,
                retry: 0,
                tx_timer: 0,
            })),
            apdu: Apdu::new(0x01, vec![9, 9]),
        };
        stack.send(sicb).await.unwrap();
        assert_eq!(*seen.lock().unwrap(), vec![0x01]);
    }

    #[tokio::test]
    async fn send_requeues_on_queue_full_and_retransmit_loop_drains_it() {
        let driver = Arc::new(MockLinkDriver::new(4, [0; 6]));
        let link: Arc<dyn LinkDriver> = driver.clone();
        link.open("mock0").await.unwrap();
        // MockLinkDriver's write() shares its backpressure check with
        // pending_rx/queue_capacity (default 100) — fill it via the
        // public inject hook to force the first send to see queue-full.
        for _ in 0..100 {
            driver.inject_incoming(vec![0u8; 1]).await;
        }
        let stack = DeviceStack::new(link.clone(), tables(), 4);

        let sicb = Sicb {
            command: cmd::MI_COMM,
            flags: SicbFlags::default(),
            address: Some(AddressBlock::Outgoing(OutgoingAddress::SubnetNode {
                subnet: 1,
                node: 2,
                retry: 0,
                tx_timer: 0,
            })),
            apdu: Apdu::new(0x01, vec![9, 9]),
        };
        stack.send(sicb).await.unwrap();
        assert_eq!(driver.stats().primary.backoffs, 1);

        // Drain the injected backlog so the next retransmit tick's write succeeds.
        for _ in 0..100 {
            let _ = link.read(4, std::time::Duration::from_millis(10)).await;
        }
        tokio::time::sleep(std::time::Duration::from_millis(60)).await;
        assert!(driver.stats().primary.transmitted >= 1);
    }

    #[tokio::test]
    async fn handle_incoming_frame_ignores_empty_and_unknown_frames() {
        let link: Arc<dyn LinkDriver> = Arc::new(MockLinkDriver::new(4, [0; 6]));
        let stack = DeviceStack::new(link, tables(), 4);
        stack.handle_incoming_frame(&[]).await;
        stack.handle_incoming_frame(&[0xEE]).await; // IncomingFrameType::Unknown
    }
}
