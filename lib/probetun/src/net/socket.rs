use crate::net::packet::{self, CtrlKind, Packet};
use crate::net::support::MacAddr;
use crate::net::table::AcceptSignal;
use flare::choose;
use flare::logging;
use flare::util;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Combined SSID + vendor IE payload capacity.
pub const MTU_WITH_VENDOR_IE: usize = packet::PAY1_MAX_LEN + packet::PAY2_MAX_LEN;
/// SSID-only payload capacity.
pub const MTU_WITHOUT_VENDOR_IE: usize = packet::PAY1_MAX_LEN;

/// Capability byte exchanged at `pay1[5]` during the handshake.
pub const CAPS_VENDOR_IE: u8 = 2;
pub const CAPS_NO_VENDOR_IE: u8 = 1;
const CAPS_OFFSET: usize = 5;

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum SocketState {
    /// No handshake seen yet.
    Close,
    /// Stage-1 answered, stage-2 outstanding.
    PendingOpen,
    /// Handshake complete, waiting for `accept()`.
    PendingAccept,
    /// Accepted, data may flow.
    Open,
    /// Reset stored, to be flushed on the next inbound frame.
    PendingClose,
    /// Ready to be reaped by the connection table.
    Delete,
}

/// Protocol-side state of a connection. Written by the listener thread only
/// (and by `accept()` for the PENDING_ACCEPT -> OPEN transition).
struct ProtoState {
    state: SocketState,
    client_iv: u32,
    client_iv_bytes: [u8; packet::IV_LEN],
    client_sa_first: Option<MacAddr>,
    tx_vendor_ie_allowed: bool,
    rx_vendor_ie_possible: bool,
    mtu: usize,
    last_rx_packet: Option<Packet>,
    tx_packet: Option<Packet>,
    last_ingress: Instant,
}

/// One logical tunnel to a client: the two-stage handshake, the stop-and-wait
/// bookkeeping and the byte queues shared with the application.
///
/// The identity key is `client_iv` before an id is assigned and `client_id`
/// afterwards; the 802.11 source address is recorded once for diagnostics but
/// never trusted.
pub struct ClientSocket {
    client_id: u8,
    srv_id: u8,
    tx_vendor_ie_supported: bool,
    proto: Mutex<ProtoState>,
    in_queue: Mutex<VecDeque<Vec<u8>>>,
    out_queue: Mutex<VecDeque<Vec<u8>>>,
    accept_signal: Arc<AcceptSignal>,
    log: logging::Logger,
}

impl ClientSocket {
    pub(crate) fn new<'a, L: Into<Option<&'a logging::Logger>>>(
        client_id: u8,
        srv_id: u8,
        tx_vendor_ie_supported: bool,
        accept_signal: Arc<AcceptSignal>,
        log: L,
    ) -> ClientSocket {
        let socket_log = match log.into() {
            Some(log) => log.new(logging::o!("client_id" => client_id)),
            _ => logging::Logger::root(logging::Discard, logging::o!()),
        };

        ClientSocket {
            client_id,
            srv_id,
            tx_vendor_ie_supported,
            proto: Mutex::new(ProtoState {
                state: SocketState::Close,
                client_iv: 0,
                client_iv_bytes: [0; packet::IV_LEN],
                client_sa_first: None,
                tx_vendor_ie_allowed: false,
                rx_vendor_ie_possible: false,
                mtu: MTU_WITH_VENDOR_IE,
                last_rx_packet: None,
                tx_packet: None,
                last_ingress: Instant::now(),
            }),
            in_queue: Mutex::new(VecDeque::new()),
            out_queue: Mutex::new(VecDeque::new()),
            accept_signal,
            log: socket_log,
        }
    }

    #[inline]
    pub fn client_id(&self) -> u8 {
        self.client_id
    }

    #[inline]
    pub fn srv_id(&self) -> u8 {
        self.srv_id
    }

    #[inline]
    pub fn state(&self) -> SocketState {
        self.proto.lock().expect("socket state lock poisoned").state
    }

    /// Negotiated payload capacity per frame, fixed after the handshake.
    #[inline]
    pub fn mtu(&self) -> usize {
        self.proto.lock().expect("socket state lock poisoned").mtu
    }

    #[inline]
    pub fn tx_vendor_ie_allowed(&self) -> bool {
        self.proto.lock().expect("socket state lock poisoned").tx_vendor_ie_allowed
    }

    #[inline]
    pub fn rx_vendor_ie_possible(&self) -> bool {
        self.proto.lock().expect("socket state lock poisoned").rx_vendor_ie_possible
    }

    /// Source address seen on the first stage-1 request. Diagnostics only.
    #[inline]
    pub fn client_sa_first(&self) -> Option<MacAddr> {
        self.proto.lock().expect("socket state lock poisoned").client_sa_first
    }

    #[inline]
    pub(crate) fn client_iv(&self) -> u32 {
        self.proto.lock().expect("socket state lock poisoned").client_iv
    }

    #[inline]
    pub(crate) fn last_ingress_elapsed(&self, now: Instant) -> Duration {
        now.duration_since(self.proto.lock().expect("socket state lock poisoned").last_ingress)
    }

    /// True when inbound chunks are queued for `read()`.
    #[inline]
    pub fn has_in_data(&self) -> bool {
        !self.in_queue.lock().expect("in queue lock poisoned").is_empty()
    }

    /// Dequeues whole chunks as long as the next one still fits in `bufsize`.
    /// Returns an empty buffer when the socket is not open or nothing is
    /// queued. A zero length chunk marks end-of-stream and terminates the
    /// read once dequeued.
    pub fn read(&self, bufsize: usize) -> Vec<u8> {
        if self.state() != SocketState::Open {
            return Vec::new();
        }

        // Length check and pop happen under one lock so the listener cannot
        // grow the queue in between.
        let mut queue = self.in_queue.lock().expect("in queue lock poisoned");
        let mut buf = Vec::new();

        while let Some(chunk_len) = queue.front().map(Vec::len) {
            if buf.len() + chunk_len > bufsize {
                break;
            }

            let chunk = queue.pop_front().expect("peeked chunk vanished");

            if chunk.is_empty() {
                break;
            }

            buf.extend_from_slice(&chunk);
        }

        buf
    }

    /// Splits the supplied bytes into MTU sized chunks and queues them for
    /// transmission on the following round-trips. Never blocks.
    pub fn send(&self, data: &[u8]) {
        let mtu = self.mtu();
        let mut queue = self.out_queue.lock().expect("out queue lock poisoned");

        for chunk in data.chunks(mtu) {
            logging::trace!(self.log, "pushing outbound chunk"; "context" => "send", "len" => chunk.len());
            queue.push_back(chunk.to_vec());
        }
    }

    /// Stores a connection reset as the outstanding response and parks the
    /// socket in PENDING_CLOSE; the listener flushes the reset in reply to
    /// the next inbound frame from this client.
    pub fn shutdown(&self) {
        let mut proto = self.proto.lock().expect("socket state lock poisoned");

        match proto.state {
            SocketState::PendingOpen | SocketState::PendingAccept | SocketState::Open => (),
            _ => return,
        }

        let reset = self.reset_packet(&proto);
        proto.tx_packet = Some(reset);
        self.set_state(&mut proto, SocketState::PendingClose);
    }

    /// Idle housekeeping entry point: resets an open connection that went
    /// quiet past the configured limit.
    pub(crate) fn idle_reset(&self) {
        let mut proto = self.proto.lock().expect("socket state lock poisoned");

        if proto.state != SocketState::Open {
            return;
        }

        logging::info!(self.log, "resetting idle connection"; "context" => "housekeeping");

        let reset = self.reset_packet(&proto);
        proto.tx_packet = Some(reset);
        self.set_state(&mut proto, SocketState::PendingClose);
    }

    /// Claims a handshake-complete socket for the application. Returns false
    /// when the socket is not waiting in PENDING_ACCEPT.
    pub(crate) fn try_accept(&self) -> bool {
        let mut proto = self.proto.lock().expect("socket state lock poisoned");

        if proto.state != SocketState::PendingAccept {
            return false;
        }

        self.set_state(&mut proto, SocketState::Open);
        true
    }

    /// Runs one inbound packet through the state machine and returns the
    /// response to transmit, if any.
    pub(crate) fn handle_request(&self, req: Packet) -> Option<Packet> {
        let mut proto = self.proto.lock().expect("socket state lock poisoned");
        proto.last_ingress = Instant::now();

        if proto.state == SocketState::PendingClose {
            // Flush the stored reset and hand the socket to the reaper.
            let mut resp = proto.tx_packet.clone();
            if let Some(reset) = resp.as_mut() {
                reset.da = req.sa;
            }
            self.set_state(&mut proto, SocketState::Delete);
            return resp;
        }

        match req.ctrl {
            Some(CtrlKind::InitReq1) => self.handle_init_req1(&mut proto, req),
            Some(CtrlKind::InitReq2) if req.seq == 2 => self.handle_init_req2(&mut proto, req),
            Some(CtrlKind::Reset) => {
                logging::debug!(self.log, "connection reset by peer"; "context" => "handle_request");
                self.set_state(&mut proto, SocketState::Delete);
                None
            }
            Some(kind) => {
                logging::debug!(self.log, "unhandled control message";
                                "context" => "handle_request",
                                "kind" => ?kind,
                                "seq" => req.seq);
                None
            }
            None => self.handle_data(&mut proto, req),
        }
    }

    fn handle_init_req1(&self, proto: &mut ProtoState, req: Packet) -> Option<Packet> {
        match proto.state {
            SocketState::Close => {
                let (iv, iv_bytes) = match req.client_iv() {
                    Some(pair) => pair,
                    None => {
                        logging::debug!(self.log, "stage-1 request too short for nonce"; "context" => "init1");
                        return None;
                    }
                };

                proto.client_iv = iv;
                proto.client_iv_bytes = iv_bytes;
                proto.client_sa_first = Some(req.sa);
                proto.rx_vendor_ie_possible = req.pay2.is_some();

                let mut resp = Packet::control(CtrlKind::InitRsp1);
                // Directed response, even if the scan address rotates later.
                resp.da = req.sa;
                resp.pay1.extend_from_slice(&iv_bytes);
                resp.pay1
                    .push(choose!(self.tx_vendor_ie_supported => CAPS_VENDOR_IE, CAPS_NO_VENDOR_IE));
                if self.tx_vendor_ie_supported {
                    resp.pay2 = Some(iv_bytes.to_vec());
                }
                resp.client_id = self.client_id;
                resp.srv_id = self.srv_id;
                resp.seq = 1;
                resp.ack = req.seq;

                logging::debug!(self.log, "handing out client id";
                                "context" => "init1",
                                "client_iv" => iv,
                                "client_sa" => %req.sa,
                                "rx_vendor_ie" => proto.rx_vendor_ie_possible);

                proto.last_rx_packet = Some(req);
                proto.tx_packet = Some(resp.clone());
                self.set_state(proto, SocketState::PendingOpen);

                Some(resp)
            }
            SocketState::PendingOpen if req.ack == 0 => {
                logging::debug!(self.log, "repeated stage-1 request, resending stored response";
                                "context" => "init1");
                proto.tx_packet.clone()
            }
            state => {
                logging::debug!(self.log, "invalid socket state for stage-1 request, resetting";
                                "context" => "init1",
                                "state" => ?state);
                let mut resp = self.reset_packet(proto);
                resp.da = req.sa;
                self.set_state(proto, SocketState::Delete);
                Some(resp)
            }
        }
    }

    fn handle_init_req2(&self, proto: &mut ProtoState, req: Packet) -> Option<Packet> {
        let last_was_req2 = proto
            .last_rx_packet
            .as_ref()
            .and_then(|last| last.ctrl)
            == Some(CtrlKind::InitReq2);

        match proto.state {
            SocketState::PendingOpen => {
                let caps = match req.pay1.get(CAPS_OFFSET) {
                    Some(&caps) => caps,
                    None => {
                        logging::debug!(self.log, "stage-2 request too short for capability byte";
                                        "context" => "init2");
                        return None;
                    }
                };

                match caps {
                    CAPS_VENDOR_IE => {
                        proto.tx_vendor_ie_allowed = true;
                        proto.mtu = MTU_WITH_VENDOR_IE;
                    }
                    CAPS_NO_VENDOR_IE => {
                        proto.tx_vendor_ie_allowed = false;
                        proto.mtu = MTU_WITHOUT_VENDOR_IE;
                    }
                    caps => {
                        logging::debug!(self.log, "invalid vendor IE capability, packet dropped";
                                        "context" => "init2",
                                        "caps" => caps);
                        return None;
                    }
                }

                let mut resp = proto
                    .tx_packet
                    .take()
                    .expect("pending socket lost its stage-1 response");
                resp.ctrl = Some(CtrlKind::InitRsp2);
                resp.da = req.sa;
                resp.pay1 = vec![CtrlKind::InitRsp2.into()];
                resp.pay1.extend_from_slice(&proto.client_iv_bytes);
                resp.pay2 =
                    choose!(proto.tx_vendor_ie_allowed => Some(proto.client_iv_bytes.to_vec()), None);
                resp.seq = 2;
                resp.ack = req.seq;

                logging::debug!(self.log, "handshake complete, queued for accept";
                                "context" => "init2",
                                "tx_vendor_ie" => proto.tx_vendor_ie_allowed,
                                "mtu" => proto.mtu);

                proto.last_rx_packet = Some(req);
                proto.tx_packet = Some(resp.clone());
                self.set_state(proto, SocketState::PendingAccept);

                Some(resp)
            }
            SocketState::PendingAccept => {
                logging::debug!(self.log, "connection in handover queue, resending stage-2 response";
                                "context" => "init2");
                proto.tx_packet.clone()
            }
            SocketState::Open if last_was_req2 => {
                logging::debug!(self.log, "resending stage-2 response"; "context" => "init2");
                proto.tx_packet.clone()
            }
            state => {
                logging::debug!(self.log, "invalid socket state for stage-2 request, resetting";
                                "context" => "init2",
                                "state" => ?state);
                let mut resp = self.reset_packet(proto);
                resp.da = req.sa;
                self.set_state(proto, SocketState::Delete);
                Some(resp)
            }
        }
    }

    // Stop-and-wait bookkeeping:
    //
    // req.seq            req.ack        action
    // == last_rx.seq+1   == tx.seq      enqueue data, advance tx.seq, load next chunk
    // == last_rx.seq+1   != tx.seq      enqueue data, ack it, keep payload
    // != last_rx.seq+1   == tx.seq      advance tx.seq, load next chunk
    // != last_rx.seq+1   != tx.seq      resend last response verbatim
    fn handle_data(&self, proto: &mut ProtoState, req: Packet) -> Option<Packet> {
        if proto.state != SocketState::Open {
            logging::debug!(self.log, "ignored inbound data packet, socket not open";
                            "context" => "data",
                            "state" => ?proto.state);
            return None;
        }

        let last_seq = proto
            .last_rx_packet
            .as_ref()
            .expect("open socket must have a last rx packet")
            .seq;
        let mut tx = proto.tx_packet.take().expect("open socket must have a tx packet");

        tx.ctrl = None;
        tx.da = req.sa;

        let req_ack = req.ack;
        let new_data = req.seq == (last_seq + 1) & 0x0F;

        if new_data {
            let mut indata = req.pay1.clone();
            if let Some(pay2) = &req.pay2 {
                indata.extend_from_slice(pay2);
            }

            logging::debug!(self.log, "enqueueing inbound data";
                            "context" => "data",
                            "len" => indata.len(),
                            "data" => util::hex_str(&indata));

            self.in_queue
                .lock()
                .expect("in queue lock poisoned")
                .push_back(indata);

            tx.ack = req.seq;
            proto.last_rx_packet = Some(req);
        }

        if req_ack == tx.seq {
            // The peer saw our outstanding frame, advance and load the next
            // outbound chunk.
            tx.seq = (tx.seq + 1) & 0x0F;

            let mut outdata = self
                .out_queue
                .lock()
                .expect("out queue lock poisoned")
                .pop_front()
                .unwrap_or_default();

            if outdata.len() > proto.mtu {
                logging::error!(self.log, "outbound chunk exceeds mtu, clipping";
                                "context" => "data",
                                "len" => outdata.len(),
                                "mtu" => proto.mtu);
                outdata.truncate(proto.mtu);
            }

            if outdata.len() > packet::PAY1_MAX_LEN {
                tx.pay2 = Some(outdata.split_off(packet::PAY1_MAX_LEN));
                tx.pay1 = outdata;
            } else {
                tx.pay1 = outdata;
                tx.pay2 = None;
            }
        }

        proto.tx_packet = Some(tx.clone());
        Some(tx)
    }

    /// Builds a connection reset addressed at the last known peer.
    fn reset_packet(&self, proto: &ProtoState) -> Packet {
        let mut resp = Packet::control(CtrlKind::Reset);

        resp.client_id = self.client_id;
        resp.srv_id = self.srv_id;

        if let Some(tx) = &proto.tx_packet {
            resp.seq = tx.seq;
            resp.ack = tx.ack;
        }
        if let Some(last) = &proto.last_rx_packet {
            resp.da = last.sa;
        }

        resp
    }

    fn set_state(&self, proto: &mut ProtoState, new: SocketState) {
        let old = proto.state;
        if old == new {
            return;
        }

        proto.state = new;

        logging::debug!(self.log, "socket state changed";
                        "context" => "state",
                        "old" => ?old,
                        "new" => ?new);

        // Wake anyone blocked in accept() when a connection enters or leaves
        // the handover queue.
        if old == SocketState::PendingAccept || new == SocketState::PendingAccept {
            self.accept_signal.notify();
        }
    }
}
