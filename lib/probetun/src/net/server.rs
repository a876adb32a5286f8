use crate::net::link::{FirmwareSink, FrameSink, FrameSource, InboundFrame, NetlinkSource, OutboundFrame};
use crate::net::link::NETLINK_GROUP;
use crate::net::packet::{self, CtrlKind, Packet};
use crate::net::socket::{ClientSocket, SocketState};
use crate::net::support::{DropReason, ErrorType, MacAddr, NetworkError, NetworkResult};
use crate::net::table::ConnectionTable;
use flare::logging;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

/// Hard cap on concurrent clients, one below the 4 bit id space on purpose.
pub const MAX_CONNECTIONS_LIMIT: usize = 7;

// Inbound poll granularity; bounds how long shutdown takes to be observed.
const POLL_TIMEOUT: Duration = Duration::from_millis(500);
const ACCEPT_WAIT_TIMEOUT: Duration = Duration::from_millis(500);
const HOUSEKEEPING_INTERVAL: Duration = Duration::from_secs(3);

/// Handle to an accepted tunnel connection, shared with the listener thread.
pub type Connection = Arc<ClientSocket>;

/// The server side of the tunnel: owns the kernel channels, the connection
/// table and the listener thread, and exposes the socket-style
/// `bind`/`listen`/`accept`/`unbind` surface.
pub struct Server {
    srv_id: u8,
    netlink_group: u32,
    tx_vendor_ie: bool,
    idle_timeout: Option<Duration>,
    bound: bool,
    channels: Option<(Box<dyn FrameSource>, Box<dyn FrameSink>)>,
    table: Option<Arc<ConnectionTable>>,
    listener: Option<thread::JoinHandle<()>>,
    stop: Arc<AtomicBool>,
    log: logging::Logger,
}

impl Server {
    pub fn new<'a, L: Into<Option<&'a logging::Logger>>>(log: L) -> Server {
        let server_log = match log.into() {
            Some(log) => log.new(logging::o!()),
            _ => logging::Logger::root(logging::Discard, logging::o!()),
        };

        Server {
            srv_id: 0,
            netlink_group: NETLINK_GROUP,
            tx_vendor_ie: true,
            idle_timeout: None,
            bound: false,
            channels: None,
            table: None,
            listener: None,
            stop: Arc::new(AtomicBool::new(false)),
            log: server_log,
        }
    }

    /// Builds a server on pre-opened channels instead of the kernel pair,
    /// used by tests and alternative transports.
    pub fn with_channels<'a, L: Into<Option<&'a logging::Logger>>>(
        source: Box<dyn FrameSource>,
        sink: Box<dyn FrameSink>,
        log: L,
    ) -> Server {
        let mut server = Server::new(log);
        server.channels = Some((source, sink));
        server
    }

    /// Disables the vendor IE on outbound frames, for firmwares that can
    /// only inject the SSID element.
    pub fn set_tx_vendor_ie(&mut self, enabled: bool) {
        self.tx_vendor_ie = enabled;
    }

    /// Enables the idle housekeeping sweep: open connections quiet for
    /// longer than `timeout` are reset.
    pub fn set_idle_timeout(&mut self, timeout: Option<Duration>) {
        self.idle_timeout = timeout;
    }

    pub fn set_netlink_group(&mut self, group: u32) {
        self.netlink_group = group;
    }

    #[inline]
    pub fn srv_id(&self) -> u8 {
        self.srv_id
    }

    /// Claims the server id and opens the kernel channels. Refuses a double
    /// bind and fails when either channel cannot be opened, typically for
    /// lack of root permissions.
    pub fn bind(&mut self, srv_id: u8) -> NetworkResult<()> {
        if srv_id == 0 || srv_id > 15 {
            logging::error!(self.log, "bind() server id out of range"; "srv_id" => srv_id);
            return Err(NetworkError::Fatal(ErrorType::InvalidServerId));
        }

        if self.bound {
            logging::error!(self.log, "bind() netlink multicast listener already running");
            return Err(NetworkError::Fatal(ErrorType::AlreadyBound));
        }

        if self.channels.is_none() {
            let source = match NetlinkSource::open(self.netlink_group, &self.log) {
                Ok(source) => source,
                Err(err) => {
                    logging::error!(self.log, "failed to open netlink multicast channel, try with root permissions";
                                    "group" => self.netlink_group,
                                    "error" => ?err);
                    return Err(err);
                }
            };
            let sink = match FirmwareSink::open(&self.log) {
                Ok(sink) => sink,
                Err(err) => {
                    logging::error!(self.log, "failed to open firmware ioctl channel"; "error" => ?err);
                    return Err(err);
                }
            };

            self.channels = Some((Box::new(source), Box::new(sink)));
        }

        self.srv_id = srv_id;
        self.bound = true;

        logging::info!(self.log, "bound"; "srv_id" => srv_id);

        Ok(())
    }

    /// Creates the connection table and starts the listener thread.
    pub fn listen(&mut self, max_connections: usize) -> NetworkResult<()> {
        if max_connections == 0 || max_connections > MAX_CONNECTIONS_LIMIT {
            logging::error!(self.log, "listen() max connections out of range";
                            "requested" => max_connections,
                            "limit" => MAX_CONNECTIONS_LIMIT);
            return Err(NetworkError::Fatal(ErrorType::TooManyConnections));
        }

        if !self.bound {
            logging::error!(self.log, "listen() socket not bound, call bind() first");
            return Err(NetworkError::Fatal(ErrorType::NotBound));
        }

        if self.listener.is_some() {
            logging::error!(self.log, "listen() already listening");
            return Err(NetworkError::Fatal(ErrorType::AlreadyListening));
        }

        let (source, sink) = self
            .channels
            .take()
            .expect("bound server must have open channels");

        let table = Arc::new(ConnectionTable::new(max_connections, self.tx_vendor_ie, &self.log));
        self.table = Some(table.clone());
        self.stop.store(false, Ordering::Relaxed);

        let dispatcher = Dispatcher {
            srv_id: self.srv_id,
            table,
            sink,
            log: self.log.new(logging::o!()),
        };

        let stop = self.stop.clone();
        let idle_timeout = self.idle_timeout;
        let thread_log = self.log.new(logging::o!());

        let handle = thread::Builder::new()
            .name("probetun firmware event thread".into())
            .spawn(move || listener_loop(source, dispatcher, stop, idle_timeout, thread_log))?;
        self.listener = Some(handle);

        logging::info!(self.log, "listening for incoming connections"; "max" => max_connections);

        Ok(())
    }

    /// Blocks until a handshake-complete connection is available, moves it
    /// to OPEN and returns it. Returns `None` once the server is unbound (or
    /// was never listening).
    pub fn accept(&self) -> Option<Connection> {
        let table = match &self.table {
            Some(table) => table,
            None => {
                logging::error!(self.log, "accept() socket not listening");
                return None;
            }
        };

        logging::debug!(self.log, "entering accept"; "context" => "accept");

        loop {
            if self.stop.load(Ordering::Relaxed) {
                return None;
            }

            if let Some(socket) = table.first_by_state(SocketState::PendingAccept) {
                if socket.try_accept() {
                    logging::debug!(self.log, "returning accepted connection";
                                    "context" => "accept",
                                    "client_id" => socket.client_id());
                    return Some(socket);
                }
                continue;
            }

            table.wait_for_pending_accept_change(ACCEPT_WAIT_TIMEOUT);
        }
    }

    /// Signals the listener to stop, wakes blocked acceptors and closes the
    /// channels.
    pub fn unbind(&mut self) {
        logging::debug!(self.log, "stop listening for firmware events"; "context" => "unbind");

        self.stop.store(true, Ordering::Relaxed);

        if let Some(table) = &self.table {
            table.notify_accept_waiters();
        }

        if let Some(handle) = self.listener.take() {
            handle.join().expect("listener thread panicked");
        }

        // Dropping the channel halves closes the underlying sockets.
        self.channels = None;
        self.table = None;
        self.bound = false;
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        if self.listener.is_some() {
            self.unbind();
        }
    }
}

fn listener_loop(
    mut source: Box<dyn FrameSource>,
    mut dispatcher: Dispatcher,
    stop: Arc<AtomicBool>,
    idle_timeout: Option<Duration>,
    log: logging::Logger,
) {
    logging::debug!(log, "listening for firmware events");

    let mut housekeeping_time = Instant::now();

    while !stop.load(Ordering::Relaxed) {
        match source.recv_frame(POLL_TIMEOUT) {
            Ok(Some(frame)) => dispatcher.dispatch(frame),
            Ok(None) => (),
            Err(err) => {
                logging::error!(log, "inbound channel failure, listener stopping"; "error" => ?err);
                break;
            }
        }

        let now = Instant::now();
        if now.duration_since(housekeeping_time) >= HOUSEKEEPING_INTERVAL {
            dispatcher.housekeeping(idle_timeout, now);
            housekeeping_time = now;
        }
    }

    logging::debug!(log, "stopped listening for firmware events");
}

/// Routes validated packets to their connection and pushes responses to the
/// outbound sink. Runs entirely on the listener thread.
struct Dispatcher {
    srv_id: u8,
    table: Arc<ConnectionTable>,
    sink: Box<dyn FrameSink>,
    log: logging::Logger,
}

impl Dispatcher {
    fn dispatch(&mut self, frame: InboundFrame) {
        if let Err(err) = self.dispatch_frame(frame) {
            match err {
                NetworkError::Drop(reason) => {
                    logging::debug!(self.log, "packet dropped in dispatcher";
                                    "context" => "dispatch",
                                    "reason" => ?reason);
                }
                NetworkError::Fatal(err_type) => {
                    logging::error!(self.log, "outbound channel failure";
                                    "context" => "dispatch",
                                    "error" => ?err_type);
                }
            }
        }

        self.table.reap_deleted();
    }

    fn dispatch_frame(&mut self, frame: InboundFrame) -> NetworkResult<()> {
        packet::check_length_checksum(&frame.ssid, frame.vendor_ie.as_deref())?;

        let req = Packet::parse(frame.sa, frame.da, &frame.ssid, frame.vendor_ie.as_deref())?;

        if let Some(resp) = self.route(req)? {
            self.emit(resp)?;
        }

        Ok(())
    }

    fn route(&mut self, req: Packet) -> NetworkResult<Option<Packet>> {
        match req.ctrl {
            Some(CtrlKind::InitReq1) | Some(CtrlKind::InitReq2) => {
                if req.srv_id != self.srv_id {
                    logging::debug!(self.log, "control message targets foreign server";
                                    "context" => "route",
                                    "srv_id" => req.srv_id);
                    return Err(NetworkError::Drop(DropReason::WrongServer));
                }

                // Before an id is assigned the stage-1 nonce is the only
                // usable identity; everything later routes by client id.
                if req.ctrl == Some(CtrlKind::InitReq1) && req.seq == 1 {
                    let (client_iv, _) = req
                        .client_iv()
                        .ok_or(NetworkError::Drop(DropReason::TruncatedFrame))?;

                    match self.table.get_by_client_iv(client_iv) {
                        Some(socket) => Ok(socket.handle_request(req)),
                        None => {
                            logging::info!(self.log, "connection request";
                                           "context" => "route",
                                           "client_iv" => client_iv,
                                           "client_sa" => %req.sa);

                            let socket = self
                                .table
                                .provide_new_client_socket(self.srv_id)
                                .ok_or(NetworkError::Drop(DropReason::Exhausted))?;
                            Ok(socket.handle_request(req))
                        }
                    }
                } else {
                    let socket = self
                        .table
                        .get_by_client_id(req.client_id)
                        .ok_or(NetworkError::Drop(DropReason::UnknownClient))?;
                    Ok(socket.handle_request(req))
                }
            }
            Some(CtrlKind::Reset) => {
                let socket = self
                    .table
                    .get_by_client_id(req.client_id)
                    .ok_or(NetworkError::Drop(DropReason::UnknownClient))?;
                Ok(socket.handle_request(req))
            }
            Some(_) => Err(NetworkError::Drop(DropReason::UnknownControl)),
            None => {
                let socket = self
                    .table
                    .get_by_client_id(req.client_id)
                    .ok_or(NetworkError::Drop(DropReason::UnknownClient))?;
                Ok(socket.handle_request(req))
            }
        }
    }

    fn emit(&mut self, mut resp: Packet) -> NetworkResult<()> {
        if resp.sa.is_unset() {
            resp.sa = MacAddr::random_local();
        }

        let frame = OutboundFrame {
            sa: resp.sa,
            da: resp.da,
            ssid: resp.generate_raw_ssid(),
            vendor_ie: resp.generate_raw_vendor_ie(),
        };

        self.sink.send_frame(&frame)
    }

    fn housekeeping(&mut self, idle_timeout: Option<Duration>, now: Instant) {
        let limit = match idle_timeout {
            Some(limit) => limit,
            None => return,
        };

        for socket in self.table.snapshot() {
            if socket.state() == SocketState::Open && socket.last_ingress_elapsed(now) >= limit {
                socket.idle_reset();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::socket::{CAPS_NO_VENDOR_IE, CAPS_VENDOR_IE};
    use std::cmp;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    const SRV_ID: u8 = 9;
    const CLIENT_SA: [u8; 6] = [0x02, 0xAA, 0xBB, 0xCC, 0xDD, 0xEE];

    struct MockSource {
        frames: Arc<Mutex<VecDeque<InboundFrame>>>,
    }

    impl FrameSource for MockSource {
        fn recv_frame(&mut self, timeout: Duration) -> NetworkResult<Option<InboundFrame>> {
            let frame = self.frames.lock().unwrap().pop_front();
            if frame.is_none() {
                thread::sleep(cmp::min(timeout, Duration::from_millis(1)));
            }
            Ok(frame)
        }
    }

    struct MockSink {
        sent: Arc<Mutex<Vec<OutboundFrame>>>,
    }

    impl FrameSink for MockSink {
        fn send_frame(&mut self, frame: &OutboundFrame) -> NetworkResult<()> {
            self.sent.lock().unwrap().push(frame.clone());
            Ok(())
        }
    }

    fn client_frame(packet: &Packet) -> InboundFrame {
        InboundFrame {
            sa: packet.sa,
            da: MacAddr::ZERO,
            ssid: packet.generate_raw_ssid().to_vec(),
            vendor_ie: packet.generate_raw_vendor_ie().map(|raw| raw.to_vec()),
        }
    }

    fn req1(iv: [u8; 4], srv_id: u8) -> Packet {
        let mut req = Packet::control(CtrlKind::InitReq1);
        req.sa = MacAddr::new(CLIENT_SA);
        req.pay1.extend_from_slice(&iv);
        req.seq = 1;
        req.srv_id = srv_id;
        req
    }

    fn req2(client_id: u8, iv: [u8; 4], caps: u8) -> Packet {
        let mut req = Packet::control(CtrlKind::InitReq2);
        req.sa = MacAddr::new(CLIENT_SA);
        req.pay1.extend_from_slice(&iv);
        req.pay1.push(caps);
        req.seq = 2;
        req.ack = 1;
        req.client_id = client_id;
        req.srv_id = SRV_ID;
        req
    }

    fn data(client_id: u8, seq: u8, ack: u8, pay1: &[u8]) -> Packet {
        let mut req = Packet::new();
        req.sa = MacAddr::new(CLIENT_SA);
        req.client_id = client_id;
        req.srv_id = SRV_ID;
        req.seq = seq;
        req.ack = ack;
        req.pay1 = pay1.to_vec();
        req
    }

    struct Harness {
        dispatcher: Dispatcher,
        table: Arc<ConnectionTable>,
        sent: Arc<Mutex<Vec<OutboundFrame>>>,
    }

    impl Harness {
        fn new(max_connections: usize) -> Harness {
            let sent = Arc::new(Mutex::new(Vec::new()));
            let table = Arc::new(ConnectionTable::new(max_connections, true, None));

            Harness {
                dispatcher: Dispatcher {
                    srv_id: SRV_ID,
                    table: table.clone(),
                    sink: Box::new(MockSink { sent: sent.clone() }),
                    log: logging::Logger::root(logging::Discard, logging::o!()),
                },
                table,
                sent,
            }
        }

        fn push(&mut self, packet: &Packet) {
            self.dispatcher.dispatch(client_frame(packet));
        }

        fn sent_count(&self) -> usize {
            self.sent.lock().unwrap().len()
        }

        fn last_response(&self) -> Packet {
            let sent = self.sent.lock().unwrap();
            let frame = sent.last().expect("no response emitted");
            Packet::parse(frame.sa, frame.da, &frame.ssid, frame.vendor_ie.as_ref().map(|raw| &raw[..]))
                .expect("response must parse")
        }

        /// Drives a client through both handshake stages.
        fn handshake(&mut self, iv: [u8; 4]) -> u8 {
            self.push(&req1(iv, SRV_ID));
            let client_id = self.last_response().client_id;
            self.push(&req2(client_id, iv, CAPS_VENDOR_IE));
            client_id
        }
    }

    #[test]
    fn test_handshake_roundtrip() {
        let mut harness = Harness::new(2);

        harness.push(&req1([1, 2, 3, 4], SRV_ID));

        let rsp1 = harness.last_response();
        assert_eq!(rsp1.ctrl, Some(CtrlKind::InitRsp1));
        assert_eq!(rsp1.client_id, 1);
        assert_eq!(rsp1.srv_id, SRV_ID);
        assert_eq!(rsp1.da, MacAddr::new(CLIENT_SA));
        assert_eq!(&rsp1.pay1[1..5], &[1, 2, 3, 4]);

        harness.push(&req2(1, [1, 2, 3, 4], CAPS_VENDOR_IE));

        let rsp2 = harness.last_response();
        assert_eq!(rsp2.ctrl, Some(CtrlKind::InitRsp2));
        assert_eq!(rsp2.seq, 2);
        assert_eq!(rsp2.ack, 2);

        let socket = harness.table.get_by_client_id(1).unwrap();
        assert_eq!(socket.state(), SocketState::PendingAccept);
    }

    #[test]
    fn test_response_sa_randomised() {
        let mut harness = Harness::new(1);
        harness.push(&req1([1, 2, 3, 4], SRV_ID));

        let sent = harness.sent.lock().unwrap();
        let frame = sent.last().unwrap();
        assert!(!frame.sa.is_unset());
        // locally administered unicast
        assert_eq!(frame.sa.bytes()[0] & 0x03, 0x02);
    }

    #[test]
    fn test_repeated_stage1_reuses_socket() {
        let mut harness = Harness::new(2);

        harness.push(&req1([1, 2, 3, 4], SRV_ID));
        harness.push(&req1([1, 2, 3, 4], SRV_ID));

        assert_eq!(harness.sent_count(), 2);
        assert_eq!(harness.last_response().client_id, 1);
        // The repeat must not have burned a second id.
        assert!(harness.table.get_by_client_id(2).is_none());
    }

    #[test]
    fn test_wrong_server_id_dropped() {
        let mut harness = Harness::new(2);

        harness.push(&req1([1, 2, 3, 4], SRV_ID + 1));

        assert_eq!(harness.sent_count(), 0);
        assert!(harness.table.get_by_client_id(1).is_none());
    }

    #[test]
    fn test_corrupted_frame_dropped() {
        let mut harness = Harness::new(2);

        let mut frame = client_frame(&req1([1, 2, 3, 4], SRV_ID));
        frame.ssid[31] ^= 0xFF;
        harness.dispatcher.dispatch(frame);

        assert_eq!(harness.sent_count(), 0);
        assert!(harness.table.get_by_client_id(1).is_none());
    }

    #[test]
    fn test_inbound_rsp_control_dropped() {
        let mut harness = Harness::new(2);

        let mut forged = Packet::control(CtrlKind::InitRsp1);
        forged.srv_id = SRV_ID;
        forged.seq = 1;
        harness.push(&forged);

        assert_eq!(harness.sent_count(), 0);
    }

    #[test]
    fn test_data_unknown_client_dropped() {
        let mut harness = Harness::new(2);

        harness.push(&data(4, 3, 2, b"hi"));

        assert_eq!(harness.sent_count(), 0);
    }

    #[test]
    fn test_id_exhaustion_silently_ignores_new_clients() {
        let mut harness = Harness::new(2);

        harness.push(&req1([1, 0, 0, 0], SRV_ID));
        harness.push(&req1([2, 0, 0, 0], SRV_ID));
        assert_eq!(harness.sent_count(), 2);

        // Third distinct nonce: no response, no socket.
        harness.push(&req1([3, 0, 0, 0], SRV_ID));
        assert_eq!(harness.sent_count(), 2);

        // The admitted clients keep progressing.
        harness.push(&req2(1, [1, 0, 0, 0], CAPS_VENDOR_IE));
        harness.push(&req2(2, [2, 0, 0, 0], CAPS_NO_VENDOR_IE));
        assert_eq!(harness.sent_count(), 4);
        assert_eq!(
            harness.table.get_by_client_id(1).unwrap().state(),
            SocketState::PendingAccept
        );
        assert_eq!(
            harness.table.get_by_client_id(2).unwrap().state(),
            SocketState::PendingAccept
        );
    }

    #[test]
    fn test_data_exchange_after_accept() {
        let mut harness = Harness::new(2);
        let client_id = harness.handshake([1, 2, 3, 4]);

        let socket = harness.table.get_by_client_id(client_id).unwrap();
        assert!(socket.try_accept());

        socket.send(b"response payload");
        harness.push(&data(client_id, 3, 2, b"request payload"));

        let resp = harness.last_response();
        assert_eq!(resp.ctrl, None);
        assert_eq!(resp.seq, 3);
        assert_eq!(resp.ack, 3);
        assert_eq!(resp.pay1, b"response payload".to_vec());

        assert_eq!(socket.read(64), b"request payload".to_vec());
    }

    #[test]
    fn test_reset_reaps_connection_and_recycles_id() {
        let mut harness = Harness::new(1);
        let client_id = harness.handshake([1, 2, 3, 4]);

        let mut reset = Packet::control(CtrlKind::Reset);
        reset.client_id = client_id;
        reset.srv_id = SRV_ID;
        harness.push(&reset);

        assert!(harness.table.get_by_client_id(client_id).is_none());

        // The freed id serves the next client.
        harness.push(&req1([5, 6, 7, 8], SRV_ID));
        assert_eq!(harness.last_response().client_id, client_id);
    }

    #[test]
    fn test_housekeeping_resets_idle_connections() {
        let mut harness = Harness::new(1);
        let client_id = harness.handshake([1, 2, 3, 4]);

        let socket = harness.table.get_by_client_id(client_id).unwrap();
        assert!(socket.try_accept());

        // Sweep with a generous clock offset: the connection counts as idle.
        harness
            .dispatcher
            .housekeeping(Some(Duration::from_secs(60)), Instant::now() + Duration::from_secs(120));

        assert_eq!(socket.state(), SocketState::PendingClose);

        // The next inbound frame flushes the reset and frees the socket.
        harness.push(&data(client_id, 3, 2, b"late"));
        assert_eq!(harness.last_response().ctrl, Some(CtrlKind::Reset));
        assert!(harness.table.get_by_client_id(client_id).is_none());
    }

    #[test]
    fn test_server_config_errors() {
        let mut server = Server::new(None);

        assert_eq!(
            server.listen(2).unwrap_err(),
            NetworkError::Fatal(ErrorType::NotBound)
        );
        assert_eq!(
            server.listen(MAX_CONNECTIONS_LIMIT + 1).unwrap_err(),
            NetworkError::Fatal(ErrorType::TooManyConnections)
        );
        assert_eq!(
            server.bind(0).unwrap_err(),
            NetworkError::Fatal(ErrorType::InvalidServerId)
        );
        assert_eq!(
            server.bind(16).unwrap_err(),
            NetworkError::Fatal(ErrorType::InvalidServerId)
        );
        assert!(server.accept().is_none());
    }

    #[test]
    fn test_server_double_bind_refused() {
        let frames = Arc::new(Mutex::new(VecDeque::new()));
        let sent = Arc::new(Mutex::new(Vec::new()));

        let mut server = Server::with_channels(
            Box::new(MockSource { frames }),
            Box::new(MockSink { sent }),
            None,
        );

        server.bind(SRV_ID).unwrap();
        assert_eq!(
            server.bind(SRV_ID).unwrap_err(),
            NetworkError::Fatal(ErrorType::AlreadyBound)
        );
    }

    #[test]
    fn test_server_lifecycle_end_to_end() {
        let frames = Arc::new(Mutex::new(VecDeque::new()));
        let sent = Arc::new(Mutex::new(Vec::new()));

        {
            let mut queued = frames.lock().unwrap();
            queued.push_back(client_frame(&req1([1, 2, 3, 4], SRV_ID)));
            queued.push_back(client_frame(&req2(1, [1, 2, 3, 4], CAPS_VENDOR_IE)));
        }

        let mut server = Server::with_channels(
            Box::new(MockSource { frames: frames.clone() }),
            Box::new(MockSink { sent: sent.clone() }),
            None,
        );

        server.bind(SRV_ID).unwrap();
        server.listen(2).unwrap();

        let connection = server.accept().expect("no connection accepted");
        assert_eq!(connection.client_id(), 1);
        assert_eq!(connection.state(), SocketState::Open);
        assert_eq!(connection.mtu(), 264);

        // Queue a data frame and let the listener answer it.
        connection.send(b"pong");
        frames
            .lock()
            .unwrap()
            .push_back(client_frame(&data(1, 3, 2, b"ping")));

        let deadline = Instant::now() + Duration::from_secs(5);
        while sent.lock().unwrap().len() < 3 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(sent.lock().unwrap().len(), 3);
        assert_eq!(connection.read(64), b"ping".to_vec());

        server.unbind();
        assert!(server.accept().is_none());
    }
}
