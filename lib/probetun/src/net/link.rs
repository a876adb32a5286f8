use crate::net::packet::{SSID_IE_LEN, VENDOR_IE_LEN};
use crate::net::support::{DropReason, ErrorType, MacAddr, NetworkError, NetworkResult};
use byteorder::{LittleEndian, WriteBytesExt};
use flare::logging;
use hashbrown::HashMap;
use mio::unix::EventedFd;
use mio::{Events, Poll, PollOpt, Ready, Token};
use nix::sys::socket::{
    bind, recv, sendto, socket, AddressFamily, MsgFlags, NetlinkAddr, SockFlag, SockProtocol,
    SockType,
};
use std::cmp;
use std::os::unix::io::{AsRawFd, OwnedFd};
use std::time::Duration;

/// Default kernel multicast group the patched firmware publishes received
/// probe-requests on.
pub const NETLINK_GROUP: u32 = 21;

const NLMSG_HDR_LEN: usize = 16;
const RECV_BUF_SIZE: usize = 0xFFFF;

// 802.11 management header offsets within the frame body.
const FC_PROBE_REQUEST: u8 = 0x40;
const DA_OFFSET: usize = 4;
const SA_OFFSET: usize = 10;
const IE_OFFSET: usize = 24;

const SSID_IE_TYPE: u8 = 0;
const VENDOR_IE_TYPE: u8 = 221;

// Probe-response injection contract of the patched firmware: argument tag
// plus the two fixed argument lengths (SSID only / SSID + vendor IE).
const SEND_PROBE_RESP_ARG: u32 = 5;
const ARG_LEN_SSID_ONLY: u32 = 48;
const ARG_LEN_WITH_VENDOR: u32 = 286;

/// One received probe-request, reduced to what the tunnel consumes.
#[derive(Debug, Clone)]
pub struct InboundFrame {
    pub sa: MacAddr,
    pub da: MacAddr,
    pub ssid: Vec<u8>,
    pub vendor_ie: Option<Vec<u8>>,
}

/// One probe-response to be emitted by the driver. IE payloads are raw,
/// without type/length prefixes.
#[derive(Debug, Clone)]
pub struct OutboundFrame {
    pub sa: MacAddr,
    pub da: MacAddr,
    pub ssid: [u8; SSID_IE_LEN],
    pub vendor_ie: Option<[u8; VENDOR_IE_LEN]>,
}

/// Inbound half of the kernel boundary: yields at most one decoded
/// probe-request per call, `None` when the timeout elapses or the pending
/// datagram is not usable.
pub trait FrameSource: Send {
    fn recv_frame(&mut self, timeout: Duration) -> NetworkResult<Option<InboundFrame>>;
}

/// Outbound half of the kernel boundary: asks the driver to transmit one
/// directed probe-response.
pub trait FrameSink: Send {
    fn send_frame(&mut self, frame: &OutboundFrame) -> NetworkResult<()>;
}

/// Decodes a netlink datagram into an `InboundFrame`: strips the 16 byte
/// netlink header, requires a probe-request frame control, pulls DA/SA and
/// walks the IE TLV list (two trailing padding bytes excluded).
pub fn parse_probe_request(datagram: &[u8]) -> NetworkResult<InboundFrame> {
    if datagram.len() < NLMSG_HDR_LEN + IE_OFFSET + 2 {
        return Err(NetworkError::Drop(DropReason::TruncatedFrame));
    }

    let body = &datagram[NLMSG_HDR_LEN..];

    if body[0] != FC_PROBE_REQUEST {
        return Err(NetworkError::Drop(DropReason::NotProbeRequest));
    }

    let da = MacAddr::from_slice(&body[DA_OFFSET..DA_OFFSET + MacAddr::LEN]);
    let sa = MacAddr::from_slice(&body[SA_OFFSET..SA_OFFSET + MacAddr::LEN]);

    let ies = parse_ies(&body[IE_OFFSET..body.len() - 2]);

    let ssid = match ies.get(&SSID_IE_TYPE) {
        Some(ssid) => ssid.clone(),
        None => return Err(NetworkError::Drop(DropReason::MissingSsid)),
    };

    Ok(InboundFrame {
        sa,
        da,
        ssid,
        vendor_ie: ies.get(&VENDOR_IE_TYPE).cloned(),
    })
}

/// Walks a `type | length | value` list into a dictionary. On duplicate
/// types the last occurrence wins; a value running past the buffer is
/// clipped.
fn parse_ies(data: &[u8]) -> HashMap<u8, Vec<u8>> {
    let mut ies = HashMap::new();
    let mut pos = 0;

    while pos + 2 <= data.len() {
        let ie_type = data[pos];
        let ie_len = data[pos + 1] as usize;
        pos += 2;

        let end = cmp::min(pos + ie_len, data.len());
        ies.insert(ie_type, data[pos..end].to_vec());
        pos += ie_len;
    }

    ies
}

/// Packs the probe-response injection argument the way the firmware expects
/// it: little-endian tag and length, DA, BSSID, then the framed SSID IE and
/// optionally the framed vendor IE.
pub fn pack_probe_resp_arg(frame: &OutboundFrame) -> Vec<u8> {
    let arg_len = match frame.vendor_ie {
        Some(_) => ARG_LEN_WITH_VENDOR,
        None => ARG_LEN_SSID_ONLY,
    };

    let mut buf = Vec::with_capacity(8 + arg_len as usize);

    buf.write_u32::<LittleEndian>(SEND_PROBE_RESP_ARG)
        .expect("Error writing argument tag");
    buf.write_u32::<LittleEndian>(arg_len)
        .expect("Error writing argument length");

    buf.extend_from_slice(frame.da.bytes());
    buf.extend_from_slice(frame.sa.bytes());

    buf.push(SSID_IE_TYPE);
    buf.push(SSID_IE_LEN as u8);
    buf.extend_from_slice(&frame.ssid);

    if let Some(vendor_ie) = &frame.vendor_ie {
        buf.push(VENDOR_IE_TYPE);
        buf.push(VENDOR_IE_LEN as u8);
        buf.extend_from_slice(vendor_ie);
    }

    buf
}

/// Netlink multicast listener surfacing probe-requests the firmware saw.
/// The raw socket is polled level-triggered so one datagram is consumed per
/// `recv_frame` call and the poll timeout keeps the listener cancellable.
pub struct NetlinkSource {
    fd: OwnedFd,
    poll: Poll,
    events: Events,
    log: logging::Logger,
}

impl NetlinkSource {
    pub fn open<'a, L: Into<Option<&'a logging::Logger>>>(
        group: u32,
        log: L,
    ) -> NetworkResult<NetlinkSource> {
        let source_log = match log.into() {
            Some(log) => log.new(logging::o!()),
            _ => logging::Logger::root(logging::Discard, logging::o!()),
        };

        if group == 0 || group > 32 {
            return Err(NetworkError::Fatal(ErrorType::InvalidGroup));
        }

        let fd = socket(
            AddressFamily::Netlink,
            SockType::Raw,
            SockFlag::empty(),
            SockProtocol::NetlinkUserSock,
        )?;

        // Joining the multicast group through the bind mask needs root.
        let addr = NetlinkAddr::new(std::process::id(), 1 << (group - 1));
        bind(fd.as_raw_fd(), &addr)?;

        let poll = Poll::new()?;
        poll.register(
            &EventedFd(&fd.as_raw_fd()),
            Token(0),
            Ready::readable(),
            PollOpt::level(),
        )?;

        logging::debug!(source_log, "netlink multicast listener opened";
                        "context" => "open",
                        "group" => group);

        Ok(NetlinkSource {
            fd,
            poll,
            events: Events::with_capacity(4),
            log: source_log,
        })
    }
}

impl FrameSource for NetlinkSource {
    fn recv_frame(&mut self, timeout: Duration) -> NetworkResult<Option<InboundFrame>> {
        self.poll.poll(&mut self.events, Some(timeout))?;

        if self.events.iter().next().is_none() {
            return Ok(None);
        }

        let mut buf = [0u8; RECV_BUF_SIZE];
        let count = recv(self.fd.as_raw_fd(), &mut buf, MsgFlags::empty())?;

        match parse_probe_request(&buf[..count]) {
            Ok(frame) => Ok(Some(frame)),
            Err(NetworkError::Drop(reason)) => {
                logging::trace!(self.log, "firmware event discarded";
                                "context" => "recv",
                                "reason" => ?reason);
                Ok(None)
            }
            Err(err) => Err(err),
        }
    }
}

/// Unicast channel to the driver carrying probe-response injection requests.
pub struct FirmwareSink {
    fd: OwnedFd,
    log: logging::Logger,
}

impl FirmwareSink {
    pub fn open<'a, L: Into<Option<&'a logging::Logger>>>(log: L) -> NetworkResult<FirmwareSink> {
        let sink_log = match log.into() {
            Some(log) => log.new(logging::o!()),
            _ => logging::Logger::root(logging::Discard, logging::o!()),
        };

        let fd = socket(
            AddressFamily::Netlink,
            SockType::Raw,
            SockFlag::empty(),
            SockProtocol::NetlinkUserSock,
        )?;

        logging::debug!(sink_log, "firmware ioctl channel opened"; "context" => "open");

        Ok(FirmwareSink { fd, log: sink_log })
    }
}

impl FrameSink for FirmwareSink {
    fn send_frame(&mut self, frame: &OutboundFrame) -> NetworkResult<()> {
        let buf = pack_probe_resp_arg(frame);

        logging::trace!(self.log, "submitting probe response";
                        "context" => "send",
                        "da" => %frame.da,
                        "sa" => %frame.sa,
                        "vendor_ie" => frame.vendor_ie.is_some());

        let kernel = NetlinkAddr::new(0, 0);
        sendto(self.fd.as_raw_fd(), &buf, &kernel, MsgFlags::empty())?;

        Ok(())
    }
}
