use crate::net::support::{DropReason, MacAddr, NetworkError, NetworkResult};
use byteorder::{ByteOrder, LittleEndian};
use std::cmp;

pub const PAY1_MAX_LEN: usize = 28;
pub const PAY2_MAX_LEN: usize = 236;

pub const SSID_IE_LEN: usize = 32;
pub const VENDOR_IE_LEN: usize = 238;

// Type/length prefixes for consumers that want framed IE bytes. The tunnel
// core itself hands un-prefixed payloads to the outbound sink.
pub const SSID_IE_TL: [u8; 2] = [0x00, 0x20];
pub const VENDOR_IE_TL: [u8; 2] = [0xDD, 0xEE];

const FLAG_CTRL: u8 = 0x80;
const PAY1_LEN_MASK: u8 = 0x1F;

const ACK_SEQ_OFFSET: usize = 28;
const FLAG_LEN_OFFSET: usize = 29;
const IDS_OFFSET: usize = 30;
const SSID_CHK_OFFSET: usize = 31;
const PAY2_LEN_OFFSET: usize = 236;
const VENDOR_CHK_OFFSET: usize = 237;

// Offset of the 4 byte connection nonce inside a stage-1 control payload.
const IV_OFFSET: usize = 1;
pub const IV_LEN: usize = 4;

/// Control message types carried in `pay1[0]` of control packets.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum CtrlKind {
    InitReq1 = 1,
    InitRsp1 = 2,
    InitReq2 = 3,
    InitRsp2 = 4,
    Reset = 5,
}

impl CtrlKind {
    #[inline]
    pub fn from_u8(value: u8) -> Option<CtrlKind> {
        match value {
            1 => Some(CtrlKind::InitReq1),
            2 => Some(CtrlKind::InitRsp1),
            3 => Some(CtrlKind::InitReq2),
            4 => Some(CtrlKind::InitRsp2),
            5 => Some(CtrlKind::Reset),
            _ => None,
        }
    }
}

impl From<CtrlKind> for u8 {
    #[inline]
    fn from(kind: CtrlKind) -> Self {
        kind as u8
    }
}

/// 8 bit one's-complement style checksum: low byte of the running sum,
/// bit-inverted.
pub fn simple_checksum8(data: &[u8]) -> u8 {
    let mut sum = 0u8;

    for &byte in data {
        sum = sum.wrapping_add(byte);
    }

    !sum
}

/// 16 bit variant (sum modulo 0xFFFF, bit-inverted, split big-endian).
/// Not referenced by the wire layout, kept alongside the 8 bit flavour.
pub fn simple_checksum16(data: &[u8]) -> [u8; 2] {
    let mut sum = 0u32;

    for &byte in data {
        sum = (sum + u32::from(byte)) % 0xFFFF;
    }

    let sum = !sum;

    [(sum >> 8) as u8, sum as u8]
}

/// Validation gate applied before any parsing: the SSID IE must be exactly 32
/// bytes with a matching trailing checksum, and a vendor IE, when present,
/// exactly 238 bytes with a matching trailing checksum.
pub fn check_length_checksum(ssid: &[u8], vendor_ie: Option<&[u8]>) -> NetworkResult<()> {
    if ssid.len() != SSID_IE_LEN {
        return Err(NetworkError::Drop(DropReason::BadLength));
    }

    if ssid[SSID_CHK_OFFSET] != simple_checksum8(&ssid[..SSID_CHK_OFFSET]) {
        return Err(NetworkError::Drop(DropReason::BadChecksum));
    }

    if let Some(vendor_ie) = vendor_ie {
        if vendor_ie.len() != VENDOR_IE_LEN {
            return Err(NetworkError::Drop(DropReason::BadLength));
        }

        if vendor_ie[VENDOR_CHK_OFFSET] != simple_checksum8(&vendor_ie[..VENDOR_CHK_OFFSET]) {
            return Err(NetworkError::Drop(DropReason::BadChecksum));
        }
    }

    Ok(())
}

/// A single tunnel-layer frame: up to 28 payload bytes in the SSID IE and,
/// optionally, up to 236 more in a vendor-specific IE.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Packet {
    pub sa: MacAddr,
    pub da: MacAddr,
    /// Logical source, 1..15. 0 marks a client that has no assigned id yet.
    pub client_id: u8,
    /// Logical destination, 1..15.
    pub srv_id: u8,
    pub seq: u8,
    pub ack: u8,
    /// Control message type; `None` for data frames.
    pub ctrl: Option<CtrlKind>,
    pub pay1: Vec<u8>,
    pub pay2: Option<Vec<u8>>,
}

impl Packet {
    #[inline]
    pub fn new() -> Packet {
        Packet {
            sa: MacAddr::ZERO,
            da: MacAddr::ZERO,
            client_id: 0,
            srv_id: 0,
            seq: 0,
            ack: 0,
            ctrl: None,
            pay1: Vec::new(),
            pay2: None,
        }
    }

    /// Builds an empty control packet of the given kind, with the type byte
    /// already placed in `pay1[0]`.
    #[inline]
    pub fn control(kind: CtrlKind) -> Packet {
        let mut packet = Packet::new();
        packet.ctrl = Some(kind);
        packet.pay1.push(kind.into());
        packet
    }

    /// Decodes a frame that already passed `check_length_checksum`.
    pub fn parse(
        sa: MacAddr,
        da: MacAddr,
        ssid: &[u8],
        vendor_ie: Option<&[u8]>,
    ) -> NetworkResult<Packet> {
        if ssid.len() != SSID_IE_LEN {
            return Err(NetworkError::Drop(DropReason::BadLength));
        }

        let ack_seq = ssid[ACK_SEQ_OFFSET];
        let flag_len = ssid[FLAG_LEN_OFFSET];
        let ids = ssid[IDS_OFFSET];

        let pay1_len = (flag_len & PAY1_LEN_MASK) as usize;
        if pay1_len > PAY1_MAX_LEN {
            return Err(NetworkError::Drop(DropReason::BadLength));
        }

        let ctrl = if flag_len & FLAG_CTRL != 0 {
            match CtrlKind::from_u8(ssid[0]) {
                Some(kind) => Some(kind),
                None => return Err(NetworkError::Drop(DropReason::UnknownControl)),
            }
        } else {
            None
        };

        let pay2 = match vendor_ie {
            Some(vendor_ie) => {
                if vendor_ie.len() != VENDOR_IE_LEN {
                    return Err(NetworkError::Drop(DropReason::BadLength));
                }

                let pay2_len = cmp::min(vendor_ie[PAY2_LEN_OFFSET] as usize, PAY2_MAX_LEN);
                Some(vendor_ie[..pay2_len].to_vec())
            }
            None => None,
        };

        Ok(Packet {
            sa,
            da,
            client_id: ids >> 4,
            srv_id: ids & 0x0F,
            seq: ack_seq & 0x0F,
            ack: ack_seq >> 4,
            ctrl,
            pay1: ssid[..pay1_len].to_vec(),
            pay2,
        })
    }

    /// Serialises the SSID IE body. Oversized payloads are clipped as a last
    /// resort; the emitting paths keep chunks within bounds themselves.
    pub fn generate_raw_ssid(&self) -> [u8; SSID_IE_LEN] {
        let mut out = [0u8; SSID_IE_LEN];

        let mut pay_len = cmp::min(self.pay1.len(), PAY1_MAX_LEN);
        out[..pay_len].copy_from_slice(&self.pay1[..pay_len]);

        if let Some(kind) = self.ctrl {
            out[0] = kind.into();
            pay_len = cmp::max(pay_len, 1);
        }

        out[ACK_SEQ_OFFSET] = ((self.ack & 0x0F) << 4) | (self.seq & 0x0F);

        let mut flag_len = pay_len as u8;
        if self.ctrl.is_some() {
            flag_len |= FLAG_CTRL;
        }
        out[FLAG_LEN_OFFSET] = flag_len;

        out[IDS_OFFSET] = ((self.client_id & 0x0F) << 4) | (self.srv_id & 0x0F);
        out[SSID_CHK_OFFSET] = simple_checksum8(&out[..SSID_CHK_OFFSET]);

        out
    }

    /// Serialises the vendor IE body, or `None` when the packet carries no
    /// second payload.
    pub fn generate_raw_vendor_ie(&self) -> Option<[u8; VENDOR_IE_LEN]> {
        let pay2 = self.pay2.as_ref()?;
        let mut out = [0u8; VENDOR_IE_LEN];

        let pay_len = cmp::min(pay2.len(), PAY2_MAX_LEN);
        out[..pay_len].copy_from_slice(&pay2[..pay_len]);

        out[PAY2_LEN_OFFSET] = pay_len as u8;
        out[VENDOR_CHK_OFFSET] = simple_checksum8(&out[..VENDOR_CHK_OFFSET]);

        Some(out)
    }

    /// SSID IE with the type/length prefix.
    pub fn generate_ssid_ie(&self) -> Vec<u8> {
        let mut out = SSID_IE_TL.to_vec();
        out.extend_from_slice(&self.generate_raw_ssid());
        out
    }

    /// Vendor IE with the type/length prefix.
    pub fn generate_vendor_ie(&self) -> Option<Vec<u8>> {
        let raw = self.generate_raw_vendor_ie()?;
        let mut out = VENDOR_IE_TL.to_vec();
        out.extend_from_slice(&raw);
        Some(out)
    }

    /// Reads the 32 bit connection nonce out of a stage-1 payload, as value
    /// and raw little-endian bytes.
    pub fn client_iv(&self) -> Option<(u32, [u8; IV_LEN])> {
        if self.pay1.len() < IV_OFFSET + IV_LEN {
            return None;
        }

        let mut bytes = [0u8; IV_LEN];
        bytes.copy_from_slice(&self.pay1[IV_OFFSET..IV_OFFSET + IV_LEN]);

        Some((LittleEndian::read_u32(&bytes), bytes))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_data_packet() -> Packet {
        let mut packet = Packet::new();
        packet.sa = MacAddr::new([1, 2, 3, 4, 5, 6]);
        packet.da = MacAddr::new([6, 5, 4, 3, 2, 1]);
        packet.client_id = 3;
        packet.srv_id = 9;
        packet.seq = 7;
        packet.ack = 12;
        packet.pay1 = b"hello world".to_vec();
        packet
    }

    #[test]
    fn test_checksum8_known_vector() {
        let data: Vec<u8> = (0x00..=0x1E).collect();
        assert_eq!(data.len(), 31);
        assert_eq!(simple_checksum8(&data), 0x2E);
    }

    #[test]
    fn test_checksum8_wraps() {
        assert_eq!(simple_checksum8(&[0xFF, 0x02]), !0x01);
    }

    #[test]
    fn test_checksum16() {
        // sum = 6, inverted dword = 0xFFFFFFF9
        assert_eq!(simple_checksum16(&[1, 2, 3]), [0xFF, 0xF9]);
    }

    #[test]
    fn test_roundtrip_data() {
        let packet = make_data_packet();
        let raw = packet.generate_raw_ssid();

        check_length_checksum(&raw, None).unwrap();
        let parsed = Packet::parse(packet.sa, packet.da, &raw, None).unwrap();

        assert_eq!(parsed, packet);
    }

    #[test]
    fn test_roundtrip_data_with_vendor_ie() {
        let mut packet = make_data_packet();
        packet.pay2 = Some(vec![0xAB; 100]);

        let raw_ssid = packet.generate_raw_ssid();
        let raw_vendor = packet.generate_raw_vendor_ie().unwrap();

        check_length_checksum(&raw_ssid, Some(&raw_vendor)).unwrap();
        let parsed = Packet::parse(packet.sa, packet.da, &raw_ssid, Some(&raw_vendor)).unwrap();

        assert_eq!(parsed, packet);
    }

    #[test]
    fn test_roundtrip_control() {
        let mut packet = Packet::control(CtrlKind::InitReq1);
        packet.pay1.extend_from_slice(&[0xA1, 0xB2, 0xC3, 0xD4]);
        packet.seq = 1;
        packet.srv_id = 9;

        let raw = packet.generate_raw_ssid();
        let parsed = Packet::parse(MacAddr::ZERO, MacAddr::ZERO, &raw, None).unwrap();

        assert_eq!(parsed.ctrl, Some(CtrlKind::InitReq1));
        assert_eq!(parsed.pay1, packet.pay1);
        assert_eq!(parsed.seq, 1);
        assert_eq!(parsed.client_id, 0);
        assert_eq!(parsed.srv_id, 9);
    }

    #[test]
    fn test_ssid_layout() {
        let packet = make_data_packet();
        let raw = packet.generate_raw_ssid();

        assert_eq!(raw.len(), SSID_IE_LEN);
        assert_eq!(&raw[..11], b"hello world");
        assert_eq!(&raw[11..28], &[0u8; 17][..]);
        assert_eq!(raw[28], (12 << 4) | 7);
        assert_eq!(raw[29], 11);
        assert_eq!(raw[30], (3 << 4) | 9);
        assert_eq!(raw[31], simple_checksum8(&raw[..31]));
    }

    #[test]
    fn test_vendor_ie_layout() {
        let mut packet = make_data_packet();
        packet.pay2 = Some(vec![0x55; 10]);

        let raw = packet.generate_raw_vendor_ie().unwrap();

        assert_eq!(raw.len(), VENDOR_IE_LEN);
        assert_eq!(&raw[..10], &[0x55; 10][..]);
        assert_eq!(raw[236], 10);
        assert_eq!(raw[237], simple_checksum8(&raw[..237]));
    }

    #[test]
    fn test_generate_clips_oversized_payloads() {
        let mut packet = make_data_packet();
        packet.pay1 = vec![1; 40];
        packet.pay2 = Some(vec![2; 300]);

        let raw_ssid = packet.generate_raw_ssid();
        let raw_vendor = packet.generate_raw_vendor_ie().unwrap();

        assert_eq!(raw_ssid[29] as usize, PAY1_MAX_LEN);
        assert_eq!(raw_vendor[236] as usize, PAY2_MAX_LEN);
    }

    #[test]
    fn test_tl_prefixes() {
        let mut packet = make_data_packet();
        packet.pay2 = Some(vec![9; 4]);

        let ssid = packet.generate_ssid_ie();
        let vendor = packet.generate_vendor_ie().unwrap();

        assert_eq!(&ssid[..2], &SSID_IE_TL[..]);
        assert_eq!(ssid.len(), SSID_IE_LEN + 2);
        assert_eq!(&vendor[..2], &VENDOR_IE_TL[..]);
        assert_eq!(vendor.len(), VENDOR_IE_LEN + 2);
    }

    #[test]
    fn test_gate_rejects_bad_ssid_length() {
        let result = check_length_checksum(&[0u8; 31], None);
        assert_eq!(result.unwrap_err(), NetworkError::Drop(DropReason::BadLength));
    }

    #[test]
    fn test_gate_rejects_bad_ssid_checksum() {
        let mut raw = make_data_packet().generate_raw_ssid();
        raw[31] ^= 0xFF;

        let result = check_length_checksum(&raw, None);
        assert_eq!(result.unwrap_err(), NetworkError::Drop(DropReason::BadChecksum));
    }

    #[test]
    fn test_gate_rejects_bad_vendor_ie() {
        let mut packet = make_data_packet();
        packet.pay2 = Some(vec![1, 2, 3]);

        let raw_ssid = packet.generate_raw_ssid();
        let mut raw_vendor = packet.generate_raw_vendor_ie().unwrap();

        let result = check_length_checksum(&raw_ssid, Some(&raw_vendor[..200]));
        assert_eq!(result.unwrap_err(), NetworkError::Drop(DropReason::BadLength));

        raw_vendor[237] ^= 0xFF;
        let result = check_length_checksum(&raw_ssid, Some(&raw_vendor));
        assert_eq!(result.unwrap_err(), NetworkError::Drop(DropReason::BadChecksum));
    }

    #[test]
    fn test_parse_rejects_unknown_control() {
        let mut packet = Packet::control(CtrlKind::Reset);
        let mut raw = packet.generate_raw_ssid();

        // Forge an out-of-range control type and refresh the checksum.
        raw[0] = 9;
        raw[31] = simple_checksum8(&raw[..31]);

        let result = Packet::parse(MacAddr::ZERO, MacAddr::ZERO, &raw, None);
        assert_eq!(result.unwrap_err(), NetworkError::Drop(DropReason::UnknownControl));

        // The same bytes parse fine as a data frame.
        packet.ctrl = None;
        packet.pay1 = vec![9];
        let raw = packet.generate_raw_ssid();
        assert!(Packet::parse(MacAddr::ZERO, MacAddr::ZERO, &raw, None).is_ok());
    }

    #[test]
    fn test_parse_truncates_payloads_to_encoded_lengths() {
        let mut packet = make_data_packet();
        packet.pay1 = vec![7; 5];
        packet.pay2 = Some(vec![8; 20]);

        let raw_ssid = packet.generate_raw_ssid();
        let raw_vendor = packet.generate_raw_vendor_ie().unwrap();
        let parsed = Packet::parse(packet.sa, packet.da, &raw_ssid, Some(&raw_vendor)).unwrap();

        assert_eq!(parsed.pay1.len(), 5);
        assert_eq!(parsed.pay2.as_ref().unwrap().len(), 20);
    }

    #[test]
    fn test_client_iv_little_endian() {
        let mut packet = Packet::control(CtrlKind::InitReq1);
        packet.pay1.extend_from_slice(&[0xA1, 0xB2, 0xC3, 0xD4]);

        let (iv, bytes) = packet.client_iv().unwrap();
        assert_eq!(bytes, [0xA1, 0xB2, 0xC3, 0xD4]);
        assert_eq!(iv, 0xD4C3_B2A1);

        packet.pay1.truncate(3);
        assert!(packet.client_iv().is_none());
    }
}
