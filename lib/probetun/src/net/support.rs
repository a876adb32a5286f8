use std::fmt;
use std::io;

pub type NetworkResult<T> = Result<T, NetworkError>;

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum NetworkError {
    /// Per-frame failure. The offending frame is discarded and the listener
    /// carries on; nothing is reported to the peer.
    Drop(DropReason),
    /// Configuration or transport failure that aborts the calling operation.
    Fatal(ErrorType),
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum DropReason {
    BadLength,
    BadChecksum,
    NotProbeRequest,
    TruncatedFrame,
    MissingSsid,
    WrongServer,
    UnknownClient,
    UnknownControl,
    InvalidState,
    InvalidCaps,
    Exhausted,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ErrorType {
    AlreadyBound,
    AlreadyListening,
    NotBound,
    NotListening,
    InvalidServerId,
    InvalidGroup,
    TooManyConnections,
    Io(io::ErrorKind),
}

impl From<io::Error> for NetworkError {
    #[inline]
    fn from(io_error: io::Error) -> Self {
        NetworkError::Fatal(ErrorType::Io(io_error.kind()))
    }
}

impl From<nix::errno::Errno> for NetworkError {
    #[inline]
    fn from(errno: nix::errno::Errno) -> Self {
        NetworkError::Fatal(ErrorType::Io(io::Error::from_raw_os_error(errno as i32).kind()))
    }
}

pub trait ErrorUtils {
    fn has_failed(&self) -> bool;
}

impl<T> ErrorUtils for NetworkResult<T> {
    fn has_failed(&self) -> bool {
        match self {
            Ok(_) => false,
            Err(NetworkError::Drop(_)) => false,
            _ => true,
        }
    }
}

/// An 802.11 link address. Source addresses rotate on some clients between
/// scans, so this is carried for diagnostics and directed responses only and
/// never used as connection identity.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct MacAddr([u8; 6]);

impl MacAddr {
    pub const LEN: usize = 6;
    pub const ZERO: MacAddr = MacAddr([0; 6]);

    #[inline]
    pub fn new(bytes: [u8; 6]) -> MacAddr {
        MacAddr(bytes)
    }

    /// Builds an address from a 6 byte slice.
    #[inline]
    pub fn from_slice(bytes: &[u8]) -> MacAddr {
        let mut addr = [0u8; Self::LEN];
        addr.copy_from_slice(bytes);
        MacAddr(addr)
    }

    /// Generates a random locally-administered unicast address, used as the
    /// responder address on outbound probe-responses.
    #[inline]
    pub fn random_local() -> MacAddr {
        let mut addr: [u8; 6] = rand::random();
        addr[0] = (addr[0] & 0xFE) | 0x02;
        MacAddr(addr)
    }

    #[inline]
    pub fn bytes(&self) -> &[u8; 6] {
        &self.0
    }

    /// True for the all-zero placeholder address.
    #[inline]
    pub fn is_unset(&self) -> bool {
        self.0 == [0; 6]
    }
}

impl fmt::Display for MacAddr {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            self.0[0], self.0[1], self.0[2], self.0[3], self.0[4], self.0[5]
        )
    }
}
