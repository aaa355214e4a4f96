//! Proxy frame codec
//!
//! Every logical stream multiplexed over a tunnel connection travels as a
//! sequence of length-prefixed frames:
//!
//! ```text
//! [4] length of everything after this field
//! [8] connect id
//! [1] step        (Request=1, Forward=2)
//! [1] protocol    (TCP=0, UDP=1)
//! [1] direction   (Forward=0, Reverse=1)
//! [1] source length (0, 6 or 18) + source address
//! [1] target length (0, 6 or 18) + target address
//! [..] payload
//! ```
//!
//! Integers are little-endian. Addresses are the raw IPv4 or IPv6 octets
//! followed by the port.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

/// Size of the length prefix
pub const LENGTH_PREFIX_LEN: usize = 4;

/// Fixed part after the prefix: connect id, step, protocol, direction and
/// both address length bytes
const FIXED_BODY_LEN: usize = 8 + 1 + 1 + 1 + 1 + 1;

/// Upper bound on a frame body; anything larger means the stream is desynced
pub const MAX_FRAME_LEN: usize = 8 * 1024 * 1024;

const IPV4_ADDR_LEN: u8 = 4 + 2;
const IPV6_ADDR_LEN: u8 = 16 + 2;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FrameError {
    #[error("Truncated frame: need {needed} bytes, have {available}")]
    Truncated { needed: usize, available: usize },

    #[error("Length prefix {declared} does not match body of {actual} bytes")]
    InvalidLength { declared: usize, actual: usize },

    #[error("Invalid address length: {0}")]
    InvalidAddressLength(u8),

    #[error("Invalid step: {0}")]
    InvalidStep(u8),

    #[error("Invalid protocol: {0}")]
    InvalidProtocol(u8),

    #[error("Invalid direction: {0}")]
    InvalidDirection(u8),

    #[error("Frame too large: {0} bytes")]
    TooLarge(usize),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ProxyStep {
    Request = 1,
    Forward = 2,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ProxyProtocol {
    Tcp = 0,
    Udp = 1,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ProxyDirection {
    Forward = 0,
    Reverse = 1,
}

impl TryFrom<u8> for ProxyStep {
    type Error = FrameError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(ProxyStep::Request),
            2 => Ok(ProxyStep::Forward),
            other => Err(FrameError::InvalidStep(other)),
        }
    }
}

impl TryFrom<u8> for ProxyProtocol {
    type Error = FrameError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(ProxyProtocol::Tcp),
            1 => Ok(ProxyProtocol::Udp),
            other => Err(FrameError::InvalidProtocol(other)),
        }
    }
}

impl TryFrom<u8> for ProxyDirection {
    type Error = FrameError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(ProxyDirection::Forward),
            1 => Ok(ProxyDirection::Reverse),
            other => Err(FrameError::InvalidDirection(other)),
        }
    }
}

/// One multiplexing frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyFrame {
    pub connect_id: u64,
    pub step: ProxyStep,
    pub protocol: ProxyProtocol,
    pub direction: ProxyDirection,
    pub source: Option<SocketAddr>,
    pub target: Option<SocketAddr>,
    pub data: Bytes,
}

impl ProxyFrame {
    /// Forward-step frame carrying only payload
    pub fn forward(connect_id: u64, protocol: ProxyProtocol, data: Bytes) -> Self {
        Self {
            connect_id,
            step: ProxyStep::Forward,
            protocol,
            direction: ProxyDirection::Forward,
            source: None,
            target: None,
            data,
        }
    }

    /// Request-step frame opening a logical stream toward `target`
    pub fn request(connect_id: u64, protocol: ProxyProtocol, target: SocketAddr) -> Self {
        Self {
            connect_id,
            step: ProxyStep::Request,
            protocol,
            direction: ProxyDirection::Forward,
            source: None,
            target: Some(target),
            data: Bytes::new(),
        }
    }

    pub fn with_direction(mut self, direction: ProxyDirection) -> Self {
        self.direction = direction;
        self
    }

    pub fn with_source(mut self, source: SocketAddr) -> Self {
        self.source = Some(source);
        self
    }

    pub fn with_target(mut self, target: SocketAddr) -> Self {
        self.target = Some(target);
        self
    }

    pub fn with_data(mut self, data: Bytes) -> Self {
        self.data = data;
        self
    }

    /// A Forward frame without payload closes the logical stream
    pub fn is_close(&self) -> bool {
        self.step == ProxyStep::Forward && self.data.is_empty()
    }

    /// Total encoded size including the length prefix
    pub fn encoded_len(&self) -> usize {
        LENGTH_PREFIX_LEN
            + FIXED_BODY_LEN
            + addr_len(self.source) as usize
            + addr_len(self.target) as usize
            + self.data.len()
    }

    pub fn encode(&self) -> Bytes {
        let total = self.encoded_len();
        let mut buf = BytesMut::with_capacity(total);

        buf.put_u32_le((total - LENGTH_PREFIX_LEN) as u32);
        buf.put_u64_le(self.connect_id);
        buf.put_u8(self.step as u8);
        buf.put_u8(self.protocol as u8);
        buf.put_u8(self.direction as u8);
        put_addr(&mut buf, self.source);
        put_addr(&mut buf, self.target);
        buf.put_slice(&self.data);

        buf.freeze()
    }

    /// Decode one complete frame, length prefix included.
    ///
    /// The payload is a zero-copy slice of `frame`.
    pub fn decode(mut frame: Bytes) -> Result<Self, FrameError> {
        ensure(&frame, LENGTH_PREFIX_LEN)?;
        let declared = frame.get_u32_le() as usize;
        if declared != frame.len() {
            return Err(FrameError::InvalidLength {
                declared,
                actual: frame.len(),
            });
        }

        ensure(&frame, FIXED_BODY_LEN - 2)?;
        let connect_id = frame.get_u64_le();
        let step = ProxyStep::try_from(frame.get_u8())?;
        let protocol = ProxyProtocol::try_from(frame.get_u8())?;
        let direction = ProxyDirection::try_from(frame.get_u8())?;
        let source = get_addr(&mut frame)?;
        let target = get_addr(&mut frame)?;

        Ok(Self {
            connect_id,
            step,
            protocol,
            direction,
            source,
            target,
            data: frame,
        })
    }
}

fn ensure(buf: &Bytes, needed: usize) -> Result<(), FrameError> {
    if buf.remaining() < needed {
        return Err(FrameError::Truncated {
            needed,
            available: buf.remaining(),
        });
    }
    Ok(())
}

fn addr_len(addr: Option<SocketAddr>) -> u8 {
    match addr {
        None => 0,
        Some(SocketAddr::V4(_)) => IPV4_ADDR_LEN,
        Some(SocketAddr::V6(_)) => IPV6_ADDR_LEN,
    }
}

fn put_addr(buf: &mut BytesMut, addr: Option<SocketAddr>) {
    buf.put_u8(addr_len(addr));
    if let Some(addr) = addr {
        match addr.ip() {
            IpAddr::V4(ip) => buf.put_slice(&ip.octets()),
            IpAddr::V6(ip) => buf.put_slice(&ip.octets()),
        }
        buf.put_u16_le(addr.port());
    }
}

fn get_addr(buf: &mut Bytes) -> Result<Option<SocketAddr>, FrameError> {
    ensure(buf, 1)?;
    let len = buf.get_u8();
    let ip = match len {
        0 => return Ok(None),
        IPV4_ADDR_LEN => {
            ensure(buf, len as usize)?;
            let mut octets = [0u8; 4];
            buf.copy_to_slice(&mut octets);
            IpAddr::V4(Ipv4Addr::from(octets))
        }
        IPV6_ADDR_LEN => {
            ensure(buf, len as usize)?;
            let mut octets = [0u8; 16];
            buf.copy_to_slice(&mut octets);
            IpAddr::V6(Ipv6Addr::from(octets))
        }
        other => return Err(FrameError::InvalidAddressLength(other)),
    };
    let port = buf.get_u16_le();
    Ok(Some(SocketAddr::new(ip, port)))
}

/// Splits a byte stream from a tunnel connection back into frames
#[derive(Debug, Default)]
pub struct FrameReassembler {
    buffer: BytesMut,
}

impl FrameReassembler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Bytes received but not yet returned as a frame
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Next complete frame, `Ok(None)` when more bytes are needed.
    ///
    /// An error means the stream can no longer be trusted.
    pub fn next_frame(&mut self) -> Result<Option<ProxyFrame>, FrameError> {
        if self.buffer.len() < LENGTH_PREFIX_LEN {
            return Ok(None);
        }
        let mut prefix = [0u8; LENGTH_PREFIX_LEN];
        prefix.copy_from_slice(&self.buffer[..LENGTH_PREFIX_LEN]);
        let body_len = u32::from_le_bytes(prefix) as usize;
        if body_len > MAX_FRAME_LEN {
            return Err(FrameError::TooLarge(body_len));
        }
        if self.buffer.len() < LENGTH_PREFIX_LEN + body_len {
            return Ok(None);
        }
        let frame = self.buffer.split_to(LENGTH_PREFIX_LEN + body_len).freeze();
        ProxyFrame::decode(frame).map(Some)
    }
}
