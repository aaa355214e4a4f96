//! SOCKS5 wire handling (RFC 1928, NO AUTH, IP destinations only)
//!
//! Domain-name destinations are refused: routing is by destination IP.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use bytes::{BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::{ProxyError, Result};

pub const VERSION: u8 = 0x05;
pub const METHOD_NO_AUTH: u8 = 0x00;
pub const METHOD_NONE_ACCEPTABLE: u8 = 0xFF;

pub const ATYP_IPV4: u8 = 0x01;
pub const ATYP_DOMAIN: u8 = 0x03;
pub const ATYP_IPV6: u8 = 0x04;

pub const REPLY_SUCCEEDED: u8 = 0x00;
pub const REPLY_GENERAL_FAILURE: u8 = 0x01;
pub const REPLY_HOST_UNREACHABLE: u8 = 0x04;
pub const REPLY_COMMAND_NOT_SUPPORTED: u8 = 0x07;
pub const REPLY_ADDRESS_NOT_SUPPORTED: u8 = 0x08;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Connect,
    UdpAssociate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Request {
    pub command: Command,
    pub target: SocketAddr,
}

/// Run the greeting and read the client's request.
///
/// Refusals (auth method, command, address type) are answered on the
/// stream before the error is returned. A successful request is not
/// answered; the caller replies once it knows the outcome.
pub async fn accept<S>(stream: &mut S) -> Result<Request>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    // VER | NMETHODS | METHODS
    let mut header = [0u8; 2];
    stream.read_exact(&mut header).await?;
    if header[0] != VERSION {
        return Err(ProxyError::UnsupportedVersion(header[0]));
    }

    let mut methods = vec![0u8; header[1] as usize];
    stream.read_exact(&mut methods).await?;
    if !methods.contains(&METHOD_NO_AUTH) {
        stream.write_all(&[VERSION, METHOD_NONE_ACCEPTABLE]).await?;
        return Err(ProxyError::NoAcceptableMethod);
    }
    stream.write_all(&[VERSION, METHOD_NO_AUTH]).await?;

    // VER | CMD | RSV | ATYP | DST.ADDR | DST.PORT
    let mut request = [0u8; 4];
    stream.read_exact(&mut request).await?;
    if request[0] != VERSION {
        return Err(ProxyError::UnsupportedVersion(request[0]));
    }

    let command = match request[1] {
        0x01 => Command::Connect,
        0x03 => Command::UdpAssociate,
        other => {
            reply(stream, REPLY_COMMAND_NOT_SUPPORTED, unspecified()).await?;
            return Err(ProxyError::UnsupportedCommand(other));
        }
    };

    let ip = match request[3] {
        ATYP_IPV4 => {
            let mut addr = [0u8; 4];
            stream.read_exact(&mut addr).await?;
            IpAddr::V4(Ipv4Addr::from(addr))
        }
        ATYP_IPV6 => {
            let mut addr = [0u8; 16];
            stream.read_exact(&mut addr).await?;
            IpAddr::V6(Ipv6Addr::from(addr))
        }
        other => {
            reply(stream, REPLY_ADDRESS_NOT_SUPPORTED, unspecified()).await?;
            return Err(ProxyError::UnsupportedAddressType(other));
        }
    };

    let mut port = [0u8; 2];
    stream.read_exact(&mut port).await?;

    Ok(Request {
        command,
        target: SocketAddr::new(ip, u16::from_be_bytes(port)),
    })
}

/// VER | REP | RSV | ATYP | BND.ADDR | BND.PORT
pub async fn reply<S>(stream: &mut S, code: u8, bound: SocketAddr) -> std::io::Result<()>
where
    S: AsyncWrite + Unpin,
{
    let mut buf = BytesMut::with_capacity(22);
    buf.put_u8(VERSION);
    buf.put_u8(code);
    buf.put_u8(0x00);
    put_addr(&mut buf, bound);
    stream.write_all(&buf).await
}

fn unspecified() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 0))
}

fn put_addr(buf: &mut BytesMut, addr: SocketAddr) {
    match addr.ip() {
        IpAddr::V4(ip) => {
            buf.put_u8(ATYP_IPV4);
            buf.put_slice(&ip.octets());
        }
        IpAddr::V6(ip) => {
            buf.put_u8(ATYP_IPV6);
            buf.put_slice(&ip.octets());
        }
    }
    buf.put_u16(addr.port());
}

/// Split a client UDP datagram into destination and payload.
///
/// RSV(2) | FRAG | ATYP | DST.ADDR | DST.PORT | DATA
pub fn parse_udp_datagram(datagram: &Bytes) -> Result<(SocketAddr, Bytes)> {
    if datagram.len() < 4 {
        return Err(ProxyError::TruncatedDatagram);
    }
    if datagram[2] != 0 {
        return Err(ProxyError::Fragmented);
    }
    let (ip, offset) = match datagram[3] {
        ATYP_IPV4 => {
            if datagram.len() < 10 {
                return Err(ProxyError::TruncatedDatagram);
            }
            let mut octets = [0u8; 4];
            octets.copy_from_slice(&datagram[4..8]);
            (IpAddr::V4(Ipv4Addr::from(octets)), 8)
        }
        ATYP_IPV6 => {
            if datagram.len() < 22 {
                return Err(ProxyError::TruncatedDatagram);
            }
            let mut octets = [0u8; 16];
            octets.copy_from_slice(&datagram[4..20]);
            (IpAddr::V6(Ipv6Addr::from(octets)), 20)
        }
        other => return Err(ProxyError::UnsupportedAddressType(other)),
    };
    let port = u16::from_be_bytes([datagram[offset], datagram[offset + 1]]);
    Ok((SocketAddr::new(ip, port), datagram.slice(offset + 2..)))
}

/// Prefix `data` with the header naming where it came from
pub fn wrap_udp_datagram(source: SocketAddr, data: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(22 + data.len());
    buf.put_u16(0);
    buf.put_u8(0);
    put_addr(&mut buf, source);
    buf.put_slice(data);
    buf.freeze()
}
