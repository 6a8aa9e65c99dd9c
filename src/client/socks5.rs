//! SOCKS5 front end of the local proxy (RFC 1928, CONNECT only, no auth).

use std::io;
use std::net::IpAddr;
use std::sync::Arc;

use mirage_tunnel::addr::{Socks5Host, ATYP_DOMAIN, ATYP_IPV4, ATYP_IPV6};
use mirage_tunnel::Socks5Address;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::debug;

use super::pool::SessionPool;
use super::pump;

const SOCKS5_VERSION: u8 = 5;

const CMD_CONNECT: u8 = 1;

const REP_SUCCESS: u8 = 0;
const REP_HOST_UNREACHABLE: u8 = 4;
const REP_COMMAND_NOT_SUPPORTED: u8 = 7;
const REP_ADDR_TYPE_NOT_SUPPORTED: u8 = 8;

/// Drive one local SOCKS5 connection. `first_packet` is the bytes of the
/// initial read, which must hold the whole method-negotiation message.
pub async fn handle(mut conn: TcpStream, first_packet: &[u8], pool: &Arc<SessionPool>) {
    if first_packet[0] != SOCKS5_VERSION {
        return;
    }
    let num_methods = first_packet[1] as usize;
    if num_methods != first_packet.len() - 2 {
        return;
    }
    if conn.write_all(&[SOCKS5_VERSION, 0]).await.is_err() {
        return;
    }

    let mut header = [0u8; 3];
    if conn.read_exact(&mut header).await.is_err() {
        return;
    }
    if header[0] != SOCKS5_VERSION {
        return;
    }
    if header[1] != CMD_CONNECT {
        let _ = send_reply(&mut conn, REP_COMMAND_NOT_SUPPORTED, None).await;
        return;
    }

    let address = match read_addr(&mut conn).await {
        Ok(address) => address,
        Err(_) => {
            let _ = send_reply(&mut conn, REP_ADDR_TYPE_NOT_SUPPORTED, None).await;
            return;
        }
    };
    debug!(target = %address, "socks5 connect");

    let Some((sess, stream_id, rx)) = pool.acquire().await else {
        let _ = send_reply(&mut conn, REP_HOST_UNREACHABLE, None).await;
        return;
    };

    if send_reply(&mut conn, REP_SUCCESS, Some(&address)).await.is_err() {
        sess.del_stream(stream_id);
        return;
    }
    if sess.write_stream_new(stream_id, &address).await.is_err() {
        sess.del_stream(stream_id);
        return;
    }

    pump(conn, sess, stream_id, rx).await;
}

/// Read the address block of a command message.
async fn read_addr<R: AsyncRead + Unpin>(r: &mut R) -> io::Result<Socks5Address> {
    let atyp = r.read_u8().await?;
    let host = match atyp {
        ATYP_IPV4 => {
            let mut octets = [0u8; 4];
            r.read_exact(&mut octets).await?;
            Socks5Host::Ip(IpAddr::from(octets))
        }
        ATYP_IPV6 => {
            let mut octets = [0u8; 16];
            r.read_exact(&mut octets).await?;
            Socks5Host::Ip(IpAddr::from(octets))
        }
        ATYP_DOMAIN => {
            let len = r.read_u8().await? as usize;
            let mut fqdn = vec![0u8; len];
            r.read_exact(&mut fqdn).await?;
            Socks5Host::Domain(
                String::from_utf8(fqdn)
                    .map_err(|_| io::Error::from(io::ErrorKind::InvalidData))?,
            )
        }
        _ => return Err(io::ErrorKind::InvalidData.into()),
    };
    let port = r.read_u16().await?;
    Ok(Socks5Address::new(host, port))
}

/// Reply with `rep`; the bound address echoes the requested target, or
/// 0.0.0.0:0 on failure replies.
async fn send_reply<W: AsyncWrite + Unpin>(
    w: &mut W,
    rep: u8,
    addr: Option<&Socks5Address>,
) -> io::Result<()> {
    let mut msg = vec![SOCKS5_VERSION, rep, 0];
    match addr {
        Some(addr) => {
            addr.encode(&mut msg)
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
        }
        None => {
            msg.extend_from_slice(&[ATYP_IPV4, 0, 0, 0, 0, 0, 0]);
        }
    }
    w.write_all(&msg).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn read_addr_ipv4() {
        let (mut a, mut b) = tokio::io::duplex(64);
        a.write_all(&[ATYP_IPV4, 1, 2, 3, 4, 0x00, 0x50]).await.unwrap();
        let addr = read_addr(&mut b).await.unwrap();
        assert_eq!(addr, Socks5Address::from_host_port("1.2.3.4", 80));
    }

    #[tokio::test]
    async fn read_addr_domain() {
        let (mut a, mut b) = tokio::io::duplex(64);
        a.write_all(&[ATYP_DOMAIN, 11]).await.unwrap();
        a.write_all(b"example.com").await.unwrap();
        a.write_all(&[0x01, 0xbb]).await.unwrap();
        let addr = read_addr(&mut b).await.unwrap();
        assert_eq!(addr, Socks5Address::from_host_port("example.com", 443));
    }

    #[tokio::test]
    async fn read_addr_rejects_unknown_type() {
        let (mut a, mut b) = tokio::io::duplex(64);
        a.write_all(&[0x02, 0, 0]).await.unwrap();
        assert!(read_addr(&mut b).await.is_err());
    }

    #[tokio::test]
    async fn success_reply_echoes_target() {
        let addr = Socks5Address::from_host_port("1.2.3.4", 80);
        let mut out = Vec::new();
        send_reply(&mut out, REP_SUCCESS, Some(&addr)).await.unwrap();
        assert_eq!(out, [0x05, 0x00, 0x00, 0x01, 0x01, 0x02, 0x03, 0x04, 0x00, 0x50]);
    }

    #[tokio::test]
    async fn failure_reply_is_zero_address() {
        let mut out = Vec::new();
        send_reply(&mut out, REP_HOST_UNREACHABLE, None).await.unwrap();
        assert_eq!(out, [0x05, 0x04, 0x00, 0x01, 0, 0, 0, 0, 0, 0]);
    }
}
