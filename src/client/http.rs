//! HTTP front end of the local proxy: CONNECT plus plain requests with an
//! absolute-form URL.

use std::sync::Arc;

use mirage_tunnel::Socks5Address;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tracing::debug;
use url::Url;

use super::pool::SessionPool;
use super::pump;

const CONNECT_ESTABLISHED: &[u8] = b"HTTP/1.1 200 Connection established\r\n\r\n";

/// Drive one local HTTP connection. `first_packet` holds the initial read
/// and, for non-CONNECT requests, becomes the first data carried upstream.
pub async fn handle(mut conn: TcpStream, first_packet: Vec<u8>, pool: &Arc<SessionPool>) {
    let Some(target) = parse_target(&first_packet) else {
        return;
    };
    debug!(target = %target.address, connect = target.is_connect, "http request");

    let Some((sess, stream_id, rx)) = pool.acquire().await else {
        return;
    };

    if sess.write_stream_new(stream_id, &target.address).await.is_err() {
        sess.del_stream(stream_id);
        return;
    }

    let opening = if target.is_connect {
        conn.write_all(CONNECT_ESTABLISHED).await
    } else {
        sess.write_stream_data(stream_id, &first_packet).await
    };
    if opening.is_err() {
        sess.del_stream(stream_id);
        return;
    }

    pump(conn, sess, stream_id, rx).await;
}

struct Target {
    address: Socks5Address,
    is_connect: bool,
}

fn parse_target(first_packet: &[u8]) -> Option<Target> {
    // Only the request line matters; the rest may be headers or raw body.
    let line_end = first_packet.iter().position(|&b| b == b'\n')?;
    let line = String::from_utf8_lossy(&first_packet[..line_end]);
    let mut parts = line.split_whitespace();
    let method = parts.next()?;
    let raw_url = parts.next()?;

    if method == "CONNECT" {
        let (host, port) = split_host_port(raw_url)?;
        return Some(Target {
            address: Socks5Address::from_host_port(&host, port),
            is_connect: true,
        });
    }

    let url = Url::parse(raw_url).ok()?;
    let host = url.host_str()?;
    let port = url.port().unwrap_or(80);
    Some(Target {
        address: Socks5Address::from_host_port(host, port),
        is_connect: false,
    })
}

fn split_host_port(s: &str) -> Option<(String, u16)> {
    let (host, port) = s.rsplit_once(':')?;
    let port: u16 = port.parse().ok()?;
    let host = host
        .strip_prefix('[')
        .and_then(|h| h.strip_suffix(']'))
        .unwrap_or(host);
    if host.is_empty() {
        return None;
    }
    Some((host.to_owned(), port))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connect_request() {
        let target = parse_target(b"CONNECT example.com:443 HTTP/1.1\r\n\r\n").unwrap();
        assert!(target.is_connect);
        assert_eq!(target.address, Socks5Address::from_host_port("example.com", 443));
    }

    #[test]
    fn connect_to_bracketed_ipv6() {
        let target = parse_target(b"CONNECT [2001:db8::1]:443 HTTP/1.1\r\n\r\n").unwrap();
        assert_eq!(
            target.address,
            Socks5Address::from_host_port("2001:db8::1", 443)
        );
    }

    #[test]
    fn connect_without_port_is_rejected() {
        assert!(parse_target(b"CONNECT example.com HTTP/1.1\r\n\r\n").is_none());
    }

    #[test]
    fn absolute_form_get_defaults_to_port_80() {
        let target = parse_target(b"GET http://example.com/index.html HTTP/1.1\r\n\r\n").unwrap();
        assert!(!target.is_connect);
        assert_eq!(target.address, Socks5Address::from_host_port("example.com", 80));
    }

    #[test]
    fn absolute_form_with_explicit_port() {
        let target = parse_target(b"GET http://example.com:8080/ HTTP/1.1\r\n\r\n").unwrap();
        assert_eq!(
            target.address,
            Socks5Address::from_host_port("example.com", 8080)
        );
    }

    #[test]
    fn garbage_is_rejected() {
        assert!(parse_target(b"\xff\xfe\r\n").is_none());
        assert!(parse_target(b"GET\r\n").is_none());
    }
}
