//! The fronted port: the only thing the outside world ever talks to.
//!
//! Every inbound connection starts with the fixed 43-byte prefix of a TLS
//! ClientHello (record header, handshake header, legacy version, 32-byte
//! random). Decoding the random against the channel key tells tunnel
//! clients apart from innocent visitors; either way the connection is
//! spliced onward with the prefix replayed first, so both backends see an
//! untouched byte stream.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use mirage_tunnel::hello::{decode_hello_random, RANDOM_LENGTH, RANDOM_OFFSET};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, trace};
use uuid::Uuid;

/// Record header + handshake header + version + random.
pub const HELLO_PREFIX_LENGTH: usize = RANDOM_OFFSET + RANDOM_LENGTH;

const READ_DEADLINE: Duration = Duration::from_secs(10);

pub async fn handle_fronted_conn(
    mut conn: TcpStream,
    peer: SocketAddr,
    fake_web_addr: Arc<str>,
    channel: Uuid,
    tls_server_addrs: Arc<HashMap<Uuid, SocketAddr>>,
) {
    let mut prefix = [0u8; HELLO_PREFIX_LENGTH];
    match timeout(READ_DEADLINE, conn.read_exact(&mut prefix)).await {
        Ok(Ok(_)) => {}
        Ok(Err(_)) | Err(_) => return,
    }

    let random: [u8; RANDOM_LENGTH] = prefix[RANDOM_OFFSET..].try_into().unwrap();
    let client_uuid = decode_hello_random(&random, &channel);

    match tls_server_addrs.get(&client_uuid) {
        Some(addr) => {
            debug!(%peer, client = %client_uuid, "tunnel client connected");
            forward_tcp_conn(conn, &addr.to_string(), &prefix).await;
        }
        None => {
            trace!(%peer, "visitor relayed to impersonated site");
            forward_tcp_conn(conn, &fake_web_addr, &prefix).await;
        }
    }
}

/// Splice `client` to `remote_addr`, writing `data` upstream first. Either
/// side failing closes both.
async fn forward_tcp_conn(mut client: TcpStream, remote_addr: &str, data: &[u8]) {
    let Ok(mut server) = TcpStream::connect(remote_addr).await else {
        return;
    };
    if server.write_all(data).await.is_err() {
        return;
    }
    let _ = tokio::io::copy_bidirectional(&mut client, &mut server).await;
}
