//! The local proxy daemon: accepts SOCKS5 and HTTP connections and carries
//! them over the pooled tunnel session.

pub mod http;
pub mod pool;
pub mod session;
pub mod socks5;

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use bytes::Bytes;
use mirage_tunnel::frame::MAX_BODY_LENGTH;
use mirage_tunnel::KeyPair;
use rustls::ServerName;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::config::ClientConfig;
use pool::SessionPool;
use session::Session;

pub struct Proxy {
    listener: TcpListener,
    pool: Arc<SessionPool>,
}

/// Build the pool and bind the local listener.
pub async fn bind(cfg: ClientConfig) -> anyhow::Result<Proxy> {
    if cfg.auto_start {
        warn!("AutoStart is set but no platform registration backend is compiled in");
    }

    let identity = KeyPair::generate(&cfg.client, 2048).context("deriving client identity")?;
    let server_name = ServerName::try_from(cfg.fake_web_domain.as_str())
        .context("FakeWebDomain is not a valid server name")?;
    let tunnel = mirage_tunnel::Client::new(cfg.channel, cfg.client, server_name, &identity);

    let pool = SessionPool::new(cfg.server_addr, tunnel);
    pool.run();

    let listener = TcpListener::bind(&cfg.listen_addr)
        .await
        .with_context(|| format!("binding local listener on {}", cfg.listen_addr))?;
    info!(addr = %listener.local_addr()?, "local proxy listening");
    Ok(Proxy { listener, pool })
}

impl Proxy {
    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub async fn run(self) -> anyhow::Result<()> {
        loop {
            let (conn, peer) = match self.listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!("accept failed: {}", e);
                    continue;
                }
            };
            debug!(%peer, "local connection");
            let pool = self.pool.clone();
            tokio::spawn(async move {
                handle_conn(conn, pool).await;
            });
        }
    }
}

/// Sniff the first packet and hand off to the matching front end.
async fn handle_conn(mut conn: TcpStream, pool: Arc<SessionPool>) {
    let mut first_packet = vec![0u8; MAX_BODY_LENGTH];
    let n = match conn.read(&mut first_packet).await {
        Ok(0) | Err(_) => return,
        Ok(n) => n,
    };
    first_packet.truncate(n);

    if first_packet[0] == 5 && n >= 3 {
        socks5::handle(conn, &first_packet, &pool).await;
    } else {
        http::handle(conn, first_packet, &pool).await;
    }
}

/// Shuttle bytes between one local connection and its tunnel stream until
/// either side goes away.
pub(crate) async fn pump(
    conn: TcpStream,
    sess: Arc<Session>,
    stream_id: u16,
    mut rx: mpsc::Receiver<Bytes>,
) {
    let (mut local_read, mut local_write) = conn.into_split();
    let mut buf = vec![0u8; MAX_BODY_LENGTH];
    loop {
        tokio::select! {
            read = local_read.read(&mut buf) => match read {
                Ok(0) | Err(_) => {
                    let _ = sess.write_stream_del(stream_id).await;
                    break;
                }
                Ok(n) => {
                    if sess.write_stream_data(stream_id, &buf[..n]).await.is_err() {
                        break;
                    }
                }
            },
            data = rx.recv() => match data {
                Some(data) => {
                    if local_write.write_all(&data).await.is_err() {
                        let _ = sess.write_stream_del(stream_id).await;
                        break;
                    }
                }
                // The peer or the session tore the stream down.
                None => break,
            },
        }
    }
    sess.del_stream(stream_id);
}
