//! The fronted server daemon: one public port, one tunnel TLS listener per
//! registered client, and the certificate mirror they present.

pub mod front;
pub mod remote;
pub mod session;
pub mod webcert;

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use mirage_tunnel::server::FakeCertProvider;
use mirage_tunnel::{Acceptor, KeyPair};
use rustls::ServerName;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};
use url::Url;
use uuid::Uuid;

use crate::config::ServerConfig;
use webcert::WebCert;

pub struct Server {
    front_listener: TcpListener,
    fake_web_addr: Arc<str>,
    channel: Uuid,
    tls_server_addrs: Arc<HashMap<Uuid, SocketAddr>>,
}

/// Resolve the impersonated site, start the certificate mirror and the
/// per-client tunnel listeners, and bind the fronted port.
pub async fn bind(cfg: ServerConfig) -> anyhow::Result<Server> {
    let url = Url::parse(&cfg.fake_web_url).context("parsing FakeWebURL")?;
    let host = url
        .host_str()
        .context("FakeWebURL has no host")?
        .to_owned();
    let fake_web_addr = format!("{}:{}", host, url.port().unwrap_or(443));
    let server_name =
        ServerName::try_from(host.as_str()).context("FakeWebURL host is not a valid server name")?;

    let webcert = WebCert::new(fake_web_addr.clone(), server_name);
    let max_version = match webcert.refresh().await {
        Ok(version) => {
            info!(addr = %fake_web_addr, ?version, "mirrored impersonated site's certificate");
            version
        }
        Err(e) => {
            warn!(addr = %fake_web_addr, "initial certificate mirror failed: {}", e);
            None
        }
    };
    webcert.clone().spawn_refresh();

    let mut tls_server_addrs = HashMap::with_capacity(cfg.clients.len());
    for entry in &cfg.clients {
        let identity = KeyPair::generate(&entry.id, 2048)
            .with_context(|| format!("deriving identity for client {}", entry.id))?;
        let provider: Arc<dyn FakeCertProvider> = webcert.clone();
        let acceptor = Arc::new(
            Acceptor::new(&identity, Some(provider), max_version)
                .with_context(|| format!("building TLS listener for client {}", entry.id))?,
        );
        let listener = TcpListener::bind(&entry.listen_addr)
            .await
            .with_context(|| format!("binding tunnel listener on {}", entry.listen_addr))?;
        let addr = listener.local_addr()?;
        info!(client = %entry.id, %addr, "tunnel listener started");
        tls_server_addrs.insert(entry.id, addr);
        tokio::spawn(tunnel_listen(listener, acceptor));
    }

    let front_listener = TcpListener::bind(&cfg.fronted_listen_addr)
        .await
        .with_context(|| format!("binding fronted listener on {}", cfg.fronted_listen_addr))?;
    info!(addr = %front_listener.local_addr()?, "fronted port listening");

    Ok(Server {
        front_listener,
        fake_web_addr: fake_web_addr.into(),
        channel: cfg.channel,
        tls_server_addrs: Arc::new(tls_server_addrs),
    })
}

impl Server {
    pub fn front_addr(&self) -> std::io::Result<SocketAddr> {
        self.front_listener.local_addr()
    }

    pub async fn run(self) -> anyhow::Result<()> {
        loop {
            let (conn, peer) = match self.front_listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!("fronted accept failed: {}", e);
                    continue;
                }
            };
            tokio::spawn(front::handle_fronted_conn(
                conn,
                peer,
                self.fake_web_addr.clone(),
                self.channel,
                self.tls_server_addrs.clone(),
            ));
        }
    }
}

async fn tunnel_listen(listener: TcpListener, acceptor: Arc<Acceptor>) {
    loop {
        let (conn, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                warn!("tunnel accept failed: {}", e);
                continue;
            }
        };
        let acceptor = acceptor.clone();
        tokio::spawn(async move {
            match acceptor.accept(conn).await {
                Ok(stream) => session::run(stream).await,
                Err(e) => debug!(%peer, "tunnel handshake failed: {}", e),
            }
        });
    }
}
