//! Mirror of the impersonated site's certificate chain.
//!
//! The tunnel listeners present this chain so that, from the outside, the
//! server's TLS looks exactly like a connection to the real site. The chain
//! is re-fetched daily and only replaced by one with a strictly later
//! NotAfter.

use std::io;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use mirage_tunnel::server::{FakeCertProvider, PresentedCert};
use mirage_tunnel::utils::{complete_handshake, NoCertificateVerification};
use rustls::{ClientConnection, Connection, ProtocolVersion, ServerName};
use tokio::net::TcpStream;
use tracing::{debug, warn};

const REFRESH_INTERVAL: Duration = Duration::from_secs(24 * 60 * 60);

pub struct WebCert {
    web_addr: String,
    server_name: ServerName,
    tlsconf: Arc<rustls::ClientConfig>,
    state: Mutex<Option<Mirror>>,
}

struct Mirror {
    cert: Arc<PresentedCert>,
    not_after: i64,
}

impl WebCert {
    pub fn new(web_addr: String, server_name: ServerName) -> Arc<WebCert> {
        let tlsconf = rustls::ClientConfig::builder()
            .with_safe_defaults()
            .with_custom_certificate_verifier(Arc::new(NoCertificateVerification))
            .with_no_client_auth();
        Arc::new(WebCert {
            web_addr,
            server_name,
            tlsconf: Arc::new(tlsconf),
            state: Mutex::new(None),
        })
    }

    /// Fetch the site's chain, adopt it if its leaf outlives the cached one,
    /// and report the negotiated TLS version.
    pub async fn refresh(&self) -> io::Result<Option<ProtocolVersion>> {
        let (chain, version) = self.fetch_chain().await?;
        let leaf = chain
            .first()
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "empty certificate chain"))?;
        let (_, parsed) = x509_parser::parse_x509_certificate(&leaf.0)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))?;
        let not_after = parsed.validity().not_after.timestamp();

        let mut state = self.state.lock().unwrap();
        let newer = state
            .as_ref()
            .map(|mirror| not_after > mirror.not_after)
            .unwrap_or(true);
        if newer {
            debug!(not_after, "adopting mirrored certificate chain");
            *state = Some(Mirror {
                // TODO: surface the peer's stapled OCSP and SCTs once the
                // TLS fork exposes them on the client connection.
                cert: Arc::new(PresentedCert {
                    chain,
                    ocsp: None,
                    sct_list: None,
                }),
                not_after,
            });
        }
        Ok(version)
    }

    /// Refresh daily, keeping the previous chain on failure.
    pub fn spawn_refresh(self: Arc<WebCert>) {
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(REFRESH_INTERVAL).await;
                if let Err(e) = self.refresh().await {
                    warn!(addr = %self.web_addr, "certificate mirror refresh failed: {}", e);
                }
            }
        });
    }

    async fn fetch_chain(&self) -> io::Result<(Vec<rustls::Certificate>, Option<ProtocolVersion>)> {
        let mut stream = TcpStream::connect(&self.web_addr).await?;
        let tlsconn = ClientConnection::new(self.tlsconf.clone(), self.server_name.clone())
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
        let mut conn = Connection::from(tlsconn);
        complete_handshake(&mut conn, &mut stream).await?;
        let chain = conn
            .peer_certificates()
            .map(|certs| certs.to_vec())
            .unwrap_or_default();
        let version = conn.protocol_version();
        Ok((chain, version))
    }
}

impl FakeCertProvider for WebCert {
    fn fake_certificate(&self) -> Option<Arc<PresentedCert>> {
        self.state.lock().unwrap().as_ref().map(|m| m.cert.clone())
    }
}
