//! Server side of the camouflaged TLS transport.

use std::io;
use std::sync::Arc;

use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use rustls::{Certificate, Connection, ProtocolVersion, ServerConnection};
use tokio::net::TcpStream;
use tracing::{debug, trace};

use crate::keypair::KeyPair;
use crate::tlsio::TlsStream;
use crate::utils::complete_handshake;

/// Certificate material to present on the wire: chain, OCSP staple, SCTs.
#[derive(Debug, Clone)]
pub struct PresentedCert {
    pub chain: Vec<Certificate>,
    pub ocsp: Option<Vec<u8>>,
    pub sct_list: Option<Vec<u8>>,
}

/// Source of the impersonated site's current certificate.
///
/// Returning `None` (nothing mirrored yet) falls back to the deterministic
/// chain. Implementations should hand out a shared handle; this is called
/// on every handshake.
pub trait FakeCertProvider: Send + Sync {
    fn fake_certificate(&self) -> Option<Arc<PresentedCert>>;
}

/// Accepts tunnel connections for one registered client identity.
pub struct Acceptor {
    config: Arc<rustls::ServerConfig>,
}

impl Acceptor {
    /// Build an acceptor around a client's deterministic identity.
    ///
    /// The wire presents whatever `fake_cert` currently mirrors while every
    /// handshake signature is made with the deterministic key, and the
    /// negotiated TLS version is clamped to `max_version` so the listener's
    /// profile matches the impersonated origin.
    pub fn new(
        identity: &KeyPair,
        fake_cert: Option<Arc<dyn FakeCertProvider>>,
        max_version: Option<ProtocolVersion>,
    ) -> Result<Acceptor, rustls::Error> {
        let key = rustls::sign::any_supported_type(&identity.private_key())
            .map_err(|_| rustls::Error::General("unusable deterministic key".into()))?;
        let resolver = CamouflageResolver {
            key,
            self_chain: vec![identity.certificate()],
            fake_cert,
        };
        let versions: &[&'static rustls::SupportedProtocolVersion] = match max_version {
            Some(ProtocolVersion::TLSv1_2) => &[&rustls::version::TLS12],
            _ => &[&rustls::version::TLS13, &rustls::version::TLS12],
        };
        let config = rustls::ServerConfig::builder()
            .with_safe_default_cipher_suites()
            .with_safe_default_kx_groups()
            .with_protocol_versions(versions)?
            .with_no_client_auth()
            .with_cert_resolver(Arc::new(resolver));
        Ok(Acceptor {
            config: Arc::new(config),
        })
    }

    /// Accept an incoming `TcpStream` (the fronted port has already routed
    /// and replayed its opening bytes) as a tunnel transport.
    pub async fn accept(&self, mut stream: TcpStream) -> io::Result<TlsStream> {
        let tlsconn = ServerConnection::new(self.config.clone())
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
        let mut conn = Connection::from(tlsconn);
        complete_handshake(&mut conn, &mut stream).await?;
        debug!(
            version = ?conn.protocol_version(),
            "tunnel handshake done with {:?}",
            stream.peer_addr()
        );
        Ok(TlsStream::new(stream, conn))
    }
}

struct CamouflageResolver {
    key: Arc<dyn rustls::sign::SigningKey>,
    self_chain: Vec<Certificate>,
    fake_cert: Option<Arc<dyn FakeCertProvider>>,
}

impl ResolvesServerCert for CamouflageResolver {
    fn resolve(&self, _client_hello: ClientHello) -> Option<Arc<CertifiedKey>> {
        let mut certified = CertifiedKey::new(self.self_chain.clone(), self.key.clone());
        if let Some(provider) = &self.fake_cert {
            if let Some(fake) = provider.fake_certificate() {
                trace!(chain_len = fake.chain.len(), "presenting mirrored chain");
                certified.cert = fake.chain.clone();
                certified.ocsp = fake.ocsp.clone();
                certified.sct_list = fake.sct_list.clone();
            }
        }
        Some(Arc::new(certified))
    }
}
