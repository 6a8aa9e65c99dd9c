//! Client side of the camouflaged TLS transport.

use std::io;
use std::sync::Arc;

use derivative::Derivative;
use rand::Rng;
use rustls::{ClientConnection, Connection, ServerName};
use tokio::net::TcpStream;
use tracing::{debug, trace};
use uuid::Uuid;

use crate::hello::encode_hello_random;
use crate::keypair::KeyPair;
use crate::tlsio::TlsStream;
use crate::utils::{complete_handshake, PinnedCertVerifier};

/// Client with config to establish camouflaged tunnels with peer servers.
#[derive(Clone, Derivative)]
#[derivative(Debug)]
pub struct Client {
    pub channel_uuid: Uuid,
    pub client_uuid: Uuid,
    pub server_name: ServerName,
    #[derivative(Debug = "ignore")]
    tlsconf: Arc<rustls::ClientConfig>,
}

impl Client {
    /// Create a client for one channel/client identity pair.
    ///
    /// `server_name` is sent as SNI and should match the web site the server
    /// impersonates. `identity` is the deterministic material for
    /// `client_uuid`; handshake signatures are verified against it while the
    /// chain on the wire (the impersonated site's) is ignored.
    pub fn new(
        channel_uuid: Uuid,
        client_uuid: Uuid,
        server_name: ServerName,
        identity: &KeyPair,
    ) -> Client {
        let tlsconf = rustls::ClientConfig::builder()
            .with_safe_defaults()
            .with_custom_certificate_verifier(PinnedCertVerifier::new(identity.certificate()))
            .with_no_client_auth();
        Client {
            channel_uuid,
            client_uuid,
            server_name,
            tlsconf: Arc::new(tlsconf),
        }
    }

    /// Handshake with a peer server on the other end of the `TcpStream`.
    ///
    /// The ClientHello `random` carries the encoded client identity; on the
    /// wire the handshake is indistinguishable from a visit to the
    /// impersonated site.
    pub async fn connect(&self, mut stream: TcpStream) -> io::Result<TlsStream> {
        let random = encode_hello_random(&self.channel_uuid, &self.client_uuid);
        let session_id: [u8; 32] = rand::thread_rng().gen();
        trace!("camouflaged random for {:?}: {:x?}", stream, random);

        let tlsconn = ClientConnection::new_with(
            self.tlsconf.clone(),
            self.server_name.clone(),
            random.into(),
            session_id.as_slice().into(),
            None,
        )
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
