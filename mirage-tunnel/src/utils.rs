//! TLS plumbing shared by the client connector and the server acceptor.

use std::io::{self, Cursor};
use std::sync::Arc;
use std::time::SystemTime;

use rustls::client::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::{Certificate, Connection, DigitallySignedStruct, ServerName, SignatureScheme};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::trace;

pub const TLS_RECORD_HEADER_LENGTH: usize = 5;
pub const MAXIMUM_CIPHERTEXT_LENGTH: usize = 16384 + 2048;

pub fn u16_from_be_slice(s: &[u8]) -> u16 {
    u16::from_be_bytes([s[0], s[1]])
}

/// Read one whole TLS record (header included) into `buf`.
pub async fn read_tls_record<R: AsyncRead + Unpin>(
    r: &mut R,
    buf: &mut Vec<u8>,
) -> io::Result<()> {
    let mut header = [0u8; TLS_RECORD_HEADER_LENGTH];
    r.read_exact(&mut header).await?;
    if !(20..=23).contains(&header[0]) || header[1] != 0x03 {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "not a TLS record",
        ));
    }
    let len = u16_from_be_slice(&header[3..5]) as usize;
    if len > MAXIMUM_CIPHERTEXT_LENGTH {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "oversized TLS record",
        ));
    }
    buf.clear();
    buf.extend_from_slice(&header);
    buf.resize(TLS_RECORD_HEADER_LENGTH + len, 0);
    r.read_exact(&mut buf[TLS_RECORD_HEADER_LENGTH..]).await?;
    Ok(())
}

/// Drive a rustls connection until the handshake is done, one record at a
/// time. Writing is preferred over reading to avoid deadlock-like waiting.
pub async fn complete_handshake<S>(conn: &mut Connection, stream: &mut S) -> io::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut buf = Vec::with_capacity(TLS_RECORD_HEADER_LENGTH + MAXIMUM_CIPHERTEXT_LENGTH);
    while conn.is_handshaking() {
        if conn.wants_write() {
            let mut out = Vec::new();
            conn.write_tls(&mut out)?;
            stream.write_all(&out).await?;
            trace!(len = out.len(), "tls handshake bytes out");
            continue;
        }
        if !conn.wants_read() {
            break;
        }
        read_tls_record(stream, &mut buf).await?;
        conn.read_tls(&mut Cursor::new(&buf[..]))?;
        conn.process_new_packets().map_err(|e| {
            io::Error::new(
                io::ErrorKind::InvalidData,
                format!("TLS handshake state: {}", e),
            )
        })?;
    }
    while conn.wants_write() {
        let mut out = Vec::new();
        conn.write_tls(&mut out)?;
        stream.write_all(&out).await?;
    }
    stream.flush().await?;
    Ok(())
}

/// Accepts whatever certificate the peer presents.
///
/// The camouflage server deliberately presents the impersonated site's chain,
/// so chain validation is meaningless on this path.
pub struct NoCertificateVerification;

impl ServerCertVerifier for NoCertificateVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &Certificate,
        _intermediates: &[Certificate],
        _server_name: &ServerName,
        _scts: &mut dyn Iterator<Item = &[u8]>,
        _ocsp_response: &[u8],
        _now: SystemTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }
}

/// Ignores the presented chain but checks every handshake signature against
/// one pinned certificate.
///
/// The tunnel server sends the impersonated site's chain on the wire while
/// signing with the key derived from the client UUID; the client already
/// holds the matching certificate, so the signature check is the real
/// authentication here.
pub struct PinnedCertVerifier {
    pinned: Certificate,
}

impl PinnedCertVerifier {
    pub fn new(pinned: Certificate) -> Arc<PinnedCertVerifier> {
        Arc::new(PinnedCertVerifier { pinned })
    }

    fn verify_signature(
        &self,
        message: &[u8],
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        let alg = signature_alg(dss.scheme).ok_or(rustls::Error::InvalidCertificateSignatureType)?;
        let cert = webpki::EndEntityCert::try_from(self.pinned.0.as_slice())
            .map_err(|_| rustls::Error::InvalidCertificateEncoding)?;
        cert.verify_signature(alg, message, &dss.sig.0)
            .map_err(|_| rustls::Error::InvalidCertificateSignature)?;
        Ok(HandshakeSignatureValid::assertion())
    }
}

impl ServerCertVerifier for PinnedCertVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &Certificate,
        _intermediates: &[Certificate],
        _server_name: &ServerName,
        _scts: &mut dyn Iterator<Item = &[u8]>,
        _ocsp_response: &[u8],
        _now: SystemTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        // The wire chain mirrors the impersonated site by design.
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        _cert: &Certificate,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        self.verify_signature(message, dss)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        _cert: &Certificate,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        self.verify_signature(message, dss)
    }
}

fn signature_alg(scheme: SignatureScheme) -> Option<&'static webpki::SignatureAlgorithm> {
    match scheme {
        SignatureScheme::RSA_PKCS1_SHA256 => Some(&webpki::RSA_PKCS1_2048_8192_SHA256),
        SignatureScheme::RSA_PKCS1_SHA384 => Some(&webpki::RSA_PKCS1_2048_8192_SHA384),
        SignatureScheme::RSA_PKCS1_SHA512 => Some(&webpki::RSA_PKCS1_2048_8192_SHA512),
        SignatureScheme::RSA_PSS_SHA256 => Some(&webpki::RSA_PSS_2048_8192_SHA256_LEGACY_KEY),
        SignatureScheme::RSA_PSS_SHA384 => Some(&webpki::RSA_PSS_2048_8192_SHA384_LEGACY_KEY),
        SignatureScheme::RSA_PSS_SHA512 => Some(&webpki::RSA_PSS_2048_8192_SHA512_LEGACY_KEY),
        SignatureScheme::ECDSA_NISTP256_SHA256 => Some(&webpki::ECDSA_P256_SHA256),
        SignatureScheme::ECDSA_NISTP384_SHA384 => Some(&webpki::ECDSA_P384_SHA384),
        SignatureScheme::ED25519 => Some(&webpki::ED25519),
        _ => None,
    }
}
