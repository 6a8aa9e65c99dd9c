//! Transport core for a tunnel that hides behind the TLS identity of a real
//! web site.
//!
//! The pieces fit together like this: a [`Client`] opens a TCP connection to
//! the fronted port of a server and performs a TLS handshake whose ClientHello
//! `random` carries an encrypted client identity ([`hello`]). The server's
//! front router inspects those bytes and either relays the connection to the
//! real site being impersonated or to a tunnel listener backed by an
//! [`Acceptor`], which presents the impersonated site's certificate chain
//! while signing with a key derived deterministically from the client
//! identity ([`keypair`]). Once established, the connection carries framed
//! multiplexed streams ([`frame`], [`addr`]).

pub mod addr;
pub mod client;
pub mod frame;
pub mod hello;
pub mod keypair;
pub mod server;
pub mod tlsio;
pub mod utils;

pub use addr::Socks5Address;
pub use client::Client;
pub use frame::{FrameHead, ProtoType, StreamType, HEAD_LENGTH, MAX_BODY_LENGTH, MAX_FRAME_SIZE};
pub use keypair::KeyPair;
pub use server::Acceptor;
pub use tlsio::TlsStream;
