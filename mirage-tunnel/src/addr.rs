//! SOCKS5 address block, used on the wire as the body of a stream-open frame.
//!
//! One type byte (1 = IPv4, 3 = domain, 4 = IPv6), the address itself, then
//! two big-endian port bytes. Domains are length-prefixed and must be 1-255
//! bytes. The split domain/IP representation keeps the IPv4/IPv6 distinction
//! lossless.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

pub const ATYP_IPV4: u8 = 1;
pub const ATYP_DOMAIN: u8 = 3;
pub const ATYP_IPV6: u8 = 4;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Socks5Host {
    Ip(IpAddr),
    Domain(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Socks5Address {
    pub host: Socks5Host,
    pub port: u16,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum AddrError {
    #[error("socks5 address encode error")]
    Encode,
    #[error("socks5 address decode error")]
    Decode,
}

impl Socks5Address {
    pub fn new(host: Socks5Host, port: u16) -> Socks5Address {
        Socks5Address { host, port }
    }

    /// Classify a textual host as an IP literal or a domain name.
    pub fn from_host_port(host: &str, port: u16) -> Socks5Address {
        let host = match host.parse::<IpAddr>() {
            Ok(ip) => Socks5Host::Ip(ip),
            Err(_) => Socks5Host::Domain(host.to_owned()),
        };
        Socks5Address { host, port }
    }

    pub fn encode(&self, data: &mut Vec<u8>) -> Result<usize, AddrError> {
        let start = data.len();
        match &self.host {
            Socks5Host::Ip(IpAddr::V4(ip)) => {
                data.push(ATYP_IPV4);
                data.extend_from_slice(&ip.octets());
            }
            Socks5Host::Ip(IpAddr::V6(ip)) => {
                data.push(ATYP_IPV6);
                data.extend_from_slice(&ip.octets());
            }
            Socks5Host::Domain(fqdn) => {
                if fqdn.is_empty() || fqdn.len() > 255 {
                    return Err(AddrError::Encode);
                }
                data.push(ATYP_DOMAIN);
                data.push(fqdn.len() as u8);
                data.extend_from_slice(fqdn.as_bytes());
            }
        }
        data.extend_from_slice(&self.port.to_be_bytes());
        Ok(data.len() - start)
    }

    /// Decode one address block from the front of `data`, returning it along
    /// with the number of bytes consumed.
    pub fn decode(data: &[u8]) -> Result<(Socks5Address, usize), AddrError> {
        let atyp = *data.first().ok_or(AddrError::Decode)?;
        match atyp {
            ATYP_IPV4 => {
                if data.len() < 7 {
                    return Err(AddrError::Decode);
                }
                let octets: [u8; 4] = data[1..5].try_into().unwrap();
                let port = u16::from_be_bytes([data[5], data[6]]);
                Ok((
                    Socks5Address::new(Socks5Host::Ip(IpAddr::V4(Ipv4Addr::from(octets))), port),
                    7,
                ))
            }
            ATYP_IPV6 => {
                if data.len() < 19 {
                    return Err(AddrError::Decode);
                }
                let octets: [u8; 16] = data[1..17].try_into().unwrap();
                let port = u16::from_be_bytes([data[17], data[18]]);
                Ok((
                    Socks5Address::new(Socks5Host::Ip(IpAddr::V6(Ipv6Addr::from(octets))), port),
                    19,
                ))
            }
            ATYP_DOMAIN => {
                if data.len() < 2 {
                    return Err(AddrError::Decode);
                }
                let len = data[1] as usize;
                if len == 0 || data.len() < 4 + len {
                    return Err(AddrError::Decode);
                }
                let fqdn =
                    String::from_utf8(data[2..2 + len].to_vec()).map_err(|_| AddrError::Decode)?;
                let port = u16::from_be_bytes([data[2 + len], data[3 + len]]);
                Ok((
                    Socks5Address::new(Socks5Host::Domain(fqdn), port),
                    4 + len,
                ))
            }
            _ => Err(AddrError::Decode),
        }
    }
}

impl fmt::Display for Socks5Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.host {
            Socks5Host::Ip(IpAddr::V6(ip)) => write!(f, "[{}]:{}", ip, self.port),
            Socks5Host::Ip(IpAddr::V4(ip)) => write!(f, "{}:{}", ip, self.port),
            Socks5Host::Domain(fqdn) => write!(f, "{}:{}", fqdn, self.port),
        }
    }
}
