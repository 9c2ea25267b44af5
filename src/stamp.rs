//! `sdns://` stamp parsing.
//!
//! A stamp is a compact, self-describing descriptor for an upstream
//! resolver: protocol id, endpoint, provider name, pinned key material.
//! Parsing happens once at server registration time, so correctness matters
//! more than speed here — unlike the query path, this is not a hot loop.

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;

use crate::error::StampError;

const PREFIX: &str = "sdns://";

const PROTO_DNSCRYPT: u8 = 0x01;
const PROTO_DOH: u8 = 0x02;

/// Protocol-specific payload carried by a stamp.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StampProtocol {
    DnsCrypt {
        /// `host:port` of the resolver.
        addr: String,
        /// Long-term Ed25519 public key pinned by the stamp.
        public_key: [u8; 32],
    },
    Doh {
        /// `host:port` used to establish the TLS connection, if overridden.
        addr: Option<String>,
        /// Optional pinned certificate hashes (SHA-256 of SPKI, typically).
        hashes: Vec<Vec<u8>>,
        /// TLS server name / HTTP `Host`.
        hostname: String,
        /// HTTP path, e.g. `/dns-query`.
        path: String,
    },
}

/// A fully parsed `sdns://` stamp.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Stamp {
    pub props: u64,
    pub provider_name: String,
    pub protocol: StampProtocol,
}

struct Cursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn u8(&mut self) -> Result<u8, StampError> {
        let b = *self.data.get(self.pos).ok_or(StampError::Truncated)?;
        self.pos += 1;
        Ok(b)
    }

    fn bytes(&mut self, n: usize) -> Result<&'a [u8], StampError> {
        let slice = self
            .data
            .get(self.pos..self.pos + n)
            .ok_or(StampError::Truncated)?;
        self.pos += n;
        Ok(slice)
    }

    fn u64_le(&mut self) -> Result<u64, StampError> {
        let raw: [u8; 8] = self.bytes(8)?.try_into().unwrap();
        Ok(u64::from_le_bytes(raw))
    }

    /// A single length-prefixed field (one-byte length, 0-255).
    fn lp(&mut self) -> Result<&'a [u8], StampError> {
        let len = self.u8()? as usize;
        self.bytes(len)
    }

    /// A sequence of length-prefixed fields: the top bit of each length
    /// byte signals "another item follows", matching the sdns convention
    /// for repeated fields like pinned hashes.
    fn lp_array(&mut self) -> Result<Vec<Vec<u8>>, StampError> {
        let mut items = Vec::new();
        loop {
            let len_byte = self.u8()?;
            let more = len_byte & 0x80 != 0;
            let len = (len_byte & 0x7F) as usize;
            items.push(self.bytes(len)?.to_vec());
            if !more {
                break;
            }
        }
        Ok(items)
    }

    fn utf8_lp(&mut self) -> Result<String, StampError> {
        String::from_utf8(self.lp()?.to_vec()).map_err(|_| StampError::BadUtf8)
    }
}

impl Stamp {
    /// Parse an `sdns://<base64url>` stamp.
    pub fn parse(input: &str) -> Result<Self, StampError> {
        let encoded = input.strip_prefix(PREFIX).ok_or(StampError::MissingPrefix)?;
        let raw = URL_SAFE_NO_PAD
            .decode(encoded)
            .map_err(|e| StampError::Base64(e.to_string()))?;

        let mut cursor = Cursor::new(&raw);
        let proto_id = cursor.u8()?;
        let props = cursor.u64_le()?;

        match proto_id {
            PROTO_DNSCRYPT => {
                let addr = String::from_utf8(cursor.lp()?.to_vec()).map_err(|_| StampError::BadUtf8)?;
                let public_key_bytes = cursor.lp()?;
                if public_key_bytes.len() != 32 {
                    return Err(StampError::BadPublicKey(public_key_bytes.len()));
                }
                let public_key: [u8; 32] = public_key_bytes.try_into().unwrap();
                let provider_name = cursor.utf8_lp()?;

                Ok(Stamp {
                    props,
                    provider_name,
                    protocol: StampProtocol::DnsCrypt { addr, public_key },
                })
            }
            PROTO_DOH => {
                let addr_raw = cursor.lp()?;
                let addr = if addr_raw.is_empty() {
                    None
                } else {
                    Some(String::from_utf8(addr_raw.to_vec()).map_err(|_| StampError::BadUtf8)?)
                };
                let hashes = cursor.lp_array()?;
                let hostname = cursor.utf8_lp()?;
                let path = cursor.utf8_lp()?;

                Ok(Stamp {
                    props,
                    provider_name: hostname.clone(),
                    protocol: StampProtocol::Doh {
                        addr,
                        hashes,
                        hostname,
                        path,
                    },
                })
            }
            other => Err(StampError::UnsupportedProtocol(other)),
        }
    }

    /// Re-encode this stamp to `sdns://...`. Mostly useful for tests and
    /// for the CLI's `--dump-stamp` style diagnostics.
    pub fn to_sdns(&self) -> String {
        let mut raw = Vec::new();
        match &self.protocol {
            StampProtocol::DnsCrypt { addr, public_key } => {
                raw.push(PROTO_DNSCRYPT);
                raw.extend_from_slice(&self.props.to_le_bytes());
                push_lp(&mut raw, addr.as_bytes());
                push_lp(&mut raw, public_key);
                push_lp(&mut raw, self.provider_name.as_bytes());
            }
            StampProtocol::Doh {
                addr,
                hashes,
                hostname,
                path,
            } => {
                raw.push(PROTO_DOH);
                raw.extend_from_slice(&self.props.to_le_bytes());
                push_lp(&mut raw, addr.as_deref().unwrap_or("").as_bytes());
                push_lp_array(&mut raw, hashes);
                push_lp(&mut raw, hostname.as_bytes());
                push_lp(&mut raw, path.as_bytes());
            }
        }
        format!("{PREFIX}{}", URL_SAFE_NO_PAD.encode(&raw))
    }
}

fn push_lp(out: &mut Vec<u8>, data: &[u8]) {
    assert!(data.len() <= 0x7F, "field too long for single-byte LP");
    out.push(data.len() as u8);
    out.extend_from_slice(data);
}

fn push_lp_array(out: &mut Vec<u8>, items: &[Vec<u8>]) {
    if items.is_empty() {
        out.push(0);
        return;
    }
    for (i, item) in items.iter().enumerate() {
        let more = i + 1 < items.len();
        assert!(item.len() <= 0x7F, "hash too long for single-byte LP");
        let len_byte = item.len() as u8 | if more { 0x80 } else { 0 };
        out.push(len_byte);
        out.extend_from_slice(item);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dnscrypt_stamp_round_trips() {
        let stamp = Stamp {
            props: 0,
            provider_name: "2.dnscrypt-cert.example".to_string(),
            protocol: StampProtocol::DnsCrypt {
                addr: "203.0.113.1:443".to_string(),
                public_key: [7u8; 32],
            },
        };
        let encoded = stamp.to_sdns();
        assert!(encoded.starts_with("sdns://"));
        let parsed = Stamp::parse(&encoded).unwrap();
        assert_eq!(parsed, stamp);
    }

    #[test]
    fn doh_stamp_round_trips_with_hashes() {
        let stamp = Stamp {
            props: 0,
            provider_name: "doh.example".to_string(),
            protocol: StampProtocol::Doh {
                addr: Some("203.0.113.2:443".to_string()),
                hashes: vec![vec![1, 2, 3], vec![4, 5]],
                hostname: "doh.example".to_string(),
                path: "/dns-query".to_string(),
            },
        };
        let encoded = stamp.to_sdns();
        let parsed = Stamp::parse(&encoded).unwrap();
        assert_eq!(parsed, stamp);
    }

    #[test]
    fn rejects_missing_prefix() {
        assert_eq!(Stamp::parse("not-a-stamp").unwrap_err(), StampError::MissingPrefix);
    }

    #[test]
    fn rejects_unsupported_protocol() {
        let raw = vec![0x09u8; 9];
        let encoded = format!("sdns://{}", URL_SAFE_NO_PAD.encode(raw));
        assert_eq!(
            Stamp::parse(&encoded).unwrap_err(),
            StampError::UnsupportedProtocol(0x09)
        );
    }
}
