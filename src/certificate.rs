//! DNSCrypt short-term certificate: wire encoding, signature verification,
//! and the minimal DNS TXT query/response plumbing used to bootstrap it
//! from `2.dnscrypt-cert.<provider>`.

use crate::crypto::{self, Aead2};
use crate::error::ProxyError;

const CERT_MAGIC: [u8; 4] = *b"DNSC";
const SIGNED_PART_LEN: usize = 32 + 8 + 4 + 4 + 4; // resolver_pk..ts_end
const CERT_LEN: usize = 4 + 2 + 2 + 64 + SIGNED_PART_LEN;

/// A server's current short-term certificate, installed atomically after
/// signature verification (see [`verify_and_parse`]).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Certificate {
    pub construction: AeadTag,
    pub signature: [u8; 64],
    pub resolver_pk: [u8; 32],
    pub client_magic: [u8; 8],
    pub serial: u32,
    pub ts_start: u32,
    pub ts_end: u32,
}

/// Wire tag for the negotiated AEAD construction (`es-version` field).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AeadTag {
    XSalsa20Poly1305,
    XChaCha20Poly1305,
}

impl From<AeadTag> for Aead2 {
    fn from(tag: AeadTag) -> Self {
        match tag {
            AeadTag::XSalsa20Poly1305 => Aead2::XSalsa20Poly1305,
            AeadTag::XChaCha20Poly1305 => Aead2::XChaCha20Poly1305,
        }
    }
}

impl Certificate {
    pub fn is_valid_at(&self, now_unix: u64, ignore_timestamp: bool) -> bool {
        ignore_timestamp
            || (self.ts_start as u64 <= now_unix && now_unix <= self.ts_end as u64)
    }
}

/// Parse and verify one certificate blob (as extracted from a TXT record)
/// against the stamp's pinned long-term public key. Returns `None` rather
/// than erroring on malformed input: a bootstrap query can return multiple
/// candidate certificates and callers pick the best valid one.
pub fn verify_and_parse(blob: &[u8], pinned_pubkey: &[u8; 32]) -> Option<Certificate> {
    if blob.len() != CERT_LEN {
        return None;
    }
    if blob[0..4] != CERT_MAGIC {
        return None;
    }
    let es_version = u16::from_be_bytes([blob[4], blob[5]]);
    let construction = match es_version {
        1 => AeadTag::XSalsa20Poly1305,
        2 => AeadTag::XChaCha20Poly1305,
        _ => return None,
    };
    let signature: [u8; 64] = blob[8..72].try_into().ok()?;
    let signed_part = &blob[72..];
    debug_assert_eq!(signed_part.len(), SIGNED_PART_LEN);

    if !crypto::verify_signature(pinned_pubkey, signed_part, &signature) {
        return None;
    }

    let resolver_pk: [u8; 32] = signed_part[0..32].try_into().ok()?;
    let client_magic: [u8; 8] = signed_part[32..40].try_into().ok()?;
    let serial = u32::from_be_bytes(signed_part[40..44].try_into().ok()?);
    let ts_start = u32::from_be_bytes(signed_part[44..48].try_into().ok()?);
    let ts_end = u32::from_be_bytes(signed_part[48..52].try_into().ok()?);

    Some(Certificate {
        construction,
        signature,
        resolver_pk,
        client_magic,
        serial,
        ts_start,
        ts_end,
    })
}

/// Build the bootstrap TXT query sent to `2.dnscrypt-cert.<provider_name>`.
pub fn build_bootstrap_query(provider_name: &str) -> Vec<u8> {
    let qname = format!("2.dnscrypt-cert.{provider_name}");
    let mut pkt = vec![0u8; 12];
    pkt[0] = 0x00;
    pkt[1] = 0x01; // arbitrary fixed TID; this is a one-shot bootstrap query
    pkt[2] = 0x01; // RD
    pkt[4..6].copy_from_slice(&1u16.to_be_bytes()); // QDCOUNT = 1

    for label in qname.trim_end_matches('.').split('.') {
        pkt.push(label.len() as u8);
        pkt.extend_from_slice(label.as_bytes());
    }
    pkt.push(0);
    pkt.extend_from_slice(&16u16.to_be_bytes()); // QTYPE = TXT
    pkt.extend_from_slice(&1u16.to_be_bytes()); // QCLASS = IN
    pkt
}

/// Extract every TXT record's concatenated character-strings from a
/// bootstrap response, skipping the question section it echoes back.
pub fn extract_txt_records(response: &[u8]) -> Result<Vec<Vec<u8>>, ProxyError> {
    if response.len() < 12 {
        return Err(ProxyError::Parse("bootstrap response shorter than header"));
    }
    let qdcount = u16::from_be_bytes([response[4], response[5]]) as usize;
    let ancount = u16::from_be_bytes([response[6], response[7]]) as usize;

    let mut pos = 12;
    for _ in 0..qdcount {
        pos = skip_name(response, pos)?;
        pos += 4; // QTYPE + QCLASS
    }

    let mut records = Vec::new();
    for _ in 0..ancount {
        pos = skip_name(response, pos)?;
        let rtype = read_u16(response, pos)?;
        pos += 8; // TYPE + CLASS + TTL
        let rdlength = read_u16(response, pos)? as usize;
        pos += 2;
        let rdata = response
            .get(pos..pos + rdlength)
            .ok_or(ProxyError::Parse("truncated RR"))?;
        pos += rdlength;

        if rtype == 16 {
            records.push(concat_character_strings(rdata));
        }
    }
    Ok(records)
}

fn concat_character_strings(rdata: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(rdata.len());
    let mut i = 0;
    while i < rdata.len() {
        let len = rdata[i] as usize;
        i += 1;
        let end = (i + len).min(rdata.len());
        out.extend_from_slice(&rdata[i..end]);
        i = end;
    }
    out
}

fn skip_name(pkt: &[u8], mut pos: usize) -> Result<usize, ProxyError> {
    loop {
        let len = *pkt.get(pos).ok_or(ProxyError::Parse("truncated name"))? as usize;
        if len == 0 {
            return Ok(pos + 1);
        }
        if len & 0xC0 != 0 {
            return Ok(pos + 2);
        }
        pos += 1 + len;
    }
}

fn read_u16(pkt: &[u8], pos: usize) -> Result<u16, ProxyError> {
    let bytes = pkt
        .get(pos..pos + 2)
        .ok_or(ProxyError::Parse("truncated field"))?;
    Ok(u16::from_be_bytes([bytes[0], bytes[1]]))
}

#[cfg(test)]
mod tests {
    use super::*;
    use ed25519_dalek::{Signer, SigningKey};
    use rand_core::OsRng;

    fn sample_cert_bytes(signing_key: &SigningKey) -> Vec<u8> {
        let mut signed_part = Vec::with_capacity(SIGNED_PART_LEN);
        signed_part.extend_from_slice(&[9u8; 32]); // resolver_pk
        signed_part.extend_from_slice(b"q6fnvWj8"); // client_magic
        signed_part.extend_from_slice(&42u32.to_be_bytes()); // serial
        signed_part.extend_from_slice(&0u32.to_be_bytes()); // ts_start
        signed_part.extend_from_slice(&u32::MAX.to_be_bytes()); // ts_end

        let signature = signing_key.sign(&signed_part);

        let mut cert = Vec::with_capacity(CERT_LEN);
        cert.extend_from_slice(&CERT_MAGIC);
        cert.extend_from_slice(&1u16.to_be_bytes()); // XSalsa20Poly1305
        cert.extend_from_slice(&0u16.to_be_bytes());
        cert.extend_from_slice(&signature.to_bytes());
        cert.extend_from_slice(&signed_part);
        cert
    }

    #[test]
    fn verifies_and_parses_valid_certificate() {
        let signing_key = SigningKey::generate(&mut OsRng);
        let pubkey = signing_key.verifying_key().to_bytes();
        let cert_bytes = sample_cert_bytes(&signing_key);

        let cert = verify_and_parse(&cert_bytes, &pubkey).expect("valid cert");
        assert_eq!(cert.construction, AeadTag::XSalsa20Poly1305);
        assert_eq!(cert.serial, 42);
        assert!(cert.is_valid_at(1_700_000_000, false));
    }

    #[test]
    fn rejects_tampered_signature() {
        let signing_key = SigningKey::generate(&mut OsRng);
        let pubkey = signing_key.verifying_key().to_bytes();
        let mut cert_bytes = sample_cert_bytes(&signing_key);
        let last = cert_bytes.len() - 1;
        cert_bytes[last] ^= 0xFF;

        assert!(verify_and_parse(&cert_bytes, &pubkey).is_none());
    }

    #[test]
    fn bootstrap_query_embeds_provider_name() {
        let query = build_bootstrap_query("example.com");
        assert!(query.len() > 12);
        assert_eq!(&query[4..6], &1u16.to_be_bytes());
    }

    #[test]
    fn extracts_txt_character_strings() {
        let mut response = vec![0u8; 12];
        response[4..6].copy_from_slice(&0u16.to_be_bytes()); // QDCOUNT
        response[6..8].copy_from_slice(&1u16.to_be_bytes()); // ANCOUNT
        response.push(0); // empty name (root, via pointer-free direct root)
        response.extend_from_slice(&16u16.to_be_bytes()); // TYPE TXT
        response.extend_from_slice(&1u16.to_be_bytes()); // CLASS IN
        response.extend_from_slice(&0u32.to_be_bytes()); // TTL
        let rdata = {
            let mut r = vec![5u8];
            r.extend_from_slice(b"hello");
            r
        };
        response.extend_from_slice(&(rdata.len() as u16).to_be_bytes());
        response.extend_from_slice(&rdata);

        let txts = extract_txt_records(&response).unwrap();
        assert_eq!(txts, vec![b"hello".to_vec()]);
    }
}
