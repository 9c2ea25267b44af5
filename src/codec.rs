//! Wire-level DNS framing and header accessors.
//!
//! This module never interprets the question or answer sections; it only
//! touches the fixed 12-byte header and the TCP length prefix. Anything
//! deeper (domain names, records) belongs to the plugin pipeline, which is
//! out of scope for the core.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::ProxyError;

/// Smallest legal DNS message: a 12-byte header plus an empty-ish question.
/// Below this, a packet cannot carry even a zero-length QNAME + QTYPE/QCLASS.
pub const MIN_DNS: usize = 12 + 5;

/// Largest DNS message this proxy will ever allocate for, matching the
/// 16-bit TCP length prefix ceiling.
pub const MAX_DNS: usize = 0xFFFF;

/// Default ceiling for a UDP reply to a client before it must be truncated.
pub const MAX_UDP_DNS: usize = 1252;

const HEADER_LEN: usize = 12;

/// Result code nibble of the DNS header (RFC 1035 §4.1.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rcode(pub u8);

impl Rcode {
    pub const NO_ERROR: Rcode = Rcode(0);
    pub const SERVFAIL: Rcode = Rcode(2);
}

/// Read the 16-bit transaction ID from a raw DNS message.
///
/// Panics if `pkt` is shorter than the header; callers are expected to have
/// already checked `len(pkt) >= MIN_DNS`.
pub fn tid(pkt: &[u8]) -> u16 {
    u16::from_be_bytes([pkt[0], pkt[1]])
}

/// Overwrite the transaction ID of a raw DNS message in place.
pub fn set_tid(pkt: &mut [u8], v: u16) {
    let [hi, lo] = v.to_be_bytes();
    pkt[0] = hi;
    pkt[1] = lo;
}

/// Read the RCODE nibble (low 4 bits of byte 3) of a raw DNS message.
pub fn rcode(pkt: &[u8]) -> Rcode {
    Rcode(pkt[3] & 0x0F)
}

/// Whether the TC (truncated) bit is set in a raw DNS message.
pub fn has_tc(pkt: &[u8]) -> bool {
    pkt[2] & 0x02 != 0
}

fn qr_bit_set(pkt: &mut [u8]) {
    pkt[2] |= 0x80;
}

fn set_tc(pkt: &mut [u8]) {
    pkt[2] |= 0x02;
}

/// Build a minimal truncated response for `query`: `QR=1`, `TC=1`, same TID
/// and question section, `RCODE=NoError`, no answer/authority/additional
/// records. The client is expected to retry over TCP.
pub fn truncated_response(query: &[u8]) -> Vec<u8> {
    let question_end = question_section_end(query).unwrap_or(HEADER_LEN);
    let mut resp = Vec::with_capacity(question_end);
    resp.extend_from_slice(&query[..HEADER_LEN]);
    // ANCOUNT, NSCOUNT, ARCOUNT all zero.
    resp[6..12].fill(0);
    resp[3] &= 0xF0; // RCODE = NoError
    qr_bit_set(&mut resp);
    set_tc(&mut resp);
    if question_end > HEADER_LEN {
        resp.extend_from_slice(&query[HEADER_LEN..question_end]);
    }
    resp
}

/// Build a synthetic SERVFAIL response to `query`: `QR=1`, `RCODE=SERVFAIL`,
/// same TID and question section, no answer/authority/additional records.
/// Used to give the client a terminal answer when upstream forwarding fails
/// outright, rather than leaving it to time out.
pub fn servfail_response(query: &[u8]) -> Vec<u8> {
    let question_end = question_section_end(query).unwrap_or(HEADER_LEN);
    let mut resp = Vec::with_capacity(question_end);
    resp.extend_from_slice(&query[..HEADER_LEN]);
    resp[6..12].fill(0);
    resp[3] = (resp[3] & 0xF0) | Rcode::SERVFAIL.0;
    qr_bit_set(&mut resp);
    if question_end > HEADER_LEN {
        resp.extend_from_slice(&query[HEADER_LEN..question_end]);
    }
    resp
}

/// Find the end of the question section (QNAME + QTYPE + QCLASS), honoring
/// only the first question, which is all a DNS message is expected to carry.
fn question_section_end(pkt: &[u8]) -> Option<usize> {
    let qdcount = u16::from_be_bytes([*pkt.get(4)?, *pkt.get(5)?]);
    if qdcount == 0 {
        return Some(HEADER_LEN);
    }
    let mut pos = HEADER_LEN;
    loop {
        let label_len = *pkt.get(pos)? as usize;
        if label_len == 0 {
            pos += 1;
            break;
        }
        if label_len & 0xC0 != 0 {
            // Compression pointer; shouldn't appear in a question section
            // but don't walk off the buffer if a hostile client sends one.
            pos += 2;
            break;
        }
        pos += 1 + label_len;
    }
    pos += 4; // QTYPE + QCLASS
    if pos > pkt.len() { None } else { Some(pos) }
}

/// Read a big-endian 16-bit length prefix followed by exactly that many
/// bytes from an async stream. Fails with [`ProxyError::Undersize`] wrapped
/// framing is the caller's concern; I/O errors surface as `Transport`.
pub async fn read_prefixed<R: AsyncRead + Unpin>(
    stream: &mut R,
    server: &str,
) -> Result<Vec<u8>, ProxyError> {
    let mut len_buf = [0u8; 2];
    stream
        .read_exact(&mut len_buf)
        .await
        .map_err(|source| ProxyError::Transport {
            server: server.to_string(),
            source,
        })?;
    let len = u16::from_be_bytes(len_buf) as usize;
    let mut buf = vec![0u8; len];
    stream
        .read_exact(&mut buf)
        .await
        .map_err(|source| ProxyError::Transport {
            server: server.to_string(),
            source,
        })?;
    Ok(buf)
}

/// Write `bytes` to an async stream with a big-endian 16-bit length prefix.
/// Fails with [`ProxyError::Oversize`] if `bytes` cannot fit a 16-bit length.
pub async fn write_prefixed<W: AsyncWrite + Unpin>(
    stream: &mut W,
    bytes: &[u8],
    server: &str,
) -> Result<(), ProxyError> {
    if bytes.len() > MAX_DNS {
        return Err(ProxyError::Oversize {
            len: bytes.len(),
            max: MAX_DNS,
        });
    }
    let len_prefix = (bytes.len() as u16).to_be_bytes();
    stream
        .write_all(&len_prefix)
        .await
        .map_err(|source| ProxyError::Transport {
            server: server.to_string(),
            source,
        })?;
    stream
        .write_all(bytes)
        .await
        .map_err(|source| ProxyError::Transport {
            server: server.to_string(),
            source,
        })
}

/// Frame `bytes` as `len || bytes` without performing any I/O. Used by the
/// test harness to build fixtures and by callers that already own a buffer
/// they want to write in one syscall.
pub fn prefix(bytes: &[u8]) -> Result<Vec<u8>, ProxyError> {
    if bytes.len() > MAX_DNS {
        return Err(ProxyError::Oversize {
            len: bytes.len(),
            max: MAX_DNS,
        });
    }
    let mut out = Vec::with_capacity(bytes.len() + 2);
    out.extend_from_slice(&(bytes.len() as u16).to_be_bytes());
    out.extend_from_slice(bytes);
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_query(id: u16) -> Vec<u8> {
        let mut q = vec![0u8; HEADER_LEN];
        set_tid(&mut q, id);
        q[4..6].copy_from_slice(&1u16.to_be_bytes()); // QDCOUNT = 1
        q.extend_from_slice(&[7]);
        q.extend_from_slice(b"example");
        q.extend_from_slice(&[3]);
        q.extend_from_slice(b"com");
        q.push(0);
        q.extend_from_slice(&1u16.to_be_bytes()); // QTYPE A
        q.extend_from_slice(&1u16.to_be_bytes()); // QCLASS IN
        q
    }

    #[test]
    fn tid_round_trips() {
        let mut pkt = sample_query(0xBEEF);
        assert_eq!(tid(&pkt), 0xBEEF);
        set_tid(&mut pkt, 0x1234);
        assert_eq!(tid(&pkt), 0x1234);
    }

    #[test]
    fn rcode_reads_low_nibble() {
        let mut pkt = sample_query(1);
        pkt[3] = 0x82; // RA set, RCODE = SERVFAIL
        assert_eq!(rcode(&pkt), Rcode::SERVFAIL);
    }

    #[test]
    fn has_tc_reads_bit() {
        let mut pkt = sample_query(1);
        assert!(!has_tc(&pkt));
        pkt[2] |= 0x02;
        assert!(has_tc(&pkt));
    }

    #[test]
    fn servfail_response_sets_rcode_and_preserves_question() {
        let query = sample_query(0x4242);
        let resp = servfail_response(&query);

        assert_eq!(tid(&resp), 0x4242);
        assert!(!has_tc(&resp));
        assert_eq!(resp[2] & 0x80, 0x80, "QR bit must be set");
        assert_eq!(rcode(&resp), Rcode::SERVFAIL);
        assert_eq!(&resp[HEADER_LEN..], &query[HEADER_LEN..]);
    }

    #[test]
    fn truncated_response_sets_flags_and_preserves_question() {
        let query = sample_query(0xBEEF);
        let resp = truncated_response(&query);

        assert_eq!(tid(&resp), 0xBEEF);
        assert!(has_tc(&resp));
        assert_eq!(resp[2] & 0x80, 0x80, "QR bit must be set");
        assert_eq!(rcode(&resp), Rcode::NO_ERROR);
        assert!(resp.len() <= MAX_UDP_DNS);
        assert_eq!(&resp[HEADER_LEN..], &query[HEADER_LEN..]);
    }

    #[tokio::test]
    async fn write_then_read_prefixed_round_trips() {
        let payload = sample_query(42);
        let mut buf = Vec::new();
        write_prefixed(&mut buf, &payload, "test").await.unwrap();

        let mut cursor = std::io::Cursor::new(buf);
        let read_back = read_prefixed(&mut cursor, "test").await.unwrap();
        assert_eq!(read_back, payload);
    }

    #[tokio::test]
    async fn write_prefixed_rejects_oversize() {
        let payload = vec![0u8; MAX_DNS + 1];
        let mut buf = Vec::new();
        let err = write_prefixed(&mut buf, &payload, "test").await.unwrap_err();
        assert!(matches!(err, ProxyError::Oversize { .. }));
    }
}
