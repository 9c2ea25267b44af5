//! DNS-over-HTTPS (RFC 8484) upstream exchange.
//!
//! The HTTP/TLS client is injected (a `reqwest::Client`) rather than built
//! here, so the core stays agnostic to TLS configuration — that plumbing is
//! out of scope per the top-level spec.

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use futures_util::StreamExt;
use reqwest::header::{ACCEPT, CONTENT_TYPE};

use crate::codec::{self, MAX_DNS};
use crate::error::ProxyError;

const DNS_MESSAGE_MIME: &str = "application/dns-message";

/// POST (or GET, if `use_get`) `query` to `url`. Per invariant 3, the
/// client's original transaction ID is preserved across the exchange even
/// though the wire request always carries TID 0: it is restored on the
/// response before returning.
pub async fn exchange(
    client: &reqwest::Client,
    url: &str,
    use_get: bool,
    query: &[u8],
    server_name: &str,
) -> Result<Vec<u8>, ProxyError> {
    let original_tid = codec::tid(query);
    let mut zeroed = query.to_vec();
    codec::set_tid(&mut zeroed, 0);

    let response = if use_get {
        let encoded = URL_SAFE_NO_PAD.encode(&zeroed);
        client
            .get(url)
            .query(&[("dns", encoded)])
            .header(ACCEPT, DNS_MESSAGE_MIME)
            .send()
            .await
    } else {
        client
            .post(url)
            .header(CONTENT_TYPE, DNS_MESSAGE_MIME)
            .header(ACCEPT, DNS_MESSAGE_MIME)
            .body(zeroed)
            .send()
            .await
    }
    .map_err(|source| http_err(server_name, source))?;

    let mut body = Vec::new();
    let mut stream = response.bytes_stream();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|source| http_err(server_name, source))?;
        body.extend_from_slice(&chunk);
        if body.len() > MAX_DNS {
            return Err(ProxyError::Oversize {
                len: body.len(),
                max: MAX_DNS,
            });
        }
    }

    if body.len() < 12 {
        return Err(ProxyError::Parse("DoH response shorter than DNS header"));
    }
    codec::set_tid(&mut body, original_tid);
    Ok(body)
}

fn http_err(server_name: &str, source: reqwest::Error) -> ProxyError {
    ProxyError::Http {
        server: server_name.to_string(),
        source,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tid_zeroing_preserves_rest_of_header() {
        let mut query = vec![0u8; 12];
        codec::set_tid(&mut query, 0x1234);
        let mut zeroed = query.clone();
        codec::set_tid(&mut zeroed, 0);
        assert_eq!(codec::tid(&zeroed), 0);
        assert_eq!(&zeroed[2..], &query[2..]);
    }
}
