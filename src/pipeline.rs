//! The query pipeline: turns one client query into one reply, end to end.
//!
//! `process` is the single entry point both the UDP and TCP listener loops
//! call. It never panics on malformed input and always returns through
//! exactly one `apply_logging` call, whether the outcome is a forwarded
//! answer, a synthesized one, or a drop.

use std::net::SocketAddr;
use std::sync::Arc;

use crate::codec;
use crate::crypto::{Keypair, SharedBox, fresh_client_nonce};
use crate::error::ProxyError;
use crate::estimator::QuestionSizeEstimator;
use crate::plugins::{Action, ClientProto, Plugins, PluginsState, ReturnCode};
use crate::registry::{Protocol, ServerInfo, ServerRegistry};
use crate::transport;

/// Everything the pipeline needs that isn't per-query: shared across every
/// call to [`process`] for the lifetime of the proxy.
pub struct PipelineDeps<'a> {
    pub registry: &'a ServerRegistry,
    pub plugins: &'a dyn Plugins,
    pub keypair: &'a Keypair,
    pub ephemeral_keys: bool,
    pub estimator: &'a QuestionSizeEstimator,
    pub udp_max: usize,
}

/// Handle one client query. Returns `Some(reply)` to write back to the
/// client, or `None` to drop silently (an explicit plugin decision, or a
/// query too malformed to answer meaningfully).
pub async fn process(
    deps: &PipelineDeps<'_>,
    client_proto: ClientProto,
    client_addr: SocketAddr,
    mut query: Vec<u8>,
) -> Option<Vec<u8>> {
    let mut state = PluginsState::new(client_proto, client_addr);

    if query.len() < codec::MIN_DNS {
        state.return_code = ReturnCode::ParseError;
        deps.plugins.apply_logging(&state);
        return None;
    }

    let action = deps.plugins.apply_query(&mut query, None);
    let mut response = match action {
        Action::Drop => {
            state.return_code = ReturnCode::Drop;
            deps.plugins.apply_logging(&state);
            return None;
        }
        Action::Synth(bytes) => {
            state.return_code = ReturnCode::Synth;
            bytes
        }
        Action::Forward => match forward_query(deps, &mut state, &query).await {
            Some(resp) => resp,
            None => {
                deps.plugins.apply_logging(&state);
                return Some(codec::servfail_response(&query));
            }
        },
    };

    let mut ttl_out = None;
    if deps
        .plugins
        .apply_response(&mut response, &mut ttl_out)
        .is_err()
    {
        state.return_code = ReturnCode::ServerError;
        deps.plugins.apply_logging(&state);
        return Some(codec::servfail_response(&query));
    }

    if client_proto == ClientProto::Udp && response.len() > deps.udp_max {
        response = codec::truncated_response(&query);
    }

    deps.plugins.apply_logging(&state);
    Some(response)
}

/// Select a server and forward `query` to it, updating `state` and the
/// server's health as a side effect. `None` means the caller should
/// synthesize a SERVFAIL reply; the logging event has not been emitted yet.
async fn forward_query(
    deps: &PipelineDeps<'_>,
    state: &mut PluginsState,
    query: &[u8],
) -> Option<Vec<u8>> {
    let Some(server) = deps.registry.get_one() else {
        state.return_code = ReturnCode::ServerError;
        return None;
    };
    state.server_name = Some(server.name.clone());

    server.notice_begin();
    let result = match &server.protocol {
        Protocol::DnsCrypt { .. } => exchange_dnscrypt(deps, &server, query).await,
        Protocol::Doh { url, use_get } => {
            transport::doh::exchange(deps.registry.http_client(), url, *use_get, query, &server.name)
                .await
        }
    };

    match result {
        Ok(response) => {
            // A server that answers but with SERVFAIL is still misbehaving:
            // count it against health, but the client still gets the reply.
            if codec::rcode(&response) == codec::Rcode::SERVFAIL {
                server.notice_failure();
            } else {
                server.notice_success();
            }
            state.return_code = ReturnCode::Forward;
            Some(response)
        }
        Err(err) => {
            if err.counts_as_server_failure() {
                server.notice_failure();
            }
            state.return_code = ReturnCode::ServerError;
            None
        }
    }
}

/// Encrypt, send, and decrypt one DNSCrypt exchange, retrying over TCP if
/// the resolver's UDP reply comes back truncated.
async fn exchange_dnscrypt(
    deps: &PipelineDeps<'_>,
    server: &Arc<ServerInfo>,
    query: &[u8],
) -> Result<Vec<u8>, ProxyError> {
    let Protocol::DnsCrypt {
        udp_addr,
        tcp_addr,
        cert,
        ..
    } = &server.protocol
    else {
        unreachable!("exchange_dnscrypt called on a non-DNSCrypt server");
    };
    let cert = cert
        .read()
        .unwrap()
        .clone()
        .ok_or(ProxyError::Parse("server has no installed certificate"))?;

    let keypair = if deps.ephemeral_keys {
        Keypair::generate()
    } else {
        deps.keypair.clone()
    };
    let shared = SharedBox::derive(&keypair, &cert.resolver_pk, cert.construction.into());
    let padded_len = deps.estimator.current();

    let client_nonce = fresh_client_nonce();
    let ct_query = crate::crypto::encrypt_query(
        &shared,
        &cert.client_magic,
        &keypair.public_bytes(),
        &client_nonce,
        query,
        padded_len,
    )?;
    let ct_response =
        transport::dnscrypt::exchange_udp(*udp_addr, server.timeout, &ct_query, &server.name).await?;
    let plaintext = crate::crypto::decrypt_response(&shared, &client_nonce, &ct_response)?;
    validate_response_len(&plaintext)?;

    if !codec::has_tc(&plaintext) {
        deps.estimator.adjust(plaintext.len());
        return Ok(plaintext);
    }

    deps.estimator.blind_adjust();
    let client_nonce = fresh_client_nonce();
    let ct_query = crate::crypto::encrypt_query(
        &shared,
        &cert.client_magic,
        &keypair.public_bytes(),
        &client_nonce,
        query,
        padded_len,
    )?;
    let ct_response = transport::dnscrypt::exchange_tcp(
        *tcp_addr,
        server.timeout,
        &ct_query,
        &server.name,
        deps.registry.dialer(),
    )
    .await?;
    let plaintext = crate::crypto::decrypt_response(&shared, &client_nonce, &ct_response)?;
    validate_response_len(&plaintext)?;
    Ok(plaintext)
}

/// Reject a decrypted upstream response outside the legal DNS message size
/// range before any header accessor (`codec::has_tc`, `codec::rcode`, ...)
/// touches it. `crypto::unpad` can legally return a slice shorter than a
/// DNS header, and nothing upstream of this point bounds it otherwise.
fn validate_response_len(plaintext: &[u8]) -> Result<(), ProxyError> {
    if plaintext.len() < codec::MIN_DNS {
        return Err(ProxyError::Undersize {
            len: plaintext.len(),
            min: codec::MIN_DNS,
        });
    }
    if plaintext.len() > codec::MAX_DNS {
        return Err(ProxyError::Oversize {
            len: plaintext.len(),
            max: codec::MAX_DNS,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugins::NoopPlugins;
    use std::time::Duration;

    fn sample_query(id: u16) -> Vec<u8> {
        let mut q = vec![0u8; 12];
        codec::set_tid(&mut q, id);
        q[4..6].copy_from_slice(&1u16.to_be_bytes());
        q.extend_from_slice(&[7]);
        q.extend_from_slice(b"example");
        q.extend_from_slice(&[3]);
        q.extend_from_slice(b"com");
        q.push(0);
        q.extend_from_slice(&1u16.to_be_bytes());
        q.extend_from_slice(&1u16.to_be_bytes());
        q
    }

    #[test]
    fn validate_response_len_rejects_undersize_and_oversize() {
        assert!(validate_response_len(&[0u8; codec::MIN_DNS]).is_ok());
        assert!(matches!(
            validate_response_len(&[]),
            Err(ProxyError::Undersize { len: 0, .. })
        ));
        assert!(matches!(
            validate_response_len(&vec![0u8; codec::MAX_DNS + 1]),
            Err(ProxyError::Oversize { .. })
        ));
    }

    #[tokio::test]
    async fn undersize_query_is_dropped() {
        let registry = ServerRegistry::new(reqwest::Client::new(), false, None, Duration::from_secs(1));
        let estimator = QuestionSizeEstimator::new();
        let plugins = NoopPlugins;
        let keypair = Keypair::generate();
        let deps = PipelineDeps {
            registry: &registry,
            plugins: &plugins,
            keypair: &keypair,
            ephemeral_keys: false,
            estimator: &estimator,
            udp_max: codec::MAX_UDP_DNS,
        };

        let result = process(
            &deps,
            ClientProto::Udp,
            "127.0.0.1:5353".parse().unwrap(),
            vec![0u8; 4],
        )
        .await;
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn no_live_server_yields_servfail() {
        let registry = ServerRegistry::new(reqwest::Client::new(), false, None, Duration::from_secs(1));
        let estimator = QuestionSizeEstimator::new();
        let plugins = NoopPlugins;
        let keypair = Keypair::generate();
        let deps = PipelineDeps {
            registry: &registry,
            plugins: &plugins,
            keypair: &keypair,
            ephemeral_keys: false,
            estimator: &estimator,
            udp_max: codec::MAX_UDP_DNS,
        };

        let query = sample_query(0xABCD);
        let response = process(
            &deps,
            ClientProto::Udp,
            "127.0.0.1:5353".parse().unwrap(),
            query.clone(),
        )
        .await
        .expect("servfail synthesized");

        assert_eq!(codec::tid(&response), 0xABCD);
        assert_eq!(codec::rcode(&response), codec::Rcode::SERVFAIL);
    }

    #[tokio::test]
    async fn oversize_udp_response_is_truncated_to_client() {
        let registry = ServerRegistry::new(reqwest::Client::new(), false, None, Duration::from_secs(1));
        let estimator = QuestionSizeEstimator::new();
        struct SynthPlugins;
        impl Plugins for SynthPlugins {
            fn apply_query(&self, _q: &mut Vec<u8>, _s: Option<&str>) -> Action {
                Action::Synth(vec![0u8; crate::codec::MAX_UDP_DNS + 200])
            }
            fn apply_response(
                &self,
                _r: &mut Vec<u8>,
                _t: &mut Option<u32>,
            ) -> Result<(), ProxyError> {
                Ok(())
            }
            fn apply_logging(&self, _s: &PluginsState) {}
        }
        let plugins = SynthPlugins;
        let keypair = Keypair::generate();
        let deps = PipelineDeps {
            registry: &registry,
            plugins: &plugins,
            keypair: &keypair,
            ephemeral_keys: false,
            estimator: &estimator,
            udp_max: codec::MAX_UDP_DNS,
        };

        let query = sample_query(0x1111);
        let response = process(
            &deps,
            ClientProto::Udp,
            "127.0.0.1:5353".parse().unwrap(),
            query.clone(),
        )
        .await
        .unwrap();
        assert!(response.len() <= codec::MAX_UDP_DNS);
        assert!(codec::has_tc(&response));
        assert_eq!(codec::tid(&response), 0x1111);
    }
}
