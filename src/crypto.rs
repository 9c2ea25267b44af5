//! DNSCrypt crypto box: X25519 key agreement, authenticated encryption of
//! queries, and decryption/validation of responses.
//!
//! The core never reimplements a primitive: X25519, XSalsa20-Poly1305 and
//! XChaCha20-Poly1305 all come from vetted RustCrypto/dalek crates. This
//! module only wires them together the way the DNSCrypt v2 wire format
//! requires (magic bytes, half-zeroed client nonce, padding).

use aead::{Aead, KeyInit};
use blake2::Blake2s256;
use blake2::digest::Digest;
use chacha20poly1305::XChaCha20Poly1305;
use crypto_box::SalsaBox;
use rand_core::{OsRng, RngCore};
use x25519_dalek::{PublicKey, StaticSecret};

use crate::error::ProxyError;

/// Fixed resolver magic prefixing every DNSCrypt server response.
pub const RESOLVER_MAGIC: [u8; 8] = *b"r6fnvWj8";

/// AEAD construction negotiated via the server's certificate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Aead2 {
    XSalsa20Poly1305,
    XChaCha20Poly1305,
}

/// An X25519 keypair. The proxy holds one process-lifetime keypair unless
/// ephemeral mode is enabled, in which case a fresh one is minted per
/// exchange (see [`Keypair::generate`] call sites in the registry/pipeline).
#[derive(Clone)]
pub struct Keypair {
    secret: StaticSecret,
    public: PublicKey,
}

impl Keypair {
    pub fn generate() -> Self {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = PublicKey::from(&secret);
        Self { secret, public }
    }

    pub fn public_bytes(&self) -> [u8; 32] {
        self.public.to_bytes()
    }
}

/// A negotiated shared cipher for one server: the X25519 agreement has
/// already happened and the correct AEAD has been derived from it.
pub enum SharedBox {
    Salsa(Box<SalsaBox>),
    XChaCha(Box<XChaCha20Poly1305>, [u8; 32]),
}

impl SharedBox {
    /// Perform X25519(my_secret, their_public) and derive the symmetric
    /// cipher matching `construction`.
    pub fn derive(my: &Keypair, their_public: &[u8; 32], construction: Aead2) -> Self {
        match construction {
            Aead2::XSalsa20Poly1305 => {
                // SalsaBox::new performs X25519 then HSalsa20 internally,
                // matching NaCl's crypto_box_beforenm used by DNSCrypt.
                let their_public = crypto_box::PublicKey::from_bytes(*their_public);
                let my_secret = crypto_box::SecretKey::from_bytes(my.secret.to_bytes());
                SharedBox::Salsa(Box::new(SalsaBox::new(&their_public, &my_secret)))
            }
            Aead2::XChaCha20Poly1305 => {
                let their_public = PublicKey::from(*their_public);
                let shared = my.secret.diffie_hellman(&their_public);
                let mut hasher = Blake2s256::new();
                hasher.update(shared.as_bytes());
                let key: [u8; 32] = hasher.finalize().into();
                let cipher = XChaCha20Poly1305::new((&key).into());
                SharedBox::XChaCha(Box::new(cipher), key)
            }
        }
    }

    fn encrypt(&self, nonce: &[u8; 24], plaintext: &[u8]) -> Result<Vec<u8>, ProxyError> {
        match self {
            SharedBox::Salsa(b) => b
                .encrypt(nonce.into(), plaintext)
                .map_err(|_| ProxyError::Decrypt("encryption failure")),
            SharedBox::XChaCha(c, _) => c
                .encrypt(nonce.into(), plaintext)
                .map_err(|_| ProxyError::Decrypt("encryption failure")),
        }
    }

    fn decrypt(&self, nonce: &[u8; 24], ciphertext: &[u8]) -> Result<Vec<u8>, ProxyError> {
        match self {
            SharedBox::Salsa(b) => b
                .decrypt(nonce.into(), ciphertext)
                .map_err(|_| ProxyError::Decrypt("AEAD tag mismatch")),
            SharedBox::XChaCha(c, _) => c
                .decrypt(nonce.into(), ciphertext)
                .map_err(|_| ProxyError::Decrypt("AEAD tag mismatch")),
        }
    }
}

/// A fresh 12-byte client nonce, drawn from a CSPRNG. Under the birthday
/// bound for 96 bits of randomness this does not repeat within the
/// lifetime of any single `(client_pk, resolver_pk)` pair; DNSCrypt relies
/// on this rather than a dedup table, and so does this proxy.
pub fn fresh_client_nonce() -> [u8; 12] {
    let mut nonce = [0u8; 12];
    OsRng.fill_bytes(&mut nonce);
    nonce
}

fn full_nonce(client_nonce: &[u8; 12], second_half: &[u8; 12]) -> [u8; 24] {
    let mut full = [0u8; 24];
    full[..12].copy_from_slice(client_nonce);
    full[12..].copy_from_slice(second_half);
    full
}

/// Pad `query` to at least `target_len` bytes using ISO/IEC 7816-4 padding
/// (`0x80` followed by zeroes). If `query` is already at or past
/// `target_len` a single block of padding (min 1 byte) is still appended,
/// since the `0x80` marker is what `unpad` uses to find the boundary.
pub fn pad(query: &[u8], target_len: usize) -> Vec<u8> {
    let len = target_len.max(query.len() + 1);
    let mut padded = Vec::with_capacity(len);
    padded.extend_from_slice(query);
    padded.push(0x80);
    padded.resize(len, 0);
    padded
}

/// Strip ISO/IEC 7816-4 padding, returning the original bytes before the
/// trailing `0x80 00*` marker. Fails with [`ProxyError::Parse`] if no
/// marker byte is found.
pub fn unpad(padded: &[u8]) -> Result<&[u8], ProxyError> {
    let mut i = padded.len();
    while i > 0 {
        i -= 1;
        match padded[i] {
            0x00 => continue,
            0x80 => return Ok(&padded[..i]),
            _ => return Err(ProxyError::Parse("malformed padding")),
        }
    }
    Err(ProxyError::Parse("malformed padding"))
}

/// Encrypt a client query for the wire: returns
/// `client_magic || client_pk || client_nonce || AEAD(query || padding)`.
pub fn encrypt_query(
    shared: &SharedBox,
    client_magic: &[u8; 8],
    client_pk: &[u8; 32],
    client_nonce: &[u8; 12],
    query: &[u8],
    padded_len: usize,
) -> Result<Vec<u8>, ProxyError> {
    let padded = pad(query, padded_len);
    let nonce = full_nonce(client_nonce, &[0u8; 12]);
    let ciphertext = shared.encrypt(&nonce, padded.as_slice())?;

    let mut wire = Vec::with_capacity(8 + 32 + 12 + ciphertext.len());
    wire.extend_from_slice(client_magic);
    wire.extend_from_slice(client_pk);
    wire.extend_from_slice(client_nonce);
    wire.extend_from_slice(&ciphertext);
    Ok(wire)
}

/// Decrypt a server response of the form
/// `resolver_magic || client_nonce_echo || server_nonce || AEAD(response)`.
///
/// Verifies the resolver magic and that the echoed client nonce matches the
/// one this exchange sent; any mismatch is [`ProxyError::Decrypt`].
pub fn decrypt_response(
    shared: &SharedBox,
    client_nonce: &[u8; 12],
    wire: &[u8],
) -> Result<Vec<u8>, ProxyError> {
    if wire.len() < 8 + 12 + 12 {
        return Err(ProxyError::Decrypt("response shorter than header"));
    }
    let (magic, rest) = wire.split_at(8);
    if magic != RESOLVER_MAGIC {
        return Err(ProxyError::Decrypt("bad resolver magic"));
    }
    let (nonce_echo, rest) = rest.split_at(12);
    if nonce_echo != client_nonce {
        return Err(ProxyError::Decrypt("client nonce echo mismatch"));
    }
    let (server_nonce, ciphertext) = rest.split_at(12);
    let server_nonce: [u8; 12] = server_nonce.try_into().unwrap();
    let nonce = full_nonce(client_nonce, &server_nonce);
    let padded = shared.decrypt(&nonce, ciphertext)?;
    unpad(&padded).map(<[u8]>::to_vec)
}

/// Verify an Ed25519 signature over a certificate body against a pinned
/// long-term public key (the stamp's `pubkey` field).
pub fn verify_signature(pubkey: &[u8; 32], body: &[u8], signature: &[u8; 64]) -> bool {
    use ed25519_dalek::{Signature, Verifier, VerifyingKey};
    let Ok(verifying_key) = VerifyingKey::from_bytes(pubkey) else {
        return false;
    };
    let signature = Signature::from_bytes(signature);
    verifying_key.verify(body, &signature).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn salsa_box_round_trips() {
        let client = Keypair::generate();
        let server = Keypair::generate();

        let client_side =
            SharedBox::derive(&client, &server.public_bytes(), Aead2::XSalsa20Poly1305);
        let server_side =
            SharedBox::derive(&server, &client.public_bytes(), Aead2::XSalsa20Poly1305);

        let client_nonce = fresh_client_nonce();
        let client_magic = *b"q6fnvWj8";
        let query = b"A example.com.";

        let wire = encrypt_query(
            &client_side,
            &client_magic,
            &client.public_bytes(),
            &client_nonce,
            query,
            64,
        )
        .unwrap();

        let ct = &wire[8 + 32 + 12..];
        let nonce = full_nonce(&client_nonce, &[0u8; 12]);
        let padded = server_side.decrypt(&nonce, ct).unwrap();
        let decrypted_query = unpad(&padded).unwrap();
        assert_eq!(decrypted_query, query);

        // Server replies using its own server nonce. Real responses are
        // padded the same way queries are; decrypt_response strips it.
        let server_nonce = fresh_client_nonce();
        let response_plain = b"response payload";
        let response_padded = pad(response_plain, 32);
        let response_nonce = full_nonce(&client_nonce, &server_nonce);
        let response_ct = server_side
            .encrypt(&response_nonce, response_padded.as_slice())
            .unwrap();

        let mut response_wire = Vec::new();
        response_wire.extend_from_slice(&RESOLVER_MAGIC);
        response_wire.extend_from_slice(&client_nonce);
        response_wire.extend_from_slice(&server_nonce);
        response_wire.extend_from_slice(&response_ct);

        let decrypted = decrypt_response(&client_side, &client_nonce, &response_wire).unwrap();
        assert_eq!(decrypted, response_plain);
    }

    #[test]
    fn xchacha_box_round_trips() {
        let client = Keypair::generate();
        let server = Keypair::generate();

        let client_side =
            SharedBox::derive(&client, &server.public_bytes(), Aead2::XChaCha20Poly1305);
        let server_side =
            SharedBox::derive(&server, &client.public_bytes(), Aead2::XChaCha20Poly1305);

        let nonce = full_nonce(&fresh_client_nonce(), &[0u8; 12]);
        let ct = client_side.encrypt(&nonce, b"hello").unwrap();
        let pt = server_side.decrypt(&nonce, &ct).unwrap();
        assert_eq!(pt, b"hello");
    }

    #[test]
    fn decrypt_rejects_bad_resolver_magic() {
        let client = Keypair::generate();
        let server = Keypair::generate();
        let shared = SharedBox::derive(&client, &server.public_bytes(), Aead2::XSalsa20Poly1305);
        let client_nonce = fresh_client_nonce();

        let mut wire = vec![0u8; 8 + 12 + 12 + 16];
        wire[..8].copy_from_slice(b"deadbeef");
        let err = decrypt_response(&shared, &client_nonce, &wire).unwrap_err();
        assert!(matches!(err, ProxyError::Decrypt(_)));
    }

    #[test]
    fn pad_then_unpad_round_trips() {
        let query = b"some query bytes";
        let padded = pad(query, 64);
        assert_eq!(padded.len(), 64);
        assert_eq!(unpad(&padded).unwrap(), query);
    }

    #[test]
    fn client_nonces_are_distinct() {
        let nonces: Vec<_> = (0..256).map(|_| fresh_client_nonce()).collect();
        let unique: std::collections::HashSet<_> = nonces.iter().collect();
        assert_eq!(unique.len(), nonces.len());
    }
}
