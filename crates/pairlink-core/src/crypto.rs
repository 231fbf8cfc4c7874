//! Cryptographic primitives for pairing and session traffic
//!
//! Two distinct constructions, and conflating them breaks pairing:
//!
//! - **Sealed box** (asymmetric, anonymous): used once per handshake so the
//!   recipient can decrypt with their long-term key without prior state.
//!   Wire format: `[ephemeral X25519 pk (32)] + [ciphertext + tag (16)]`.
//! - **Secretbox** (symmetric, authenticated): used for all session traffic
//!   under a key-exchange-derived 32-byte key.
//!   Wire format: `[nonce (24)] + [ciphertext + tag (16)]`.

use chacha20poly1305::{
    aead::{Aead, KeyInit},
    XChaCha20Poly1305, XNonce,
};
use hkdf::Hkdf;
use sha2::Sha256;
use x25519_dalek::{PublicKey as X25519PublicKey, StaticSecret as X25519StaticSecret};

use crate::error::{P2pError, P2pResult};

/// Nonce size for XChaCha20-Poly1305 (24 bytes)
pub const NONCE_SIZE: usize = 24;

/// Poly1305 authentication tag size
pub const MAC_SIZE: usize = 16;

/// Domain separation for session key expansion
const KX_HKDF_INFO: &[u8] = b"pairlink-kx-v1";

/// Domain separation for sealed-box key derivation
const SEALED_HKDF_INFO: &[u8] = b"pairlink-sealed-v1";

pub type SymmetricKey = [u8; 32];

/// Compute the 32-byte generic hash (BLAKE3) of arbitrary data.
pub fn generic_hash(data: &[u8]) -> [u8; 32] {
    *blake3::hash(data).as_bytes()
}

/// Hex form of [`generic_hash`], used for peer addresses and relay distances.
pub fn generic_hash_hex(data: &[u8]) -> String {
    hex::encode(generic_hash(data))
}

fn random_bytes<const N: usize>() -> P2pResult<[u8; N]> {
    let mut buf = [0u8; N];
    getrandom::getrandom(&mut buf)
        .map_err(|e| P2pError::Crypto(format!("Failed to get random bytes: {}", e)))?;
    Ok(buf)
}

// ─── Secretbox ──────────────────────────────────────────────────────────────

/// Encrypt with a fresh random nonce. Returns `nonce || ciphertext`.
pub fn encrypt(key: &SymmetricKey, plaintext: &[u8]) -> P2pResult<Vec<u8>> {
    let cipher = XChaCha20Poly1305::new(key.into());
    let nonce_bytes: [u8; NONCE_SIZE] = random_bytes()?;
    let nonce = XNonce::from_slice(&nonce_bytes);

    let ciphertext = cipher
        .encrypt(nonce, plaintext)
        .map_err(|_| P2pError::Crypto("Encryption failed".to_string()))?;

    let mut output = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
    output.extend_from_slice(&nonce_bytes);
    output.extend_from_slice(&ciphertext);
    Ok(output)
}

/// Decrypt `nonce || ciphertext`. Anything shorter than nonce + tag is
/// rejected before touching the cipher.
pub fn decrypt(key: &SymmetricKey, data: &[u8]) -> P2pResult<Vec<u8>> {
    if data.len() < NONCE_SIZE + MAC_SIZE {
        return Err(P2pError::DecryptionFailed(
            "Data too short to contain nonce and tag".to_string(),
        ));
    }

    let (nonce_bytes, ciphertext) = data.split_at(NONCE_SIZE);
    let cipher = XChaCha20Poly1305::new(key.into());
    let nonce = XNonce::from_slice(nonce_bytes);

    cipher
        .decrypt(nonce, ciphertext)
        .map_err(|_| P2pError::DecryptionFailed("Invalid ciphertext or wrong key".to_string()))
}

// ─── Sealed box ─────────────────────────────────────────────────────────────

/// Derive the per-box symmetric key from the DH shared secret.
fn sealed_key(shared: &[u8], ephemeral_pk: &[u8; 32], recipient_pk: &[u8; 32]) -> SymmetricKey {
    let mut info = Vec::with_capacity(SEALED_HKDF_INFO.len() + 64);
    info.extend_from_slice(SEALED_HKDF_INFO);
    info.extend_from_slice(ephemeral_pk);
    info.extend_from_slice(recipient_pk);

    let hkdf = Hkdf::<Sha256>::new(None, shared);
    let mut key = [0u8; 32];
    hkdf.expand(&info, &mut key)
        .expect("HKDF expand never fails for 32-byte output");
    key
}

/// Nonce is a function of the two public keys, so the sender transmits only
/// the ephemeral key alongside the ciphertext.
fn sealed_nonce(ephemeral_pk: &[u8; 32], recipient_pk: &[u8; 32]) -> [u8; NONCE_SIZE] {
    let mut hasher = blake3::Hasher::new();
    hasher.update(ephemeral_pk);
    hasher.update(recipient_pk);
    let hash = hasher.finalize();
    let mut nonce = [0u8; NONCE_SIZE];
    nonce.copy_from_slice(&hash.as_bytes()[..NONCE_SIZE]);
    nonce
}

/// Seal `plaintext` to a recipient's X25519 public key.
///
/// The sender needs no long-term state: a fresh ephemeral keypair is
/// generated per box and its public half is prepended to the output.
pub fn seal(plaintext: &[u8], recipient_pk: &X25519PublicKey) -> P2pResult<Vec<u8>> {
    let ephemeral_secret = X25519StaticSecret::from(random_bytes::<32>()?);
    let ephemeral_public = X25519PublicKey::from(&ephemeral_secret);

    let shared = ephemeral_secret.diffie_hellman(recipient_pk);
    let key = sealed_key(
        shared.as_bytes(),
        ephemeral_public.as_bytes(),
        recipient_pk.as_bytes(),
    );
    let nonce_bytes = sealed_nonce(ephemeral_public.as_bytes(), recipient_pk.as_bytes());

    let cipher = XChaCha20Poly1305::new(&key.into());
    let ciphertext = cipher
        .encrypt(XNonce::from_slice(&nonce_bytes), plaintext)
        .map_err(|_| P2pError::Crypto("Sealing failed".to_string()))?;

    let mut output = Vec::with_capacity(32 + ciphertext.len());
    output.extend_from_slice(ephemeral_public.as_bytes());
    output.extend_from_slice(&ciphertext);
    Ok(output)
}

/// Open a sealed box with the recipient's X25519 keypair.
pub fn open(
    sealed: &[u8],
    recipient_secret: &X25519StaticSecret,
    recipient_pk: &X25519PublicKey,
) -> P2pResult<Vec<u8>> {
    if sealed.len() < 32 + MAC_SIZE {
        return Err(P2pError::DecryptionFailed(
            "Sealed box too short".to_string(),
        ));
    }

    let mut ephemeral_pk = [0u8; 32];
    ephemeral_pk.copy_from_slice(&sealed[..32]);
    let ciphertext = &sealed[32..];

    let shared = recipient_secret.diffie_hellman(&X25519PublicKey::from(ephemeral_pk));
    let key = sealed_key(shared.as_bytes(), &ephemeral_pk, recipient_pk.as_bytes());
    let nonce_bytes = sealed_nonce(&ephemeral_pk, recipient_pk.as_bytes());

    let cipher = XChaCha20Poly1305::new(&key.into());
    cipher
        .decrypt(XNonce::from_slice(&nonce_bytes), ciphertext)
        .map_err(|_| P2pError::DecryptionFailed("Sealed box does not authenticate".to_string()))
}

// ─── Session key exchange ───────────────────────────────────────────────────

/// Directional session keys derived from an X25519 key exchange.
#[derive(Clone)]
pub struct SessionKeys {
    /// Key for decrypting traffic from the peer
    pub rx: SymmetricKey,
    /// Key for encrypting traffic to the peer
    pub tx: SymmetricKey,
}

impl std::fmt::Debug for SessionKeys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionKeys").finish_non_exhaustive()
    }
}

/// Expand the raw DH output into 64 bytes bound to both public keys.
/// The first half belongs to the client's rx direction, the second to its tx.
fn kx_expand(shared: &[u8], client_pk: &[u8; 32], server_pk: &[u8; 32]) -> [u8; 64] {
    let mut info = Vec::with_capacity(KX_HKDF_INFO.len() + 64);
    info.extend_from_slice(KX_HKDF_INFO);
    info.extend_from_slice(client_pk);
    info.extend_from_slice(server_pk);

    let hkdf = Hkdf::<Sha256>::new(None, shared);
    let mut okm = [0u8; 64];
    hkdf.expand(&info, &mut okm)
        .expect("HKDF expand never fails for 64-byte output");
    okm
}

fn split_keys(okm: [u8; 64]) -> (SymmetricKey, SymmetricKey) {
    let mut first = [0u8; 32];
    let mut second = [0u8; 32];
    first.copy_from_slice(&okm[..32]);
    second.copy_from_slice(&okm[32..]);
    (first, second)
}

/// Session keys for the side that initiates the session (client role).
pub fn client_session_keys(
    client_secret: &X25519StaticSecret,
    client_pk: &X25519PublicKey,
    server_pk: &X25519PublicKey,
) -> SessionKeys {
    let shared = client_secret.diffie_hellman(server_pk);
    let okm = kx_expand(shared.as_bytes(), client_pk.as_bytes(), server_pk.as_bytes());
    let (rx, tx) = split_keys(okm);
    SessionKeys { rx, tx }
}

/// Session keys for the answering side (server role). The halves are swapped
/// relative to the client so both peers agree on each direction.
pub fn server_session_keys(
    server_secret: &X25519StaticSecret,
    server_pk: &X25519PublicKey,
    client_pk: &X25519PublicKey,
) -> SessionKeys {
    let shared = server_secret.diffie_hellman(client_pk);
    let okm = kx_expand(shared.as_bytes(), client_pk.as_bytes(), server_pk.as_bytes());
    let (tx, rx) = split_keys(okm);
    SessionKeys { rx, tx }
}
