//! Long-term Ed25519 identity and its derived artifacts
//!
//! The same keypair serves three purposes:
//! - signing the time-bucketed login digest for relay authentication,
//! - deriving the peer address (`publicKeyHash`) used on the chat layer,
//! - X25519 conversion for sealed boxes and session key exchange.

use ed25519_dalek::{Signature, Signer, SigningKey, VerifyingKey};
use sha2::{Digest, Sha512};
use x25519_dalek::{PublicKey as X25519PublicKey, StaticSecret as X25519StaticSecret};

use crate::crypto::generic_hash;
use crate::error::{P2pError, P2pResult};

/// Seconds per login time bucket. The relay accepts a signature over the
/// current bucket, which bounds the replay window.
pub const LOGIN_BUCKET_SECS: i64 = 300;

/// Credentials for password-login against a relay node.
#[derive(Debug, Clone)]
pub struct LoginCredentials {
    /// Chat-layer user id: hex of the public key hash
    pub user_id: String,
    /// `"ed:" + hex(signature) + ":" + hex(public key)`
    pub password: String,
    /// Hex of the raw public key
    pub device_id: String,
}

/// Ed25519-based identity. The public key hash is the peer's address.
#[derive(Clone)]
pub struct Identity {
    signing_key: SigningKey,
}

impl Identity {
    /// Generate a fresh identity from the system RNG.
    pub fn generate() -> P2pResult<Self> {
        let mut seed = [0u8; 32];
        getrandom::getrandom(&mut seed)
            .map_err(|e| P2pError::Identity(format!("Failed to generate seed: {}", e)))?;
        Ok(Self::from_secret_bytes(&seed))
    }

    /// Reconstruct an identity from its 32-byte secret seed.
    pub fn from_secret_bytes(secret: &[u8; 32]) -> Self {
        Self {
            signing_key: SigningKey::from_bytes(secret),
        }
    }

    pub fn secret_bytes(&self) -> &[u8; 32] {
        self.signing_key.as_bytes()
    }

    pub fn public_key(&self) -> [u8; 32] {
        self.signing_key.verifying_key().to_bytes()
    }

    pub fn public_key_hex(&self) -> String {
        hex::encode(self.public_key())
    }

    /// 32-byte generic hash of the public key; its hex form is the local
    /// half of every recipient address.
    pub fn public_key_hash(&self) -> [u8; 32] {
        generic_hash(&self.public_key())
    }

    pub fn public_key_hash_hex(&self) -> String {
        hex::encode(self.public_key_hash())
    }

    pub fn sign(&self, message: &[u8]) -> Signature {
        self.signing_key.sign(message)
    }

    /// X25519 secret: the clamped lower half of SHA-512 over the seed,
    /// matching the standard Ed25519-to-Curve25519 conversion.
    pub fn x25519_secret(&self) -> X25519StaticSecret {
        let digest = Sha512::digest(self.signing_key.as_bytes());
        let mut scalar = [0u8; 32];
        scalar.copy_from_slice(&digest[..32]);
        scalar[0] &= 248;
        scalar[31] &= 127;
        scalar[31] |= 64;
        X25519StaticSecret::from(scalar)
    }

    pub fn x25519_public(&self) -> X25519PublicKey {
        X25519PublicKey::from(&self.x25519_secret())
    }

    /// Login credentials for the given wall-clock time (seconds).
    ///
    /// The digest is `h32("login:" + floor(now / 300))`; the relay verifies
    /// the detached signature against the public key embedded in the
    /// password string.
    pub fn login_credentials(&self, now_secs: i64) -> LoginCredentials {
        let bucket = now_secs.div_euclid(LOGIN_BUCKET_SECS);
        let digest = generic_hash(format!("login:{}", bucket).as_bytes());
        let signature = self.sign(&digest);

        LoginCredentials {
            user_id: self.public_key_hash_hex(),
            password: format!(
                "ed:{}:{}",
                hex::encode(signature.to_bytes()),
                self.public_key_hex()
            ),
            device_id: self.public_key_hex(),
        }
    }
}

impl std::fmt::Debug for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Identity")
            .field("public_key", &self.public_key_hex())
            .finish_non_exhaustive()
    }
}

/// Convert a peer's Ed25519 public key to its X25519 form.
pub fn x25519_public_from_ed25519(public_key: &[u8; 32]) -> P2pResult<X25519PublicKey> {
    let verifying = VerifyingKey::from_bytes(public_key)
        .map_err(|_| P2pError::Identity("Invalid Ed25519 public key".to_string()))?;
    Ok(X25519PublicKey::from(verifying.to_montgomery().to_bytes()))
}

/// Short display id for a peer: bs58 of the first 5 hash bytes.
pub fn sender_id(public_key: &[u8]) -> String {
    bs58::encode(&generic_hash(public_key)[..5]).into_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{client_session_keys, server_session_keys};

    #[test]
    fn test_identity_roundtrip() {
        let id = Identity::generate().unwrap();
        let restored = Identity::from_secret_bytes(id.secret_bytes());
        assert_eq!(id.public_key(), restored.public_key());
        assert_eq!(id.public_key_hash_hex(), restored.public_key_hash_hex());
    }

    #[test]
    fn test_public_key_hash_is_hex_of_32_bytes() {
        let id = Identity::generate().unwrap();
        assert_eq!(id.public_key_hash_hex().len(), 64);
    }

    #[test]
    fn test_login_credentials_bucket() {
        // floor(1_700_000_000 / 300) = 5_666_666
        let id = Identity::from_secret_bytes(&[7u8; 32]);
        let creds = id.login_credentials(1_700_000_000);

        let digest = generic_hash(b"login:5666666");
        let expected = format!(
            "ed:{}:{}",
            hex::encode(id.sign(&digest).to_bytes()),
            id.public_key_hex()
        );
        assert_eq!(creds.password, expected);
        assert_eq!(creds.device_id, id.public_key_hex());
        assert_eq!(creds.user_id, id.public_key_hash_hex());
    }

    #[test]
    fn test_login_credentials_stable_within_bucket() {
        let id = Identity::from_secret_bytes(&[9u8; 32]);
        let a = id.login_credentials(1_700_000_000);
        let b = id.login_credentials(1_700_000_299);
        let c = id.login_credentials(1_700_000_300);
        assert_eq!(a.password, b.password);
        assert_ne!(a.password, c.password);
    }

    #[test]
    fn test_converted_keys_agree_on_shared_secret() {
        let alice = Identity::generate().unwrap();
        let bob = Identity::generate().unwrap();

        // Alice only knows Bob's Ed25519 public key, and vice versa.
        let bob_x = x25519_public_from_ed25519(&bob.public_key()).unwrap();
        let alice_x = x25519_public_from_ed25519(&alice.public_key()).unwrap();

        let alice_keys = client_session_keys(&alice.x25519_secret(), &alice.x25519_public(), &bob_x);
        let bob_keys = server_session_keys(&bob.x25519_secret(), &bob.x25519_public(), &alice_x);

        assert_eq!(alice_keys.tx, bob_keys.rx);
        assert_eq!(alice_keys.rx, bob_keys.tx);
    }

    #[test]
    fn test_sender_id_deterministic() {
        let id = Identity::from_secret_bytes(&[3u8; 32]);
        let a = sender_id(&id.public_key());
        let b = sender_id(&id.public_key());
        assert_eq!(a, b);
        assert!(!a.is_empty());
    }

    #[test]
    fn test_public_conversion_matches_secret_conversion() {
        let id = Identity::generate().unwrap();
        let via_public = x25519_public_from_ed25519(&id.public_key()).unwrap();
        assert_eq!(via_public.as_bytes(), id.x25519_public().as_bytes());
    }
}
