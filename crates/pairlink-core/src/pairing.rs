//! Pairing handshake payloads and the channel-open wire format
//!
//! A pairing descriptor travels out-of-band (QR code, deep link) as JSON;
//! the response travels back through the chat substrate inside a sealed box,
//! wrapped in a `@channel-open` text message:
//!
//! ```text
//! "@channel-open:" + recipient + ":" + hex(sealed_box(payload, peer_pk))
//! recipient = "@" + hex(genericHash(peer_pk)) + ":" + relayServer
//! ```

use serde::{Deserialize, Serialize};

use crate::crypto::generic_hash_hex;
use crate::error::{P2pError, P2pResult};

/// Tag prefix of a channel-open message body.
pub const CHANNEL_OPEN_PREFIX: &str = "@channel-open:";

/// Direction tag of a pairing payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PairingKind {
    #[serde(rename = "p2p-pairing-request")]
    Request,
    #[serde(rename = "p2p-pairing-response")]
    Response,
}

/// A pairing descriptor: everything a peer needs to reach us.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PairingInfo {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: PairingKind,
    pub name: String,
    pub version: String,
    /// Hex Ed25519 public key
    pub public_key: String,
    pub relay_server: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub icon: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub app_url: Option<String>,
}

impl PairingInfo {
    /// Decode the peer's public key from its hex form.
    pub fn public_key_bytes(&self) -> P2pResult<[u8; 32]> {
        let bytes = hex::decode(&self.public_key)
            .map_err(|_| P2pError::InvalidPairing("Public key is not valid hex".to_string()))?;
        bytes
            .try_into()
            .map_err(|_| P2pError::InvalidPairing("Public key must be 32 bytes".to_string()))
    }

    /// The peer's chat-layer address on its chosen relay.
    pub fn recipient_address(&self) -> P2pResult<String> {
        Ok(recipient_address(
            &generic_hash_hex(&self.public_key_bytes()?),
            &self.relay_server,
        ))
    }
}

/// A pairing response extended with the derived short sender id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtendedPairingResponse {
    #[serde(flatten)]
    pub info: PairingInfo,
    pub sender_id: String,
}

/// `"@" + <peer hash hex> + ":" + <relay>` — the canonical address used as
/// both chat user id and routing-cache key.
pub fn recipient_address(public_key_hash_hex: &str, relay_server: &str) -> String {
    format!("@{}:{}", public_key_hash_hex, relay_server)
}

/// Build the channel-open message body carrying a sealed pairing response.
pub fn channel_open_text(recipient: &str, sealed: &[u8]) -> String {
    format!("{}{}:{}", CHANNEL_OPEN_PREFIX, recipient, hex::encode(sealed))
}

/// Whether `text` is a channel-open addressed to the given local hash.
pub fn is_channel_open_for(text: &str, local_hash_hex: &str) -> bool {
    text.starts_with(&format!("{}@{}", CHANNEL_OPEN_PREFIX, local_hash_hex))
}

/// Extract the sealed payload: everything after the last `:`, hex-decoded.
pub fn channel_open_payload(text: &str) -> P2pResult<Vec<u8>> {
    let encoded = text
        .rsplit(':')
        .next()
        .ok_or_else(|| P2pError::InvalidPairing("Empty channel-open body".to_string()))?;
    hex::decode(encoded)
        .map_err(|_| P2pError::InvalidPairing("Channel-open payload is not valid hex".to_string()))
}

/// Parse a sealed-box plaintext as a pairing response.
pub fn parse_pairing_response(plaintext: &[u8]) -> P2pResult<PairingInfo> {
    let info: PairingInfo = serde_json::from_slice(plaintext)?;
    if info.kind != PairingKind::Response {
        return Err(P2pError::InvalidPairing(
            "Expected a pairing response payload".to_string(),
        ));
    }
    Ok(info)
}
