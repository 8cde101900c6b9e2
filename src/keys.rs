//! Event hashing, signature checks and the signing seam.
//!
//! Signing itself is an external collaborator: the session only ever sees the
//! [`Signer`] trait. [`KeySigner`] is the bundled implementation backed by a
//! raw secret key, used by the CLI and the tests.

use async_trait::async_trait;
use bech32::{Bech32, Hrp};
use secp256k1::{schnorr::Signature, Keypair, Message, Secp256k1, XOnlyPublicKey};
use sha2::{Digest, Sha256};

use crate::{
    error::{Error, Result},
    event::Event,
};

const NPUB: Hrp = Hrp::parse_unchecked("npub");

/// Recompute the Nostr event hash from its fields.
pub fn event_hash(ev: &Event) -> Result<[u8; 32]> {
    let arr = serde_json::json!([0, ev.pubkey, ev.created_at, ev.kind, ev.tags, ev.content]);
    let data = serde_json::to_vec(&arr)?;
    let hash = Sha256::digest(&data);
    Ok(hash.into())
}

/// Content-addressed id of an event, hex encoded.
pub fn compute_id(ev: &Event) -> Result<String> {
    Ok(hex::encode(event_hash(ev)?))
}

/// Verify an event's ID and Schnorr signature.
pub fn verify_event(ev: &Event) -> Result<()> {
    let hash = event_hash(ev)?;
    let calc_id = hex::encode(hash);
    if calc_id != ev.id {
        return Err(Error::InvalidEvent("id mismatch".into()));
    }
    let sig_bytes =
        hex::decode(&ev.sig).map_err(|e| Error::InvalidEvent(format!("signature: {e}")))?;
    let pk_bytes =
        hex::decode(&ev.pubkey).map_err(|e| Error::InvalidEvent(format!("pubkey: {e}")))?;
    let sig = Signature::from_slice(&sig_bytes)?;
    let pk = XOnlyPublicKey::from_slice(&pk_bytes)?;
    let secp = Secp256k1::verification_only();
    let msg = Message::from_digest_slice(&hash)?;
    secp.verify_schnorr(&sig, &msg, &pk)?;
    Ok(())
}

/// Decides whether a fetched event is authentic.
pub trait Verifier: Send + Sync {
    fn verify(&self, ev: &Event) -> bool;
}

/// Checks ids and Schnorr signatures.
#[derive(Debug, Clone, Copy, Default)]
pub struct SchnorrVerifier;

impl Verifier for SchnorrVerifier {
    fn verify(&self, ev: &Event) -> bool {
        ev.is_signed() && verify_event(ev).is_ok()
    }
}

/// Accepts every signed event. Used when `VERIFY_SIG=0`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TrustSigned;

impl Verifier for TrustSigned {
    fn verify(&self, ev: &Event) -> bool {
        ev.is_signed()
    }
}

/// Produces signatures for drafted events.
#[async_trait]
pub trait Signer: Send + Sync {
    /// Hex public key events are signed as.
    fn public_key(&self) -> String;

    /// Return `event` with `id` and `sig` filled in. Implementations that ask a
    /// human may return [`Error::SigningDeclined`].
    async fn sign(&self, event: Event) -> Result<Event>;
}

/// Signer backed by an in-memory secret key.
pub struct KeySigner {
    keypair: Keypair,
    pubkey: String,
}

impl KeySigner {
    /// Build a signer from a hex encoded 32 byte secret key.
    pub fn from_hex(secret: &str) -> Result<Self> {
        let bytes = hex::decode(secret.trim())?;
        Self::from_bytes(&bytes)
    }

    pub fn from_bytes(secret: &[u8]) -> Result<Self> {
        let secp = Secp256k1::new();
        let keypair = Keypair::from_seckey_slice(&secp, secret)
            .map_err(|e| Error::InvalidKey(e.to_string()))?;
        let pubkey = hex::encode(keypair.x_only_public_key().0.serialize());
        Ok(Self { keypair, pubkey })
    }

    /// Sign synchronously; the async trait method delegates here.
    pub fn sign_event(&self, mut event: Event) -> Result<Event> {
        if event.pubkey != self.pubkey {
            return Err(Error::Signing(format!(
                "event author {} does not match signer",
                event.pubkey
            )));
        }
        let hash = event_hash(&event)?;
        event.id = hex::encode(hash);
        let secp = Secp256k1::new();
        let msg = Message::from_digest_slice(&hash).map_err(|e| Error::Signing(e.to_string()))?;
        let sig = secp.sign_schnorr_with_rng(&msg, &self.keypair, &mut rand::thread_rng());
        event.sig = hex::encode(sig.as_ref());
        Ok(event)
    }
}

#[async_trait]
impl Signer for KeySigner {
    fn public_key(&self) -> String {
        self.pubkey.clone()
    }

    async fn sign(&self, event: Event) -> Result<Event> {
        self.sign_event(event)
    }
}

/// Encode a hex public key as `npub…`.
pub fn npub_encode(pubkey_hex: &str) -> Result<String> {
    let bytes = hex::decode(pubkey_hex)?;
    if bytes.len() != 32 {
        return Err(Error::InvalidKey(format!("expected 32 bytes, got {}", bytes.len())));
    }
    bech32::encode::<Bech32>(NPUB, &bytes).map_err(|e| Error::InvalidKey(e.to_string()))
}

/// Decode an `npub…` string into a hex public key.
pub fn npub_decode(npub: &str) -> Result<String> {
    let (hrp, data) = bech32::decode(npub).map_err(|e| Error::InvalidKey(e.to_string()))?;
    if hrp != NPUB {
        return Err(Error::InvalidKey(format!("unexpected prefix {hrp}")));
    }
    if data.len() != 32 {
        return Err(Error::InvalidKey(format!("expected 32 bytes, got {}", data.len())));
    }
    Ok(hex::encode(data))
}

/// Accept either a 64 character hex key or an `npub…` string.
pub fn parse_pubkey(input: &str) -> Result<String> {
    let s = input.trim();
    if s.starts_with("npub1") {
        return npub_decode(s);
    }
    if s.len() == 64 && s.chars().all(|c| c.is_ascii_hexdigit()) {
        return Ok(s.to_ascii_lowercase());
    }
    Err(Error::InvalidKey(format!("not a public key: {s}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{kinds, Tag};

    fn signer() -> KeySigner {
        KeySigner::from_bytes(&[1u8; 32]).unwrap()
    }

    #[test]
    fn event_hash_matches_reference() {
        let ev = Event::draft("00".repeat(32), 1, 1, vec![], "");
        let expected = {
            let obj =
                serde_json::json!([0, ev.pubkey, ev.created_at, ev.kind, ev.tags, ev.content]);
            let mut hasher = Sha256::new();
            hasher.update(serde_json::to_vec(&obj).unwrap());
            let bytes = hasher.finalize();
            let mut arr = [0u8; 32];
            arr.copy_from_slice(&bytes);
            arr
        };
        assert_eq!(event_hash(&ev).unwrap(), expected);
    }

    #[test]
    fn signed_event_verifies() {
        let s = signer();
        let ev = Event::draft(s.public_key(), kinds::CONTACTS, 10, vec![Tag::new(["p", "x"])], "{}");
        let signed = s.sign_event(ev).unwrap();
        assert!(verify_event(&signed).is_ok());
        assert!(SchnorrVerifier.verify(&signed));
    }

    #[test]
    fn tampered_content_fails() {
        let s = signer();
        let ev = Event::draft(s.public_key(), kinds::CONTACTS, 10, vec![], "{}");
        let mut signed = s.sign_event(ev).unwrap();
        signed.content = "{\"wss://evil\":{}}".into();
        assert!(verify_event(&signed).is_err());
        assert!(!SchnorrVerifier.verify(&signed));
    }

    #[test]
    fn bad_sig_fails() {
        let s = signer();
        let ev = Event::draft(s.public_key(), 1, 1, vec![], "");
        let mut signed = s.sign_event(ev).unwrap();
        signed.sig = "00".repeat(64);
        assert!(verify_event(&signed).is_err());
    }

    #[test]
    fn signer_refuses_foreign_author() {
        let ev = Event::draft("ab".repeat(32), 1, 1, vec![], "");
        assert!(matches!(signer().sign_event(ev), Err(Error::Signing(_))));
    }

    #[test]
    fn trust_signed_only_checks_presence() {
        let mut ev = Event::draft("p", 1, 1, vec![], "");
        assert!(!TrustSigned.verify(&ev));
        ev.sig = "zz".into();
        assert!(TrustSigned.verify(&ev));
    }

    #[test]
    fn npub_round_trip() {
        let hex_key = signer().public_key();
        let npub = npub_encode(&hex_key).unwrap();
        assert!(npub.starts_with("npub1"));
        assert_eq!(npub_decode(&npub).unwrap(), hex_key);
        assert_eq!(parse_pubkey(&npub).unwrap(), hex_key);
        assert_eq!(parse_pubkey(&hex_key.to_uppercase()).unwrap(), hex_key);
        assert!(parse_pubkey("nope").is_err());
    }
}
