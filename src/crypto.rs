//! secp256k1 identities and opaque payload encryption.
//!
//! A user id is the 33-byte compressed public key in lowercase hex.
//! Signatures are compact ECDSA over a 32-byte digest supplied by the
//! caller; see [`crate::event::signing_digest`] for what gets signed.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use anyhow::{anyhow, Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use secp256k1::ecdh::SharedSecret;
use secp256k1::{ecdsa::Signature, Message, PublicKey, Secp256k1, SecretKey};
use serde::{Deserialize, Serialize};

/// A secp256k1 keypair identifying a user or relay.
#[derive(Clone)]
pub struct Keys {
    secret: SecretKey,
    public: PublicKey,
}

impl Keys {
    /// Generate a fresh random keypair.
    pub fn generate() -> Self {
        let secp = Secp256k1::new();
        let secret = SecretKey::new(&mut rand::thread_rng());
        let public = PublicKey::from_secret_key(&secp, &secret);
        Self { secret, public }
    }

    /// Load a keypair from a 32-byte hex secret.
    pub fn from_secret_hex(hex_secret: &str) -> Result<Self> {
        let bytes = hex::decode(hex_secret.trim()).context("decoding secret key hex")?;
        let secret = SecretKey::from_slice(&bytes).context("parsing secret key")?;
        let public = PublicKey::from_secret_key(&Secp256k1::new(), &secret);
        Ok(Self { secret, public })
    }

    /// The public key (user id) as lowercase hex of the compressed form.
    pub fn public_hex(&self) -> String {
        hex::encode(self.public.serialize())
    }

    /// The secret key as lowercase hex.
    pub fn secret_hex(&self) -> String {
        hex::encode(self.secret.secret_bytes())
    }

    /// Sign a 32-byte digest, returning the compact signature in hex.
    pub fn sign(&self, digest: &[u8; 32]) -> String {
        let secp = Secp256k1::new();
        let msg = Message::from_digest_slice(digest).expect("digest is 32 bytes");
        let sig = secp.sign_ecdsa(&msg, &self.secret);
        hex::encode(sig.serialize_compact())
    }

    /// Derive the ECDH shared secret with a peer's hex public key.
    pub fn ecdh(&self, peer_hex: &str) -> Result<[u8; 32]> {
        let peer = parse_public(peer_hex)?;
        Ok(SharedSecret::new(&peer, &self.secret).secret_bytes())
    }
}

/// Verify a compact hex signature over a 32-byte digest.
///
/// Any malformed key, signature, or digest counts as verification failure.
pub fn verify(author_hex: &str, digest: &[u8; 32], sig_hex: &str) -> bool {
    let Ok(public) = parse_public(author_hex) else {
        return false;
    };
    let Ok(raw) = hex::decode(sig_hex) else {
        return false;
    };
    let Ok(sig) = Signature::from_compact(&raw) else {
        return false;
    };
    let Ok(msg) = Message::from_digest_slice(digest) else {
        return false;
    };
    Secp256k1::verification_only()
        .verify_ecdsa(&msg, &sig, &public)
        .is_ok()
}

fn parse_public(hex_key: &str) -> Result<PublicKey> {
    let bytes = hex::decode(hex_key).context("decoding public key hex")?;
    PublicKey::from_slice(&bytes).context("parsing public key")
}

/// An AES-GCM sealed payload: base64 ciphertext plus hex 96-bit IV.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Sealed {
    pub ciphertext: String,
    pub iv: String,
}

/// Encrypt a payload with AES-256-GCM under a shared key.
///
/// Client-side utility: the relay treats sealed message content as an opaque
/// string and never needs the key.
pub fn seal(key: &[u8; 32], plaintext: &[u8]) -> Result<Sealed> {
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key));
    let mut iv = [0u8; 12];
    rand::RngCore::fill_bytes(&mut rand::thread_rng(), &mut iv);
    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&iv), plaintext)
        .map_err(|_| anyhow!("encryption failed"))?;
    Ok(Sealed {
        ciphertext: BASE64.encode(ciphertext),
        iv: hex::encode(iv),
    })
}

/// Decrypt a payload sealed with [`seal`].
pub fn open(key: &[u8; 32], sealed: &Sealed) -> Result<Vec<u8>> {
    let iv = hex::decode(&sealed.iv).context("decoding iv hex")?;
    if iv.len() != 12 {
        return Err(anyhow!("iv must be 96 bits"));
    }
    let ciphertext = BASE64
        .decode(&sealed.ciphertext)
        .context("decoding ciphertext base64")?;
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key));
    cipher
        .decrypt(Nonce::from_slice(&iv), ciphertext.as_ref())
        .map_err(|_| anyhow!("decryption failed"))
}
