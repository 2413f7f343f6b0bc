//! Cryptographic primitives for the data channel and local credentials
//!
//! Everything here is built on `ring`: AES-256-GCM for sealed datagrams,
//! HKDF-SHA256 for per-epoch keys, HMAC-SHA256 for the attach proof and
//! PBKDF2-HMAC-SHA256 for stored password hashes.

use crate::error::{GatewayError, Result};
use bytes::{BufMut, Bytes, BytesMut};
use ring::rand::{SecureRandom, SystemRandom};
use ring::{aead, hkdf, hmac, pbkdf2};
use std::num::NonZeroU32;

pub mod tls;

/// Length of session identifiers and epoch secrets
pub const SECRET_LEN: usize = 32;
/// AES-GCM nonce length
pub const NONCE_LEN: usize = 12;
/// Bytes added to every sealed datagram (epoch + nonce + tag)
pub const SEAL_OVERHEAD: usize = 4 + NONCE_LEN + 16;

const ATTACH_LABEL: &[u8] = b"rvpngw attach";
const ATTACHED_LABEL: &[u8] = b"rvpngw attached";
const DATA_LABEL: &[u8] = b"rvpngw data";
const PASSWORD_SCHEME: &str = "pbkdf2-sha256";

/// Fill a fixed-size array from the system CSPRNG
pub fn random_array<const N: usize>() -> Result<[u8; N]> {
    let mut out = [0u8; N];
    SystemRandom::new()
        .fill(&mut out)
        .map_err(|e| GatewayError::Crypto(format!("Random generation failed: {e:?}")))?;
    Ok(out)
}

/// Proof a client sends when attaching a datagram channel
pub fn attach_proof(master: &[u8; SECRET_LEN], session_id: &[u8; SECRET_LEN]) -> [u8; 32] {
    sign(master, ATTACH_LABEL, session_id)
}

/// Proof the gateway returns once a datagram channel is attached
pub fn attached_proof(master: &[u8; SECRET_LEN], session_id: &[u8; SECRET_LEN]) -> [u8; 32] {
    sign(master, ATTACHED_LABEL, session_id)
}

/// Constant-time check of an attach proof
pub fn verify_attach_proof(
    master: &[u8; SECRET_LEN],
    session_id: &[u8; SECRET_LEN],
    proof: &[u8],
) -> bool {
    let key = hmac::Key::new(hmac::HMAC_SHA256, master);
    let mut msg = Vec::with_capacity(ATTACH_LABEL.len() + SECRET_LEN);
    msg.extend_from_slice(ATTACH_LABEL);
    msg.extend_from_slice(session_id);
    hmac::verify(&key, &msg, proof).is_ok()
}

fn sign(master: &[u8; SECRET_LEN], label: &[u8], session_id: &[u8; SECRET_LEN]) -> [u8; 32] {
    let key = hmac::Key::new(hmac::HMAC_SHA256, master);
    let mut ctx = hmac::Context::with_key(&key);
    ctx.update(label);
    ctx.update(session_id);
    let tag = ctx.sign();
    let mut out = [0u8; 32];
    out.copy_from_slice(tag.as_ref());
    out
}

/// AEAD state for one cipher epoch of a datagram channel
pub struct EpochCipher {
    epoch: u32,
    key: aead::LessSafeKey,
    rng: SystemRandom,
}

impl std::fmt::Debug for EpochCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EpochCipher")
            .field("epoch", &self.epoch)
            .finish_non_exhaustive()
    }
}

impl EpochCipher {
    /// Derive the key for `epoch` from the epoch secret
    pub fn derive(
        session_id: &[u8; SECRET_LEN],
        secret: &[u8; SECRET_LEN],
        epoch: u32,
    ) -> Result<Self> {
        let epoch_bytes = epoch.to_be_bytes();
        let info: [&[u8]; 2] = [DATA_LABEL, &epoch_bytes];
        let prk = hkdf::Salt::new(hkdf::HKDF_SHA256, session_id).extract(secret);
        let okm = prk
            .expand(&info, &aead::AES_256_GCM)
            .map_err(|e| GatewayError::Crypto(format!("Key derivation failed: {e:?}")))?;
        let key = aead::LessSafeKey::new(aead::UnboundKey::from(okm));
        Ok(Self {
            epoch,
            key,
            rng: SystemRandom::new(),
        })
    }

    pub fn epoch(&self) -> u32 {
        self.epoch
    }

    /// Seal `kind || payload` into `epoch || nonce || ciphertext || tag`
    pub fn seal(&self, kind: u8, payload: &[u8]) -> Result<Bytes> {
        let mut nonce_bytes = [0u8; NONCE_LEN];
        self.rng
            .fill(&mut nonce_bytes)
            .map_err(|e| GatewayError::Crypto(format!("Nonce generation failed: {e:?}")))?;
        let nonce = aead::Nonce::assume_unique_for_key(nonce_bytes);

        let epoch_bytes = self.epoch.to_be_bytes();
        let mut in_out = Vec::with_capacity(1 + payload.len() + 16);
        in_out.push(kind);
        in_out.extend_from_slice(payload);
        self.key
            .seal_in_place_append_tag(nonce, aead::Aad::from(epoch_bytes), &mut in_out)
            .map_err(|e| GatewayError::Crypto(format!("Encryption failed: {e:?}")))?;

        let mut out = BytesMut::with_capacity(4 + NONCE_LEN + in_out.len());
        out.put_slice(&epoch_bytes);
        out.put_slice(&nonce_bytes);
        out.put_slice(&in_out);
        Ok(out.freeze())
    }

    /// Open a sealed datagram produced for this epoch
    pub fn open(&self, datagram: &[u8]) -> Result<(u8, Bytes)> {
        if datagram.len() < SEAL_OVERHEAD + 1 {
            return Err(GatewayError::Crypto("Datagram too short".into()));
        }
        let (epoch_bytes, rest) = datagram.split_at(4);
        let epoch = u32::from_be_bytes([
            epoch_bytes[0],
            epoch_bytes[1],
            epoch_bytes[2],
            epoch_bytes[3],
        ]);
        if epoch != self.epoch {
            return Err(GatewayError::Crypto(format!(
                "Epoch mismatch: got {epoch}, expected {}",
                self.epoch
            )));
        }
        let (nonce_bytes, sealed) = rest.split_at(NONCE_LEN);
        let nonce = aead::Nonce::try_assume_unique_for_key(nonce_bytes)
            .map_err(|e| GatewayError::Crypto(format!("Invalid nonce: {e:?}")))?;

        let mut in_out = sealed.to_vec();
        let plain = self
            .key
            .open_in_place(nonce, aead::Aad::from(epoch.to_be_bytes()), &mut in_out)
            .map_err(|e| GatewayError::Crypto(format!("Decryption failed: {e:?}")))?;
        let (kind, payload) = plain
            .split_first()
            .ok_or_else(|| GatewayError::Crypto("Empty datagram".into()))?;
        Ok((*kind, Bytes::copy_from_slice(payload)))
    }
}

/// Epoch number carried in the first four bytes of a sealed datagram
pub fn peek_epoch(datagram: &[u8]) -> Option<u32> {
    let head: [u8; 4] = datagram.get(..4)?.try_into().ok()?;
    Some(u32::from_be_bytes(head))
}

/// Hash a password into the stored `pbkdf2-sha256$iter$salt$hash` form
pub fn hash_password(password: &str, iterations: u32) -> Result<String> {
    let iterations = NonZeroU32::new(iterations)
        .ok_or_else(|| GatewayError::Crypto("Iteration count must be positive".into()))?;
    let salt: [u8; 16] = random_array()?;
    let mut hash = [0u8; 32];
    pbkdf2::derive(
        pbkdf2::PBKDF2_HMAC_SHA256,
        iterations,
        &salt,
        password.as_bytes(),
        &mut hash,
    );
    Ok(format!(
        "{PASSWORD_SCHEME}${}${}${}",
        iterations,
        hex::encode(salt),
        hex::encode(hash)
    ))
}

/// Check a password against a stored hash. Malformed hashes never verify.
pub fn verify_password(password: &str, encoded: &str) -> bool {
    let mut parts = encoded.split('$');
    let (Some(scheme), Some(iter), Some(salt), Some(hash), None) = (
        parts.next(),
        parts.next(),
        parts.next(),
        parts.next(),
        parts.next(),
    ) else {
        return false;
    };
    if scheme != PASSWORD_SCHEME {
        return false;
    }
    let Some(iterations) = iter.parse::<u32>().ok().and_then(NonZeroU32::new) else {
        return false;
    };
    let (Ok(salt), Ok(hash)) = (hex::decode(salt), hex::decode(hash)) else {
        return false;
    };
    pbkdf2::verify(
        pbkdf2::PBKDF2_HMAC_SHA256,
        iterations,
        &salt,
        password.as_bytes(),
        &hash,
    )
    .is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seal_open() {
        let sid = [7u8; 32];
        let secret = [9u8; 32];
        let cipher = EpochCipher::derive(&sid, &secret, 1).unwrap();
        let sealed = cipher.seal(0x00, b"ip packet").unwrap();
        assert_eq!(sealed.len(), SEAL_OVERHEAD + 1 + 9);
        assert_eq!(peek_epoch(&sealed), Some(1));

        let (kind, payload) = cipher.open(&sealed).unwrap();
        assert_eq!(kind, 0x00);
        assert_eq!(&payload[..], b"ip packet");
    }

    #[test]
    fn test_open_rejects_other_epoch_and_tampering() {
        let sid = [1u8; 32];
        let secret = [2u8; 32];
        let one = EpochCipher::derive(&sid, &secret, 1).unwrap();
        let two = EpochCipher::derive(&sid, &secret, 2).unwrap();
        let sealed = one.seal(0x00, b"data").unwrap();
        assert!(two.open(&sealed).is_err());

        let mut tampered = sealed.to_vec();
        let last = tampered.len() - 1;
        tampered[last] ^= 0xff;
        assert!(one.open(&tampered).is_err());
    }

    #[test]
    fn test_keys_are_bound_to_session() {
        let secret = [3u8; 32];
        let a = EpochCipher::derive(&[1u8; 32], &secret, 1).unwrap();
        let b = EpochCipher::derive(&[2u8; 32], &secret, 1).unwrap();
        let sealed = a.seal(0x00, b"x").unwrap();
        assert!(b.open(&sealed).is_err());
    }

    #[test]
    fn test_attach_proof() {
        let master = [5u8; 32];
        let sid = [6u8; 32];
        let proof = attach_proof(&master, &sid);
        assert!(verify_attach_proof(&master, &sid, &proof));
        assert!(!verify_attach_proof(&[0u8; 32], &sid, &proof));
        assert_ne!(proof, attached_proof(&master, &sid));
    }

    #[test]
    fn test_password_hash_roundtrip() {
        let stored = hash_password("hunter2", 1000).unwrap();
        assert!(stored.starts_with("pbkdf2-sha256$1000$"));
        assert!(verify_password("hunter2", &stored));
        assert!(!verify_password("hunter3", &stored));
        assert!(!verify_password("hunter2", "plain"));
        assert!(!verify_password("hunter2", "pbkdf2-sha256$0$00$00"));
    }
}
