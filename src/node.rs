/// Node identity: the ed25519 key pair the blobber signs transactions with, and the
/// signature check used for validator tickets and client write markers.
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use log::debug;
use rand::RngCore;

use crate::error::{BlobberError, Result};
use crate::utils::hash;

/// Length of a hex-encoded ed25519 signature.
pub const SIGNATURE_HEX_LEN: usize = 128;

pub struct NodeIdentity {
    signing_key: SigningKey,
    id: String,
    public_key: String,
}

impl NodeIdentity {
    /// Loads the identity from a hex-encoded 32-byte secret key.
    pub fn from_secret_hex(secret: &str) -> Result<Self> {
        let bytes = hex::decode(secret.trim())
            .map_err(|e| BlobberError::Config(format!("invalid secret key hex: {}", e)))?;
        let bytes: [u8; 32] = bytes
            .try_into()
            .map_err(|_| BlobberError::Config("secret key must be 32 bytes".into()))?;
        Ok(Self::from_signing_key(SigningKey::from_bytes(&bytes)))
    }

    /// Creates a fresh random identity.
    pub fn generate() -> Self {
        let mut secret = [0u8; 32];
        rand::rng().fill_bytes(&mut secret);
        Self::from_signing_key(SigningKey::from_bytes(&secret))
    }

    fn from_signing_key(signing_key: SigningKey) -> Self {
        let public_bytes = signing_key.verifying_key().to_bytes();
        let id = hash(public_bytes);
        let public_key = hex::encode(public_bytes);
        debug!("Loaded node identity {}", id);
        Self {
            signing_key,
            id,
            public_key,
        }
    }

    /// Hex SHA-256 of the public key.
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn public_key(&self) -> &str {
        &self.public_key
    }

    pub fn secret_hex(&self) -> String {
        hex::encode(self.signing_key.to_bytes())
    }

    /// Signs a hex hash string and returns the hex signature.
    pub fn sign(&self, hash: &str) -> String {
        hex::encode(self.signing_key.sign(hash.as_bytes()).to_bytes())
    }
}

/// Verifies a hex signature over `hash` against a hex public key.
///
/// Any decoding failure counts as an invalid signature.
pub fn verify_signature(public_key: &str, signature: &str, hash: &str) -> bool {
    let Ok(key_bytes) = hex::decode(public_key) else {
        return false;
    };
    let Ok(key_bytes) = <[u8; 32]>::try_from(key_bytes.as_slice()) else {
        return false;
    };
    let Ok(verifying_key) = VerifyingKey::from_bytes(&key_bytes) else {
        return false;
    };
    let Ok(sig_bytes) = hex::decode(signature) else {
        return false;
    };
    let Ok(sig_bytes) = <[u8; 64]>::try_from(sig_bytes.as_slice()) else {
        return false;
    };
    verifying_key
        .verify(hash.as_bytes(), &Signature::from_bytes(&sig_bytes))
        .is_ok()
}

/// Derives the client ID the network assigns to a public key.
pub fn client_id_for(public_key: &str) -> Result<String> {
    let bytes = hex::decode(public_key)
        .map_err(|e| BlobberError::Internal(format!("invalid public key hex: {}", e)))?;
    Ok(hash(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sign_and_verify() {
        let identity = NodeIdentity::generate();
        let digest = hash("payload");
        let signature = identity.sign(&digest);
        assert_eq!(signature.len(), SIGNATURE_HEX_LEN);
        assert!(verify_signature(identity.public_key(), &signature, &digest));
        assert!(!verify_signature(identity.public_key(), &signature, &hash("other")));
        assert!(!verify_signature("zz", &signature, &digest));
    }

    #[test]
    fn test_identity_roundtrips_through_secret() {
        let identity = NodeIdentity::generate();
        let restored = NodeIdentity::from_secret_hex(&identity.secret_hex()).unwrap();
        assert_eq!(identity.id(), restored.id());
        assert_eq!(
            client_id_for(identity.public_key()).unwrap(),
            identity.id().to_string()
        );
    }

    #[test]
    fn test_rejects_short_secret() {
        assert!(NodeIdentity::from_secret_hex("abcd").is_err());
    }
}
