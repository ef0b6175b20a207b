//! Key and signature layer
//!
//! Feeds are signed with Ed25519. The writer's public key travels inside the
//! feed as a JWK-style descriptor (`declare-key` operation), so a feed is
//! self-describing: anyone holding it can verify it without a key directory.
//!
//! The feed fingerprint is the hex SHA-256 of the declared public key bytes.

use std::fmt;
use std::io;
use std::path::Path;

use base64::prelude::*;
use ed25519_dalek::{Signature, Signer, SigningKey, VerifyingKey};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::info;

use crate::error::CodecError;

/// JWK key type for Edwards curves
pub const KEY_TYPE: &str = "OKP";

/// JWK curve name
pub const CURVE: &str = "Ed25519";

/// Public key as carried in a `declare-key` operation body
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublicKeyDescriptor {
    /// Key type (always "OKP")
    pub kty: String,
    /// Curve (always "Ed25519")
    pub crv: String,
    /// Base64url (unpadded) public key bytes
    pub x: String,
}

impl PublicKeyDescriptor {
    pub fn from_verifying_key(key: &VerifyingKey) -> Self {
        Self {
            kty: KEY_TYPE.to_string(),
            crv: CURVE.to_string(),
            x: BASE64_URL_SAFE_NO_PAD.encode(key.as_bytes()),
        }
    }

    /// Parse the descriptor back into a usable verifying key.
    pub fn verifying_key(&self) -> Result<VerifyingKey, CodecError> {
        if self.kty != KEY_TYPE || self.crv != CURVE {
            return Err(CodecError::MalformedOperation(format!(
                "unsupported key {}/{}",
                self.kty, self.crv
            )));
        }
        let bytes = BASE64_URL_SAFE_NO_PAD
            .decode(&self.x)
            .map_err(|e| CodecError::MalformedOperation(format!("bad key encoding: {}", e)))?;
        let bytes: [u8; 32] = bytes.try_into().map_err(|b: Vec<u8>| {
            CodecError::MalformedOperation(format!("key must be 32 bytes, got {}", b.len()))
        })?;
        VerifyingKey::from_bytes(&bytes)
            .map_err(|e| CodecError::MalformedOperation(format!("invalid key: {}", e)))
    }

    pub fn fingerprint(&self) -> Result<String, CodecError> {
        Ok(fingerprint(&self.verifying_key()?))
    }

    /// Verify `signature` over `data` with this key.
    pub fn verify(&self, data: &[u8], signature: &[u8]) -> Result<(), CodecError> {
        let key = self.verifying_key()?;
        let signature =
            Signature::from_slice(signature).map_err(|_| CodecError::SignatureInvalid)?;
        key.verify_strict(data, &signature)
            .map_err(|_| CodecError::SignatureInvalid)
    }
}

/// Content address of a feed: hex SHA-256 of the writer's public key.
pub fn fingerprint(key: &VerifyingKey) -> String {
    hex::encode(Sha256::digest(key.as_bytes()))
}

/// The local writer's private key.
#[derive(Clone)]
pub struct NodeKey {
    signing: SigningKey,
}

impl NodeKey {
    /// Create a key with fresh randomness
    pub fn generate() -> Self {
        Self {
            signing: SigningKey::generate(&mut OsRng),
        }
    }

    pub fn from_bytes(secret: &[u8; 32]) -> Self {
        Self {
            signing: SigningKey::from_bytes(secret),
        }
    }

    /// Load the key file at `path`, generating and saving one if missing.
    pub fn load_or_generate(path: &Path) -> io::Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            let key = Self::generate();
            key.save(path)?;
            info!(path = %path.display(), fingerprint = %key.fingerprint(), "Generated node key");
            Ok(key)
        }
    }

    /// Load a hex-encoded secret key
    pub fn load(path: &Path) -> io::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let bytes = hex::decode(content.trim())
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        let secret: [u8; 32] = bytes.try_into().map_err(|_| {
            io::Error::new(io::ErrorKind::InvalidData, "key file must hold 32 bytes")
        })?;
        Ok(Self::from_bytes(&secret))
    }

    pub fn save(&self, path: &Path) -> io::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, hex::encode(self.signing.to_bytes()))?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
        }
        Ok(())
    }

    pub fn verifying_key(&self) -> VerifyingKey {
        self.signing.verifying_key()
    }

    pub fn public(&self) -> PublicKeyDescriptor {
        PublicKeyDescriptor::from_verifying_key(&self.verifying_key())
    }

    /// Fingerprint of the feed this key writes
    pub fn fingerprint(&self) -> String {
        fingerprint(&self.verifying_key())
    }

    pub fn sign(&self, data: &[u8]) -> Signature {
        self.signing.sign(data)
    }
}

impl fmt::Debug for NodeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeKey({}...)", &self.fingerprint()[..8])
    }
}
