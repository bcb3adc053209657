use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use hkdf::Hkdf;
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::Zeroize;

use crate::error::{ProtocolError, Result};

pub const KEY_LEN: usize = 32;

/// Public half of an account identity: a signing key and an agreement key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IdentityKey {
    pub signing: [u8; KEY_LEN],
    pub agreement: [u8; KEY_LEN],
}

impl IdentityKey {
    pub fn to_bytes(&self) -> [u8; KEY_LEN * 2] {
        let mut out = [0u8; KEY_LEN * 2];
        out[..KEY_LEN].copy_from_slice(&self.signing);
        out[KEY_LEN..].copy_from_slice(&self.agreement);
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != KEY_LEN * 2 {
            return Err(ProtocolError::InvalidKey(format!(
                "identity key must be {} bytes, got {}",
                KEY_LEN * 2,
                bytes.len()
            )));
        }
        let mut signing = [0u8; KEY_LEN];
        let mut agreement = [0u8; KEY_LEN];
        signing.copy_from_slice(&bytes[..KEY_LEN]);
        agreement.copy_from_slice(&bytes[KEY_LEN..]);
        Ok(Self { signing, agreement })
    }

    pub fn verify(&self, message: &[u8], signature: &[u8]) -> bool {
        let Ok(verifying) = VerifyingKey::from_bytes(&self.signing) else {
            return false;
        };
        let Ok(signature) = Signature::from_slice(signature) else {
            return false;
        };
        verifying.verify(message, &signature).is_ok()
    }
}

#[derive(Clone, Serialize, Deserialize)]
pub struct IdentityKeyPair {
    signing_secret: [u8; KEY_LEN],
    agreement_secret: [u8; KEY_LEN],
}

impl std::fmt::Debug for IdentityKeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdentityKeyPair")
            .field("public", &self.public_key())
            .finish_non_exhaustive()
    }
}

impl Drop for IdentityKeyPair {
    fn drop(&mut self) {
        self.signing_secret.zeroize();
        self.agreement_secret.zeroize();
    }
}

impl IdentityKeyPair {
    pub fn generate() -> Self {
        let signing = SigningKey::generate(&mut OsRng);
        let agreement = StaticSecret::random_from_rng(OsRng);
        Self {
            signing_secret: signing.to_bytes(),
            agreement_secret: agreement.to_bytes(),
        }
    }

    pub fn public_key(&self) -> IdentityKey {
        let signing = SigningKey::from_bytes(&self.signing_secret);
        let agreement = StaticSecret::from(self.agreement_secret);
        IdentityKey {
            signing: signing.verifying_key().to_bytes(),
            agreement: PublicKey::from(&agreement).to_bytes(),
        }
    }

    pub fn sign(&self, message: &[u8]) -> Vec<u8> {
        SigningKey::from_bytes(&self.signing_secret)
            .sign(message)
            .to_bytes()
            .to_vec()
    }

    pub fn agree(&self, their_public: &[u8; KEY_LEN]) -> [u8; KEY_LEN] {
        StaticSecret::from(self.agreement_secret)
            .diffie_hellman(&PublicKey::from(*their_public))
            .to_bytes()
    }

    pub fn serialize(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn deserialize(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// Ephemeral or prekey agreement pair.
pub struct AgreementKeyPair {
    secret: StaticSecret,
    public: PublicKey,
}

impl AgreementKeyPair {
    pub fn generate() -> Self {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = PublicKey::from(&secret);
        Self { secret, public }
    }

    pub fn from_secret(bytes: [u8; KEY_LEN]) -> Self {
        let secret = StaticSecret::from(bytes);
        let public = PublicKey::from(&secret);
        Self { secret, public }
    }

    pub fn public_key(&self) -> [u8; KEY_LEN] {
        self.public.to_bytes()
    }

    pub fn secret_bytes(&self) -> [u8; KEY_LEN] {
        self.secret.to_bytes()
    }

    pub fn agree(&self, their_public: &[u8; KEY_LEN]) -> [u8; KEY_LEN] {
        self.secret
            .diffie_hellman(&PublicKey::from(*their_public))
            .to_bytes()
    }
}

pub(crate) fn public_key_from_slice(bytes: &[u8]) -> Result<[u8; KEY_LEN]> {
    bytes.try_into().map_err(|_| {
        ProtocolError::InvalidKey(format!(
            "public key must be {KEY_LEN} bytes, got {}",
            bytes.len()
        ))
    })
}

pub(crate) fn hkdf_expand<const N: usize>(
    salt: Option<&[u8]>,
    ikm: &[u8],
    info: &[u8],
) -> Result<[u8; N]> {
    let hk = Hkdf::<Sha256>::new(salt, ikm);
    let mut okm = [0u8; N];
    hk.expand(info, &mut okm)
        .map_err(|_| ProtocolError::InvalidKey("hkdf expansion failed".into()))?;
    Ok(okm)
}
