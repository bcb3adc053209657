use std::collections::HashMap;

use ed25519_dalek::{Signer, SigningKey};
use rand::{rngs::OsRng, RngCore};
use serde::{Deserialize, Serialize};
use shared::domain::{DistributionId, RecipientDevice};
use zeroize::Zeroize;

use crate::{
    error::{ProtocolError, Result},
    keys::{hkdf_expand, IdentityKey, KEY_LEN},
    session::derive_message_keys,
    session_cipher::{open, seal},
    store::ProtocolStore,
};

/// Largest gap a receiver will step its chain forward to catch up.
const MAX_FORWARD_JUMPS: u32 = 2_000;

/// Sending or receiving state for one sender's chain in one distribution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SenderKeyRecord {
    pub distribution_id: DistributionId,
    pub chain_id: u32,
    pub iteration: u32,
    chain_key: [u8; KEY_LEN],
    signing_public: [u8; KEY_LEN],
    signing_secret: Option<[u8; KEY_LEN]>,
}

impl SenderKeyRecord {
    fn generate(distribution_id: DistributionId) -> Self {
        let signing = SigningKey::generate(&mut OsRng);
        let mut chain_key = [0u8; KEY_LEN];
        OsRng.fill_bytes(&mut chain_key);
        Self {
            distribution_id,
            chain_id: OsRng.next_u32() & 0x7FFF_FFFF,
            iteration: 0,
            chain_key,
            signing_public: signing.verifying_key().to_bytes(),
            signing_secret: Some(signing.to_bytes()),
        }
    }

    fn advance(&mut self) -> Result<()> {
        self.chain_key = hkdf_expand(None, &self.chain_key, b"sender-chain-key")?;
        self.iteration += 1;
        Ok(())
    }

    pub fn serialize(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn deserialize(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SenderKeyDistributionMessage {
    pub distribution_id: DistributionId,
    pub chain_id: u32,
    pub iteration: u32,
    pub chain_key: [u8; KEY_LEN],
    pub signing_public: [u8; KEY_LEN],
}

impl SenderKeyDistributionMessage {
    pub fn serialize(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn deserialize(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct SenderKeyMessage {
    distribution_id: DistributionId,
    chain_id: u32,
    iteration: u32,
    ciphertext: Vec<u8>,
    signature: Vec<u8>,
}

fn signed_portion(
    distribution_id: DistributionId,
    chain_id: u32,
    iteration: u32,
    ciphertext: &[u8],
) -> Vec<u8> {
    let mut out = Vec::with_capacity(24 + ciphertext.len());
    out.extend_from_slice(distribution_id.0.as_bytes());
    out.extend_from_slice(&chain_id.to_be_bytes());
    out.extend_from_slice(&iteration.to_be_bytes());
    out.extend_from_slice(ciphertext);
    out
}

/// Returns the distribution message for the local sender key, creating the key if needed.
pub async fn create_sender_key_distribution_message<S: ProtocolStore + ?Sized>(
    store: &S,
    sender: &RecipientDevice,
    distribution_id: DistributionId,
) -> Result<SenderKeyDistributionMessage> {
    let record = match store.load_sender_key(sender, distribution_id).await? {
        Some(record) if record.signing_secret.is_some() => record,
        _ => {
            let record = SenderKeyRecord::generate(distribution_id);
            store
                .store_sender_key(sender, distribution_id, &record)
                .await?;
            record
        }
    };
    Ok(SenderKeyDistributionMessage {
        distribution_id,
        chain_id: record.chain_id,
        iteration: record.iteration,
        chain_key: record.chain_key,
        signing_public: record.signing_public,
    })
}

pub async fn group_encrypt<S: ProtocolStore + ?Sized>(
    store: &S,
    sender: &RecipientDevice,
    distribution_id: DistributionId,
    plaintext: &[u8],
) -> Result<Vec<u8>> {
    let mut record = store
        .load_sender_key(sender, distribution_id)
        .await?
        .ok_or(ProtocolError::NoSenderKey(distribution_id.0))?;
    let signing_secret = record
        .signing_secret
        .ok_or(ProtocolError::NoSenderKey(distribution_id.0))?;

    let mut keys = derive_message_keys(&record.chain_key, record.iteration)?;
    let ciphertext = seal(&keys.key, &keys.nonce, plaintext)?;
    keys.key.zeroize();

    let signature = SigningKey::from_bytes(&signing_secret)
        .sign(&signed_portion(
            distribution_id,
            record.chain_id,
            record.iteration,
            &ciphertext,
        ))
        .to_bytes()
        .to_vec();
    let message = SenderKeyMessage {
        distribution_id,
        chain_id: record.chain_id,
        iteration: record.iteration,
        ciphertext,
        signature,
    };

    record.advance()?;
    store
        .store_sender_key(sender, distribution_id, &record)
        .await?;
    Ok(serde_json::to_vec(&message)?)
}

/// Receiver-side state for the distributions a device has been handed.
#[derive(Default)]
pub struct SenderKeyReceiver {
    chains: HashMap<DistributionId, SenderKeyRecord>,
}

impl SenderKeyReceiver {
    pub fn process(&mut self, message: &SenderKeyDistributionMessage) {
        self.chains.insert(
            message.distribution_id,
            SenderKeyRecord {
                distribution_id: message.distribution_id,
                chain_id: message.chain_id,
                iteration: message.iteration,
                chain_key: message.chain_key,
                signing_public: message.signing_public,
                signing_secret: None,
            },
        );
    }

    pub fn decrypt(&mut self, serialized: &[u8]) -> Result<Vec<u8>> {
        let message: SenderKeyMessage = serde_json::from_slice(serialized)?;
        let record = self
            .chains
            .get_mut(&message.distribution_id)
            .ok_or(ProtocolError::NoSenderKey(message.distribution_id.0))?;
        if record.chain_id != message.chain_id {
            return Err(ProtocolError::InvalidMessage("sender key chain changed".into()));
        }
        if message.iteration < record.iteration
            || message.iteration - record.iteration > MAX_FORWARD_JUMPS
        {
            return Err(ProtocolError::InvalidMessage(format!(
                "sender key iteration {} out of range",
                message.iteration
            )));
        }

        let verifier = IdentityKey {
            signing: record.signing_public,
            agreement: [0u8; KEY_LEN],
        };
        let signed = signed_portion(
            message.distribution_id,
            message.chain_id,
            message.iteration,
            &message.ciphertext,
        );
        if !verifier.verify(&signed, &message.signature) {
            return Err(ProtocolError::InvalidMessage(
                "sender key signature mismatch".into(),
            ));
        }

        while record.iteration < message.iteration {
            record.advance()?;
        }
        let keys = derive_message_keys(&record.chain_key, record.iteration)?;
        let plaintext = open(&keys.key, &keys.nonce, &message.ciphertext)?;
        record.advance()?;
        Ok(plaintext)
    }
}
