use chacha20poly1305::{
    aead::{Aead, KeyInit},
    ChaCha20Poly1305, Nonce,
};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use shared::domain::{RecipientDevice, RegistrationId};
use zeroize::Zeroize;

use crate::{
    bundle::PreKeyBundle,
    error::{ProtocolError, Result},
    keys::{hkdf_expand, AgreementKeyPair, IdentityKey, KEY_LEN},
    session::{PendingPreKey, SessionRecord, SESSION_VERSION},
    store::{ProtocolStore, TrustLevel},
};

const X3DH_INFO: &[u8] = b"delivery-ratchet-x3dh";
const PLAINTEXT_CONTENT_MARKER: u8 = 0xC0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CiphertextKind {
    Whisper,
    PreKey,
    SenderKey,
    Plaintext,
}

impl CiphertextKind {
    pub fn as_u8(self) -> u8 {
        match self {
            CiphertextKind::Whisper => 2,
            CiphertextKind::PreKey => 3,
            CiphertextKind::SenderKey => 7,
            CiphertextKind::Plaintext => 8,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CiphertextMessage {
    pub kind: CiphertextKind,
    pub serialized: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WhisperMessage {
    pub version: u8,
    pub counter: u32,
    pub ciphertext: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreKeyMessage {
    pub registration_id: RegistrationId,
    pub signed_prekey_id: u32,
    pub one_time_prekey_id: Option<u32>,
    pub pq_prekey_id: Option<u32>,
    pub base_key: [u8; KEY_LEN],
    pub identity_key: IdentityKey,
    pub message: WhisperMessage,
}

/// Inputs shared by both sides of the initial agreement.
pub(crate) fn agreement_material(
    dh1: [u8; KEY_LEN],
    dh2: [u8; KEY_LEN],
    dh3: [u8; KEY_LEN],
    dh4: Option<[u8; KEY_LEN]>,
    pq_public: Option<&[u8; KEY_LEN]>,
) -> Result<([u8; KEY_LEN], [u8; KEY_LEN])> {
    let mut ikm = vec![0xFFu8; KEY_LEN];
    ikm.extend_from_slice(&dh1);
    ikm.extend_from_slice(&dh2);
    ikm.extend_from_slice(&dh3);
    if let Some(dh4) = dh4 {
        ikm.extend_from_slice(&dh4);
    }
    if let Some(pq_public) = pq_public {
        ikm.extend_from_slice(&Sha256::digest(pq_public));
    }
    let okm: [u8; KEY_LEN * 2] = hkdf_expand(None, &ikm, X3DH_INFO)?;
    ikm.zeroize();

    let mut root_key = [0u8; KEY_LEN];
    let mut chain_key = [0u8; KEY_LEN];
    root_key.copy_from_slice(&okm[..KEY_LEN]);
    chain_key.copy_from_slice(&okm[KEY_LEN..]);
    Ok((root_key, chain_key))
}

/// Verifies the bundle, checks the remote identity and stores a fresh session.
///
/// An identity that is unknown gets trusted on first use. A changed identity, or one
/// still awaiting approval, yields [`ProtocolError::UntrustedIdentity`] and nothing
/// is stored.
pub async fn process_prekey_bundle<S: ProtocolStore + ?Sized>(
    store: &S,
    address: &RecipientDevice,
    bundle: &PreKeyBundle,
) -> Result<()> {
    let identity = bundle.identity_key;
    if !identity.verify(
        &bundle.signed_prekey.public_key,
        &bundle.signed_prekey.signature,
    ) {
        return Err(ProtocolError::InvalidSignature(address.clone()));
    }
    if let Some(pq) = &bundle.pq_prekey {
        if !identity.verify(&pq.public_key, &pq.signature) {
            return Err(ProtocolError::InvalidSignature(address.clone()));
        }
    }

    match store.load_identity(&address.service_id).await? {
        None => {
            store
                .save_identity(&address.service_id, &identity, TrustLevel::Trusted)
                .await?;
        }
        Some((known, TrustLevel::Trusted)) if known == identity => {}
        Some(_) => {
            return Err(ProtocolError::UntrustedIdentity {
                service_id: address.service_id.clone(),
                identity,
            });
        }
    }

    let local_identity = store.local_identity().await?;
    let local_registration_id = store.local_registration_id().await?;
    let ephemeral = AgreementKeyPair::generate();

    let spk = &bundle.signed_prekey.public_key;
    let dh1 = local_identity.agree(spk);
    let dh2 = ephemeral.agree(&identity.agreement);
    let dh3 = ephemeral.agree(spk);
    let dh4 = bundle
        .one_time_prekey
        .as_ref()
        .map(|otpk| ephemeral.agree(&otpk.public_key));
    let (root_key, chain_key) = agreement_material(
        dh1,
        dh2,
        dh3,
        dh4,
        bundle.pq_prekey.as_ref().map(|pq| &pq.public_key),
    )?;

    let record = SessionRecord::new_initiated(
        local_registration_id,
        bundle.registration_id,
        identity,
        root_key,
        chain_key,
        PendingPreKey {
            signed_prekey_id: bundle.signed_prekey.id,
            one_time_prekey_id: bundle.one_time_prekey.as_ref().map(|otpk| otpk.id),
            pq_prekey_id: bundle.pq_prekey.as_ref().map(|pq| pq.id),
            base_key: ephemeral.public_key(),
        },
    );
    store.store_session(address, &record).await?;
    Ok(())
}

/// Encrypts with the current session and advances its chain.
pub async fn encrypt<S: ProtocolStore + ?Sized>(
    store: &S,
    address: &RecipientDevice,
    plaintext: &[u8],
) -> Result<CiphertextMessage> {
    let mut record = store
        .load_session(address)
        .await?
        .filter(SessionRecord::is_valid)
        .ok_or_else(|| ProtocolError::NoSession(address.clone()))?;

    let mut keys = record.next_message_keys()?;
    let ciphertext = seal(&keys.key, &keys.nonce, plaintext)?;
    let whisper = WhisperMessage {
        version: SESSION_VERSION,
        counter: keys.index,
        ciphertext,
    };
    keys.key.zeroize();

    let message = match record.pending_prekey() {
        Some(pending) => {
            let local_identity = store.local_identity().await?;
            let prekey_message = PreKeyMessage {
                registration_id: record.local_registration_id(),
                signed_prekey_id: pending.signed_prekey_id,
                one_time_prekey_id: pending.one_time_prekey_id,
                pq_prekey_id: pending.pq_prekey_id,
                base_key: pending.base_key,
                identity_key: local_identity.public_key(),
                message: whisper,
            };
            CiphertextMessage {
                kind: CiphertextKind::PreKey,
                serialized: serde_json::to_vec(&prekey_message)?,
            }
        }
        None => CiphertextMessage {
            kind: CiphertextKind::Whisper,
            serialized: serde_json::to_vec(&whisper)?,
        },
    };

    store.store_session(address, &record).await?;
    Ok(message)
}

/// Wraps content that is sent without a session (resend requests).
pub fn wrap_plaintext_content(content: &[u8]) -> CiphertextMessage {
    let mut serialized = Vec::with_capacity(content.len() + 1);
    serialized.push(PLAINTEXT_CONTENT_MARKER);
    serialized.extend_from_slice(content);
    CiphertextMessage {
        kind: CiphertextKind::Plaintext,
        serialized,
    }
}

pub fn unwrap_plaintext_content(serialized: &[u8]) -> Result<&[u8]> {
    match serialized.split_first() {
        Some((&PLAINTEXT_CONTENT_MARKER, content)) => Ok(content),
        _ => Err(ProtocolError::InvalidMessage(
            "missing plaintext content marker".into(),
        )),
    }
}

pub(crate) fn seal(key: &[u8; KEY_LEN], nonce: &[u8; 12], plaintext: &[u8]) -> Result<Vec<u8>> {
    ChaCha20Poly1305::new(key.into())
        .encrypt(Nonce::from_slice(nonce), plaintext)
        .map_err(|_| ProtocolError::Encryption)
}

pub(crate) fn open(key: &[u8; KEY_LEN], nonce: &[u8; 12], ciphertext: &[u8]) -> Result<Vec<u8>> {
    ChaCha20Poly1305::new(key.into())
        .decrypt(Nonce::from_slice(nonce), ciphertext)
        .map_err(|_| ProtocolError::Decryption)
}
