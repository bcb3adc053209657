//! Pairwise ratchet sessions, sealed sender envelopes and sender keys.
//!
//! Callers own persistence through [`ProtocolStore`] and are expected to serialize
//! access per device; nothing here locks.

pub mod bundle;
pub mod error;
pub mod keys;
pub mod responder;
pub mod sealed;
pub mod sender_keys;
pub mod session;
pub mod session_cipher;
pub mod store;

pub use bundle::{OneTimePreKey, PreKeyBundle, SignedPreKey};
pub use error::ProtocolError;
pub use keys::{IdentityKey, IdentityKeyPair};
pub use responder::{DeviceKeys, ReceivingSession};
pub use sealed::{
    sealed_sender_decrypt, sealed_sender_encrypt, sealed_sender_multi_recipient_decrypt,
    sealed_sender_multi_recipient_encrypt, MultiRecipientMessage, SealedSenderRecipient,
    SenderCertificate, UnidentifiedSenderContent,
};
pub use sender_keys::{
    create_sender_key_distribution_message, group_encrypt, SenderKeyDistributionMessage,
    SenderKeyReceiver, SenderKeyRecord,
};
pub use session::SessionRecord;
pub use session_cipher::{
    encrypt, process_prekey_bundle, unwrap_plaintext_content, wrap_plaintext_content,
    CiphertextKind, CiphertextMessage,
};
pub use store::{ProtocolStore, TrustLevel};

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
