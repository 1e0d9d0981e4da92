//! Per-recipient fanout encryption.
//!
//! Every outgoing message is sealed once with a fresh AES-256-GCM content key.
//! That content key is then wrapped for each recipient with RSA-OAEP
//! (SHA-256 for both the digest and MGF1). The relay only ever sees the
//! wrapped keys and the sealed body, so it cannot read anything it forwards.

use std::collections::BTreeMap;
use std::fmt;

use aes_gcm::{
    Aes256Gcm, Nonce,
    aead::{Aead, KeyInit, Payload},
};
use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
use rand::{RngCore, rngs::OsRng};
use rsa::{
    Oaep, RsaPrivateKey, RsaPublicKey,
    pkcs8::{DecodePublicKey, EncodePublicKey, LineEnding},
};
use sha2::{Digest, Sha256};
use thiserror::Error;

pub const DEFAULT_KEY_BITS: usize = 2048;

const CONTENT_KEY_LEN: usize = 32;
const NONCE_LEN: usize = 12;

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("key generation failed: {0}")]
    KeyGeneration(rsa::Error),

    #[error("invalid public key: {0}")]
    InvalidPublicKey(String),

    #[error("failed to wrap content key: {0}")]
    KeyWrap(rsa::Error),

    #[error("failed to unwrap content key: {0}")]
    KeyUnwrap(rsa::Error),

    #[error("content key has the wrong length")]
    InvalidContentKey,

    #[error("failed to seal message body")]
    Seal,

    #[error("failed to open message body")]
    Open,

    #[error("invalid base64: {0}")]
    Encoding(#[from] base64::DecodeError),

    #[error("message body is not valid UTF-8")]
    Utf8(#[from] std::string::FromUtf8Error),
}

/// The local key pair. Lives for the process only and is never written out.
pub struct Identity {
    private_key: RsaPrivateKey,
    public_key: RsaPublicKey,
    public_pem: String,
    fingerprint: String,
}

impl Identity {
    pub fn generate(bits: usize) -> Result<Self, CryptoError> {
        let private_key =
            RsaPrivateKey::new(&mut OsRng, bits).map_err(CryptoError::KeyGeneration)?;
        let public_key = RsaPublicKey::from(&private_key);
        let public_pem = encode_public_key(&public_key)?;
        let fingerprint = fingerprint(&public_key)?;

        Ok(Self {
            private_key,
            public_key,
            public_pem,
            fingerprint,
        })
    }

    pub fn public_key(&self) -> &RsaPublicKey {
        &self.public_key
    }

    pub fn public_pem(&self) -> &str {
        &self.public_pem
    }

    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    /// Opens the copy of a message addressed to `username`.
    ///
    /// Returns `Ok(None)` when the envelope has no entry for `username`,
    /// which is the normal case for broadcasts meant for other peers.
    pub fn open(
        &self,
        username: &str,
        sender: &str,
        encrypted: &BTreeMap<String, String>,
        body: &str,
    ) -> Result<Option<String>, CryptoError> {
        let Some(wrapped) = encrypted.get(username) else {
            return Ok(None);
        };

        let wrapped = BASE64.decode(wrapped)?;
        let content_key = self
            .private_key
            .decrypt(Oaep::new::<Sha256>(), &wrapped)
            .map_err(CryptoError::KeyUnwrap)?;

        let sealed = BASE64.decode(body)?;
        let plaintext = open_body(&content_key, sender, &sealed)?;
        Ok(Some(String::from_utf8(plaintext)?))
    }
}

impl fmt::Debug for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Identity")
            .field("fingerprint", &self.fingerprint)
            .finish_non_exhaustive()
    }
}

pub fn parse_public_key(pem: &str) -> Result<RsaPublicKey, CryptoError> {
    RsaPublicKey::from_public_key_pem(pem.trim())
        .map_err(|err| CryptoError::InvalidPublicKey(err.to_string()))
}

pub fn encode_public_key(key: &RsaPublicKey) -> Result<String, CryptoError> {
    key.to_public_key_pem(LineEnding::LF)
        .map_err(|err| CryptoError::InvalidPublicKey(err.to_string()))
}

/// Hex SHA-256 over the DER encoding of the key.
pub fn fingerprint(key: &RsaPublicKey) -> Result<String, CryptoError> {
    let der = key
        .to_public_key_der()
        .map_err(|err| CryptoError::InvalidPublicKey(err.to_string()))?;
    Ok(hex::encode(Sha256::digest(der.as_bytes())))
}

/// Output of [`seal`]: the wire fields plus the recipients that were left out.
#[derive(Debug)]
pub struct Sealed {
    pub encrypted: BTreeMap<String, String>,
    pub body: String,
    pub skipped: Vec<(String, CryptoError)>,
}

/// Seals `plaintext` for every recipient other than `sender`.
///
/// A recipient whose key cannot wrap the content key is reported in
/// [`Sealed::skipped`] and left out of the map; the others are unaffected.
pub fn seal<'a, I>(plaintext: &str, sender: &str, recipients: I) -> Result<Sealed, CryptoError>
where
    I: IntoIterator<Item = (&'a str, &'a RsaPublicKey)>,
{
    let mut content_key = [0u8; CONTENT_KEY_LEN];
    OsRng.fill_bytes(&mut content_key);

    let body = BASE64.encode(seal_body(&content_key, sender, plaintext.as_bytes())?);

    let mut encrypted = BTreeMap::new();
    let mut skipped = Vec::new();
    for (username, public_key) in recipients {
        if username == sender {
            continue;
        }
        match public_key.encrypt(&mut OsRng, Oaep::new::<Sha256>(), &content_key) {
            Ok(wrapped) => {
                encrypted.insert(username.to_string(), BASE64.encode(wrapped));
            }
            Err(err) => skipped.push((username.to_string(), CryptoError::KeyWrap(err))),
        }
    }

    Ok(Sealed {
        encrypted,
        body,
        skipped,
    })
}

// Sealed body layout: nonce (12 bytes) followed by the GCM ciphertext and tag.
// The sender's username is bound as associated data.
fn seal_body(content_key: &[u8], sender: &str, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let cipher = Aes256Gcm::new_from_slice(content_key).map_err(|_| CryptoError::InvalidContentKey)?;

    let mut nonce = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce);

    let ciphertext = cipher
        .encrypt(
            Nonce::from_slice(&nonce),
            Payload {
                msg: plaintext,
                aad: sender.as_bytes(),
            },
        )
        .map_err(|_| CryptoError::Seal)?;

    let mut sealed = Vec::with_capacity(NONCE_LEN + ciphertext.len());
    sealed.extend_from_slice(&nonce);
    sealed.extend_from_slice(&ciphertext);
    Ok(sealed)
}

fn open_body(content_key: &[u8], sender: &str, sealed: &[u8]) -> Result<Vec<u8>, CryptoError> {
    if sealed.len() < NONCE_LEN {
        return Err(CryptoError::Open);
    }
    let cipher = Aes256Gcm::new_from_slice(content_key).map_err(|_| CryptoError::InvalidContentKey)?;
    let (nonce, ciphertext) = sealed.split_at(NONCE_LEN);

    cipher
        .decrypt(
            Nonce::from_slice(nonce),
            Payload {
                msg: ciphertext,
                aad: sender.as_bytes(),
            },
        )
        .map_err(|_| CryptoError::Open)
}
