use crate::canonical::to_canonical_bytes;
use crate::decoded::{Decoded, Hex};
use crate::error::Result;
use ring::digest::{digest, SHA256};
use ring::signature::{UnparsedPublicKey, ED25519, ED25519_PUBLIC_KEY_LEN};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// A public key listed in root metadata.
///
/// Only Ed25519 keys are accepted. Publishers generate them with `tuftool`; nothing else needs
/// to be parsed on the client.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
#[serde(tag = "keytype")]
pub enum Key {
    Ed25519 {
        keyval: Ed25519Key,
        scheme: Ed25519Scheme,
    },
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum Ed25519Scheme {
    Ed25519,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct Ed25519Key {
    pub public: Decoded<Hex>,
}

impl Key {
    /// Wraps raw Ed25519 public key bytes.
    pub fn ed25519(public: &[u8]) -> Self {
        Key::Ed25519 {
            keyval: Ed25519Key {
                public: public.into(),
            },
            scheme: Ed25519Scheme::Ed25519,
        }
    }

    /// Calculate the key ID for this key: the SHA-256 of its canonical JSON form.
    pub fn key_id(&self) -> Result<Decoded<Hex>> {
        let buf = to_canonical_bytes(self, "key")?;
        Ok(digest(&SHA256, &buf).as_ref().into())
    }

    /// Verify a signature of a message made with this key.
    pub(crate) fn verify(&self, msg: &[u8], signature: &[u8]) -> bool {
        match self {
            Key::Ed25519 {
                keyval,
                scheme: Ed25519Scheme::Ed25519,
            } => UnparsedPublicKey::new(&ED25519, keyval.public.as_ref())
                .verify(msg, signature)
                .is_ok(),
        }
    }
}

impl FromStr for Key {
    type Err = KeyParseError;

    /// Parses a hex-encoded Ed25519 public key.
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.parse::<Decoded<Hex>>() {
            Ok(public) if public.len() == ED25519_PUBLIC_KEY_LEN => Ok(Key::ed25519(&public)),
            _ => Err(KeyParseError(())),
        }
    }
}

#[derive(Debug)]
pub struct KeyParseError(());

impl fmt::Display for KeyParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unrecognized or invalid public key")
    }
}

impl std::error::Error for KeyParseError {}
