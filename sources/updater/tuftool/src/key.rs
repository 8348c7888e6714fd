//! Role key pairs: generation, key files, and signing.
//!
//! Keys live under the repository's keys directory as `<role>/<keyid>.pem`. A plaintext key file
//! is a PKCS#8 `PRIVATE KEY` PEM block. When a passphrase is supplied, keys for the offline roles
//! (root and targets) are stored in an `ENCRYPTED TUFTOOL KEY` block instead, holding
//! `salt || nonce || ciphertext`: the PKCS#8 document sealed with ChaCha20-Poly1305 under a key
//! derived from the passphrase with PBKDF2-HMAC-SHA256.

use crate::error::{self, Result};
use crate::write_atomic;
use log::debug;
use ring::aead::{Aad, LessSafeKey, Nonce, UnboundKey, CHACHA20_POLY1305, NONCE_LEN};
use ring::pbkdf2;
use ring::rand::{SecureRandom, SystemRandom};
use ring::signature::{Ed25519KeyPair, KeyPair as _};
use snafu::{ensure, OptionExt, ResultExt};
use std::collections::BTreeMap;
use std::fs;
use std::io::ErrorKind;
use std::num::NonZeroU32;
use std::path::{Path, PathBuf};
use tuf_schema::decoded::{Decoded, Hex};
use tuf_schema::key::Key;
use tuf_schema::{Role, RoleType, Root, Signature, Signed};

const PLAIN_TAG: &str = "PRIVATE KEY";
const ENCRYPTED_TAG: &str = "ENCRYPTED TUFTOOL KEY";
const SALT_LEN: usize = 16;
const PBKDF2_ITERATIONS: u32 = 100_000;

/// An Ed25519 key pair held by the publisher.
#[derive(Debug)]
pub struct KeyPair {
    pkcs8: Vec<u8>,
    pair: Ed25519KeyPair,
}

impl KeyPair {
    pub fn generate() -> Result<Self> {
        let pkcs8 = Ed25519KeyPair::generate_pkcs8(&SystemRandom::new())
            .ok()
            .context(error::KeyGenerateSnafu)?;
        Self::from_pkcs8(pkcs8.as_ref().to_vec())
    }

    fn from_pkcs8(pkcs8: Vec<u8>) -> Result<Self> {
        let pair = Ed25519KeyPair::from_pkcs8(&pkcs8).context(error::KeyRejectedSnafu)?;
        Ok(Self { pkcs8, pair })
    }

    pub fn public_key(&self) -> Key {
        Key::ed25519(self.pair.public_key().as_ref())
    }

    pub fn key_id(&self) -> Result<Decoded<Hex>> {
        self.public_key().key_id().context(error::KeyIdSnafu)
    }

    pub fn sign(&self, msg: &[u8]) -> Vec<u8> {
        self.pair.sign(msg).as_ref().to_vec()
    }

    /// Encodes the private key as PEM, encrypted if `passphrase` is given.
    pub fn to_pem(&self, passphrase: Option<&str>) -> Result<String> {
        let block = match passphrase {
            None => pem::Pem {
                tag: PLAIN_TAG.to_owned(),
                contents: self.pkcs8.clone(),
            },
            Some(passphrase) => pem::Pem {
                tag: ENCRYPTED_TAG.to_owned(),
                contents: encrypt(&self.pkcs8, passphrase)?,
            },
        };
        Ok(pem::encode(&block))
    }

    /// Parses a key file written by [`KeyPair::to_pem`]. `path` is only used in errors.
    pub fn from_pem(data: &[u8], passphrase: Option<&str>, path: &Path) -> Result<Self> {
        let block = pem::parse(data)
            .ok()
            .context(error::KeyUnrecognizedSnafu { path })?;
        match block.tag.as_str() {
            PLAIN_TAG => Self::from_pkcs8(block.contents),
            ENCRYPTED_TAG => {
                let passphrase = passphrase.context(error::KeyPassphraseSnafu { path })?;
                Self::from_pkcs8(decrypt(block.contents, passphrase, path)?)
            }
            _ => error::KeyUnrecognizedSnafu { path }.fail(),
        }
    }
}

fn derive_key(passphrase: &str, salt: &[u8]) -> Option<LessSafeKey> {
    let mut key = [0; 32];
    let iterations = NonZeroU32::new(PBKDF2_ITERATIONS).unwrap_or(NonZeroU32::MIN);
    pbkdf2::derive(
        pbkdf2::PBKDF2_HMAC_SHA256,
        iterations,
        salt,
        passphrase.as_bytes(),
        &mut key,
    );
    UnboundKey::new(&CHACHA20_POLY1305, &key)
        .ok()
        .map(LessSafeKey::new)
}

fn encrypt(plaintext: &[u8], passphrase: &str) -> Result<Vec<u8>> {
    let rng = SystemRandom::new();
    let mut salt = [0; SALT_LEN];
    let mut nonce = [0; NONCE_LEN];
    rng.fill(&mut salt).ok().context(error::KeyEncryptSnafu)?;
    rng.fill(&mut nonce).ok().context(error::KeyEncryptSnafu)?;

    let mut sealed = plaintext.to_vec();
    derive_key(passphrase, &salt)
        .context(error::KeyEncryptSnafu)?
        .seal_in_place_append_tag(Nonce::assume_unique_for_key(nonce), Aad::empty(), &mut sealed)
        .ok()
        .context(error::KeyEncryptSnafu)?;

    let mut out = Vec::with_capacity(SALT_LEN + NONCE_LEN + sealed.len());
    out.extend_from_slice(&salt);
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&sealed);
    Ok(out)
}

fn decrypt(mut contents: Vec<u8>, passphrase: &str, path: &Path) -> Result<Vec<u8>> {
    ensure!(
        contents.len() > SALT_LEN + NONCE_LEN,
        error::KeyDecryptSnafu { path }
    );
    let mut sealed = contents.split_off(SALT_LEN + NONCE_LEN);
    let (salt, nonce) = contents.split_at(SALT_LEN);
    let nonce = Nonce::try_assume_unique_for_key(nonce)
        .ok()
        .context(error::KeyDecryptSnafu { path })?;
    let plaintext = derive_key(passphrase, salt)
        .context(error::KeyDecryptSnafu { path })?
        .open_in_place(nonce, Aad::empty(), &mut sealed)
        .ok()
        .context(error::KeyDecryptSnafu { path })?;
    Ok(plaintext.to_vec())
}

// =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=

/// The private keys available to the publisher, indexed by key ID.
#[derive(Debug, Default)]
pub struct Keyring {
    dir: PathBuf,
    keys: BTreeMap<Decoded<Hex>, KeyPair>,
    unsaved: Vec<(RoleType, Decoded<Hex>)>,
}

impl Keyring {
    /// Loads every key file under `dir`. Missing role directories are fine: the root key in
    /// particular is often kept somewhere else.
    pub fn load(dir: &Path, passphrase: Option<&str>) -> Result<Self> {
        let mut keyring = Self {
            dir: dir.to_owned(),
            ..Self::default()
        };
        for role in RoleType::ALL {
            let role_dir = dir.join(role.to_string());
            let entries = match fs::read_dir(&role_dir) {
                Ok(entries) => entries,
                Err(err) if err.kind() == ErrorKind::NotFound => continue,
                Err(err) => return Err(err).context(error::FileReadSnafu { path: role_dir }),
            };
            for entry in entries {
                let path = entry
                    .context(error::FileReadSnafu { path: &role_dir })?
                    .path();
                if path.extension().map_or(true, |ext| ext != "pem") {
                    continue;
                }
                let data = fs::read(&path).context(error::FileReadSnafu { path: &path })?;
                let pair = KeyPair::from_pem(&data, passphrase, &path)?;
                debug!("Loaded {} key from {}", role, path.display());
                keyring.keys.insert(pair.key_id()?, pair);
            }
        }
        Ok(keyring)
    }

    fn key_path(&self, role: RoleType, keyid: &Decoded<Hex>) -> PathBuf {
        self.dir.join(role.to_string()).join(format!("{keyid}.pem"))
    }

    /// Adds a freshly generated key for `role`. The key is usable for signing right away but is
    /// only written to disk by [`Keyring::save`], so an aborted operation leaves no stray key
    /// files behind.
    pub fn add(&mut self, role: RoleType, pair: KeyPair) -> Result<Decoded<Hex>> {
        let keyid = pair.key_id()?;
        self.keys.insert(keyid.clone(), pair);
        self.unsaved.push((role, keyid.clone()));
        Ok(keyid)
    }

    /// Writes the key files for keys added since the last save. Offline role keys are encrypted
    /// when a passphrase is supplied; online role keys never are, since they are used unattended.
    pub fn save(&mut self, passphrase: Option<&str>) -> Result<()> {
        for (role, keyid) in std::mem::take(&mut self.unsaved) {
            let Some(pair) = self.keys.get(&keyid) else {
                continue;
            };
            let passphrase = passphrase.filter(|_| role.is_offline());
            let parent = self.dir.join(role.to_string());
            fs::create_dir_all(&parent).context(error::DirCreateSnafu { path: parent })?;
            write_atomic(&self.key_path(role, &keyid), pair.to_pem(passphrase)?.as_bytes())?;
            debug!("Saved new {} key {}", role, keyid);
        }
        Ok(())
    }

    /// Removes the key file for `keyid` under `role`, if present, and forgets the key.
    pub fn remove(&mut self, role: RoleType, keyid: &Decoded<Hex>) -> Result<()> {
        let path = self.key_path(role, keyid);
        match fs::remove_file(&path) {
            Ok(()) => {}
            Err(err) if err.kind() == ErrorKind::NotFound => {}
            Err(err) => return Err(err).context(error::FileRemoveSnafu { path }),
        }
        self.keys.remove(keyid);
        Ok(())
    }

    pub fn get(&self, keyid: &Decoded<Hex>) -> Option<&KeyPair> {
        self.keys.get(keyid)
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

/// Signs `role` with every available key `root` authorizes for it, and checks that the
/// signatures meet the role's threshold. Nothing is written; callers persist the result only
/// once every role in a publication has been signed.
pub fn sign_role<T: Role>(root: &Root, keyring: &Keyring, role: T) -> Result<Signed<T>> {
    let mut signed = Signed::unsigned(role);
    add_signatures(root, keyring, &mut signed)?;
    root.verify_role(&signed)
        .context(error::SignThresholdSnafu { role: T::TYPE })?;
    Ok(signed)
}

/// Signs a new root with the keys of both the current root and the new root itself, and checks
/// that a client trusting `current` would accept it.
pub fn sign_root_successor(current: &Root, keyring: &Keyring, next: Root) -> Result<Signed<Root>> {
    let mut signed = Signed::unsigned(next);
    add_signatures(current, keyring, &mut signed)?;
    let next = signed.signed.clone();
    add_signatures(&next, keyring, &mut signed)?;
    current
        .verify_successor(&signed)
        .context(error::SignThresholdSnafu {
            role: RoleType::Root,
        })?;
    Ok(signed)
}

fn add_signatures<T: Role>(authority: &Root, keyring: &Keyring, role: &mut Signed<T>) -> Result<()> {
    let Some(role_keys) = authority.roles.get(&T::TYPE) else {
        return Ok(());
    };
    let data = role
        .signed
        .canonical_form()
        .context(error::SignJsonSnafu { role: T::TYPE })?;
    for keyid in &role_keys.keyids {
        if role.signatures.iter().any(|sig| sig.keyid == *keyid) {
            continue;
        }
        if let Some(pair) = keyring.get(keyid) {
            role.signatures.push(Signature {
                keyid: keyid.clone(),
                sig: pair.sign(&data).into(),
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plaintext_key_file_round_trip() {
        let pair = KeyPair::generate().unwrap();
        let pem = pair.to_pem(None).unwrap();
        assert!(pem.contains("BEGIN PRIVATE KEY"));
        let back = KeyPair::from_pem(pem.as_bytes(), None, Path::new("k.pem")).unwrap();
        assert_eq!(back.public_key(), pair.public_key());
    }

    #[test]
    fn encrypted_key_needs_passphrase() {
        let pair = KeyPair::generate().unwrap();
        let pem = pair.to_pem(Some("hunter2")).unwrap();
        assert!(pem.contains("BEGIN ENCRYPTED TUFTOOL KEY"));

        let path = Path::new("root.pem");
        let back = KeyPair::from_pem(pem.as_bytes(), Some("hunter2"), path).unwrap();
        assert_eq!(back.key_id().unwrap(), pair.key_id().unwrap());

        assert!(matches!(
            KeyPair::from_pem(pem.as_bytes(), None, path),
            Err(error::Error::KeyPassphrase { .. })
        ));
        assert!(matches!(
            KeyPair::from_pem(pem.as_bytes(), Some("hunter3"), path),
            Err(error::Error::KeyDecrypt { .. })
        ));
    }

    #[test]
    fn keyring_encrypts_offline_roles_only() {
        let dir = tempfile::tempdir().unwrap();
        let mut keyring = Keyring::load(dir.path(), None).unwrap();
        assert!(keyring.is_empty());

        let root_id = keyring
            .add(RoleType::Root, KeyPair::generate().unwrap())
            .unwrap();
        let ts_id = keyring
            .add(RoleType::Timestamp, KeyPair::generate().unwrap())
            .unwrap();
        assert!(Keyring::load(dir.path(), None).unwrap().is_empty());
        keyring.save(Some("pw")).unwrap();

        let root_file = fs::read_to_string(keyring.key_path(RoleType::Root, &root_id)).unwrap();
        assert!(root_file.contains(ENCRYPTED_TAG));
        let ts_file = fs::read_to_string(keyring.key_path(RoleType::Timestamp, &ts_id)).unwrap();
        assert!(ts_file.contains("BEGIN PRIVATE KEY"));

        let reloaded = Keyring::load(dir.path(), Some("pw")).unwrap();
        assert_eq!(reloaded.len(), 2);
        assert!(reloaded.get(&root_id).is_some());

        // Without the passphrase the encrypted root key can't be read at all.
        assert!(Keyring::load(dir.path(), None).is_err());

        keyring.remove(RoleType::Root, &root_id).unwrap();
        assert_eq!(Keyring::load(dir.path(), None).unwrap().len(), 1);
    }
}
