//! Credential bundle, sealed at rest with a master password.
//!
//! File layout: `salt (16) || nonce (12) || AES-256-GCM ciphertext+tag`.
//! The key is PBKDF2-HMAC-SHA256 over the password and salt.

use std::collections::BTreeMap;
use std::fmt;
use std::io::Cursor;
use std::path::{Path, PathBuf};

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::Sha256;

use crate::config::SecretsConfig;

const SALT_LEN: usize = 16;
const NONCE_LEN: usize = 12;
const KDF_ROUNDS: u32 = 100_000;

#[derive(Debug, thiserror::Error)]
pub enum SecretsError {
    #[error("encrypted secrets file {0} not found")]
    MissingFile(PathBuf),
    #[error("could not decrypt secrets: wrong password or tampered file")]
    Decrypt,
    #[error("malformed secrets: {0}")]
    Malformed(String),
    #[error("required credential {0} is missing")]
    MissingCredential(String),
    #[error("secrets i/o on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

fn derive_key(password: &str, salt: &[u8]) -> [u8; 32] {
    let mut key = [0u8; 32];
    pbkdf2::pbkdf2_hmac::<Sha256>(password.as_bytes(), salt, KDF_ROUNDS, &mut key);
    key
}

/// Encrypts `plaintext` under `password` with a fresh salt and nonce.
pub fn seal(plaintext: &[u8], password: &str) -> Result<Vec<u8>, SecretsError> {
    let mut salt = [0u8; SALT_LEN];
    let mut nonce = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut salt);
    OsRng.fill_bytes(&mut nonce);

    let key = derive_key(password, &salt);
    let cipher = Aes256Gcm::new_from_slice(&key)
        .map_err(|e| SecretsError::Malformed(format!("key: {e}")))?;
    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&nonce), plaintext)
        .map_err(|_| SecretsError::Malformed("encryption failed".to_string()))?;

    let mut out = Vec::with_capacity(SALT_LEN + NONCE_LEN + ciphertext.len());
    out.extend_from_slice(&salt);
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

/// Decrypts a blob produced by [`seal`].
pub fn open(blob: &[u8], password: &str) -> Result<Vec<u8>, SecretsError> {
    if blob.len() < SALT_LEN + NONCE_LEN {
        return Err(SecretsError::Malformed(format!(
            "file is {} bytes, shorter than its header",
            blob.len()
        )));
    }
    let (salt, rest) = blob.split_at(SALT_LEN);
    let (nonce, ciphertext) = rest.split_at(NONCE_LEN);
    let key = derive_key(password, salt);
    let cipher = Aes256Gcm::new_from_slice(&key)
        .map_err(|e| SecretsError::Malformed(format!("key: {e}")))?;
    cipher
        .decrypt(Nonce::from_slice(nonce), ciphertext)
        .map_err(|_| SecretsError::Decrypt)
}

/// Decrypted `KEY=VALUE` credentials. Never printed.
#[derive(Clone, Default)]
pub struct SecretBundle {
    values: BTreeMap<String, String>,
}

impl fmt::Debug for SecretBundle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecretBundle")
            .field("keys", &self.values.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl SecretBundle {
    /// Parses dotenv text. Error messages never echo the offending line,
    /// which may hold a credential.
    pub fn parse(text: &str) -> Result<Self, SecretsError> {
        let mut values = BTreeMap::new();
        for (n, entry) in dotenv::from_read_iter(Cursor::new(text.as_bytes())).enumerate() {
            let (key, value) = entry.map_err(|e| match e {
                dotenv::Error::LineParse(..) => {
                    SecretsError::Malformed(format!("entry {} is not KEY=VALUE", n + 1))
                }
                other => SecretsError::Malformed(format!("entry {}: {}", n + 1, redacted_kind(&other))),
            })?;
            values.insert(key, value);
        }
        Ok(Self { values })
    }

    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            values: pairs.into_iter().map(|(k, v)| (k.into(), v.into())).collect(),
        }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.values.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Fails on the first name in `names` that is absent.
    pub fn require<'a>(&self, names: impl IntoIterator<Item = &'a String>) -> Result<(), SecretsError> {
        for name in names {
            if !self.values.contains_key(name.as_str()) {
                return Err(SecretsError::MissingCredential(name.clone()));
            }
        }
        Ok(())
    }
}

fn redacted_kind(e: &dotenv::Error) -> &'static str {
    match e {
        dotenv::Error::Io(_) => "unreadable",
        dotenv::Error::EnvVar(_) => "bad variable reference",
        _ => "unparseable",
    }
}

fn resolve(base_dir: &Path, p: &Path) -> PathBuf {
    if p.is_absolute() {
        p.to_path_buf()
    } else {
        base_dir.join(p)
    }
}

fn read(path: &Path) -> Result<Vec<u8>, SecretsError> {
    std::fs::read(path).map_err(|source| SecretsError::Io {
        path: path.to_path_buf(),
        source,
    })
}

/// Loads the bundle. With a password the encrypted file must exist and
/// decrypt; without one the plaintext file is used if present.
pub fn load_with_password(
    cfg: &SecretsConfig,
    base_dir: &Path,
    password: Option<&str>,
) -> Result<SecretBundle, SecretsError> {
    let bundle = match password {
        Some(password) => {
            let path = resolve(base_dir, &cfg.encrypted_file);
            if !path.exists() {
                return Err(SecretsError::MissingFile(path));
            }
            let plain = open(&read(&path)?, password)?;
            let text = String::from_utf8(plain)
                .map_err(|_| SecretsError::Malformed("bundle is not utf-8".to_string()))?;
            SecretBundle::parse(&text)?
        }
        None => {
            tracing::warn!(
                env = %cfg.password_env,
                "master password not set; falling back to plaintext secrets"
            );
            let path = resolve(base_dir, &cfg.plaintext_file);
            if path.exists() {
                let text = String::from_utf8(read(&path)?)
                    .map_err(|_| SecretsError::Malformed("bundle is not utf-8".to_string()))?;
                SecretBundle::parse(&text)?
            } else {
                SecretBundle::default()
            }
        }
    };
    bundle.require(&cfg.required)?;
    tracing::info!(credentials = bundle.len(), "secrets loaded");
    Ok(bundle)
}

/// Like [`load_with_password`], reading the password from `cfg.password_env`.
pub fn load(cfg: &SecretsConfig, base_dir: &Path) -> Result<SecretBundle, SecretsError> {
    let password = std::env::var(&cfg.password_env).ok().filter(|p| !p.is_empty());
    load_with_password(cfg, base_dir, password.as_deref())
}
