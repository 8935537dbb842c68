use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{CryptoError, CryptoResult};

/// Default PBKDF2 iteration count for password-derived keys.
pub const DEFAULT_PBKDF2_ITERATIONS: u32 = 10_000;

fn default_iterations() -> u32 {
    DEFAULT_PBKDF2_ITERATIONS
}

/// Where an encrypted store gets its key material.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum KeySource {
    /// A 256-bit key stored under `alias` in a keystore file.
    Keystore { path: PathBuf, alias: String },
    /// A key derived per blob from a password and a random salt.
    Password {
        password: String,
        #[serde(default = "default_iterations")]
        iterations: u32,
    },
}

impl fmt::Debug for KeySource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Keystore { path, alias } => f
                .debug_struct("Keystore")
                .field("path", path)
                .field("alias", alias)
                .finish(),
            Self::Password { iterations, .. } => f
                .debug_struct("Password")
                .field("password", &"<redacted>")
                .field("iterations", iterations)
                .finish(),
        }
    }
}

/// A JSON file mapping key aliases to hex-encoded 256-bit keys:
///
/// ```json
/// { "keys": { "blobs-2024": "000102...1f" } }
/// ```
#[derive(Clone, Default, Serialize, Deserialize)]
pub struct Keystore {
    keys: HashMap<String, String>,
}

impl Keystore {
    pub fn load(path: &Path) -> CryptoResult<Self> {
        let data = std::fs::read(path)
            .map_err(|e| CryptoError::Keystore(format!("{}: {e}", path.display())))?;
        serde_json::from_slice(&data)
            .map_err(|e| CryptoError::Keystore(format!("{}: {e}", path.display())))
    }

    pub fn save(&self, path: &Path) -> CryptoResult<()> {
        let data = serde_json::to_vec_pretty(self)
            .map_err(|e| CryptoError::Keystore(e.to_string()))?;
        std::fs::write(path, data)?;
        Ok(())
    }

    pub fn insert(&mut self, alias: impl Into<String>, key: &[u8; 32]) {
        self.keys.insert(alias.into(), hex::encode(key));
    }

    /// The key stored under `alias`.
    pub fn secret(&self, alias: &str) -> CryptoResult<[u8; 32]> {
        let encoded = self
            .keys
            .get(alias)
            .ok_or_else(|| CryptoError::KeyNotFound(alias.to_string()))?;
        let bytes = hex::decode(encoded)
            .map_err(|e| CryptoError::InvalidKey(format!("alias {alias}: {e}")))?;
        bytes.try_into().map_err(|bytes: Vec<u8>| {
            CryptoError::InvalidKey(format!(
                "alias {alias}: expected 32 bytes, got {}",
                bytes.len()
            ))
        })
    }
}

impl fmt::Debug for Keystore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut aliases: Vec<_> = self.keys.keys().collect();
        aliases.sort();
        f.debug_struct("Keystore").field("aliases", &aliases).finish()
    }
}
