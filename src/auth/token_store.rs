use aes_gcm::{
    aead::{Aead, KeyInit, OsRng},
    Aes256Gcm, Key, Nonce,
};
use anyhow::{Context, Result};
use argon2::Argon2;
use base64::{engine::general_purpose, Engine as _};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use super::Session;

const SESSION_FILE_NAME: &str = "session.json";

/// On-disk envelope for an encrypted session.
#[derive(Debug, Serialize, Deserialize)]
struct SealedSession {
    encrypted_data: String,
    nonce: String,
    salt: String,
    stored_at: i64,
}

/// Persists the signed-in session between runs, encrypted with a key derived
/// from machine-local material.
#[derive(Debug, Clone)]
pub struct TokenStore {
    path: PathBuf,
}

impl TokenStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// `<data_dir>/promptlib/session.json`
    pub fn default_location() -> Result<Self> {
        let dir = dirs::data_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not determine data directory"))?
            .join("promptlib");
        Ok(Self::new(dir.join(SESSION_FILE_NAME)))
    }

    /// Location of the sealed session file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn derive_key(salt: &[u8]) -> Result<[u8; 32]> {
        let mut material = String::new();
        if let Ok(user) = std::env::var("USER").or_else(|_| std::env::var("USERNAME")) {
            material.push_str(&user);
        }
        material.push_str(&gethostname::gethostname().to_string_lossy());
        material.push_str("promptlib-session-v1");

        let mut key = [0u8; 32];
        Argon2::default()
            .hash_password_into(material.as_bytes(), salt, &mut key)
            .map_err(|e| anyhow::anyhow!("Failed to derive key: {}", e))?;
        Ok(key)
    }

    /// Encrypt and write `session`, creating parent directories.
    pub fn save(&self, session: &Session) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).context("Failed to create session directory")?;
        }

        let mut salt = [0u8; 32];
        let mut nonce_bytes = [0u8; 12];
        OsRng.fill_bytes(&mut salt);
        OsRng.fill_bytes(&mut nonce_bytes);

        let key = Self::derive_key(&salt)?;
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key));
        let nonce = Nonce::from_slice(&nonce_bytes);

        let plaintext = serde_json::to_vec(session)?;
        let encrypted = cipher
            .encrypt(nonce, plaintext.as_ref())
            .map_err(|e| anyhow::anyhow!("Encryption failed: {}", e))?;

        let sealed = SealedSession {
            encrypted_data: general_purpose::STANDARD.encode(&encrypted),
            nonce: general_purpose::STANDARD.encode(nonce_bytes),
            salt: general_purpose::STANDARD.encode(salt),
            stored_at: chrono::Utc::now().timestamp(),
        };
        let json = serde_json::to_string_pretty(&sealed)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::write(&self.path, json)?;
            let mut perms = std::fs::metadata(&self.path)?.permissions();
            perms.set_mode(0o600);
            std::fs::set_permissions(&self.path, perms)?;
        }

        #[cfg(not(unix))]
        {
            std::fs::write(&self.path, json)?;
        }

        info!("Session stored at {:?}", self.path);
        Ok(())
    }

    /// Read and decrypt the stored session, if any.
    pub fn load(&self) -> Result<Option<Session>> {
        if !self.path.exists() {
            debug!("No session file at {:?}", self.path);
            return Ok(None);
        }

        let json = std::fs::read_to_string(&self.path).context("Failed to read session file")?;
        let sealed: SealedSession =
            serde_json::from_str(&json).context("Failed to parse session file")?;

        let encrypted = general_purpose::STANDARD
            .decode(&sealed.encrypted_data)
            .context("Failed to decode encrypted data")?;
        let nonce_bytes = general_purpose::STANDARD
            .decode(&sealed.nonce)
            .context("Failed to decode nonce")?;
        let salt = general_purpose::STANDARD
            .decode(&sealed.salt)
            .context("Failed to decode salt")?;
        if nonce_bytes.len() != 12 {
            return Err(anyhow::anyhow!("Corrupt session file: bad nonce length"));
        }

        let key = Self::derive_key(&salt)?;
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key));
        let decrypted = cipher
            .decrypt(Nonce::from_slice(&nonce_bytes), encrypted.as_ref())
            .map_err(|e| anyhow::anyhow!("Decryption failed: {}", e))?;

        let session: Session =
            serde_json::from_slice(&decrypted).context("Failed to parse decrypted session")?;
        debug!("Loaded stored session for user {}", session.user.id);
        Ok(Some(session))
    }

    /// Remove the stored session. Missing files are fine.
    pub fn clear(&self) -> Result<()> {
        if self.path.exists() {
            std::fs::remove_file(&self.path)?;
            debug!("Session file removed from {:?}", self.path);
        }
        Ok(())
    }
}
