/**
 * CREDENTIAL STORE - Chiffrement au repos des petits documents du kernel
 *
 * RÔLE :
 * Le secret d'installation (32 octets aléatoires, fichier 0600) est généré
 * au premier démarrage puis relu. Il sert de clé AES-256-GCM pour le registre
 * des nœuds et les abonnements aux alertes, et dérive la clé web.
 *
 * FORMAT : `[nonce 12 octets][ciphertext + tag]`
 *
 * ÉCHEC : toute erreur de chargement est fatale, jamais de repli en clair.
 */

use aes_gcm::aead::{Aead, AeadCore, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Nonce};
use rand::RngCore;
use serde::de::DeserializeOwned;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::fs;
use std::io::Write;
use std::path::Path;
use tracing::info;

const SECRET_LEN: usize = 32;
const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;

#[derive(Debug, thiserror::Error)]
pub enum CredentialError {
    #[error("install secret has {0} bytes, expected 32")]
    BadSecretLength(usize),
    #[error("ciphertext rejected (wrong key or tampered data)")]
    Invalid,
    #[error("encryption failed")]
    Encrypt,
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub struct CredentialStore {
    secret: [u8; SECRET_LEN],
    cipher: Aes256Gcm,
}

impl std::fmt::Debug for CredentialStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialStore").finish_non_exhaustive()
    }
}

impl CredentialStore {
    /// Ouvre le secret d'installation, le crée s'il n'existe pas.
    pub fn open(path: &Path) -> Result<Self, CredentialError> {
        if path.exists() {
            let bytes = fs::read(path)?;
            let secret: [u8; SECRET_LEN] = bytes
                .as_slice()
                .try_into()
                .map_err(|_| CredentialError::BadSecretLength(bytes.len()))?;
            restrict_permissions(path)?;
            return Ok(Self::from_secret(secret));
        }

        let mut secret = [0u8; SECRET_LEN];
        rand::rngs::OsRng.fill_bytes(&mut secret);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        write_owner_only(path, &secret)?;
        info!("generated new install secret at {}", path.display());
        Ok(Self::from_secret(secret))
    }

    pub fn from_secret(secret: [u8; SECRET_LEN]) -> Self {
        let cipher = Aes256Gcm::new(aes_gcm::Key::<Aes256Gcm>::from_slice(&secret));
        Self { secret, cipher }
    }

    pub fn encrypt_bytes(&self, plain: &[u8]) -> Result<Vec<u8>, CredentialError> {
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = self.cipher.encrypt(&nonce, plain).map_err(|_| CredentialError::Encrypt)?;

        let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    pub fn decrypt_bytes(&self, data: &[u8]) -> Result<Vec<u8>, CredentialError> {
        if data.len() < NONCE_LEN + TAG_LEN {
            return Err(CredentialError::Invalid);
        }
        let (nonce, ciphertext) = data.split_at(NONCE_LEN);
        self.cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| CredentialError::Invalid)
    }

    pub fn encrypt_json<T: Serialize>(&self, value: &T) -> Result<Vec<u8>, CredentialError> {
        self.encrypt_bytes(&serde_json::to_vec(value)?)
    }

    pub fn decrypt_json<T: DeserializeOwned>(&self, data: &[u8]) -> Result<T, CredentialError> {
        Ok(serde_json::from_slice(&self.decrypt_bytes(data)?)?)
    }

    /// Clé 256 bits pour les sessions web, stable pour une installation.
    pub fn derive_web_key(&self) -> [u8; 32] {
        let mut h = Sha256::new();
        h.update(b"vigie/web-session/v1");
        h.update(self.secret);
        let mut key = [0u8; 32];
        key.copy_from_slice(&h.finalize());
        key
    }
}

fn write_owner_only(path: &Path, bytes: &[u8]) -> Result<(), CredentialError> {
    let mut opts = fs::OpenOptions::new();
    opts.write(true).create_new(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        opts.mode(0o600);
    }
    let mut file = opts.open(path)?;
    file.write_all(bytes)?;
    file.sync_all()?;
    Ok(())
}

fn restrict_permissions(path: &Path) -> Result<(), CredentialError> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mode = fs::metadata(path)?.permissions().mode() & 0o777;
        if mode != 0o600 {
            fs::set_permissions(path, fs::Permissions::from_mode(0o600))?;
        }
    }
    #[cfg(not(unix))]
    let _ = path;
    Ok(())
}
