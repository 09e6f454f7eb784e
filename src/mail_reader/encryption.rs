use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Nonce,
};
use anyhow::{anyhow, bail, Result};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use log::info;
use rand::RngCore;
use std::fs;
use std::path::{Path, PathBuf};

use crate::mail_reader::error::MailError;
use crate::mail_reader::session::{CredentialSource, Credentials};

pub const PASSWORD_FILE: &str = ".encrypted_password";
pub const KEY_FILE: &str = ".encryption_key";

const NONCE_LEN: usize = 12;

fn get_encryption_key(key_path: &Path) -> Result<Aes256Gcm> {
    let key = if key_path.exists() {
        // Read existing key
        let key_bytes = fs::read(key_path)?;
        Aes256Gcm::new_from_slice(&key_bytes)
            .map_err(|e| anyhow!("Failed to create cipher from key: {}", e))?
    } else {
        // Generate new key
        let mut key_bytes = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut key_bytes);
        fs::write(key_path, key_bytes)?;
        Aes256Gcm::new_from_slice(&key_bytes)
            .map_err(|e| anyhow!("Failed to create cipher from new key: {}", e))?
    };
    Ok(key)
}

pub fn encrypt_password(key_path: &Path, password: &str) -> Result<String> {
    let cipher = get_encryption_key(key_path)?;
    let mut nonce_bytes = [0u8; NONCE_LEN];
    rand::thread_rng().fill_bytes(&mut nonce_bytes);
    let nonce = Nonce::from_slice(&nonce_bytes);

    let ciphertext = cipher
        .encrypt(nonce, password.as_bytes())
        .map_err(|e| anyhow!("Failed to encrypt password: {}", e))?;

    let mut combined = Vec::new();
    combined.extend_from_slice(&nonce_bytes);
    combined.extend_from_slice(&ciphertext);

    Ok(BASE64.encode(&combined))
}

pub fn decrypt_password(key_path: &Path, encrypted: &str) -> Result<String> {
    let cipher = get_encryption_key(key_path)?;
    let combined = BASE64
        .decode(encrypted.trim())
        .map_err(|e| anyhow!("Failed to decode base64: {}", e))?;
    if combined.len() <= NONCE_LEN {
        bail!("Encrypted password is truncated");
    }

    let (nonce_bytes, ciphertext) = combined.split_at(NONCE_LEN);
    let nonce = Nonce::from_slice(nonce_bytes);

    let plaintext = cipher
        .decrypt(nonce, ciphertext)
        .map_err(|e| anyhow!("Failed to decrypt password: {}", e))?;

    String::from_utf8(plaintext)
        .map_err(|e| anyhow!("Failed to convert decrypted bytes to string: {}", e))
}

/// Password kept AES-256-GCM encrypted on disk. The first time around the
/// user is prompted and the answer is stored for later runs.
#[derive(Debug, Clone)]
pub struct EncryptedPasswordStore {
    pub host: String,
    pub username: String,
    pub password_file: PathBuf,
    pub key_file: PathBuf,
}

impl EncryptedPasswordStore {
    fn password(&self) -> Result<String> {
        if self.password_file.exists() {
            // Read and decrypt stored password
            let encrypted = fs::read_to_string(&self.password_file)?;
            decrypt_password(&self.key_file, &encrypted)
        } else {
            // Get new password and store it
            let prompt = format!("Password for {}@{}: ", self.username, self.host);
            let password = rpassword::prompt_password(prompt)?;
            let encrypted = encrypt_password(&self.key_file, &password)?;
            fs::write(&self.password_file, encrypted)?;
            info!("Stored encrypted password in {}", self.password_file.display());
            Ok(password)
        }
    }
}

impl CredentialSource for EncryptedPasswordStore {
    fn credentials(&self) -> Result<Credentials, MailError> {
        let password = self
            .password()
            .map_err(|e| MailError::Credentials(format!("{:#}", e)))?;
        Ok(Credentials {
            host: self.host.clone(),
            username: self.username.clone(),
            password,
        })
    }
}
