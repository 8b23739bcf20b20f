//! Actor key material on disk
//!
//! Each local actor owns `<keys_dir>/<name>-public.pem` (SPKI) and
//! `<keys_dir>/<name>-private.pem` (PKCS#8). Only the public key path is
//! stored; the private key is found next to it.

use rsa::pkcs1::{DecodeRsaPrivateKey, DecodeRsaPublicKey};
use rsa::pkcs8::{DecodePrivateKey, DecodePublicKey, EncodePrivateKey, EncodePublicKey, LineEnding};
use rsa::{RsaPrivateKey, RsaPublicKey};
use std::path::{Path, PathBuf};

use crate::error::{AppError, Result};

/// Freshly generated key pair
#[derive(Debug, Clone)]
pub struct GeneratedKeys {
    pub public_key_pem: String,
    pub public_key_path: PathBuf,
}

/// Generate and write a key pair for `name`
///
/// Generation runs on the blocking pool; 4096-bit keys take seconds.
pub async fn generate_keypair(keys_dir: &Path, name: &str, bits: usize) -> Result<GeneratedKeys> {
    let (private_key_pem, public_key_pem) = tokio::task::spawn_blocking(move || {
        let mut rng = rand::thread_rng();
        let private_key = RsaPrivateKey::new(&mut rng, bits)
            .map_err(|e| AppError::Internal(e.into()))?;
        let public_key = RsaPublicKey::from(&private_key);

        let private_key_pem = private_key
            .to_pkcs8_pem(LineEnding::LF)
            .map_err(|e| AppError::Internal(e.into()))?
            .to_string();
        let public_key_pem = public_key
            .to_public_key_pem(LineEnding::LF)
            .map_err(|e| AppError::Internal(e.into()))?;

        Ok::<_, AppError>((private_key_pem, public_key_pem))
    })
    .await
    .map_err(|e| AppError::Internal(e.into()))??;

    tokio::fs::create_dir_all(keys_dir)
        .await
        .map_err(|e| AppError::Internal(e.into()))?;

    let public_key_path = keys_dir.join(format!("{}-public.pem", name));
    let private_key_path = private_key_path(&public_key_path);

    tokio::fs::write(&private_key_path, private_key_pem.as_bytes())
        .await
        .map_err(|e| AppError::Internal(e.into()))?;
    tokio::fs::write(&public_key_path, public_key_pem.as_bytes())
        .await
        .map_err(|e| AppError::Internal(e.into()))?;

    tracing::info!(actor = name, path = %public_key_path.display(), "Generated actor key pair");

    Ok(GeneratedKeys {
        public_key_pem,
        public_key_path,
    })
}

/// Private key path for a stored public key path
pub fn private_key_path(public_key_path: &Path) -> PathBuf {
    let raw = public_key_path.to_string_lossy();
    PathBuf::from(raw.replace("public.pem", "private.pem"))
}

/// Load the private key that pairs with `public_key_path`
///
/// # Errors
/// `MissingPrivateKey` when the file does not exist. Nothing retries this;
/// the operator has to restore or regenerate the key.
pub async fn load_private_key(public_key_path: &Path) -> Result<RsaPrivateKey> {
    let path = private_key_path(public_key_path);

    let pem = match tokio::fs::read_to_string(&path).await {
        Ok(pem) => pem,
        Err(error) if error.kind() == std::io::ErrorKind::NotFound => {
            tracing::error!(
                path = %path.display(),
                "Private key missing. Restore the file from backup, or remove the actor \
                 and recreate it to generate a new key pair; remote peers will refetch the \
                 public key."
            );
            return Err(AppError::MissingPrivateKey {
                path: path.display().to_string(),
            });
        }
        Err(error) => return Err(AppError::Internal(error.into())),
    };

    parse_private_key(&pem)
}

/// Parse a PKCS#8 or PKCS#1 private key
pub fn parse_private_key(pem: &str) -> Result<RsaPrivateKey> {
    RsaPrivateKey::from_pkcs8_pem(pem)
        .or_else(|_| RsaPrivateKey::from_pkcs1_pem(pem))
        .map_err(|e| AppError::Internal(anyhow::anyhow!("Invalid private key: {}", e)))
}

/// Parse an SPKI or PKCS#1 public key
pub fn parse_public_key(pem: &str) -> Result<RsaPublicKey> {
    RsaPublicKey::from_public_key_pem(pem)
        .or_else(|_| RsaPublicKey::from_pkcs1_pem(pem))
        .map_err(|e| AppError::Validation(format!("Invalid public key: {}", e)))
}
