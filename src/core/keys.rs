// src/core/keys.rs — Ephemeral SSH keypairs, one per session
//
// A keypair lives in its own private directory under the work dir. The
// private half is written there (mode 0600) only so the job runner can hand
// it to ssh; dropping the `Keypair` deletes the directory.

use std::fmt;
use std::path::{Path, PathBuf};

use ssh_key::rand_core::OsRng;
use ssh_key::{Algorithm, HashAlg, LineEnding, PrivateKey};

use crate::infra::errors::BrokerError;

const KEY_FILE: &str = "id_ed25519";
const KEY_COMMENT: &str = "handoff-ephemeral";

/// Mints and destroys per-session keypairs.
#[derive(Debug, Clone)]
pub struct KeyMinter {
    root: PathBuf,
}

/// A single-use ed25519 keypair. Not `Clone`: exactly one owner.
pub struct Keypair {
    public_key: String,
    fingerprint: String,
    dir: PathBuf,
    private_key_path: PathBuf,
    _private: PrivateKey,
}

impl KeyMinter {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Generate a fresh keypair with no relation to any other.
    pub fn mint(&self) -> Result<Keypair, BrokerError> {
        // Directory names are random and unrelated to the session id, which is a secret.
        let dir = self.root.join(uuid::Uuid::new_v4().simple().to_string());
        std::fs::create_dir_all(&dir)?;
        restrict_dir(&dir)?;

        match write_keypair(&dir) {
            Ok(keypair) => {
                tracing::debug!("Minted ephemeral key {}", keypair.fingerprint);
                Ok(keypair)
            }
            Err(e) => {
                let _ = std::fs::remove_dir_all(&dir);
                Err(e)
            }
        }
    }

    /// Drop the key held in `slot`, if any. Idempotent: an empty slot is a no-op.
    ///
    /// Returns whether a key was destroyed.
    pub fn revoke(&self, slot: &mut Option<Keypair>) -> bool {
        match slot.take() {
            Some(keypair) => {
                tracing::debug!("Revoked ephemeral key {}", keypair.fingerprint);
                drop(keypair);
                true
            }
            None => false,
        }
    }
}

fn write_keypair(dir: &Path) -> Result<Keypair, BrokerError> {
    let mut private = PrivateKey::random(&mut OsRng, Algorithm::Ed25519)?;
    private.set_comment(KEY_COMMENT);

    let private_key_path = dir.join(KEY_FILE);
    private.write_openssh_file(&private_key_path, LineEnding::LF)?;

    let public = private.public_key();
    let public_key = public.to_openssh()?;
    let fingerprint = public.fingerprint(HashAlg::Sha256).to_string();

    Ok(Keypair {
        public_key,
        fingerprint,
        dir: dir.to_path_buf(),
        private_key_path,
        _private: private,
    })
}

#[cfg(unix)]
fn restrict_dir(dir: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(dir, std::fs::Permissions::from_mode(0o700))
}

#[cfg(not(unix))]
fn restrict_dir(_dir: &Path) -> std::io::Result<()> {
    Ok(())
}

impl Keypair {
    /// Public half in OpenSSH `authorized_keys` format.
    pub fn public_key(&self) -> &str {
        &self.public_key
    }

    /// `SHA256:...` fingerprint of the public half.
    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    pub fn private_key_path(&self) -> &Path {
        &self.private_key_path
    }

    /// Private directory owned by this keypair; job files may be placed here.
    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

impl Drop for Keypair {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_dir_all(&self.dir) {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!("Failed to remove key directory {:?}: {}", self.dir, e);
            }
        }
    }
}

impl fmt::Debug for Keypair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Keypair")
            .field("fingerprint", &self.fingerprint)
            .field("dir", &self.dir)
            .finish_non_exhaustive()
    }
}
