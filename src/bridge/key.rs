//! Key operations
//!
//! Ownership follows how a key was obtained:
//!
//! | origin                      | kind    | owns memory | freed by            |
//! |-----------------------------|---------|-------------|---------------------|
//! | `private_key_from_file`     | private | no          | the session         |
//! | `public_key_from_file`      | public  | no          | bridge teardown     |
//! | `private_key_to_public_key` | public  | yes         | its own release     |

use std::path::Path;

use tracing::debug;

use super::Bridge;
use crate::error::BridgeError;
use crate::handle::{HandleId, KeyKind, ResourceHandle};
use crate::native::{SSH_EOF, SSH_ERROR};
use crate::symbols::KEY_TYPES;

/// Map a native import failure onto the host-visible error
fn import_error(path: &Path, code: i32) -> BridgeError {
    if code == SSH_EOF {
        BridgeError::NotFound {
            path: path.to_path_buf(),
        }
    } else {
        BridgeError::ImportError {
            path: path.to_path_buf(),
        }
    }
}

impl Bridge {
    /// Load a private key that lives as long as `session`
    pub fn private_key_from_file(
        &mut self,
        session: HandleId,
        path: impl AsRef<Path>,
        passphrase: Option<&str>,
    ) -> Result<HandleId, BridgeError> {
        let path = path.as_ref();
        self.registry.session_ptr(session)?;
        let ptr = self
            .native
            .import_privkey_file(path, passphrase)
            .map_err(|code| import_error(path, code))?;
        let id = self.registry.register(ResourceHandle::borrowed_key(
            ptr,
            KeyKind::Private,
            Some(session),
        ));
        debug!("Loaded private key {} from {} for session {}", id, path.display(), session);
        Ok(id)
    }

    /// Derive the public half of a private key as an independent key
    pub fn private_key_to_public_key(&mut self, key: HandleId) -> Result<HandleId, BridgeError> {
        let (ptr, kind) = self.registry.key_ptr(key)?;
        if kind != KeyKind::Private {
            return Err(BridgeError::TypeError(format!("{} is not a private key", key)));
        }
        let public = self
            .native
            .export_privkey_to_pubkey(ptr)
            .map_err(|code| BridgeError::Native {
                operation: "private-key->public-key",
                code,
                message: "Unable to derive the public key".to_string(),
            })?;
        Ok(self
            .registry
            .register(ResourceHandle::owned_key(public, KeyKind::Public)))
    }

    /// Load a public key not tied to any session
    ///
    /// The key is borrowed and has no owning session, so its native memory
    /// is only reclaimed when the [`Bridge`] is dropped. Finalizing or
    /// releasing the handle tombstones it but frees nothing; a long-lived
    /// host that loads many public keys grows until teardown.
    pub fn public_key_from_file(&mut self, path: impl AsRef<Path>) -> Result<HandleId, BridgeError> {
        let path = path.as_ref();
        let ptr = self
            .native
            .import_pubkey_file(path)
            .map_err(|code| import_error(path, code))?;
        let id = self
            .registry
            .register(ResourceHandle::borrowed_key(ptr, KeyKind::Public, None));
        debug!("Loaded public key {} from {}", id, path.display());
        Ok(id)
    }

    /// Printable OpenSSH form of a public key: `<algorithm> <base64>`
    pub fn public_key_to_string(&self, key: HandleId) -> Result<String, BridgeError> {
        let (ptr, kind) = self.registry.key_ptr(key)?;
        if kind != KeyKind::Public {
            return Err(BridgeError::TypeError(format!("{} is not a public key", key)));
        }
        self.native
            .export_pubkey(ptr)
            .map_err(|code| BridgeError::Native {
                operation: "public-key->string",
                code,
                message: "Unable to convert the key to a string".to_string(),
            })
    }

    /// Algorithm symbol: `rsa`, `ed25519`, ...
    pub fn key_type(&self, key: HandleId) -> Result<&'static str, BridgeError> {
        let (ptr, _) = self.registry.key_ptr(key)?;
        let code = self.native.key_type(ptr);
        KEY_TYPES.reverse_lookup(code).ok_or(BridgeError::Native {
            operation: "key-type",
            code: SSH_ERROR,
            message: format!("Unknown key type {}", code),
        })
    }

    pub fn key_kind(&self, key: HandleId) -> Result<KeyKind, BridgeError> {
        self.registry.key_ptr(key).map(|(_, kind)| kind)
    }

    pub fn is_public_key(&self, key: HandleId) -> Result<bool, BridgeError> {
        Ok(self.key_kind(key)? == KeyKind::Public)
    }

    pub fn is_private_key(&self, key: HandleId) -> Result<bool, BridgeError> {
        Ok(self.key_kind(key)? == KeyKind::Private)
    }
}
