//! Identity and device keys on disk.
//!
//! ```text
//! <data dir>/me/mykey                 identity key of the primary identity, hex
//! <data dir>/me/mykey.postfix         its 12-byte postfix, hex
//! <data dir>/me/mykey.<id>            per-identity alias of the pair
//! <data dir>/me/mykey.<id>.postfix
//! <data dir>/me/nodekey               device node key, hex
//! ```
//!
//! Files are written to a temporary name and renamed into place.

use std::fs;
use std::path::{Path, PathBuf};

use kith_crypto::secp256k1::PrivateKey;
use kith_types::{EntityId, Id, POSTFIX_SIZE};
use tracing::{info, warn};

use crate::config::MeConfig;
use crate::{MeError, Result};

const KEY_FILE: &str = "mykey";
const POSTFIX_EXT: &str = "postfix";
const NODE_KEY_FILE: &str = "nodekey";

/// An identity private key with the postfix completing its id.
#[derive(Clone)]
pub struct IdentityKey {
    pub key: PrivateKey,
    pub postfix: [u8; POSTFIX_SIZE],
    pub id: EntityId,
}

impl std::fmt::Debug for IdentityKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdentityKey").field("id", &self.id).finish()
    }
}

impl IdentityKey {
    pub fn new(key: PrivateKey, postfix: [u8; POSTFIX_SIZE]) -> Result<Self> {
        let address = key.public_key()?.address();
        Ok(Self {
            id: Id::from_parts(&address, &postfix),
            key,
            postfix,
        })
    }

    /// A fresh identity with a random postfix.
    pub fn generate() -> Result<Self> {
        Self::new(PrivateKey::generate(), rand::random())
    }

    pub fn from_hex(key: &str, postfix: &str) -> Result<Self> {
        let key = PrivateKey::from_hex(key.trim())?;
        Self::new(key, parse_postfix(postfix)?)
    }
}

fn parse_postfix(s: &str) -> Result<[u8; POSTFIX_SIZE]> {
    let raw = hex::decode(s.trim()).map_err(|e| MeError::InvalidMe(format!("postfix: {e}")))?;
    raw.try_into()
        .map_err(|_| MeError::InvalidMe(format!("postfix must be {POSTFIX_SIZE} bytes")))
}

#[derive(Debug, Clone)]
pub struct KeyStore {
    dir: PathBuf,
}

impl KeyStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn key_path(&self) -> PathBuf {
        self.dir.join(KEY_FILE)
    }

    fn postfix_path(&self) -> PathBuf {
        self.dir.join(format!("{KEY_FILE}.{POSTFIX_EXT}"))
    }

    fn alias_key_path(&self, id: &EntityId) -> PathBuf {
        self.dir.join(format!("{KEY_FILE}.{}", id.to_hex()))
    }

    fn alias_postfix_path(&self, id: &EntityId) -> PathBuf {
        self.dir.join(format!("{KEY_FILE}.{}.{POSTFIX_EXT}", id.to_hex()))
    }

    fn read_pair(key: &Path, postfix: &Path) -> Result<Option<IdentityKey>> {
        if !key.exists() || !postfix.exists() {
            return Ok(None);
        }
        let key = fs::read_to_string(key)?;
        let postfix = fs::read_to_string(postfix)?;
        IdentityKey::from_hex(&key, &postfix).map(Some)
    }

    /// The primary identity, generated and saved on first use.
    pub fn load(&self) -> Result<IdentityKey> {
        if let Some(identity) = self.load_current()? {
            return Ok(identity);
        }
        let identity = IdentityKey::generate()?;
        self.save(&identity)?;
        info!(id = %identity.id, "generated identity key");
        Ok(identity)
    }

    /// The primary identity when its key files exist.
    pub fn load_current(&self) -> Result<Option<IdentityKey>> {
        Self::read_pair(&self.key_path(), &self.postfix_path())
    }

    pub fn load_by_id(&self, id: &EntityId) -> Result<Option<IdentityKey>> {
        let identity = Self::read_pair(&self.alias_key_path(id), &self.alias_postfix_path(id))?;
        match identity {
            Some(identity) if identity.id != *id => Err(MeError::InvalidMe(format!(
                "key file of {id} resolves to {}",
                identity.id
            ))),
            other => Ok(other),
        }
    }

    /// Write `identity` as the primary pair and as its per-id alias.
    pub fn save(&self, identity: &IdentityKey) -> Result<()> {
        fs::create_dir_all(&self.dir)?;
        let key = identity.key.to_hex();
        let postfix = hex::encode(identity.postfix);
        write_secret(&self.key_path(), &key)?;
        write_secret(&self.postfix_path(), &postfix)?;
        write_secret(&self.alias_key_path(&identity.id), &key)?;
        write_secret(&self.alias_postfix_path(&identity.id), &postfix)?;
        Ok(())
    }

    /// Remove the per-id alias pair of `id`.
    pub fn revoke(&self, id: &EntityId) -> Result<()> {
        remove_if_exists(&self.alias_key_path(id))?;
        remove_if_exists(&self.alias_postfix_path(id))
    }

    /// Remove the primary pair.
    pub fn revoke_current(&self) -> Result<()> {
        remove_if_exists(&self.key_path())?;
        remove_if_exists(&self.postfix_path())
    }

    /// Move the primary pair aside as `<name>.<ts>.deleted`.
    pub fn delete(&self) -> Result<()> {
        let ts = kith_types::time::now();
        for path in [self.key_path(), self.postfix_path()] {
            if path.exists() {
                let mut name = path.as_os_str().to_owned();
                name.push(format!(".{ts}.deleted"));
                fs::rename(&path, PathBuf::from(name))?;
            }
        }
        Ok(())
    }

    /// Import the identity named by `config`, if any.
    ///
    /// The key comes from `key_file` or `private_key`, never both; a key
    /// needs its postfix and a postfix its key; an expected `id` must match
    /// the derived one.
    pub fn set_my_key(&self, config: &MeConfig) -> Result<Option<IdentityKey>> {
        let key_hex = match (&config.key_file, &config.private_key) {
            (Some(_), Some(_)) => return Err(MeError::InvalidPrivateKeyFileHex),
            (Some(path), None) => Some(fs::read_to_string(path)?),
            (None, Some(hex)) => Some(hex.clone()),
            (None, None) => None,
        };
        let identity = match (key_hex, &config.postfix) {
            (None, None) => return Ok(None),
            (Some(key), Some(postfix)) => IdentityKey::from_hex(&key, postfix)?,
            _ => {
                return Err(MeError::InvalidMe(
                    "identity key and postfix must be given together".into(),
                ))
            }
        };
        if let Some(expected) = &config.id {
            let expected = Id::from_hex(expected.trim())?;
            if expected != identity.id {
                return Err(MeError::InvalidMe(format!(
                    "configured id {expected} does not match key id {}",
                    identity.id
                )));
            }
        }
        if let Some(current) = self.load_current()? {
            if current.id != identity.id {
                warn!(old = %current.id, new = %identity.id, "replacing primary identity key");
                self.delete()?;
            }
        }
        self.save(&identity)?;
        info!(id = %identity.id, "imported identity key");
        Ok(Some(identity))
    }

    /// The device node key, generated once.
    pub fn load_node_key(&self) -> Result<PrivateKey> {
        let path = self.dir.join(NODE_KEY_FILE);
        if path.exists() {
            let raw = fs::read_to_string(&path)?;
            return Ok(PrivateKey::from_hex(raw.trim())?);
        }
        fs::create_dir_all(&self.dir)?;
        let key = PrivateKey::generate();
        write_secret(&path, &key.to_hex())?;
        info!(node_id = %Id(key.public_key()?.node_id()), "generated node key");
        Ok(key)
    }
}

fn remove_if_exists(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

fn write_secret(path: &Path, contents: &str) -> Result<()> {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    fs::write(&tmp, contents)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(&tmp, fs::Permissions::from_mode(0o600))?;
    }
    fs::rename(&tmp, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_store() -> KeyStore {
        KeyStore::new(std::env::temp_dir().join(format!("kith-keystore-{}", rand::random::<u64>())))
    }

    #[test]
    fn test_load_generates_once() {
        let store = temp_store();
        let first = store.load().expect("load");
        let second = store.load().expect("reload");
        assert_eq!(first.id, second.id);
        assert_eq!(first.id.postfix(), first.postfix);
        let alias = store.load_by_id(&first.id).expect("alias").expect("exists");
        assert_eq!(alias.id, first.id);
        let _ = fs::remove_dir_all(store.dir());
    }

    #[test]
    fn test_revoke_and_delete() {
        let store = temp_store();
        let identity = store.load().expect("load");
        store.revoke(&identity.id).expect("revoke");
        assert!(store.load_by_id(&identity.id).expect("alias").is_none());
        assert!(store.load_current().expect("current").is_some());
        store.delete().expect("delete");
        assert!(store.load_current().expect("current").is_none());
        let deleted = fs::read_dir(store.dir())
            .expect("dir")
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".deleted"))
            .count();
        assert_eq!(deleted, 2);
        let _ = fs::remove_dir_all(store.dir());
    }

    #[cfg(unix)]
    #[test]
    fn test_key_file_mode() {
        use std::os::unix::fs::PermissionsExt;
        let store = temp_store();
        store.load().expect("load");
        let mode = fs::metadata(store.dir().join(KEY_FILE)).expect("meta").permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
        let _ = fs::remove_dir_all(store.dir());
    }

    #[test]
    fn test_set_my_key_rules() {
        let store = temp_store();
        let identity = IdentityKey::generate().expect("generate");

        let both = MeConfig {
            private_key: Some(identity.key.to_hex()),
            key_file: Some(store.dir().join("import")),
            postfix: Some(hex::encode(identity.postfix)),
            ..MeConfig::default()
        };
        assert!(matches!(store.set_my_key(&both), Err(MeError::InvalidPrivateKeyFileHex)));

        let no_postfix = MeConfig {
            private_key: Some(identity.key.to_hex()),
            ..MeConfig::default()
        };
        assert!(matches!(store.set_my_key(&no_postfix), Err(MeError::InvalidMe(_))));

        let wrong_id = MeConfig {
            private_key: Some(identity.key.to_hex()),
            postfix: Some(hex::encode(identity.postfix)),
            id: Some(Id::random().to_hex()),
            ..MeConfig::default()
        };
        assert!(matches!(store.set_my_key(&wrong_id), Err(MeError::InvalidMe(_))));

        let ok = MeConfig {
            private_key: Some(identity.key.to_hex()),
            postfix: Some(hex::encode(identity.postfix)),
            id: Some(identity.id.to_hex()),
            ..MeConfig::default()
        };
        let imported = store.set_my_key(&ok).expect("import").expect("some");
        assert_eq!(imported.id, identity.id);
        assert_eq!(store.load().expect("load").id, identity.id);
        assert!(store.set_my_key(&MeConfig::default()).expect("none").is_none());
        let _ = fs::remove_dir_all(store.dir());
    }

    #[test]
    fn test_node_key_is_stable() {
        let store = temp_store();
        let a = store.load_node_key().expect("node key");
        let b = store.load_node_key().expect("node key");
        assert_eq!(a.to_hex(), b.to_hex());
        let _ = fs::remove_dir_all(store.dir());
    }
}
