//! Versioned key ring persisted in a key directory.
//!
//! Each version lives in its own file `v{N}.key` holding 32 random bytes as
//! hex. Files are created once and never rewritten.

use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};

use chacha20poly1305::ChaCha20Poly1305;
use chacha20poly1305::aead::{KeyInit, OsRng};
use zeroize::Zeroizing;

use super::CipherError;

/// Symmetric key length in bytes.
pub const KEY_LEN: usize = 32;

const KEY_FILE_PREFIX: &str = "v";
const KEY_FILE_EXT: &str = "key";

/// Versioned symmetric keys loaded from disk.
pub struct KeyRing {
    dir: PathBuf,
    keys: BTreeMap<u32, Zeroizing<[u8; KEY_LEN]>>,
    active: u32,
    pinned: bool,
}

impl std::fmt::Debug for KeyRing {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyRing")
            .field("dir", &self.dir)
            .field("versions", &self.keys.keys().collect::<Vec<_>>())
            .field("active", &self.active)
            .field("pinned", &self.pinned)
            .finish()
    }
}

impl KeyRing {
    /// Load every key in `dir`.
    ///
    /// # Errors
    /// Returns `CipherError::NoKey` if the directory holds no key file.
    pub fn load(dir: impl AsRef<Path>) -> Result<Self, CipherError> {
        let dir = dir.as_ref().to_path_buf();
        let keys = read_keys(&dir)?;
        let active = *keys
            .keys()
            .next_back()
            .ok_or_else(|| CipherError::NoKey(dir.display().to_string()))?;

        tracing::info!(
            dir = %dir.display(),
            versions = keys.len(),
            active,
            "Key ring loaded"
        );
        Ok(Self {
            dir,
            keys,
            active,
            pinned: false,
        })
    }

    /// Load every key in `dir`, generating version 1 only if none exists.
    pub fn load_or_init(dir: impl AsRef<Path>) -> Result<Self, CipherError> {
        let dir = dir.as_ref();
        std::fs::create_dir_all(dir)?;

        if read_keys(dir)?.is_empty() {
            write_new_key(dir, 1)?;
            tracing::warn!(dir = %dir.display(), "No encryption key found, generated key version 1");
        }

        Self::load(dir)
    }

    /// Pin the active version instead of the newest one.
    pub fn with_active(mut self, version: u32) -> Result<Self, CipherError> {
        if !self.keys.contains_key(&version) {
            return Err(CipherError::UnknownKeyVersion(version));
        }
        self.active = version;
        self.pinned = true;
        Ok(self)
    }

    /// Generate and persist the next key version and make it active.
    ///
    /// Existing versions stay loaded so records sealed under them can still
    /// be opened and re-sealed.
    pub fn rotate(&mut self) -> Result<u32, CipherError> {
        let next = self.keys.keys().next_back().map_or(1, |v| v + 1);
        let key = write_new_key(&self.dir, next)?;
        self.keys.insert(next, key);
        self.active = next;
        self.pinned = false;

        tracing::info!(dir = %self.dir.display(), version = next, "Key ring rotated");
        Ok(next)
    }

    /// Currently active version.
    pub fn active_version(&self) -> u32 {
        self.active
    }

    /// True when the active version was chosen with [`with_active`](Self::with_active).
    pub fn is_pinned(&self) -> bool {
        self.pinned
    }

    /// All loaded versions, oldest first.
    pub fn versions(&self) -> Vec<u32> {
        self.keys.keys().copied().collect()
    }

    /// Directory backing this ring.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub(crate) fn keys(&self) -> impl Iterator<Item = (u32, &Zeroizing<[u8; KEY_LEN]>)> {
        self.keys.iter().map(|(v, k)| (*v, k))
    }
}

fn key_path(dir: &Path, version: u32) -> PathBuf {
    dir.join(format!("{KEY_FILE_PREFIX}{version}.{KEY_FILE_EXT}"))
}

/// Parse `v{N}.key` into `N`.
fn parse_version(path: &Path) -> Option<u32> {
    if path.extension().and_then(|e| e.to_str()) != Some(KEY_FILE_EXT) {
        return None;
    }
    path.file_stem()?
        .to_str()?
        .strip_prefix(KEY_FILE_PREFIX)?
        .parse()
        .ok()
}

fn read_keys(dir: &Path) -> Result<BTreeMap<u32, Zeroizing<[u8; KEY_LEN]>>, CipherError> {
    let mut keys = BTreeMap::new();
    if !dir.exists() {
        return Ok(keys);
    }

    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if !path.is_file() {
            continue;
        }
        let Some(version) = parse_version(&path) else {
            continue;
        };
        keys.insert(version, read_key(&path)?);
    }

    Ok(keys)
}

fn read_key(path: &Path) -> Result<Zeroizing<[u8; KEY_LEN]>, CipherError> {
    let invalid = |reason: String| CipherError::InvalidKey {
        path: path.display().to_string(),
        reason,
    };

    let content = Zeroizing::new(std::fs::read_to_string(path)?);
    let mut key = Zeroizing::new([0u8; KEY_LEN]);
    hex::decode_to_slice(content.trim(), key.as_mut_slice()).map_err(|e| invalid(e.to_string()))?;
    Ok(key)
}

fn write_new_key(dir: &Path, version: u32) -> Result<Zeroizing<[u8; KEY_LEN]>, CipherError> {
    let generated = ChaCha20Poly1305::generate_key(&mut OsRng);
    let mut key = Zeroizing::new([0u8; KEY_LEN]);
    key.copy_from_slice(generated.as_slice());

    let path = key_path(dir, version);
    let mut options = std::fs::OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }

    let mut file = options.open(&path)?;
    let encoded = Zeroizing::new(hex::encode(key.as_slice()));
    file.write_all(encoded.as_bytes())?;
    file.sync_all()?;

    Ok(key)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_load_or_init_creates_v1_once() {
        let dir = tempdir().unwrap();

        let first = KeyRing::load_or_init(dir.path()).unwrap();
        assert_eq!(first.versions(), vec![1]);
        let original = std::fs::read_to_string(key_path(dir.path(), 1)).unwrap();

        let second = KeyRing::load_or_init(dir.path()).unwrap();
        assert_eq!(second.versions(), vec![1]);
        let reloaded = std::fs::read_to_string(key_path(dir.path(), 1)).unwrap();
        assert_eq!(original, reloaded);
    }

    #[test]
    fn test_load_empty_dir_fails() {
        let dir = tempdir().unwrap();
        let err = KeyRing::load(dir.path()).unwrap_err();
        assert!(matches!(err, CipherError::NoKey(_)));
    }

    #[test]
    fn test_rotate_persists_new_version() {
        let dir = tempdir().unwrap();
        let mut ring = KeyRing::load_or_init(dir.path()).unwrap();
        assert_eq!(ring.rotate().unwrap(), 2);
        assert_eq!(ring.active_version(), 2);

        let reloaded = KeyRing::load(dir.path()).unwrap();
        assert_eq!(reloaded.versions(), vec![1, 2]);
        assert_eq!(reloaded.active_version(), 2);
    }

    #[test]
    fn test_with_active_pins_version() {
        let dir = tempdir().unwrap();
        let mut ring = KeyRing::load_or_init(dir.path()).unwrap();
        ring.rotate().unwrap();

        let pinned = KeyRing::load(dir.path()).unwrap().with_active(1).unwrap();
        assert_eq!(pinned.active_version(), 1);
        assert!(KeyRing::load(dir.path()).unwrap().with_active(7).is_err());
    }

    #[test]
    fn test_invalid_key_file() {
        let dir = tempdir().unwrap();
        std::fs::write(key_path(dir.path(), 1), "not-hex").unwrap();
        let err = KeyRing::load(dir.path()).unwrap_err();
        assert!(matches!(err, CipherError::InvalidKey { .. }));
    }

    #[test]
    fn test_unrelated_files_ignored() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("README"), "notes").unwrap();
        std::fs::write(dir.path().join("vX.key"), "junk").unwrap();
        let ring = KeyRing::load_or_init(dir.path()).unwrap();
        assert_eq!(ring.versions(), vec![1]);
    }

    #[test]
    fn test_parse_version() {
        assert_eq!(parse_version(Path::new("/k/v12.key")), Some(12));
        assert_eq!(parse_version(Path::new("/k/v1.txt")), None);
        assert_eq!(parse_version(Path::new("/k/key1.key")), None);
    }

    #[cfg(unix)]
    #[test]
    fn test_key_file_permissions() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempdir().unwrap();
        KeyRing::load_or_init(dir.path()).unwrap();
        let mode = std::fs::metadata(key_path(dir.path(), 1))
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(mode & 0o777, 0o600);
    }
}
