//! Durable, lock-guarded storage of the key-value map.
//!
//! The map lives in a single JSON file whose keys and values are URL-safe
//! base64 strings. Every access takes an exclusive `flock` on a sidecar lock
//! file; the lock is tried for a short, bounded time and a miss surfaces as
//! [`KvError::LockTimeout`].

use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use base64::engine::general_purpose::URL_SAFE;
use base64::Engine;
use nix::errno::Errno;
use nix::fcntl::{Flock, FlockArg};

use crate::config::StorageConfig;
use crate::KvError;

/// The materialized application state
pub type KvMap = BTreeMap<String, String>;

/// Encode a map into its persisted image.
///
/// Keys and values are base64-encoded independently and the resulting object
/// is written with sorted keys, so equal maps always produce equal bytes.
pub fn encode(map: &KvMap) -> Result<Vec<u8>, KvError> {
    let encoded: BTreeMap<String, String> = map
        .iter()
        .map(|(k, v)| (URL_SAFE.encode(k), URL_SAFE.encode(v)))
        .collect();

    Ok(serde_json::to_vec(&encoded)?)
}

/// Decode a persisted image. Empty input and `null` decode to an empty map.
pub fn decode(data: &[u8]) -> Result<KvMap, KvError> {
    if data.is_empty() {
        return Ok(KvMap::new());
    }

    let encoded: Option<BTreeMap<String, String>> = serde_json::from_slice(data)
        .map_err(|e| KvError::Encoding(format!("data {:?}: {}", String::from_utf8_lossy(data), e)))?;

    encoded
        .unwrap_or_default()
        .into_iter()
        .map(|(k, v)| Ok((decode_field("key", &k)?, decode_field("value", &v)?)))
        .collect()
}

fn decode_field(what: &str, field: &str) -> Result<String, KvError> {
    let bytes = URL_SAFE
        .decode(field)
        .map_err(|e| KvError::Encoding(format!("{what} decode: {e}")))?;

    String::from_utf8(bytes).map_err(|e| KvError::Encoding(format!("{what} decode: {e}")))
}

/// File-backed owner of this node's key-value map
#[derive(Debug, Clone)]
pub struct DataFile {
    path: PathBuf,
    lock_path: PathBuf,
    lock_timeout: Duration,
    retry_interval: Duration,
}

/// Exclusive access to the data file; the lock is released on drop.
pub struct DataFileGuard<'a> {
    file: &'a DataFile,
    _lock: Flock<File>,
}

impl DataFile {
    pub fn new<P: AsRef<Path>>(path: P, config: &StorageConfig) -> Self {
        let path = path.as_ref().to_path_buf();
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "data.json".to_string());
        let lock_path = path.with_file_name(format!(".{file_name}.lock"));

        Self {
            path,
            lock_path,
            lock_timeout: config.lock_timeout,
            retry_interval: config.lock_retry_interval,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    /// Acquire the exclusive lock, retrying until the configured timeout.
    pub fn lock(&self) -> Result<DataFileGuard<'_>, KvError> {
        let deadline = Instant::now() + self.lock_timeout;
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&self.lock_path)?;

        loop {
            match Flock::lock(file, FlockArg::LockExclusiveNonblock) {
                Ok(lock) => return Ok(DataFileGuard { file: self, _lock: lock }),
                Err((f, errno)) if errno == Errno::EWOULDBLOCK || errno == Errno::EINTR => {
                    if Instant::now() >= deadline {
                        return Err(KvError::LockTimeout(self.path.clone()));
                    }
                    file = f;
                    std::thread::sleep(self.retry_interval);
                }
                Err((_, errno)) => return Err(KvError::Io(errno.into())),
            }
        }
    }

    /// Read the whole map under the lock
    pub fn load(&self) -> Result<KvMap, KvError> {
        self.lock()?.load()
    }

    /// Replace the whole map under the lock
    pub fn save(&self, map: &KvMap) -> Result<(), KvError> {
        self.lock()?.save(map)
    }

    /// Load, mutate and save while holding one lock scope.
    pub fn update<T>(&self, f: impl FnOnce(&mut KvMap) -> T) -> Result<T, KvError> {
        let guard = self.lock()?;
        let mut map = guard.load()?;
        let out = f(&mut map);
        guard.save(&map)?;
        Ok(out)
    }
}

impl DataFileGuard<'_> {
    pub fn load(&self) -> Result<KvMap, KvError> {
        if !self.file.path.exists() {
            self.write_image(&encode(&KvMap::new())?)?;
        }

        let content = std::fs::read(&self.file.path)?;
        decode(&content)
    }

    pub fn save(&self, map: &KvMap) -> Result<(), KvError> {
        let image = encode(map)?;
        self.write_image(&image)
    }

    /// Write a complete image next to the data file and rename it into place.
    fn write_image(&self, image: &[u8]) -> Result<(), KvError> {
        let tmp = self.file.path.with_extension("json.tmp");
        {
            let mut out = File::create(&tmp)?;
            out.write_all(image)?;
            out.sync_all()?;
        }
        std::fs::rename(&tmp, &self.file.path)?;
        Ok(())
    }
}
