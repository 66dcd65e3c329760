use std::collections::HashMap;
use std::fs::File;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant, SystemTime};

use hex::ToHex;
use md5::{Digest, Md5};

pub fn md5_hex(bytes: &[u8]) -> String {
    Md5::digest(bytes).encode_hex::<String>()
}

pub fn file_md5(path: &Path) -> io::Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Md5::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hasher.finalize().encode_hex::<String>())
}

/// A published sidecar is valid when its first 32 characters are hex.
pub fn parse_remote_checksum(body: &str) -> Option<String> {
    let candidate = body.trim_start().get(..32)?;
    candidate
        .chars()
        .all(|c| c.is_ascii_hexdigit())
        .then(|| candidate.to_ascii_lowercase())
}

#[derive(Clone, Debug)]
struct CacheEntry {
    digest: String,
    len: u64,
    modified: Option<SystemTime>,
    computed_at: Instant,
}

/// Time-bounded read-through cache of file digests keyed by path.
///
/// Entries are also dropped when the file's size or mtime changes.
#[derive(Clone)]
pub struct ChecksumCache {
    ttl: Duration,
    entries: Arc<Mutex<HashMap<PathBuf, CacheEntry>>>,
}

impl ChecksumCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn checksum(&self, path: &Path) -> io::Result<String> {
        let meta = std::fs::metadata(path)?;
        let len = meta.len();
        let modified = meta.modified().ok();

        {
            let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(entry) = entries.get(path) {
                if entry.len == len
                    && entry.modified == modified
                    && entry.computed_at.elapsed() < self.ttl
                {
                    return Ok(entry.digest.clone());
                }
            }
        }

        let digest = file_md5(path)?;
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(
                path.to_path_buf(),
                CacheEntry {
                    digest: digest.clone(),
                    len,
                    modified,
                    computed_at: Instant::now(),
                },
            );
        Ok(digest)
    }

    pub fn invalidate(&self, path: &Path) {
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(path);
    }

    /// True when the file exists and hashes to `expected`.
    pub fn matches(&self, path: &Path, expected: &str) -> bool {
        if !path.is_file() {
            return false;
        }
        self.checksum(path)
            .map(|digest| digest.eq_ignore_ascii_case(expected))
            .unwrap_or(false)
    }
}
