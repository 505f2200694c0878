//! Path helpers shared by the configuration loader and the client entry
//! point.

use std::path::Path;
use std::path::PathBuf;

use crate::error::RelayErr;
use crate::error::Result;

/// Resolves `path` to an absolute path. Relative paths are anchored at the
/// process working directory, preferring the canonical form when the path
/// exists.
pub fn absolute_path(path: &str) -> PathBuf {
    if path.is_empty() {
        return std::env::current_dir().unwrap_or_default();
    }

    let path = Path::new(path);
    if path.is_absolute() {
        return path.to_path_buf();
    }

    std::fs::canonicalize(path)
        .unwrap_or_else(|_| std::env::current_dir().unwrap_or_default().join(path))
}

/// Expresses `path` relative to `base`, tolerating `/` and `/./` segments
/// on either side. Both inputs are expected to be absolute; paths outside
/// `base` are an error because the server would re-anchor them incorrectly.
pub fn relativize(base: &str, path: &str) -> Result<String> {
    let unrelated = || RelayErr::UnrelatedPaths {
        base: base.to_string(),
        path: path.to_string(),
    };

    let base_bytes = base.as_bytes();
    let path_bytes = path.as_bytes();
    let mut i = 0;
    let mut j = 0;

    loop {
        if j == base_bytes.len() || base_bytes[j] == b'/' {
            j = skip_separators(base_bytes, j);

            // A base component boundary must line up with one in the path.
            if i < path_bytes.len() && path_bytes[i] != b'/' {
                return Err(unrelated());
            }

            i = skip_separators(path_bytes, i);

            if j == base_bytes.len() {
                return Ok(path[i..].to_string());
            }
        }

        if i >= path_bytes.len() || base_bytes[j] != path_bytes[i] {
            return Err(unrelated());
        }

        i += 1;
        j += 1;
    }
}

/// Skips `/` and `/./` runs starting at `at`.
fn skip_separators(bytes: &[u8], mut at: usize) -> usize {
    while at < bytes.len()
        && (bytes[at] == b'/'
            || (bytes[at] == b'.' && (at + 1 == bytes.len() || bytes[at + 1] == b'/')))
    {
        at += 1;
    }
    at
}
