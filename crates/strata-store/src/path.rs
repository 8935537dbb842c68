use std::fmt::Write as _;
use std::path::{Path, PathBuf};

use strata_types::validate_key;

use crate::error::StoreResult;

/// Prefix of in-flight temp files. Never produced by [`PathStrategy::safe_path`],
/// which always encodes a leading `'.'`.
pub const TMP_PREFIX: &str = ".tmp-";

/// Shard directory used for keys too short to fill every shard level.
pub const SHARD_PLACEHOLDER: &str = "000";

const SHARD_WIDTH: usize = 2;

/// Maps keys to file locations under a root directory.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum PathStrategy {
    /// Every blob directly under the root.
    #[default]
    Flat,
    /// `depth` levels of two-character directories taken from the start of
    /// the encoded key: `ab/cd/abcdef...` for depth 2.
    Sharded { depth: usize },
}

impl PathStrategy {
    /// Encode a key into a single safe path component.
    ///
    /// Bytes outside `[A-Za-z0-9._ -]` become `%XX`, and a leading `'.'` is
    /// encoded so the result is never `.`, `..` or a hidden file. The
    /// mapping is injective.
    pub fn safe_path(key: &str) -> String {
        let mut out = String::with_capacity(key.len());
        for (i, b) in key.bytes().enumerate() {
            let keep = b.is_ascii_alphanumeric()
                || matches!(b, b'_' | b' ' | b'-')
                || (b == b'.' && i > 0);
            if keep {
                out.push(b as char);
            } else {
                let _ = write!(out, "%{b:02X}");
            }
        }
        out
    }

    /// Inverse of [`safe_path`](Self::safe_path). Returns `None` for names
    /// it could not have produced (temp files, malformed escapes).
    pub fn key_from_file_name(name: &str) -> Option<String> {
        if name.starts_with('.') {
            return None;
        }
        let bytes = name.as_bytes();
        let mut out = Vec::with_capacity(bytes.len());
        let mut i = 0;
        while i < bytes.len() {
            if bytes[i] == b'%' {
                let hex = name.get(i + 1..i + 3)?;
                out.push(u8::from_str_radix(hex, 16).ok()?);
                i += 3;
            } else {
                out.push(bytes[i]);
                i += 1;
            }
        }
        String::from_utf8(out).ok()
    }

    /// Location of `key` under `root`.
    pub fn path_for_key(&self, root: &Path, key: &str) -> StoreResult<PathBuf> {
        validate_key(key)?;
        let name = Self::safe_path(key);
        match *self {
            Self::Flat => Ok(root.join(name)),
            Self::Sharded { depth } => {
                let mut path = root.to_path_buf();
                if name.len() < depth * SHARD_WIDTH {
                    path.push(SHARD_PLACEHOLDER);
                } else {
                    for level in 0..depth {
                        // The encoded name is pure ASCII, so byte slicing is safe.
                        let segment = &name[level * SHARD_WIDTH..(level + 1) * SHARD_WIDTH];
                        if segment == ".." {
                            path.push("%2E%2E");
                        } else {
                            path.push(segment);
                        }
                    }
                }
                path.push(name);
                Ok(path)
            }
        }
    }

    /// Returns `true` for in-flight temp files.
    pub fn is_temp_file(path: &Path) -> bool {
        path.file_name()
            .and_then(|n| n.to_str())
            .map_or(false, |n| n.starts_with(TMP_PREFIX))
    }
}
