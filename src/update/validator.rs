//! Archive validation
//!
//! Runs before anything is unpacked: the archive's SHA256 must match the
//! expected checksum, every entry must stay inside the extraction root, and
//! one of the configured bundle entry points must be present.
//!
//! Validation is blocking IO; callers run it on `spawn_blocking`.

use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use tracing::{debug, info};
use zip::ZipArchive;

use crate::core::error::{UpdateError, UpdateResult};

const HASH_BUFFER_SIZE: usize = 64 * 1024;

/// An archive that passed validation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidatedArchive {
    pub path: PathBuf,
    /// Lower-case hex SHA256 of the archive file
    pub checksum: String,
    /// Entry point path inside the archive
    pub entry_point: PathBuf,
    /// Number of file entries
    pub entries: usize,
    /// Sum of the declared uncompressed sizes
    pub unpacked_size: u64,
}

/// Checks archives against checksum, layout and entry point rules
#[derive(Debug, Clone)]
pub struct ArchiveValidator {
    entry_points: Vec<String>,
    require_checksum: bool,
}

impl ArchiveValidator {
    pub fn new(entry_points: Vec<String>, require_checksum: bool) -> Self {
        Self {
            entry_points,
            require_checksum,
        }
    }

    pub fn entry_points(&self) -> &[String] {
        &self.entry_points
    }

    pub fn validate(&self, path: &Path, expected_checksum: Option<&str>) -> UpdateResult<ValidatedArchive> {
        let expected = expected_checksum
            .map(normalize_checksum)
            .filter(|c| !c.is_empty());
        if self.require_checksum && expected.is_none() {
            return Err(UpdateError::ChecksumRequired);
        }

        let checksum = sha256_file(path)?;
        if let Some(expected) = expected {
            if expected != checksum {
                return Err(UpdateError::ChecksumMismatch {
                    expected,
                    actual: checksum,
                });
            }
            debug!("Checksum verified for {}", path.display());
        }

        let file = File::open(path)?;
        let mut archive = ZipArchive::new(file)
            .map_err(|e| UpdateError::CorruptArchive(format!("{}: {}", path.display(), e)))?;

        let mut entries = 0usize;
        let mut unpacked_size = 0u64;
        // (depth, priority, path)
        let mut best: Option<(usize, usize, PathBuf)> = None;

        for i in 0..archive.len() {
            let entry = archive
                .by_index(i)
                .map_err(|e| UpdateError::CorruptArchive(format!("entry {}: {}", i, e)))?;

            let name = entry.name().to_string();
            let enclosed = entry.enclosed_name().ok_or_else(|| {
                UpdateError::CorruptArchive(format!("entry escapes the bundle root: {}", name))
            })?;
            if entry.is_symlink() {
                return Err(UpdateError::CorruptArchive(format!(
                    "symbolic links are not allowed: {}",
                    name
                )));
            }
            if entry.is_dir() {
                continue;
            }

            entries += 1;
            unpacked_size = unpacked_size.saturating_add(entry.size());

            let file_name = enclosed
                .file_name()
                .and_then(|n| n.to_str())
                .unwrap_or_default();
            if let Some(priority) = self.entry_points.iter().position(|e| e == file_name) {
                let depth = enclosed.components().count();
                let better = match &best {
                    Some((d, p, _)) => (depth, priority) < (*d, *p),
                    None => true,
                };
                if better {
                    best = Some((depth, priority, enclosed));
                }
            }
        }

        let entry_point = match best {
            Some((_, _, path)) => path,
            None => {
                return Err(UpdateError::MissingEntryPoint {
                    expected: self.entry_points.join(", "),
                })
            }
        };

        info!(
            "Validated archive {} ({} files, {} bytes unpacked, entry point {})",
            path.display(),
            entries,
            unpacked_size,
            entry_point.display()
        );

        Ok(ValidatedArchive {
            path: path.to_path_buf(),
            checksum,
            entry_point,
            entries,
            unpacked_size,
        })
    }
}

/// Strip an optional `sha256:` prefix and lower-case the digest
pub fn normalize_checksum(checksum: &str) -> String {
    let trimmed = checksum.trim();
    let digest = match trimmed.get(..7) {
        Some(prefix) if prefix.eq_ignore_ascii_case("sha256:") => &trimmed[7..],
        _ => trimmed,
    };
    digest.trim().to_ascii_lowercase()
}

/// Streaming SHA256 of a file, lower-case hex
pub fn sha256_file(path: &Path) -> UpdateResult<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; HASH_BUFFER_SIZE];

    loop {
        let n = file.read(&mut buffer)?;
        if n == 0 {
            break;
        }
        hasher.update(&buffer[..n]);
    }

    Ok(format!("{:x}", hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::default_entry_points;
    use crate::update::test_support::{bundle_zip, sha256_hex, write_file, write_zip};
    use proptest::prelude::*;
    use tempfile::TempDir;

    fn validator() -> ArchiveValidator {
        ArchiveValidator::new(default_entry_points(), false)
    }

    #[test]
    fn test_valid_archive() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("v2.zip");
        let bytes = bundle_zip("v2");
        write_file(&path, &bytes);

        let validated = validator().validate(&path, Some(&sha256_hex(&bytes))).unwrap();
        assert_eq!(validated.checksum, sha256_hex(&bytes));
        assert_eq!(validated.entry_point, PathBuf::from("index.bundle"));
        assert_eq!(validated.entries, 2);
        assert!(validated.unpacked_size > 0);
    }

    #[test]
    fn test_checksum_prefix_and_case() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("v2.zip");
        let bytes = bundle_zip("v2");
        write_file(&path, &bytes);

        let expected = format!("SHA256:{}", sha256_hex(&bytes).to_uppercase());
        assert!(validator().validate(&path, Some(&expected)).is_ok());
    }

    #[test]
    fn test_checksum_mismatch() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("v2.zip");
        write_file(&path, &bundle_zip("v2"));

        let err = validator()
            .validate(&path, Some(&sha256_hex(b"something else")))
            .unwrap_err();
        assert!(matches!(err, UpdateError::ChecksumMismatch { .. }));
    }

    #[test]
    fn test_checksum_required() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("v2.zip");
        write_file(&path, &bundle_zip("v2"));

        let strict = ArchiveValidator::new(default_entry_points(), true);
        assert!(matches!(strict.validate(&path, None), Err(UpdateError::ChecksumRequired)));
        assert!(matches!(strict.validate(&path, Some("  ")), Err(UpdateError::ChecksumRequired)));
        // without the requirement a missing checksum is accepted
        assert!(validator().validate(&path, None).is_ok());
    }

    #[test]
    fn test_not_a_zip_is_corrupt() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("broken.zip");
        write_file(&path, b"definitely not a zip archive");

        let err = validator().validate(&path, None).unwrap_err();
        assert!(matches!(err, UpdateError::CorruptArchive(_)));
    }

    #[test]
    fn test_truncated_zip_is_corrupt() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("truncated.zip");
        let bytes = bundle_zip("v2");
        write_file(&path, &bytes[..bytes.len() / 2]);

        let err = validator().validate(&path, None).unwrap_err();
        assert!(matches!(err, UpdateError::CorruptArchive(_)));
    }

    #[test]
    fn test_escaping_entry_is_corrupt() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("evil.zip");
        write_zip(&path, &[("index.bundle", b"x"), ("../evil.sh", b"rm -rf")]);

        let err = validator().validate(&path, None).unwrap_err();
        assert!(matches!(err, UpdateError::CorruptArchive(_)));
    }

    #[test]
    fn test_missing_entry_point() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("noentry.zip");
        write_zip(&path, &[("assets/logo.png", b"png"), ("README.md", b"hi")]);

        let err = validator().validate(&path, None).unwrap_err();
        match err {
            UpdateError::MissingEntryPoint { expected } => {
                assert!(expected.contains("index.android.bundle"));
                assert!(expected.contains("main.jsbundle"));
            }
            other => panic!("unexpected error: {}", other),
        }
    }

    #[test]
    fn test_shallowest_entry_point_wins() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested.zip");
        write_zip(
            &path,
            &[
                ("node_modules/lib/index.bundle", b"nested"),
                ("dist/main.jsbundle", b"app"),
                ("dist/assets/a.png", b"png"),
            ],
        );

        let validated = validator().validate(&path, None).unwrap();
        assert_eq!(validated.entry_point, PathBuf::from("dist/main.jsbundle"));
    }

    #[test]
    fn test_entry_point_priority_breaks_ties() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("both.zip");
        write_zip(&path, &[("index.bundle", b"a"), ("index.android.bundle", b"b")]);

        let validated = validator().validate(&path, None).unwrap();
        assert_eq!(validated.entry_point, PathBuf::from("index.android.bundle"));
    }

    #[test]
    fn test_normalize_checksum() {
        assert_eq!(normalize_checksum("ABCDEF"), "abcdef");
        assert_eq!(normalize_checksum("sha256:ABCDEF"), "abcdef");
        assert_eq!(normalize_checksum("  Sha256:abc  "), "abc");
        assert_eq!(normalize_checksum("abc"), "abc");
    }

    proptest! {
        /// The streaming hash equals the one-shot digest for any content
        #[test]
        fn prop_sha256_file_matches_digest(content in proptest::collection::vec(any::<u8>(), 0..200_000)) {
            let dir = TempDir::new().unwrap();
            let path = dir.path().join("blob");
            std::fs::write(&path, &content).unwrap();
            prop_assert_eq!(sha256_file(&path).unwrap(), sha256_hex(&content));
        }

        /// Prefix and case never change the normalized digest
        #[test]
        fn prop_normalize_checksum_idempotent(hex in "[0-9a-fA-F]{64}", prefixed in any::<bool>()) {
            let input = if prefixed { format!("sha256:{}", hex) } else { hex.clone() };
            let normalized = normalize_checksum(&input);
            prop_assert_eq!(&normalized, &hex.to_ascii_lowercase());
            prop_assert_eq!(normalize_checksum(&normalized), normalized.clone());
        }
    }
}
