use crate::config::schema::VerifyConfig;
use crate::error::IntegrityError;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::Read;
use std::path::Path;

/// Slack allowed when re-checking installed files against rounded registry sizes
pub const SIZE_TOLERANCE_BYTES: u64 = 1024;

/// Files smaller than this are treated as truncated or placeholders
pub const DEFAULT_MIN_ARTIFACT_BYTES: u64 = 1024;

const HASH_BUFFER_BYTES: usize = 1024 * 1024;
const HEADER_PROBE_BYTES: usize = 64;

/// How strictly to compare the on-disk size
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SizeCheck {
    /// Required for freshly downloaded files
    Exact,
    /// Allows `SIZE_TOLERANCE_BYTES` either way; for retained copies checked
    /// against registry sizes
    Tolerant,
}

/// Supported digest algorithms
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChecksumAlgorithm {
    Sha256,
}

/// An algorithm-tagged checksum such as `sha256:<hex>`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Checksum {
    pub algorithm: ChecksumAlgorithm,
    pub hex: String,
}

impl Checksum {
    /// Parse a tagged checksum. A bare 64-character hex string is read as SHA-256.
    pub fn parse(value: &str) -> Result<Self, IntegrityError> {
        let value = value.trim();
        let (algorithm, hex) = match value.split_once(':') {
            Some((tag, hex)) => (tag.trim().to_ascii_lowercase(), hex.trim()),
            None if value.len() == 64 => ("sha256".to_string(), value),
            None => return Err(IntegrityError::UnsupportedAlgorithm(value.to_string())),
        };

        match algorithm.as_str() {
            "sha256" | "sha-256" => {
                if hex.len() != 64 || !hex.chars().all(|c| c.is_ascii_hexdigit()) {
                    return Err(IntegrityError::UnsupportedAlgorithm(format!(
                        "sha256 digest must be 64 hex characters, got '{hex}'"
                    )));
                }
                Ok(Self {
                    algorithm: ChecksumAlgorithm::Sha256,
                    hex: hex.to_ascii_lowercase(),
                })
            }
            other => Err(IntegrityError::UnsupportedAlgorithm(other.to_string())),
        }
    }

    #[must_use]
    pub fn sha256(hex: impl Into<String>) -> Self {
        Self {
            algorithm: ChecksumAlgorithm::Sha256,
            hex: hex.into(),
        }
    }
}

impl std::fmt::Display for Checksum {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.algorithm {
            ChecksumAlgorithm::Sha256 => write!(f, "sha256:{}", self.hex),
        }
    }
}

/// Result of the checksum dimension
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChecksumOutcome {
    Matched,
    /// Registry had no checksum; the file is low-trust
    Skipped,
}

/// Known artifact layouts with a cheap header check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArtifactFormat {
    Gguf,
    Safetensors,
    Opaque,
}

impl ArtifactFormat {
    #[must_use]
    pub fn from_extension(ext: &str) -> Self {
        match ext.to_ascii_lowercase().as_str() {
            "gguf" => Self::Gguf,
            "safetensors" => Self::Safetensors,
            _ => Self::Opaque,
        }
    }
}

/// What a file is expected to look like
#[derive(Debug, Clone)]
pub struct Expectations<'a> {
    pub size_bytes: Option<u64>,
    pub checksum: Option<&'a str>,
    pub size_check: SizeCheck,
    pub format: ArtifactFormat,
}

/// Summary of a successful verification
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerificationReport {
    pub size_bytes: u64,
    /// Computed digest, always `sha256:<hex>`
    pub digest: String,
    pub checksum: ChecksumOutcome,
}

impl VerificationReport {
    #[must_use]
    pub fn is_low_trust(&self) -> bool {
        self.checksum == ChecksumOutcome::Skipped
    }
}

/// Size, checksum and structure checks for local files
#[derive(Debug, Clone, Copy)]
pub struct IntegrityVerifier {
    min_artifact_bytes: u64,
    require_checksum: bool,
}

impl Default for IntegrityVerifier {
    fn default() -> Self {
        Self::new(DEFAULT_MIN_ARTIFACT_BYTES, false)
    }
}

impl IntegrityVerifier {
    #[must_use]
    pub const fn new(min_artifact_bytes: u64, require_checksum: bool) -> Self {
        Self {
            min_artifact_bytes,
            require_checksum,
        }
    }

    #[must_use]
    pub const fn from_config(config: &VerifyConfig) -> Self {
        Self::new(config.min_artifact_bytes, config.require_checksum)
    }

    /// Compare the file size with the expected size
    pub fn verify_size(
        &self,
        path: &Path,
        expected: u64,
        mode: SizeCheck,
    ) -> Result<u64, IntegrityError> {
        let actual = std::fs::metadata(path)
            .map_err(|e| unreadable(path, &e))?
            .len();

        let ok = match mode {
            SizeCheck::Exact => actual == expected,
            SizeCheck::Tolerant => actual.abs_diff(expected) <= SIZE_TOLERANCE_BYTES,
        };

        if ok {
            Ok(actual)
        } else {
            Err(IntegrityError::SizeMismatch {
                path: path.to_path_buf(),
                expected,
                actual,
            })
        }
    }

    /// Stream the file through the tagged algorithm and compare digests
    ///
    /// Returns the outcome plus the computed `sha256:<hex>` digest. Without an
    /// expected checksum the check is skipped with a warning, or refused when
    /// checksums are required.
    pub fn verify_checksum(
        &self,
        path: &Path,
        expected: Option<&str>,
    ) -> Result<(ChecksumOutcome, String), IntegrityError> {
        let expected = self.expected_checksum(expected, &path.display().to_string())?;

        let computed = Checksum::sha256(sha256_file(path)?);

        match expected {
            Some(expected) if expected.hex == computed.hex => {
                Ok((ChecksumOutcome::Matched, computed.to_string()))
            }
            Some(expected) => Err(IntegrityError::ChecksumMismatch {
                path: path.to_path_buf(),
                expected: expected.to_string(),
                actual: computed.to_string(),
            }),
            None => {
                tracing::warn!(
                    "No checksum published for {}; installing as low-trust",
                    path.display()
                );
                Ok((ChecksumOutcome::Skipped, computed.to_string()))
            }
        }
    }

    /// Parse the published checksum for `subject` and apply the checksum policy
    ///
    /// Needs no file, so callers run it before downloading anything.
    pub fn expected_checksum(
        &self,
        expected: Option<&str>,
        subject: &str,
    ) -> Result<Option<Checksum>, IntegrityError> {
        match expected.map(str::trim).filter(|c| !c.is_empty()) {
            Some(value) => Checksum::parse(value).map(Some),
            None if self.require_checksum => {
                Err(IntegrityError::MissingChecksum(subject.to_string()))
            }
            None => Ok(None),
        }
    }

    /// Cheap sanity check against truncated files and placeholder payloads
    pub fn verify_structure(
        &self,
        path: &Path,
        format: ArtifactFormat,
    ) -> Result<(), IntegrityError> {
        let mut file = File::open(path).map_err(|e| unreadable(path, &e))?;
        let len = file.metadata().map_err(|e| unreadable(path, &e))?.len();

        let structure = |reason: String| IntegrityError::Structure {
            path: path.to_path_buf(),
            reason,
        };

        if len < self.min_artifact_bytes {
            return Err(structure(format!(
                "file is {len} bytes, below the {} byte minimum",
                self.min_artifact_bytes
            )));
        }

        let mut header = Vec::with_capacity(HEADER_PROBE_BYTES);
        file.by_ref()
            .take(HEADER_PROBE_BYTES as u64)
            .read_to_end(&mut header)
            .map_err(|e| unreadable(path, &e))?;

        if header.starts_with(b"version https://git-lfs") {
            return Err(structure("git-lfs pointer file, not model data".to_string()));
        }

        let text_start: Vec<u8> = header
            .iter()
            .skip_while(|b| b.is_ascii_whitespace())
            .take(14)
            .map(u8::to_ascii_lowercase)
            .collect();
        if text_start.starts_with(b"<!doctype html") || text_start.starts_with(b"<html") {
            return Err(structure("HTML page instead of model data".to_string()));
        }

        match format {
            ArtifactFormat::Gguf if !header.starts_with(b"GGUF") => {
                Err(structure("missing GGUF magic bytes".to_string()))
            }
            ArtifactFormat::Safetensors => {
                let mut len_bytes = [0u8; 8];
                if header.len() < 9 {
                    return Err(structure("safetensors header truncated".to_string()));
                }
                len_bytes.copy_from_slice(&header[..8]);
                let header_len = u64::from_le_bytes(len_bytes);
                if header_len == 0 || header_len.saturating_add(8) > len || header[8] != b'{' {
                    return Err(structure(format!(
                        "invalid safetensors header (declared {header_len} bytes)"
                    )));
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }

    /// Run every check; fails on the first dimension that does not pass
    pub fn verify(
        &self,
        path: &Path,
        expect: &Expectations<'_>,
    ) -> Result<VerificationReport, IntegrityError> {
        let size_bytes = match expect.size_bytes {
            Some(expected) => self.verify_size(path, expected, expect.size_check)?,
            None => std::fs::metadata(path)
                .map_err(|e| unreadable(path, &e))?
                .len(),
        };

        self.verify_structure(path, expect.format)?;
        let (checksum, digest) = self.verify_checksum(path, expect.checksum)?;

        Ok(VerificationReport {
            size_bytes,
            digest,
            checksum,
        })
    }
}

/// Hex-encoded SHA-256 of a file, read in 1 MiB chunks
pub fn sha256_file(path: &Path) -> Result<String, IntegrityError> {
    let mut file = File::open(path).map_err(|e| unreadable(path, &e))?;
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; HASH_BUFFER_BYTES];

    loop {
        let bytes_read = file.read(&mut buffer).map_err(|e| unreadable(path, &e))?;
        if bytes_read == 0 {
            break;
        }
        hasher.update(&buffer[..bytes_read]);
    }

    Ok(format!("{:x}", hasher.finalize()))
}

fn unreadable(path: &Path, err: &std::io::Error) -> IntegrityError {
    IntegrityError::Unreadable {
        path: path.to_path_buf(),
        reason: err.to_string(),
    }
}
