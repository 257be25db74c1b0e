use std::path::{Path, PathBuf};

use md5::Context as Md5Context;
use serde::{Deserialize, Serialize};
use sha1::Sha1;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, BufReader};
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum IntegrityError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("file not found: {}", .0.display())]
    NotFound(PathBuf),
}

/// Digest algorithms understood by the verifier.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum HashAlgorithm {
    Md5,
    Sha1,
    #[default]
    Sha256,
}

impl HashAlgorithm {
    /// Picks the algorithm whose hex digest has the given length. Unknown lengths use SHA-256.
    pub fn from_digest_len(len: usize) -> Self {
        match len {
            32 => HashAlgorithm::Md5,
            40 => HashAlgorithm::Sha1,
            _ => HashAlgorithm::Sha256,
        }
    }

    pub fn for_digest(digest: &str) -> Self {
        Self::from_digest_len(normalize_hash(digest).len())
    }
}

enum Hasher {
    Md5(Md5Context),
    Sha1(Sha1),
    Sha256(Sha256),
}

impl Hasher {
    fn new(algorithm: HashAlgorithm) -> Self {
        match algorithm {
            HashAlgorithm::Md5 => Hasher::Md5(Md5Context::new()),
            HashAlgorithm::Sha1 => Hasher::Sha1(Sha1::new()),
            HashAlgorithm::Sha256 => Hasher::Sha256(Sha256::new()),
        }
    }

    fn update(&mut self, data: &[u8]) {
        match self {
            Hasher::Md5(ctx) => ctx.consume(data),
            Hasher::Sha1(h) => h.update(data),
            Hasher::Sha256(h) => h.update(data),
        }
    }

    fn finish(self) -> String {
        match self {
            Hasher::Md5(ctx) => format!("{:x}", ctx.compute()),
            Hasher::Sha1(h) => hex::encode(h.finalize()),
            Hasher::Sha256(h) => format!("{:x}", h.finalize()),
        }
    }
}

/// Compute the hex digest of a file without loading it into memory.
pub async fn compute_digest(path: &Path, algorithm: HashAlgorithm) -> Result<String, IntegrityError> {
    let file = match File::open(path).await {
        Ok(file) => file,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(IntegrityError::NotFound(path.to_path_buf()))
        }
        Err(e) => return Err(e.into()),
    };
    let mut reader = BufReader::new(file);
    let mut hasher = Hasher::new(algorithm);
    let mut buffer = [0u8; 1024 * 8];
    loop {
        let n = reader.read(&mut buffer).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buffer[..n]);
    }
    Ok(hasher.finish())
}

/// Compute SHA256 hash of a file asynchronously.
pub async fn sha256_sum(path: &Path) -> Result<String, IntegrityError> {
    compute_digest(path, HashAlgorithm::Sha256).await
}

/// Lower-cases a digest and strips the separators commonly found in published hashes.
pub fn normalize_hash(hash: &str) -> String {
    hash.chars()
        .filter(|c| !matches!(c, '-' | ' ' | ':'))
        .flat_map(char::to_lowercase)
        .collect()
}

/// Case- and separator-insensitive digest comparison. Empty input never matches.
pub fn verify_hash(actual: &str, expected: &str) -> bool {
    if actual.trim().is_empty() || expected.trim().is_empty() {
        return false;
    }
    normalize_hash(actual) == normalize_hash(expected)
}

/// Checks a file against an expected digest, choosing the algorithm by digest length.
///
/// A missing file or an empty expectation is reported as "not verified"; I/O errors while
/// reading an existing file are propagated.
pub async fn verify_file_integrity(path: &Path, expected: &str) -> Result<bool, IntegrityError> {
    let expected = normalize_hash(expected);
    if expected.is_empty() {
        debug!(path = %path.display(), "no digest to verify against");
        return Ok(false);
    }
    let algorithm = HashAlgorithm::from_digest_len(expected.len());
    match compute_digest(path, algorithm).await {
        Ok(actual) => {
            let ok = verify_hash(&actual, &expected);
            if !ok {
                warn!(path = %path.display(), %expected, %actual, "digest mismatch");
            }
            Ok(ok)
        }
        Err(IntegrityError::NotFound(p)) => {
            warn!(path = %p.display(), "file to verify does not exist");
            Ok(false)
        }
        Err(e) => Err(e),
    }
}

/// First whitespace-separated token of a digest sidecar (`<hex> <file-name>`), normalized.
pub fn parse_digest_sidecar(content: &str) -> Option<String> {
    content
        .split_whitespace()
        .next()
        .map(normalize_hash)
        .filter(|hash| !hash.is_empty())
}

/// Reads the digest stored in a hash file.
pub async fn read_hash_file(path: &Path) -> Result<Option<String>, IntegrityError> {
    match tokio::fs::read_to_string(path).await {
        Ok(content) => Ok(parse_digest_sidecar(&content)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            Err(IntegrityError::NotFound(path.to_path_buf()))
        }
        Err(e) => Err(e.into()),
    }
}

/// Writes `<hex-digest> <file-name>` for `file` into `hash_path` and returns the digest.
pub async fn write_hash_file(
    file: &Path,
    hash_path: &Path,
    algorithm: HashAlgorithm,
) -> Result<String, IntegrityError> {
    let digest = compute_digest(file, algorithm).await?;
    let name = file
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    tokio::fs::write(hash_path, format!("{digest} {name}")).await?;
    Ok(digest)
}

/// Verifies `file` against the digest stored in `hash_path`.
pub async fn verify_with_hash_file(file: &Path, hash_path: &Path) -> Result<bool, IntegrityError> {
    match read_hash_file(hash_path).await {
        Ok(Some(expected)) => verify_file_integrity(file, &expected).await,
        Ok(None) | Err(IntegrityError::NotFound(_)) => Ok(false),
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const HELLO_SHA256: &str = "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824";
    const HELLO_SHA1: &str = "aaf4c61ddcc5e8a2dabede0f3b482cd9aea9434d";
    const HELLO_MD5: &str = "5d41402abc4b2a76b9719d911017c592";

    async fn hello_file(dir: &TempDir) -> PathBuf {
        let path = dir.path().join("hello.bin");
        tokio::fs::write(&path, b"hello").await.unwrap();
        path
    }

    #[test]
    fn hash_comparison_ignores_case_and_separators() {
        assert!(verify_hash("AB12", "ab-12"));
        assert!(verify_hash("ab 12", "AB:12"));
        assert!(!verify_hash("", "ab12"));
        assert!(!verify_hash("ab12", "  "));
        assert!(!verify_hash("ab12", "ab13"));
    }

    #[test]
    fn algorithm_follows_digest_length() {
        assert_eq!(HashAlgorithm::for_digest(HELLO_MD5), HashAlgorithm::Md5);
        assert_eq!(HashAlgorithm::for_digest(HELLO_SHA1), HashAlgorithm::Sha1);
        assert_eq!(HashAlgorithm::for_digest(HELLO_SHA256), HashAlgorithm::Sha256);
        assert_eq!(HashAlgorithm::from_digest_len(12), HashAlgorithm::Sha256);
    }

    #[test]
    fn sidecar_takes_first_token() {
        assert_eq!(
            parse_digest_sidecar("ABCDEF  App_1.1.0.msix\n").as_deref(),
            Some("abcdef")
        );
        assert_eq!(parse_digest_sidecar("   \n"), None);
    }

    #[tokio::test]
    async fn computes_each_algorithm() {
        let dir = TempDir::new().unwrap();
        let path = hello_file(&dir).await;
        assert_eq!(sha256_sum(&path).await.unwrap(), HELLO_SHA256);
        assert_eq!(compute_digest(&path, HashAlgorithm::Sha1).await.unwrap(), HELLO_SHA1);
        assert_eq!(compute_digest(&path, HashAlgorithm::Md5).await.unwrap(), HELLO_MD5);
    }

    #[tokio::test]
    async fn verifies_file_with_any_supported_digest() {
        let dir = TempDir::new().unwrap();
        let path = hello_file(&dir).await;
        assert!(verify_file_integrity(&path, &HELLO_SHA256.to_uppercase()).await.unwrap());
        assert!(verify_file_integrity(&path, HELLO_MD5).await.unwrap());
        assert!(!verify_file_integrity(&path, HELLO_SHA1.replace('a', "b").as_str()).await.unwrap());
        assert!(!verify_file_integrity(&path, "").await.unwrap());
    }

    #[tokio::test]
    async fn missing_file_is_not_found_or_unverified() {
        let dir = TempDir::new().unwrap();
        let missing = dir.path().join("nope.msix");
        assert!(matches!(
            sha256_sum(&missing).await,
            Err(IntegrityError::NotFound(_))
        ));
        assert!(!verify_file_integrity(&missing, HELLO_SHA256).await.unwrap());
    }

    #[tokio::test]
    async fn hash_file_round_trip() {
        let dir = TempDir::new().unwrap();
        let path = hello_file(&dir).await;
        let hash_path = dir.path().join("hello.bin.sha1");
        let digest = write_hash_file(&path, &hash_path, HashAlgorithm::Sha1).await.unwrap();
        assert_eq!(digest, HELLO_SHA1);

        let stored = tokio::fs::read_to_string(&hash_path).await.unwrap();
        assert_eq!(stored, format!("{HELLO_SHA1} hello.bin"));
        assert!(verify_with_hash_file(&path, &hash_path).await.unwrap());

        tokio::fs::write(&path, b"tampered").await.unwrap();
        assert!(!verify_with_hash_file(&path, &hash_path).await.unwrap());
        assert!(!verify_with_hash_file(&path, &dir.path().join("absent")).await.unwrap());
    }
}
