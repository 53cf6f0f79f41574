//! Artifact fetching: download, validate, extract, clean up.
//!
//! Each fetch owns a unique staging subdirectory, so concurrent fetches into
//! the same staging root never collide. Local sources are used in place and
//! are never deleted.

pub mod bundle;

use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::checksum::{self, ChecksumAlgorithm};
use crate::error::{Error, Result};
use crate::retry::{self, RetryConfig};

/// Default download timeout.
pub const DEFAULT_DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(30 * 60);

static STAGING_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Format of an import source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceFormat {
    /// Root filesystem tarball (optionally gzip-compressed).
    Tar,
    /// Virtual hard disk (`.vhdx`).
    Vhd,
    /// App-package bundle that contains a rootfs.
    Bundle,
}

impl SourceFormat {
    /// Guess the format from a path or URL extension.
    pub fn detect(source: &str) -> Self {
        let lower = source.to_ascii_lowercase();
        if bundle::is_bundle(&lower) {
            Self::Bundle
        } else if lower.ends_with(".vhdx") || lower.ends_with(".vhd") {
            Self::Vhd
        } else {
            Self::Tar
        }
    }
}

/// Where an artifact comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Source {
    /// Remote URL, downloaded into staging.
    Remote(String),
    /// Local path, used in place.
    Local(PathBuf),
}

impl Source {
    /// Parse a path, `file://` URL or `http(s)://` URL.
    pub fn parse(source: &str) -> Self {
        let lower = source.to_ascii_lowercase();
        if lower.starts_with("http://") || lower.starts_with("https://") {
            Self::Remote(source.to_string())
        } else if let Some(rest) = source.strip_prefix("file://") {
            Self::Local(PathBuf::from(rest))
        } else {
            Self::Local(PathBuf::from(source))
        }
    }

    /// Whether the source must be downloaded.
    pub fn is_remote(&self) -> bool {
        matches!(self, Self::Remote(_))
    }
}

/// What to fetch and how to validate it.
#[derive(Debug, Clone)]
pub struct FetchRequest {
    /// Path or URL.
    pub source: String,
    /// Expected hex digest, if any.
    pub checksum: Option<String>,
    /// Digest algorithm.
    pub algorithm: ChecksumAlgorithm,
    /// Extract the rootfs from a bundle after validation.
    pub extract: bool,
    /// Keep a downloaded artifact even when validation fails.
    pub retain_on_failure: bool,
}

impl FetchRequest {
    /// Fetch a source without validation or extraction.
    pub fn new(source: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            checksum: None,
            algorithm: ChecksumAlgorithm::default(),
            extract: false,
            retain_on_failure: false,
        }
    }

    /// Validate against an expected digest.
    pub fn checksum(mut self, expected: impl Into<String>, algorithm: ChecksumAlgorithm) -> Self {
        self.checksum = Some(expected.into());
        self.algorithm = algorithm;
        self
    }

    /// Extract the rootfs from a bundle.
    pub fn extract(mut self, extract: bool) -> Self {
        self.extract = extract;
        self
    }
}

/// A fetched, validated artifact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Artifact {
    /// Original path or URL.
    pub source: String,
    /// Where the artifact is on disk.
    pub local_path: PathBuf,
    /// Verified digest, if a checksum was supplied.
    pub checksum: Option<String>,
    pub algorithm: Option<ChecksumAlgorithm>,
    /// Extracted rootfs for bundles.
    pub extracted_path: Option<PathBuf>,
    /// Staging directory owned by this artifact.
    pub staging_dir: Option<PathBuf>,
}

impl Artifact {
    /// The file to hand to `wsl --import`.
    pub fn payload_path(&self) -> &Path {
        self.extracted_path.as_deref().unwrap_or(&self.local_path)
    }
}

/// Downloads remote sources.
pub trait Transport: Send + Sync {
    /// Download `url` into `dest`, returning the number of bytes written.
    fn download(&self, url: &str, dest: &Path) -> Result<u64>;
}

/// HTTP transport backed by ureq.
pub struct HttpTransport {
    agent: ureq::Agent,
}

impl HttpTransport {
    /// Create a transport with a global request timeout.
    pub fn new(timeout: Duration) -> Self {
        let config = ureq::Agent::config_builder()
            .timeout_global(Some(timeout))
            .build();
        Self {
            agent: config.into(),
        }
    }
}

impl Default for HttpTransport {
    fn default() -> Self {
        Self::new(DEFAULT_DOWNLOAD_TIMEOUT)
    }
}

impl Transport for HttpTransport {
    fn download(&self, url: &str, dest: &Path) -> Result<u64> {
        let mut response = self
            .agent
            .get(url)
            .header("User-Agent", "wslctl")
            .call()
            .map_err(|e| retry::with_url(e.into(), url))?;

        let mut file = File::create(dest).map_err(|e| Error::io(dest, e))?;
        let mut reader = response.body_mut().as_reader();
        io::copy(&mut reader, &mut file).map_err(|e| Error::Download {
            url: url.to_string(),
            message: e.to_string(),
            status: None,
        })
    }
}

/// Fetches artifacts into unique staging directories.
pub struct ArtifactFetcher {
    transport: Box<dyn Transport>,
    staging_root: PathBuf,
    retry: RetryConfig,
}

impl ArtifactFetcher {
    /// Create a fetcher with the HTTP transport.
    pub fn new(staging_root: impl Into<PathBuf>) -> Self {
        Self::with_transport(staging_root, Box::new(HttpTransport::default()))
    }

    /// Create a fetcher with a custom transport (useful for testing).
    pub fn with_transport(staging_root: impl Into<PathBuf>, transport: Box<dyn Transport>) -> Self {
        Self {
            transport,
            staging_root: staging_root.into(),
            retry: RetryConfig::default(),
        }
    }

    /// Override download retry behaviour.
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Default staging root under the system temp directory.
    pub fn default_staging_root() -> PathBuf {
        std::env::temp_dir().join("wslctl")
    }

    /// Staging root in use.
    pub fn staging_root(&self) -> &Path {
        &self.staging_root
    }

    /// Fetch, validate and optionally extract an artifact.
    ///
    /// A checksum mismatch aborts before extraction. A downloaded artifact
    /// that fails validation is deleted unless `retain_on_failure` is set.
    pub fn fetch(&self, request: &FetchRequest) -> Result<Artifact> {
        let source = Source::parse(&request.source);
        let mut staging: Option<PathBuf> = None;

        let local_path = match &source {
            Source::Remote(url) => {
                let dir = self.create_staging()?;
                let dest = dir.join(url_to_filename(url));
                staging = Some(dir);
                log::info!("downloading {} to {}", url, dest.display());
                let bytes = retry::with_retry(&self.retry, "download", || {
                    self.transport.download(url, &dest)
                })
                .inspect_err(|_| self.discard(staging.as_deref(), request.retain_on_failure))?;
                log::debug!("downloaded {} bytes", bytes);
                dest
            }
            Source::Local(path) => {
                if !path.exists() {
                    return Err(Error::io(
                        path,
                        io::Error::new(io::ErrorKind::NotFound, "source does not exist"),
                    ));
                }
                path.clone()
            }
        };

        let verified = match &request.checksum {
            Some(expected) => Some(
                checksum::verify_file(&local_path, expected, request.algorithm)
                    .inspect_err(|_| self.discard(staging.as_deref(), request.retain_on_failure))?,
            ),
            None => None,
        };

        let extracted_path = if request.extract {
            let dir = match &staging {
                Some(dir) => dir.clone(),
                None => {
                    let dir = self.create_staging()?;
                    staging = Some(dir.clone());
                    dir
                }
            };
            Some(
                bundle::extract_rootfs(&local_path, &dir)
                    .inspect_err(|_| self.discard(staging.as_deref(), request.retain_on_failure))?,
            )
        } else {
            None
        };

        Ok(Artifact {
            source: request.source.clone(),
            local_path,
            checksum: verified,
            algorithm: request.checksum.as_ref().map(|_| request.algorithm),
            extracted_path,
            staging_dir: staging,
        })
    }

    /// Remove an artifact's staging directory. Local sources are untouched.
    pub fn cleanup(&self, artifact: &Artifact) -> Result<()> {
        match &artifact.staging_dir {
            Some(dir) if dir.exists() => {
                log::debug!("removing staging directory {}", dir.display());
                fs::remove_dir_all(dir).map_err(|e| Error::io(dir, e))
            }
            _ => Ok(()),
        }
    }

    fn create_staging(&self) -> Result<PathBuf> {
        let unique = format!(
            "fetch-{}-{}-{}",
            std::process::id(),
            chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default(),
            STAGING_COUNTER.fetch_add(1, Ordering::Relaxed)
        );
        let dir = self.staging_root.join(unique);
        fs::create_dir_all(&dir).map_err(|e| Error::io(&dir, e))?;
        Ok(dir)
    }

    fn discard(&self, staging: Option<&Path>, retain: bool) {
        if retain {
            return;
        }
        if let Some(dir) = staging
            && let Err(e) = fs::remove_dir_all(dir)
        {
            log::warn!("could not remove {}: {}", dir.display(), e);
        }
    }
}

/// Convert a URL to a safe filename.
fn url_to_filename(url: &str) -> String {
    let last = url
        .split(['?', '#'])
        .next()
        .unwrap_or(url)
        .trim_end_matches('/')
        .rsplit('/')
        .next()
        .unwrap_or_default();

    let sanitized: String = last
        .chars()
        .map(|c| {
            if c.is_alphanumeric() || c == '-' || c == '_' || c == '.' {
                c
            } else {
                '_'
            }
        })
        .collect();

    if sanitized.is_empty() || sanitized == "." || sanitized == ".." || last.contains(':') {
        "download".to_string()
    } else {
        sanitized
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    /// Serves fixed bodies by URL.
    #[derive(Default)]
    struct StaticTransport {
        bodies: HashMap<String, Vec<u8>>,
        calls: Mutex<usize>,
    }

    impl Transport for StaticTransport {
        fn download(&self, url: &str, dest: &Path) -> Result<u64> {
            *self.calls.lock().unwrap() += 1;
            let body = self.bodies.get(url).ok_or_else(|| Error::Download {
                url: url.to_string(),
                message: "HTTP 404".into(),
                status: Some(404),
            })?;
            fs::write(dest, body).unwrap();
            Ok(body.len() as u64)
        }
    }

    fn fetcher(root: &Path, bodies: &[(&str, &[u8])]) -> ArtifactFetcher {
        let transport = StaticTransport {
            bodies: bodies
                .iter()
                .map(|(u, b)| ((*u).to_string(), b.to_vec()))
                .collect(),
            calls: Mutex::new(0),
        };
        ArtifactFetcher::with_transport(root, Box::new(transport))
            .with_retry(RetryConfig::no_retry())
    }

    #[test]
    fn test_source_parse() {
        assert!(Source::parse("https://example.com/a.tar").is_remote());
        assert_eq!(
            Source::parse("file:///srv/rootfs.tar"),
            Source::Local(PathBuf::from("/srv/rootfs.tar"))
        );
        assert_eq!(
            Source::parse("C:\\wsl\\rootfs.tar"),
            Source::Local(PathBuf::from("C:\\wsl\\rootfs.tar"))
        );
    }

    #[test]
    fn test_source_format_detect() {
        assert_eq!(SourceFormat::detect("ubuntu.tar.gz"), SourceFormat::Tar);
        assert_eq!(SourceFormat::detect("disk.VHDX"), SourceFormat::Vhd);
        assert_eq!(SourceFormat::detect("Ubuntu.appxbundle"), SourceFormat::Bundle);
    }

    #[test]
    fn test_fetch_remote_with_valid_checksum() {
        let root = tempfile::tempdir().unwrap();
        let f = fetcher(root.path(), &[("https://example.com/rootfs.tar", &b"ROOTFS"[..])]);
        let digest = checksum::compute_bytes(b"ROOTFS", ChecksumAlgorithm::Sha256);

        let artifact = f
            .fetch(
                &FetchRequest::new("https://example.com/rootfs.tar")
                    .checksum(&digest, ChecksumAlgorithm::Sha256),
            )
            .unwrap();

        assert_eq!(artifact.checksum.as_deref(), Some(digest.as_str()));
        assert!(artifact.local_path.ends_with("rootfs.tar"));
        assert_eq!(fs::read(artifact.payload_path()).unwrap(), b"ROOTFS");

        let staging = artifact.staging_dir.clone().unwrap();
        assert!(staging.starts_with(root.path()));
        f.cleanup(&artifact).unwrap();
        assert!(!staging.exists());
    }

    #[test]
    fn test_fetch_remote_checksum_mismatch_discards_download() {
        let root = tempfile::tempdir().unwrap();
        let f = fetcher(root.path(), &[("https://example.com/rootfs.tar", &b"ROOTFS"[..])]);

        let err = f
            .fetch(
                &FetchRequest::new("https://example.com/rootfs.tar")
                    .checksum("00", ChecksumAlgorithm::Md5),
            )
            .unwrap_err();

        assert!(matches!(err, Error::ChecksumMismatch { .. }));
        assert_eq!(fs::read_dir(root.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_fetch_remote_checksum_mismatch_retained_on_request() {
        let root = tempfile::tempdir().unwrap();
        let f = fetcher(root.path(), &[("https://example.com/rootfs.tar", &b"ROOTFS"[..])]);
        let mut request =
            FetchRequest::new("https://example.com/rootfs.tar")
                .checksum("00", ChecksumAlgorithm::Md5);
        request.retain_on_failure = true;

        assert!(f.fetch(&request).is_err());
        assert_eq!(fs::read_dir(root.path()).unwrap().count(), 1);
    }

    #[test]
    fn test_fetch_local_is_used_in_place() {
        let root = tempfile::tempdir().unwrap();
        let src = tempfile::tempdir().unwrap();
        let path = src.path().join("rootfs.tar");
        fs::write(&path, b"LOCAL").unwrap();
        let f = fetcher(root.path(), &[]);

        let artifact = f.fetch(&FetchRequest::new(path.to_string_lossy())).unwrap();
        assert_eq!(artifact.local_path, path);
        assert!(artifact.staging_dir.is_none());

        // Cleanup never deletes a local source
        f.cleanup(&artifact).unwrap();
        assert!(path.exists());
    }

    #[test]
    fn test_fetch_local_checksum_mismatch_keeps_source() {
        let root = tempfile::tempdir().unwrap();
        let src = tempfile::tempdir().unwrap();
        let path = src.path().join("rootfs.tar");
        fs::write(&path, b"LOCAL").unwrap();
        let f = fetcher(root.path(), &[]);

        let err = f
            .fetch(
                &FetchRequest::new(path.to_string_lossy())
                    .checksum("abc", ChecksumAlgorithm::Sha256),
            )
            .unwrap_err();
        assert!(matches!(err, Error::ChecksumMismatch { .. }));
        assert!(path.exists());
    }

    #[test]
    fn test_fetch_missing_local_source() {
        let root = tempfile::tempdir().unwrap();
        let f = fetcher(root.path(), &[]);
        let err = f.fetch(&FetchRequest::new("/definitely/missing/rootfs.tar")).unwrap_err();
        assert!(matches!(err, Error::Io { .. }));
    }

    #[test]
    fn test_fetch_remote_404_cleans_staging() {
        let root = tempfile::tempdir().unwrap();
        let f = fetcher(root.path(), &[]);
        let err = f.fetch(&FetchRequest::new("https://example.com/missing.tar")).unwrap_err();
        assert!(matches!(err, Error::Download { status: Some(404), .. }));
        assert_eq!(fs::read_dir(root.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_staging_dirs_are_unique() {
        let root = tempfile::tempdir().unwrap();
        let f = fetcher(root.path(), &[]);
        let a = f.create_staging().unwrap();
        let b = f.create_staging().unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_url_to_filename() {
        assert_eq!(url_to_filename("https://example.com/file.tar.gz"), "file.tar.gz");
        assert_eq!(url_to_filename("https://example.com/file.tar.gz?token=abc"), "file.tar.gz");
        assert_eq!(url_to_filename("https://example.com/a b.tar"), "a_b.tar");
        assert_eq!(url_to_filename("https://example.com/"), "example.com");
    }
}
