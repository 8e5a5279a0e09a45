//! Staging of uploaded function packages.
//!
//! A package (zip or tar archive, inlined or fetched from a URL) is
//! extracted into a fresh staging directory under the configured tmp root.
//! Extraction rejects entries that would escape the staging directory, and
//! the directory is always cleared before anything is written into it, so a
//! partial prior build can never leak into a new image.

use std::{
    fs,
    io::Read,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::{Context, Result};
use nanoid::nanoid;
use serde::Deserialize;
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::{
    data_model::PackageSource,
    error::Error,
};

const FETCH_TIMEOUT: Duration = Duration::from_secs(30);
const STAGING_ID_ALPHABET: [char; 36] = [
    'a', 'b', 'c', 'd', 'e', 'f', 'g', 'h', 'i', 'j', 'k', 'l', 'm', 'n', 'o', 'p', 'q', 'r', 's',
    't', 'u', 'v', 'w', 'x', 'y', 'z', '0', '1', '2', '3', '4', '5', '6', '7', '8', '9',
];

/// Entry-point manifest at the package root (or subfolder).
#[derive(Debug, Deserialize)]
struct PackageManifest {
    main: String,
}

/// A successfully staged package. `dir` is the staging root to discard when
/// the build is done; `source_dir` is the directory the image builder reads
/// (staging root plus the optional subfolder).
#[derive(Debug)]
pub struct StagedPackage {
    pub dir: PathBuf,
    pub source_dir: PathBuf,
    pub entry_point: String,
    pub content_hash: String,
}

pub struct WorkspaceManager {
    root: PathBuf,
    http: reqwest::Client,
}

impl WorkspaceManager {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        // Crash recovery: drop whatever a previous process left behind.
        ensure_clean_dir(&root).context("failed to initialize staging root")?;
        let http = reqwest::Client::builder()
            .timeout(FETCH_TIMEOUT)
            .build()
            .context("failed to build package fetch client")?;
        Ok(WorkspaceManager { root, http })
    }

    pub async fn stage(
        &self,
        source: &PackageSource,
        subfolder: Option<&str>,
    ) -> Result<StagedPackage, Error> {
        let bytes = match source {
            PackageSource::Archive(bytes) => bytes.clone(),
            PackageSource::Url(url) => self.fetch(url).await?,
        };
        let content_hash = hex::encode(Sha256::digest(&bytes));

        let dir = self.root.join(nanoid!(10, &STAGING_ID_ALPHABET));
        let staging = dir.clone();
        let extraction = tokio::task::spawn_blocking(move || {
            ensure_clean_dir(&staging)?;
            extract_package(&bytes, &staging)
        })
        .await
        .map_err(|e| Error::Internal(e.into()))?;
        if let Err(e) = extraction {
            self.discard_dir(&dir);
            return Err(Error::PackageInvalid(e.to_string()));
        }

        let source_dir = match subfolder {
            Some(sub) => resolve_subfolder(&dir, sub).map_err(|e| {
                self.discard_dir(&dir);
                Error::PackageInvalid(e.to_string())
            })?,
            None => dir.clone(),
        };

        let entry_point = match read_entry_point(&source_dir) {
            Ok(entry) => entry,
            Err(e) => {
                self.discard_dir(&dir);
                return Err(Error::PackageInvalid(e.to_string()));
            }
        };

        debug!(
            staging = %dir.display(),
            entry_point = %entry_point,
            "staged function package"
        );

        Ok(StagedPackage {
            dir,
            source_dir,
            entry_point,
            content_hash,
        })
    }

    pub fn discard(&self, package: &StagedPackage) {
        self.discard_dir(&package.dir);
    }

    fn discard_dir(&self, dir: &Path) {
        if let Err(e) = fs::remove_dir_all(dir) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(dir = %dir.display(), "failed to remove staging directory: {e}");
            }
        }
    }

    async fn fetch(&self, url: &str) -> Result<Vec<u8>, Error> {
        let response = self
            .http
            .get(url)
            .send()
            .await
            .map_err(|e| Error::RemoteFetchFailed {
                url: url.to_string(),
                source: e.into(),
            })?;
        if !response.status().is_success() {
            return Err(Error::RemoteFetchFailed {
                url: url.to_string(),
                source: anyhow::anyhow!("server returned status {}", response.status()),
            });
        }
        let bytes = response
            .bytes()
            .await
            .map_err(|e| Error::RemoteFetchFailed {
                url: url.to_string(),
                source: e.into(),
            })?;
        Ok(bytes.to_vec())
    }
}

/// Remove `dir` if it exists and recreate it empty.
pub(crate) fn ensure_clean_dir(dir: &Path) -> Result<()> {
    match fs::remove_dir_all(dir) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => {
            return Err(e).with_context(|| format!("failed to clear {}", dir.display()));
        }
    }
    fs::create_dir_all(dir).with_context(|| format!("failed to create {}", dir.display()))?;
    Ok(())
}

fn resolve_subfolder(dir: &Path, subfolder: &str) -> Result<PathBuf> {
    let mut resolved = dir.to_path_buf();
    for component in Path::new(subfolder).components() {
        match component {
            std::path::Component::Normal(part) => resolved.push(part),
            std::path::Component::CurDir => {}
            _ => anyhow::bail!("subfolder path {subfolder} escapes the package"),
        }
    }
    if !resolved.is_dir() {
        anyhow::bail!("subfolder path {subfolder} does not exist in the package");
    }
    Ok(resolved)
}

fn read_entry_point(dir: &Path) -> Result<String> {
    let manifest_path = dir.join("package.json");
    let raw = fs::read_to_string(&manifest_path).context("package manifest missing")?;
    let manifest: PackageManifest =
        serde_json::from_str(&raw).context("package manifest unparseable or missing main")?;
    Ok(manifest.main)
}

fn extract_package(bytes: &[u8], dest: &Path) -> Result<()> {
    if bytes.starts_with(b"PK") {
        extract_zip(bytes, dest)
    } else if bytes.starts_with(&[0x1f, 0x8b]) {
        let decoder = flate2::read::GzDecoder::new(bytes);
        tar::Archive::new(decoder)
            .unpack(dest)
            .context("failed to extract tar.gz package")
    } else {
        tar::Archive::new(bytes)
            .unpack(dest)
            .context("failed to decode package archive")
    }
}

fn extract_zip(bytes: &[u8], dest: &Path) -> Result<()> {
    let mut archive = zip::ZipArchive::new(std::io::Cursor::new(bytes))
        .context("failed to decode zip package")?;
    for index in 0..archive.len() {
        let mut file = archive
            .by_index(index)
            .context("failed to read zip entry")?;
        let Some(relative) = file.enclosed_name() else {
            anyhow::bail!("zip entry {} escapes the staging root", file.name());
        };
        let out_path = dest.join(relative);
        if file.is_dir() {
            fs::create_dir_all(&out_path)?;
            continue;
        }
        if let Some(parent) = out_path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut contents = Vec::with_capacity(file.size() as usize);
        file.read_to_end(&mut contents)?;
        fs::write(&out_path, contents)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use tempfile::TempDir;

    use super::*;

    fn zip_package(entries: &[(&str, &str)]) -> Vec<u8> {
        let mut writer = zip::ZipWriter::new(std::io::Cursor::new(Vec::new()));
        let options = zip::write::SimpleFileOptions::default();
        for (name, contents) in entries {
            writer.start_file(*name, options).unwrap();
            writer.write_all(contents.as_bytes()).unwrap();
        }
        writer.finish().unwrap().into_inner()
    }

    fn tar_gz_package(entries: &[(&str, &str)]) -> Vec<u8> {
        let mut builder = tar::Builder::new(Vec::new());
        for (name, contents) in entries {
            let mut header = tar::Header::new_gnu();
            header.set_path(name).unwrap();
            header.set_size(contents.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder.append(&header, contents.as_bytes()).unwrap();
        }
        let uncompressed = builder.into_inner().unwrap();
        let mut encoder =
            flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
        encoder.write_all(&uncompressed).unwrap();
        encoder.finish().unwrap()
    }

    fn manifest(main: &str) -> String {
        format!(r#"{{"name": "fn", "main": "{main}"}}"#)
    }

    #[tokio::test]
    async fn test_stage_zip_package() {
        let root = TempDir::new().unwrap();
        let manager = WorkspaceManager::new(root.path().join("staging")).unwrap();
        let bytes = zip_package(&[
            ("package.json", &manifest("index.js")),
            ("index.js", "module.exports = () => 'ok';"),
        ]);
        let expected_hash = hex::encode(Sha256::digest(&bytes));

        let staged = manager
            .stage(&PackageSource::Archive(bytes), None)
            .await
            .unwrap();
        assert_eq!(staged.entry_point, "index.js");
        assert_eq!(staged.content_hash, expected_hash);
        assert!(staged.source_dir.join("index.js").is_file());
        manager.discard(&staged);
        assert!(!staged.dir.exists());
    }

    #[tokio::test]
    async fn test_stage_tar_gz_package() {
        let root = TempDir::new().unwrap();
        let manager = WorkspaceManager::new(root.path().join("staging")).unwrap();
        let bytes = tar_gz_package(&[
            ("package.json", &manifest("fn.py")),
            ("fn.py", "def fn(input): return input"),
        ]);

        let staged = manager
            .stage(&PackageSource::Archive(bytes), None)
            .await
            .unwrap();
        assert_eq!(staged.entry_point, "fn.py");
        assert!(staged.source_dir.join("fn.py").is_file());
    }

    #[tokio::test]
    async fn test_stage_with_subfolder() {
        let root = TempDir::new().unwrap();
        let manager = WorkspaceManager::new(root.path().join("staging")).unwrap();
        let bytes = zip_package(&[
            ("examples/sieve/package.json", &manifest("index.js")),
            ("examples/sieve/index.js", "x"),
        ]);

        let staged = manager
            .stage(&PackageSource::Archive(bytes), Some("examples/sieve"))
            .await
            .unwrap();
        assert_eq!(staged.entry_point, "index.js");
        assert!(staged.source_dir.ends_with("examples/sieve"));
    }

    #[tokio::test]
    async fn test_stage_rejects_subfolder_escape() {
        let root = TempDir::new().unwrap();
        let manager = WorkspaceManager::new(root.path().join("staging")).unwrap();
        let bytes = zip_package(&[("package.json", &manifest("index.js"))]);

        let err = manager
            .stage(&PackageSource::Archive(bytes), Some("../outside"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::PackageInvalid(_)));
    }

    #[tokio::test]
    async fn test_stage_rejects_traversal_entry() {
        let root = TempDir::new().unwrap();
        let manager = WorkspaceManager::new(root.path().join("staging")).unwrap();
        let bytes = zip_package(&[
            ("../evil.txt", "pwned"),
            ("package.json", &manifest("index.js")),
        ]);

        let err = manager
            .stage(&PackageSource::Archive(bytes), None)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::PackageInvalid(_)));
        assert!(!root.path().join("evil.txt").exists());
    }

    #[tokio::test]
    async fn test_stage_rejects_missing_manifest() {
        let root = TempDir::new().unwrap();
        let manager = WorkspaceManager::new(root.path().join("staging")).unwrap();
        let bytes = zip_package(&[("index.js", "x")]);

        let err = manager
            .stage(&PackageSource::Archive(bytes), None)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::PackageInvalid(_)));
    }

    #[tokio::test]
    async fn test_stage_rejects_manifest_without_main() {
        let root = TempDir::new().unwrap();
        let manager = WorkspaceManager::new(root.path().join("staging")).unwrap();
        let bytes = zip_package(&[("package.json", r#"{"name": "fn"}"#)]);

        let err = manager
            .stage(&PackageSource::Archive(bytes), None)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::PackageInvalid(_)));
    }

    #[tokio::test]
    async fn test_stage_rejects_garbage_bytes() {
        let root = TempDir::new().unwrap();
        let manager = WorkspaceManager::new(root.path().join("staging")).unwrap();

        let err = manager
            .stage(&PackageSource::Archive(b"not an archive".to_vec()), None)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::PackageInvalid(_)));
    }

    #[test]
    fn test_ensure_clean_dir_clears_leftovers() {
        let root = TempDir::new().unwrap();
        let dir = root.path().join("stage");
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("leftover.js"), "stale").unwrap();

        ensure_clean_dir(&dir).unwrap();
        assert!(dir.is_dir());
        assert!(!dir.join("leftover.js").exists());
    }

    #[test]
    fn test_new_clears_stale_staging_root() {
        let root = TempDir::new().unwrap();
        let staging_root = root.path().join("staging");
        fs::create_dir_all(staging_root.join("old-build")).unwrap();

        WorkspaceManager::new(&staging_root).unwrap();
        assert!(staging_root.is_dir());
        assert!(!staging_root.join("old-build").exists());
    }
}
