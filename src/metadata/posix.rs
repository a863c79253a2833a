//! Metadata entries as JSON files in a directory tree
//!
//! Entry `datasets/c/d` lives at `<target>/datasets/c/d.json`. New entries
//! are written to a temporary file and hard-linked into place, which fails
//! if the entry already exists; updates use rename.

use super::{MetadataBackend, CONTAINERS, DATASETS, FRAGMENTS};
use crate::backend::FsckReport;
use crate::config::MetadataConfig;
use crate::error::{EsdmError, Result};
use crate::fragment::FragmentDescriptor;
use crate::types::{Accessibility, FormatFlags};
use async_trait::async_trait;
use bytes::Bytes;
use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};
use uuid::Uuid;

const ENTRY_EXT: &str = "json";
const TMP_MARKER: &str = ".tmp-";

/// Filesystem metadata backend
#[derive(Debug)]
pub struct PosixMetadata {
    id: String,
    root: PathBuf,
    accessibility: Accessibility,
}

impl PosixMetadata {
    pub fn new(id: impl Into<String>, root: impl AsRef<Path>) -> Self {
        Self {
            id: id.into(),
            root: root.as_ref().to_path_buf(),
            accessibility: Accessibility::Global,
        }
    }

    /// Build from configuration and create the directory layout if absent
    pub async fn init(config: &MetadataConfig) -> Result<Self> {
        let mut backend = Self::new(&config.id, &config.target);
        backend.accessibility = config.accessibility;
        debug!(backend = %backend.id, root = %backend.root.display(), "initializing POSIX metadata");
        backend.ensure_layout().await?;
        Ok(backend)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn relative(&self, key: &str) -> Result<PathBuf> {
        let path = Path::new(key);
        if key.is_empty() || path.components().any(|c| !matches!(c, Component::Normal(_))) {
            return Err(EsdmError::InvalidArgument(format!("invalid metadata key '{}'", key)));
        }
        Ok(path.to_path_buf())
    }

    // Appended rather than set: names may contain dots.
    fn entry_path(&self, key: &str) -> Result<PathBuf> {
        let mut path = self.root.join(self.relative(key)?).into_os_string();
        path.push(".");
        path.push(ENTRY_EXT);
        Ok(PathBuf::from(path))
    }

    fn io_error(&self, key: &str, err: std::io::Error) -> EsdmError {
        match err.kind() {
            ErrorKind::NotFound => EsdmError::NotFound(format!("entry '{}' in metadata backend '{}'", key, self.id)),
            ErrorKind::AlreadyExists => EsdmError::Conflict(format!("entry '{}' already exists", key)),
            _ => EsdmError::backend(&self.id, format!("{}: {}", key, err)),
        }
    }

    async fn ensure_layout(&self) -> Result<Vec<String>> {
        let mut created = Vec::new();
        for dir in ["", CONTAINERS, DATASETS, FRAGMENTS] {
            let path = self.root.join(dir);
            if fs::metadata(&path).await.is_err() {
                fs::create_dir_all(&path)
                    .await
                    .map_err(|e| self.io_error(&path.display().to_string(), e))?;
                if !dir.is_empty() {
                    created.push(dir.to_string());
                }
            }
        }
        Ok(created)
    }

    /// Write `payload` to a temporary sibling of `path` and return its name
    async fn write_tmp(&self, key: &str, path: &Path, payload: &[u8]) -> Result<PathBuf> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| self.io_error(key, e))?;
        }
        let mut tmp = path.as_os_str().to_owned();
        tmp.push(format!("{}{}", TMP_MARKER, Uuid::new_v4().simple()));
        let tmp = PathBuf::from(tmp);

        let result = async {
            let mut file = fs::File::create(&tmp).await?;
            file.write_all(payload).await?;
            file.sync_all().await
        }
        .await;
        if let Err(err) = result {
            let _ = fs::remove_file(&tmp).await;
            return Err(self.io_error(key, err));
        }
        Ok(tmp)
    }

    async fn walk(&self, dir: &Path) -> Result<Vec<PathBuf>> {
        let mut files = Vec::new();
        let mut pending = vec![dir.to_path_buf()];
        while let Some(next) = pending.pop() {
            let mut entries = match fs::read_dir(&next).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == ErrorKind::NotFound => continue,
                Err(e) => return Err(self.io_error(&next.display().to_string(), e)),
            };
            while let Some(entry) = entries
                .next_entry()
                .await
                .map_err(|e| self.io_error(&next.display().to_string(), e))?
            {
                let path = entry.path();
                let file_type = entry
                    .file_type()
                    .await
                    .map_err(|e| self.io_error(&path.display().to_string(), e))?;
                if file_type.is_dir() {
                    pending.push(path);
                } else {
                    files.push(path);
                }
            }
        }
        Ok(files)
    }

    fn key_of(&self, path: &Path) -> Option<String> {
        let relative = path.strip_prefix(&self.root).ok()?;
        let parts: Vec<&str> = relative
            .components()
            .map(|c| c.as_os_str().to_str())
            .collect::<Option<_>>()?;
        let joined = parts.join("/");
        let suffix = format!(".{}", ENTRY_EXT);
        joined.strip_suffix(&suffix).map(str::to_string)
    }
}

#[async_trait]
impl MetadataBackend for PosixMetadata {
    fn id(&self) -> &str {
        &self.id
    }

    fn accessibility(&self) -> Accessibility {
        self.accessibility
    }

    async fn entry_create(&self, key: &str, payload: &[u8]) -> Result<()> {
        let path = self.entry_path(key)?;
        let tmp = self.write_tmp(key, &path, payload).await?;
        let linked = fs::hard_link(&tmp, &path).await;
        let _ = fs::remove_file(&tmp).await;
        linked.map_err(|e| self.io_error(key, e))
    }

    async fn entry_retrieve(&self, key: &str) -> Result<Bytes> {
        let path = self.entry_path(key)?;
        let payload = fs::read(&path).await.map_err(|e| self.io_error(key, e))?;
        Ok(Bytes::from(payload))
    }

    async fn entry_update(&self, key: &str, payload: &[u8]) -> Result<()> {
        let path = self.entry_path(key)?;
        fs::metadata(&path).await.map_err(|e| self.io_error(key, e))?;
        let tmp = self.write_tmp(key, &path, payload).await?;
        if let Err(err) = fs::rename(&tmp, &path).await {
            let _ = fs::remove_file(&tmp).await;
            return Err(self.io_error(key, err));
        }
        Ok(())
    }

    async fn entry_destroy(&self, key: &str) -> Result<()> {
        let path = self.entry_path(key)?;
        fs::remove_file(&path).await.map_err(|e| self.io_error(key, e))
    }

    async fn entry_list(&self, prefix: &str) -> Result<Vec<String>> {
        let dir = self.root.join(self.relative(prefix)?);
        let mut keys: Vec<String> = self
            .walk(&dir)
            .await?
            .iter()
            .filter_map(|path| self.key_of(path))
            .collect();
        keys.sort();
        Ok(keys)
    }

    async fn mkfs(&self, flags: FormatFlags) -> Result<()> {
        let ignore = flags.contains(FormatFlags::IGNORE_ERRORS);

        if flags.contains(FormatFlags::DELETE) {
            debug!(backend = %self.id, root = %self.root.display(), "deleting metadata root");
            if let Err(err) = fs::remove_dir_all(&self.root).await {
                let err = self.io_error(&self.root.display().to_string(), err);
                if !ignore {
                    return Err(err);
                }
                warn!(backend = %self.id, %err, "ignoring mkfs delete failure");
            }
        }

        if flags.contains(FormatFlags::CREATE) {
            if let Err(err) = self.ensure_layout().await {
                if !ignore {
                    return Err(err);
                }
                warn!(backend = %self.id, %err, "ignoring mkfs create failure");
            }
        }
        Ok(())
    }

    async fn fsck(&self) -> Result<FsckReport> {
        let mut report = FsckReport {
            repaired: self.ensure_layout().await?,
            ..Default::default()
        };

        for path in self.walk(&self.root).await? {
            let name = path.display().to_string();
            let is_tmp = path
                .file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.contains(TMP_MARKER));
            if is_tmp {
                fs::remove_file(&path).await.map_err(|e| self.io_error(&name, e))?;
                report.repaired.push(format!("removed partial write {}", name));
                continue;
            }

            let Some(key) = self.key_of(&path) else {
                continue;
            };
            report.checked += 1;
            let payload = fs::read(&path).await.map_err(|e| self.io_error(&key, e))?;
            let valid = if key.starts_with(FRAGMENTS) {
                FragmentDescriptor::deserialize(&payload).is_ok()
            } else {
                serde_json::from_slice::<serde_json::Value>(&payload).is_ok()
            };
            if !valid {
                warn!(backend = %self.id, key = %key, "metadata entry failed validation");
                report.corrupt.push(key);
            }
        }
        Ok(report)
    }
}
