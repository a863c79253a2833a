//! Directory-tree data backend
//!
//! Layout under the target directory:
//!
//! ```text
//! <target>/containers/<container>/<dataset>/<fragment>.frag
//! <target>/shared-datasets/
//! <target>/shared-fragments/
//! ```
//!
//! Payloads are written to a temporary file and renamed into place, so a
//! location either holds a complete frame or nothing.

use super::{capabilities_from_config, BackendCapabilities, DataBackend, FsckReport, PerformanceModel};
use crate::compression::{self, Codec};
use crate::config::BackendConfig;
use crate::dataspace::Dataspace;
use crate::error::{EsdmError, Result};
use crate::fragment::{DatasetKey, FragmentId};
use crate::types::{Accessibility, FormatFlags};
use crate::utils::validate_name;
use async_trait::async_trait;
use bytes::Bytes;
use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};
use uuid::Uuid;

/// Top-level directories every formatted root contains
pub const LAYOUT_DIRS: [&str; 3] = ["containers", "shared-datasets", "shared-fragments"];

const FRAGMENT_EXT: &str = "frag";
const TMP_MARKER: &str = ".tmp-";

/// Filesystem data backend
#[derive(Debug)]
pub struct PosixBackend {
    id: String,
    root: PathBuf,
    accessibility: Accessibility,
    capabilities: BackendCapabilities,
    model: PerformanceModel,
    codec: Codec,
}

impl PosixBackend {
    /// Create a backend rooted at `root` without touching the filesystem
    pub fn new(id: impl Into<String>, root: impl AsRef<Path>) -> Self {
        Self {
            id: id.into(),
            root: root.as_ref().to_path_buf(),
            accessibility: Accessibility::Global,
            capabilities: BackendCapabilities::unbounded(),
            model: PerformanceModel::new(0.001, 500.0 * 1024.0 * 1024.0),
            codec: Codec::default(),
        }
    }

    /// Build from configuration and create the directory layout if absent
    pub async fn init(config: &BackendConfig) -> Result<Self> {
        let backend = Self::new(&config.id, &config.target)
            .with_accessibility(config.accessibility.unwrap_or(Accessibility::Global))
            .with_capabilities(capabilities_from_config(config))
            .with_performance_model(config.performance_model.into())
            .with_codec(Codec::new(config.compression, config.compression_level));

        debug!(backend = %backend.id, root = %backend.root.display(), "initializing POSIX backend");
        backend.ensure_layout().await?;
        Ok(backend)
    }

    pub fn with_accessibility(mut self, accessibility: Accessibility) -> Self {
        self.accessibility = accessibility;
        self
    }

    pub fn with_capabilities(mut self, capabilities: BackendCapabilities) -> Self {
        self.capabilities = capabilities;
        self
    }

    pub fn with_performance_model(mut self, model: PerformanceModel) -> Self {
        self.model = model;
        self
    }

    pub fn with_codec(mut self, codec: Codec) -> Self {
        self.codec = codec;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve a location token, refusing anything that escapes the root
    fn full_path(&self, location: &str) -> Result<PathBuf> {
        let relative = Path::new(location);
        let escapes = relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_)));
        if location.is_empty() || escapes {
            return Err(EsdmError::InvalidArgument(format!(
                "location '{}' is not a relative path inside the backend",
                location
            )));
        }
        Ok(self.root.join(relative))
    }

    fn io_error(&self, location: &str, err: std::io::Error) -> EsdmError {
        if err.kind() == ErrorKind::NotFound {
            EsdmError::NotFound(format!("{} on backend '{}'", location, self.id))
        } else {
            EsdmError::backend(&self.id, format!("{}: {}", location, err))
        }
    }

    /// Create missing layout directories; returns the ones created
    async fn ensure_layout(&self) -> Result<Vec<String>> {
        let mut created = Vec::new();
        for dir in std::iter::once("").chain(LAYOUT_DIRS) {
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

    async fn write_atomic(&self, location: &str, frame: &[u8]) -> Result<()> {
        let path = self.full_path(location)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| self.io_error(location, e))?;
        }

        let mut tmp = path.clone().into_os_string();
        tmp.push(format!("{}{}", TMP_MARKER, Uuid::new_v4().simple()));
        let tmp = PathBuf::from(tmp);

        let result = async {
            let mut file = fs::File::create(&tmp).await?;
            file.write_all(frame).await?;
            file.sync_all().await?;
            fs::rename(&tmp, &path).await
        }
        .await;

        if let Err(err) = result {
            let _ = fs::remove_file(&tmp).await;
            return Err(self.io_error(location, err));
        }
        Ok(())
    }

    /// Every file below `dir`, depth first
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
}

#[async_trait]
impl DataBackend for PosixBackend {
    fn id(&self) -> &str {
        &self.id
    }

    fn accessibility(&self) -> Accessibility {
        self.accessibility
    }

    fn capabilities(&self) -> &BackendCapabilities {
        &self.capabilities
    }

    fn performance_estimate(&self, space: &Dataspace) -> f64 {
        self.model.estimate(space.byte_size())
    }

    async fn create(&self, container: &str) -> Result<()> {
        validate_name("container", container)?;
        let location = format!("containers/{}", container);
        fs::create_dir_all(self.full_path(&location)?)
            .await
            .map_err(|e| self.io_error(&location, e))
    }

    async fn open(&self, container: &str) -> Result<()> {
        validate_name("container", container)?;
        let location = format!("containers/{}", container);
        let meta = fs::metadata(self.full_path(&location)?)
            .await
            .map_err(|e| self.io_error(&location, e))?;
        if !meta.is_dir() {
            return Err(EsdmError::backend(&self.id, format!("{} is not a directory", location)));
        }
        Ok(())
    }

    async fn allocate(&self, dataset: &DatasetKey, fragment: FragmentId, _bytes: u64) -> Result<String> {
        validate_name("container", &dataset.container)?;
        validate_name("dataset", &dataset.dataset)?;
        Ok(format!(
            "containers/{}/{}/{}.{}",
            dataset.container, dataset.dataset, fragment, FRAGMENT_EXT
        ))
    }

    async fn write(&self, location: &str, data: &[u8]) -> Result<()> {
        let frame = self.codec.encode(data)?;
        self.write_atomic(location, &frame).await
    }

    async fn read(&self, location: &str) -> Result<Bytes> {
        let path = self.full_path(location)?;
        let frame = fs::read(&path).await.map_err(|e| self.io_error(location, e))?;
        Ok(Bytes::from(compression::decode(&frame)?))
    }

    async fn update(&self, location: &str, data: &[u8]) -> Result<()> {
        let path = self.full_path(location)?;
        fs::metadata(&path).await.map_err(|e| self.io_error(location, e))?;
        self.write(location, data).await
    }

    async fn remove(&self, location: &str) -> Result<()> {
        let path = self.full_path(location)?;
        fs::remove_file(&path)
            .await
            .map_err(|e| self.io_error(location, e))
    }

    async fn lookup(&self, dataset: &DatasetKey) -> Result<Option<Vec<String>>> {
        let prefix = format!("containers/{}/{}", dataset.container, dataset.dataset);
        let dir = self.full_path(&prefix)?;
        let mut locations = Vec::new();
        for path in self.walk(&dir).await? {
            if path.extension().and_then(|e| e.to_str()) != Some(FRAGMENT_EXT) {
                continue;
            }
            if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
                locations.push(format!("{}/{}", prefix, name));
            }
        }
        locations.sort();
        Ok(Some(locations))
    }

    async fn mkfs(&self, flags: FormatFlags) -> Result<()> {
        let ignore = flags.contains(FormatFlags::IGNORE_ERRORS);

        if flags.contains(FormatFlags::DELETE) {
            debug!(backend = %self.id, root = %self.root.display(), "deleting backend root");
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

        for path in self.walk(&self.root.join("containers")).await? {
            let shown = path
                .strip_prefix(&self.root)
                .unwrap_or(&path)
                .display()
                .to_string();

            let is_tmp = path
                .file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.contains(TMP_MARKER));
            if is_tmp {
                fs::remove_file(&path)
                    .await
                    .map_err(|e| self.io_error(&shown, e))?;
                report.repaired.push(format!("removed partial write {}", shown));
                continue;
            }

            report.checked += 1;
            let frame = fs::read(&path).await.map_err(|e| self.io_error(&shown, e))?;
            if let Err(err) = compression::decode(&frame) {
                warn!(backend = %self.id, path = %shown, %err, "fragment failed validation");
                report.corrupt.push(shown);
            }
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compression::CompressionMethod;
    use tempfile::TempDir;

    fn backend(dir: &TempDir) -> PosixBackend {
        PosixBackend::new("p1", dir.path().join("root"))
    }

    #[tokio::test]
    async fn test_write_read_remove() {
        let temp_dir = TempDir::new().unwrap();
        let io = backend(&temp_dir);
        io.mkfs(FormatFlags::CREATE).await.unwrap();

        let key = DatasetKey::new("mycontainer", "mydataset");
        let location = io.allocate(&key, FragmentId::new(), 15).await.unwrap();
        assert!(location.starts_with("containers/mycontainer/mydataset/"));

        let data = b"Hello, ESDM!!!!";
        io.write(&location, data).await.unwrap();
        assert_eq!(&io.read(&location).await.unwrap()[..], data);

        let listed = io.lookup(&key).await.unwrap().unwrap();
        assert_eq!(listed, vec![location.clone()]);

        io.update(&location, b"updated").await.unwrap();
        assert_eq!(&io.read(&location).await.unwrap()[..], b"updated");

        io.remove(&location).await.unwrap();
        assert!(matches!(io.read(&location).await, Err(EsdmError::NotFound(_))));
        assert!(matches!(io.update(&location, b"x").await, Err(EsdmError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_compressed_payloads() {
        let temp_dir = TempDir::new().unwrap();
        let io = backend(&temp_dir).with_codec(Codec::new(CompressionMethod::Zstd, None));
        let location = "containers/c/d/x.frag";
        let data = vec![7u8; 64 * 1024];
        io.write(location, &data).await.unwrap();

        let on_disk = std::fs::metadata(io.root().join(location)).unwrap().len();
        assert!(on_disk < data.len() as u64);
        assert_eq!(io.read(location).await.unwrap().to_vec(), data);
    }

    #[tokio::test]
    async fn test_rejects_escaping_locations() {
        let temp_dir = TempDir::new().unwrap();
        let io = backend(&temp_dir);
        assert!(matches!(io.read("../etc/passwd").await, Err(EsdmError::InvalidArgument(_))));
        assert!(matches!(io.write("/abs", b"x").await, Err(EsdmError::InvalidArgument(_))));
        assert!(io.create("a/b").await.is_err());
    }

    #[tokio::test]
    async fn test_mkfs_layout_and_purge() {
        let temp_dir = TempDir::new().unwrap();
        let io = backend(&temp_dir);
        io.mkfs(FormatFlags::CREATE).await.unwrap();
        for dir in LAYOUT_DIRS {
            assert!(io.root().join(dir).is_dir());
        }

        io.write("containers/c/d/x.frag", b"data").await.unwrap();
        io.mkfs(FormatFlags::PURGE_RECREATE).await.unwrap();
        assert!(io.root().join("containers").is_dir());
        assert!(!io.root().join("containers/c").exists());

        io.mkfs(FormatFlags::DELETE).await.unwrap();
        assert!(!io.root().exists());
        assert!(io.mkfs(FormatFlags::DELETE).await.is_err());
        io.mkfs(FormatFlags::DELETE | FormatFlags::IGNORE_ERRORS).await.unwrap();
    }

    #[tokio::test]
    async fn test_open_requires_container() {
        let temp_dir = TempDir::new().unwrap();
        let io = backend(&temp_dir);
        io.mkfs(FormatFlags::CREATE).await.unwrap();
        assert!(matches!(io.open("nope").await, Err(EsdmError::NotFound(_))));
        io.create("yes").await.unwrap();
        io.open("yes").await.unwrap();
    }

    #[tokio::test]
    async fn test_fsck_repairs_and_reports() {
        let temp_dir = TempDir::new().unwrap();
        let io = backend(&temp_dir);
        io.mkfs(FormatFlags::CREATE).await.unwrap();
        io.write("containers/c/d/good.frag", b"good").await.unwrap();

        std::fs::write(io.root().join("containers/c/d/bad.frag"), b"garbage").unwrap();
        std::fs::write(io.root().join("containers/c/d/x.frag.tmp-1234"), b"partial").unwrap();
        std::fs::remove_dir(io.root().join("shared-fragments")).unwrap();

        let report = io.fsck().await.unwrap();
        assert_eq!(report.checked, 2);
        assert_eq!(report.corrupt, vec!["containers/c/d/bad.frag".to_string()]);
        assert!(report.repaired.contains(&"shared-fragments".to_string()));
        assert!(report.repaired.iter().any(|r| r.contains("partial write")));
        assert!(io.root().join("shared-fragments").is_dir());
        assert!(!io.root().join("containers/c/d/x.frag.tmp-1234").exists());
    }
}
