//! Loading of the JSON and pointer files describing containers, images and layers.
//!
//! The reader only loads named files at caller-supplied paths relative to the
//! Docker root; it knows nothing about drivers. All access goes through a
//! [`cap_std::fs::Dir`] handle on the root, so symlinks in the evidence can
//! never lead reads outside of it.
//!
//! # Document Layout
//!
//! ```text
//! <docker-root>/
//! +-- containers/<container-id>/config.v2.json
//! +-- image/<driver>/
//!     +-- repositories.json
//!     +-- imagedb/content/sha256/<image-hex>          # image config
//!     +-- imagedb/metadata/sha256/<image-hex>/parent  # optional
//!     +-- layerdb/sha256/<chain-hex>/{diff,parent,size,cache-id}
//!     +-- layerdb/mounts/<container-id>/{mount-id,init-id,parent}
//! ```

use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use cap_std::fs::Dir;
use serde::de::DeserializeOwned;
use serde::Deserialize;

use crate::error::{ExplorerError, Result};

/// Read-only access to metadata files below a Docker root.
#[derive(Debug)]
pub struct MetadataReader {
    dir: Dir,
}

impl MetadataReader {
    /// Wrap a directory handle on the Docker root.
    pub fn new(dir: Dir) -> Self {
        Self { dir }
    }

    /// The root directory handle.
    pub fn dir(&self) -> &Dir {
        &self.dir
    }

    fn map_read_error(path: &Path, e: std::io::Error) -> ExplorerError {
        match e.kind() {
            ErrorKind::NotFound => ExplorerError::MetadataNotFound {
                path: path.to_path_buf(),
            },
            ErrorKind::InvalidData => ExplorerError::MetadataCorrupt {
                path: path.to_path_buf(),
                reason: e.to_string(),
            },
            _ => ExplorerError::Io(e),
        }
    }

    /// Read a whole file.
    ///
    /// # Errors
    ///
    /// [`ExplorerError::MetadataNotFound`] if the file does not exist.
    pub fn read_bytes(&self, path: impl AsRef<Path>) -> Result<Vec<u8>> {
        let path = path.as_ref();
        self.dir
            .read(path)
            .map_err(|e| Self::map_read_error(path, e))
    }

    /// Read and parse a JSON document.
    ///
    /// # Errors
    ///
    /// [`ExplorerError::MetadataNotFound`] if the file does not exist,
    /// [`ExplorerError::MetadataCorrupt`] if it is not valid JSON or lacks a
    /// required field.
    pub fn read_json<T: DeserializeOwned>(&self, path: impl AsRef<Path>) -> Result<T> {
        let path = path.as_ref();
        let data = self.read_bytes(path)?;
        parse_json(path, &data)
    }

    /// Read a single-value pointer file (`mount-id`, `parent`, `cache-id`...),
    /// trimmed of surrounding whitespace.
    ///
    /// # Errors
    ///
    /// [`ExplorerError::MetadataNotFound`] if the file does not exist,
    /// [`ExplorerError::MetadataCorrupt`] if it is empty or not UTF-8.
    pub fn read_pointer(&self, path: impl AsRef<Path>) -> Result<String> {
        let path = path.as_ref();
        let content = self
            .dir
            .read_to_string(path)
            .map_err(|e| Self::map_read_error(path, e))?;
        let value = content.trim();
        if value.is_empty() {
            return Err(ExplorerError::MetadataCorrupt {
                path: path.to_path_buf(),
                reason: "empty pointer file".to_string(),
            });
        }
        Ok(value.to_string())
    }

    /// Like [`read_pointer`](Self::read_pointer), but an absent file is `None`.
    pub fn read_optional_pointer(&self, path: impl AsRef<Path>) -> Result<Option<String>> {
        match self.read_pointer(path) {
            Ok(value) => Ok(Some(value)),
            Err(ExplorerError::MetadataNotFound { .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Whether `path` exists (without following a final symlink out of the root).
    pub fn exists(&self, path: impl AsRef<Path>) -> bool {
        self.dir.try_exists(path).unwrap_or(false)
    }

    /// Whether `path` is a directory.
    pub fn is_dir(&self, path: impl AsRef<Path>) -> bool {
        self.dir.is_dir(path)
    }

    /// Read the target of a symlink below the root, without following it.
    pub fn read_link(&self, path: impl AsRef<Path>) -> Result<PathBuf> {
        let path = path.as_ref();
        self.dir
            .read_link(path)
            .map_err(|e| Self::map_read_error(path, e))
    }

    /// Names of the entries of a directory, sorted. A missing directory is empty.
    ///
    /// Names that are not valid UTF-8 cannot be Docker identifiers and are skipped.
    pub fn list_names(&self, path: impl AsRef<Path>) -> Result<Vec<String>> {
        let path = path.as_ref();
        let entries = match self.dir.read_dir(path) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(ExplorerError::Io(e)),
        };

        let mut names = Vec::new();
        for entry in entries {
            let entry = entry?;
            match entry.file_name().into_string() {
                Ok(name) => names.push(name),
                Err(name) => log::warn!("skipping non-UTF-8 entry {name:?} in {}", path.display()),
            }
        }
        names.sort();
        Ok(names)
    }
}

/// Parse a JSON document, attributing failures to `path`.
pub(crate) fn parse_json<T: DeserializeOwned>(path: &Path, data: &[u8]) -> Result<T> {
    serde_json::from_slice(data).map_err(|e| ExplorerError::MetadataCorrupt {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })
}

/// Paths of Docker's generic metadata, relative to the Docker root.
pub mod paths {
    use std::path::PathBuf;

    /// Directory holding one subdirectory per container.
    pub const CONTAINERS: &str = "containers";

    /// Filename of a container's configuration.
    pub const CONTAINER_CONFIG: &str = "config.v2.json";

    /// Directory holding one metadata store per storage driver.
    pub const IMAGE: &str = "image";

    /// `containers/<id>/config.v2.json`
    pub fn container_config(container_id: &str) -> PathBuf {
        PathBuf::from(CONTAINERS)
            .join(container_id)
            .join(CONTAINER_CONFIG)
    }

    /// `image/<store>`
    pub fn store(store: &str) -> PathBuf {
        PathBuf::from(IMAGE).join(store)
    }

    /// `image/<store>/repositories.json`
    pub fn repositories(store: &str) -> PathBuf {
        self::store(store).join("repositories.json")
    }

    /// `image/<store>/imagedb/content/sha256`
    pub fn image_contents(store: &str) -> PathBuf {
        self::store(store).join("imagedb/content/sha256")
    }

    /// `image/<store>/imagedb/metadata/sha256/<hex>/parent`
    pub fn image_parent(store: &str, image_hex: &str) -> PathBuf {
        self::store(store)
            .join("imagedb/metadata/sha256")
            .join(image_hex)
            .join("parent")
    }

    /// `image/<store>/layerdb/sha256`
    pub fn layers(store: &str) -> PathBuf {
        self::store(store).join("layerdb/sha256")
    }

    /// `image/<store>/layerdb/mounts`
    pub fn mounts(store: &str) -> PathBuf {
        self::store(store).join("layerdb/mounts")
    }

    /// `image/<store>/layerdb/mounts/<container-id>`
    pub fn mount(store: &str, container_id: &str) -> PathBuf {
        mounts(store).join(container_id)
    }
}

/// `config.v2.json` of a container. Only the fields this crate uses are kept.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ContainerDocument {
    /// Full container ID.
    #[serde(rename = "ID")]
    pub id: String,
    /// Image ID the container was created from.
    pub image: String,
    /// Storage driver that holds the container's layers.
    pub driver: String,
    /// Container name, with Docker's leading `/`.
    #[serde(default)]
    pub name: String,
    /// Creation timestamp.
    #[serde(default)]
    pub created: Option<String>,
    /// Runtime state.
    #[serde(default)]
    pub state: Option<ContainerState>,
    /// Configuration the container was started with.
    #[serde(default)]
    pub config: Option<ContainerRunConfig>,
    /// Volumes and bind mounts, keyed by destination.
    #[serde(default)]
    pub mount_points: Option<BTreeMap<String, MountPointDocument>>,
    /// Path of the JSON log file on the analysed host.
    #[serde(default)]
    pub log_path: Option<String>,
}

/// The `State` object of a container.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ContainerState {
    /// Whether the container was running when the evidence was captured.
    #[serde(default)]
    pub running: bool,
    /// Last start timestamp.
    #[serde(default)]
    pub started_at: Option<String>,
    /// Last stop timestamp.
    #[serde(default)]
    pub finished_at: Option<String>,
}

/// The `Config` object of a container.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ContainerRunConfig {
    /// Image name as given by the user (`busybox`, `nginx:1.25`...).
    #[serde(default)]
    pub image: Option<String>,
    /// Labels; Docker writes `null` when there are none.
    #[serde(default)]
    pub labels: Option<BTreeMap<String, String>>,
    /// Exposed ports (`"80/tcp": {}`).
    #[serde(default)]
    pub exposed_ports: Option<BTreeMap<String, serde_json::Value>>,
    /// Command.
    #[serde(default)]
    pub cmd: Option<Vec<String>>,
}

/// One entry of a container's `MountPoints`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct MountPointDocument {
    /// Host path; empty for named volumes.
    #[serde(default)]
    pub source: String,
    /// Path inside the container.
    #[serde(default)]
    pub destination: String,
    /// Volume name, for named volumes.
    #[serde(default)]
    pub name: String,
    /// Whether the container could write to it.
    #[serde(default, rename = "RW")]
    pub rw: bool,
    /// `volume`, `bind`, `tmpfs`...
    #[serde(default, rename = "Type")]
    pub kind: String,
}

/// An image configuration from `imagedb/content/sha256/`.
#[derive(Debug, Clone, Deserialize)]
pub struct ImageDocument {
    /// Creation timestamp.
    #[serde(default)]
    pub created: Option<String>,
    /// Image author.
    #[serde(default)]
    pub author: Option<String>,
    /// Free-text comment.
    #[serde(default)]
    pub comment: Option<String>,
    /// CPU architecture.
    #[serde(default)]
    pub architecture: Option<String>,
    /// Operating system.
    #[serde(default)]
    pub os: Option<String>,
    /// Runtime configuration.
    #[serde(default)]
    pub config: Option<ImageRunConfig>,
    /// Configuration of the container the top layer was committed from.
    #[serde(default)]
    pub container_config: Option<ImageRunConfig>,
    /// Filesystem layers.
    pub rootfs: RootFs,
    /// Build steps.
    #[serde(default)]
    pub history: Vec<HistoryDocument>,
}

/// Runtime configuration inside an image config.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ImageRunConfig {
    /// Command.
    #[serde(default)]
    pub cmd: Option<Vec<String>>,
    /// Entrypoint.
    #[serde(default)]
    pub entrypoint: Option<Vec<String>>,
    /// Labels.
    #[serde(default)]
    pub labels: Option<BTreeMap<String, String>>,
}

/// The `rootfs` object of an image config.
#[derive(Debug, Clone, Deserialize)]
pub struct RootFs {
    /// Always `layers`.
    #[serde(rename = "type")]
    pub kind: String,
    /// Uncompressed layer digests, base first.
    pub diff_ids: Vec<String>,
}

/// One build step of an image config's `history`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct HistoryDocument {
    /// When the step ran.
    #[serde(default)]
    pub created: Option<String>,
    /// Command of the step.
    #[serde(default)]
    pub created_by: Option<String>,
    /// Free-text comment.
    #[serde(default)]
    pub comment: Option<String>,
    /// Whether the step produced no filesystem layer.
    #[serde(default)]
    pub empty_layer: bool,
}

/// `repositories.json`: repository name, then reference, then image ID.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RepositoriesDocument {
    /// Repository index.
    #[serde(rename = "Repositories", default)]
    pub repositories: BTreeMap<String, BTreeMap<String, String>>,
}
