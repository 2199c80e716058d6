//! The Docker data directory under analysis.

use std::path::{Path, PathBuf};

use cap_std::ambient_authority;
use cap_std::fs::Dir;

use crate::config::ExplorerConfig;
use crate::driver::{self, DriverKind, StorageDriver};
use crate::error::{ExplorerError, Result};
use crate::metadata::{paths, MetadataReader};

/// Outcome of driver detection, kept so that driver-independent operations
/// keep working when it failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Detection {
    /// Exactly one driver layout was found.
    Detected(DriverKind),
    /// The configuration named the driver.
    Forced(DriverKind),
    /// No supported layout was found.
    Unsupported,
    /// More than one layout was found.
    Ambiguous(Vec<DriverKind>),
}

/// An opened Docker root: its path, a read handle and the detected driver.
#[derive(Debug)]
pub struct StorageRoot {
    path: PathBuf,
    meta: MetadataReader,
    config: ExplorerConfig,
    detection: Detection,
}

impl StorageRoot {
    /// Open `config.docker_root` and detect its storage driver.
    ///
    /// A failed detection is not an error here; it surfaces from
    /// [`driver`](Self::driver) when a driver is needed.
    ///
    /// # Errors
    ///
    /// [`ExplorerError::RootNotFound`] if the directory does not exist.
    pub fn open(config: ExplorerConfig) -> Result<Self> {
        let path = config.docker_root.clone();
        if !path.is_dir() {
            return Err(ExplorerError::RootNotFound(path));
        }
        let meta = MetadataReader::new(Dir::open_ambient_dir(&path, ambient_authority())?);

        let detection = match config.driver {
            Some(kind) => {
                log::debug!("using configured driver {kind} for {}", path.display());
                Detection::Forced(kind)
            }
            None => match driver::detect(&meta, &path) {
                Ok(kind) => Detection::Detected(kind),
                Err(ExplorerError::AmbiguousDriver { candidates }) => {
                    log::warn!(
                        "{} carries several driver layouts: {}",
                        path.display(),
                        DriverKind::join(&candidates)
                    );
                    Detection::Ambiguous(candidates)
                }
                Err(ExplorerError::UnsupportedDriver { .. }) => {
                    log::warn!("no supported driver layout under {}", path.display());
                    Detection::Unsupported
                }
                Err(e) => return Err(e),
            },
        };

        Ok(Self {
            path,
            meta,
            config,
            detection,
        })
    }

    /// Open the Docker root at `path` with default settings.
    pub fn open_path(path: impl Into<PathBuf>) -> Result<Self> {
        Self::open(ExplorerConfig::new(path))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn config(&self) -> &ExplorerConfig {
        &self.config
    }

    pub fn meta(&self) -> &MetadataReader {
        &self.meta
    }

    pub fn detection(&self) -> &Detection {
        &self.detection
    }

    /// The analysed host's `/`.
    pub fn host_root(&self) -> PathBuf {
        self.config.host_root()
    }

    /// The active driver kind.
    ///
    /// # Errors
    ///
    /// [`ExplorerError::UnsupportedDriver`] or [`ExplorerError::AmbiguousDriver`]
    /// when detection failed.
    pub fn driver_kind(&self) -> Result<DriverKind> {
        match &self.detection {
            Detection::Detected(kind) | Detection::Forced(kind) => Ok(*kind),
            Detection::Unsupported => Err(ExplorerError::UnsupportedDriver {
                root: self.path.clone(),
            }),
            Detection::Ambiguous(candidates) => Err(ExplorerError::AmbiguousDriver {
                candidates: candidates.clone(),
            }),
        }
    }

    /// Instantiate the active driver.
    pub fn driver(&self) -> Result<Box<dyn StorageDriver>> {
        let kind = self.driver_kind()?;
        let meta = MetadataReader::new(self.meta.dir().try_clone()?);
        Ok(kind.plugin(&self.path, meta))
    }

    /// Name of the `image/<store>` directory holding image and layer metadata.
    ///
    /// This is the active driver's name. Without one, a lone store directory
    /// is used so that listings still work; with several there is no way to
    /// choose and `None` is returned.
    pub fn image_store(&self) -> Result<Option<String>> {
        if let Ok(kind) = self.driver_kind() {
            return Ok(Some(kind.name().to_string()));
        }
        let stores: Vec<String> = self
            .meta
            .list_names(paths::IMAGE)?
            .into_iter()
            .filter(|name| self.meta.is_dir(paths::store(name)))
            .collect();
        match <[String; 1]>::try_from(stores) {
            Ok([store]) => {
                log::debug!("falling back to image store {store}");
                Ok(Some(store))
            }
            Err(stores) => {
                log::warn!("cannot pick an image store among {stores:?}");
                Ok(None)
            }
        }
    }
}
