//! Explorer configuration.
//!
//! Every setting has a default, so an empty file (or no file at all) is a
//! valid configuration. Settings can be loaded from TOML:
//!
//! ```toml
//! docker_root = "/mnt/evidence/var/lib/docker"
//! host_root = "/mnt/evidence"
//! scan_policy = "fail-fast"
//! driver = "overlay2"
//! mount_volumes = true
//! scan_threads = 4
//! ```

use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::driver::DriverKind;
use crate::error::Result;

/// Docker's default data directory.
pub const DEFAULT_DOCKER_ROOT: &str = "/var/lib/docker";

/// What catalog construction does with a document it cannot parse.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ScanPolicy {
    /// Skip the document, record a warning and keep scanning.
    #[default]
    BestEffort,
    /// Abort construction with the document's error.
    FailFast,
}

/// Settings for one exploration session.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ExplorerConfig {
    /// The Docker data directory of the analysed host.
    pub docker_root: PathBuf,

    /// Where the analysed host's `/` is mounted.
    pub host_root: Option<PathBuf>,

    /// Handling of unparseable documents during catalog construction.
    pub scan_policy: ScanPolicy,

    /// Use this driver instead of detecting one.
    pub driver: Option<DriverKind>,

    /// Whether container mount plans include their volumes.
    pub mount_volumes: bool,

    /// Worker threads for catalog construction.
    pub scan_threads: Option<usize>,
}

impl Default for ExplorerConfig {
    fn default() -> Self {
        Self {
            docker_root: PathBuf::from(DEFAULT_DOCKER_ROOT),
            host_root: None,
            scan_policy: ScanPolicy::default(),
            driver: None,
            mount_volumes: true,
            scan_threads: None,
        }
    }
}

impl ExplorerConfig {
    /// Defaults for the Docker root at `docker_root`.
    pub fn new(docker_root: impl Into<PathBuf>) -> Self {
        Self {
            docker_root: docker_root.into(),
            ..Self::default()
        }
    }

    /// Parse configuration from TOML content.
    ///
    /// # Errors
    ///
    /// Returns an error if the TOML content is invalid.
    pub fn from_toml(content: &str) -> std::result::Result<Self, toml::de::Error> {
        toml::from_str(content)
    }

    /// Read and parse a TOML configuration file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Ok(Self::from_toml(&content)?)
    }

    pub fn with_docker_root(mut self, docker_root: impl Into<PathBuf>) -> Self {
        self.docker_root = docker_root.into();
        self
    }

    pub fn with_host_root(mut self, host_root: impl Into<PathBuf>) -> Self {
        self.host_root = Some(host_root.into());
        self
    }

    pub fn with_scan_policy(mut self, scan_policy: ScanPolicy) -> Self {
        self.scan_policy = scan_policy;
        self
    }

    pub fn with_driver(mut self, driver: DriverKind) -> Self {
        self.driver = Some(driver);
        self
    }

    pub fn with_mount_volumes(mut self, mount_volumes: bool) -> Self {
        self.mount_volumes = mount_volumes;
        self
    }

    pub fn with_scan_threads(mut self, scan_threads: usize) -> Self {
        self.scan_threads = Some(scan_threads);
        self
    }

    /// The analysed host's `/`.
    ///
    /// Unless configured, this is `docker_root` without a trailing
    /// `var/lib/docker`, or failing that its parent directory.
    pub fn host_root(&self) -> PathBuf {
        if let Some(host_root) = &self.host_root {
            return host_root.clone();
        }
        let mut root = self.docker_root.as_path();
        if root.ends_with("var/lib/docker") {
            for _ in 0..3 {
                root = root.parent().unwrap_or(root);
            }
            return root.to_path_buf();
        }
        root.parent().unwrap_or(root).to_path_buf()
    }

    /// Number of catalog workers, at least one.
    pub fn scan_threads(&self) -> usize {
        match self.scan_threads {
            Some(threads) => threads.max(1),
            None => std::thread::available_parallelism().map_or(1, NonZeroUsize::get),
        }
    }
}
