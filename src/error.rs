//! Error types for docker-explorer.
//!
//! All fallible operations return [`Result<T>`], an alias for
//! `Result<T, ExplorerError>`.
//!
//! # Error Categories
//!
//! - **Storage root**: [`RootNotFound`], [`AmbiguousDriver`], [`UnsupportedDriver`]
//! - **Metadata documents**: [`MetadataNotFound`], [`MetadataCorrupt`]
//! - **Layer graph**: [`BrokenLayerChain`], [`CyclicLayerGraph`], [`LayerNotFound`]
//! - **Lookups**: [`ContainerNotFound`], [`ImageNotFound`]
//! - **Mount planning**: [`EmptyImage`], [`LayerContentMissing`]
//! - **System errors**: [`Io`], [`Config`]
//!
//! Every variant carries the identifier and, where relevant, the path of the
//! offending element so that an analyst can find it in the raw evidence.
//!
//! [`RootNotFound`]: ExplorerError::RootNotFound
//! [`AmbiguousDriver`]: ExplorerError::AmbiguousDriver
//! [`UnsupportedDriver`]: ExplorerError::UnsupportedDriver
//! [`MetadataNotFound`]: ExplorerError::MetadataNotFound
//! [`MetadataCorrupt`]: ExplorerError::MetadataCorrupt
//! [`BrokenLayerChain`]: ExplorerError::BrokenLayerChain
//! [`CyclicLayerGraph`]: ExplorerError::CyclicLayerGraph
//! [`LayerNotFound`]: ExplorerError::LayerNotFound
//! [`ContainerNotFound`]: ExplorerError::ContainerNotFound
//! [`ImageNotFound`]: ExplorerError::ImageNotFound
//! [`EmptyImage`]: ExplorerError::EmptyImage
//! [`LayerContentMissing`]: ExplorerError::LayerContentMissing
//! [`Io`]: ExplorerError::Io
//! [`Config`]: ExplorerError::Config

use std::path::PathBuf;

use crate::driver::DriverKind;
use crate::layer::LayerId;

/// Result type alias for operations that may return an ExplorerError.
pub type Result<T> = std::result::Result<T, ExplorerError>;

/// Error types for offline Docker storage analysis.
#[derive(Debug, thiserror::Error)]
pub enum ExplorerError {
    /// The Docker root directory was not found at the specified path.
    #[error("docker root not found at {0}")]
    RootNotFound(PathBuf),

    /// An expected metadata file is absent.
    #[error("metadata not found: {path}")]
    MetadataNotFound {
        /// Path relative to the Docker root.
        path: PathBuf,
    },

    /// A metadata file could not be parsed, or a required field is missing or mistyped.
    #[error("corrupt metadata in {path}: {reason}")]
    MetadataCorrupt {
        /// Path relative to the Docker root.
        path: PathBuf,
        /// What exactly is wrong with the document.
        reason: String,
    },

    /// More than one storage driver layout is present.
    #[error("ambiguous storage driver: layouts for {} found", DriverKind::join(.candidates))]
    AmbiguousDriver {
        /// Every driver whose markers matched.
        candidates: Vec<DriverKind>,
    },

    /// No supported storage driver layout is present.
    #[error("unsupported storage driver: no aufs, overlay or overlay2 layout under {root}")]
    UnsupportedDriver {
        /// The Docker root that was inspected.
        root: PathBuf,
    },

    /// A parent pointer references a layer that has no record.
    #[error("broken layer chain: parent {missing} of layer {layer} does not exist")]
    BrokenLayerChain {
        /// The layer whose parent pointer dangles.
        layer: LayerId,
        /// The missing parent.
        missing: LayerId,
    },

    /// Following parent pointers revisits a layer.
    #[error("cyclic layer graph: walking from {layer} revisits {repeated}")]
    CyclicLayerGraph {
        /// The layer the walk started from.
        layer: LayerId,
        /// The first layer seen twice.
        repeated: LayerId,
    },

    /// The requested layer has no record.
    #[error("layer not found: {0}")]
    LayerNotFound(LayerId),

    /// The requested container was not found.
    #[error("container not found: {0}")]
    ContainerNotFound(String),

    /// The requested image (by ID or repository tag) was not found.
    #[error("image not found: {0}")]
    ImageNotFound(String),

    /// The image has no filesystem layers, so there is nothing to mount.
    #[error("image {0} has no filesystem layers")]
    EmptyImage(String),

    /// A layer's on-disk content directory is missing.
    #[error("content of layer {layer} missing at {path}")]
    LayerContentMissing {
        /// The layer whose directory is missing.
        layer: LayerId,
        /// The expected directory.
        path: PathBuf,
    },

    /// I/O error occurred during file operations.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The configuration file could not be parsed.
    #[error("config error: {0}")]
    Config(#[from] toml::de::Error),

    /// The catalog worker pool could not be started.
    #[error("failed to start scan workers: {0}")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),
}
