//! Storage driver plugins.
//!
//! Each union filesystem Docker can use stores layer data in its own layout
//! and is mounted with its own syntax. A [`StorageDriver`] captures those
//! differences behind one capability set; exactly one driver is selected per
//! [`StorageRoot`](crate::root::StorageRoot), when it is opened.
//!
//! | driver | data directory | lower-layer bookkeeping | whiteouts |
//! |---|---|---|---|
//! | `aufs` | `aufs/diff/<cache-id>` | `aufs/layers/<cache-id>` | `.wh.<name>` files |
//! | `overlay` | `overlay/<cache-id>/{root,upper}` | `lower-id` | 0/0 character devices |
//! | `overlay2` | `overlay2/<cache-id>/diff` | `lower` + `l/` links | 0/0 character devices |

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{ExplorerError, Result};
use crate::layer::{LayerId, LayerRecord};
use crate::metadata::{paths, MetadataReader};
use crate::mount::{MountInstruction, MountPlan, UnmountInstruction};
use crate::whiteout::{self, WhiteoutConvention};

pub mod aufs;
pub mod overlay;

pub use aufs::Aufs;
pub use overlay::Overlay;

/// The storage drivers this crate understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DriverKind {
    /// AuFS, the default on older Ubuntu and Debian hosts.
    Aufs,
    /// The first OverlayFS driver (single lower directory, hardlinked snapshots).
    Overlay,
    /// The multi-lower OverlayFS driver used by every current Docker release.
    Overlay2,
}

impl DriverKind {
    /// Every supported driver, in detection order.
    pub const ALL: [DriverKind; 3] = [DriverKind::Aufs, DriverKind::Overlay, DriverKind::Overlay2];

    /// Docker's name for the driver, which is also the name of its data
    /// directory and of its metadata store under `image/`.
    pub fn name(self) -> &'static str {
        match self {
            DriverKind::Aufs => "aufs",
            DriverKind::Overlay => "overlay",
            DriverKind::Overlay2 => "overlay2",
        }
    }

    pub(crate) fn join(kinds: &[DriverKind]) -> String {
        kinds
            .iter()
            .map(|kind| kind.name())
            .collect::<Vec<_>>()
            .join(", ")
    }

    /// Whether the root's layout carries this driver's markers.
    pub fn detect(self, meta: &MetadataReader) -> bool {
        match self {
            DriverKind::Aufs => Aufs::detect(meta),
            DriverKind::Overlay | DriverKind::Overlay2 => Overlay::detect_variant(self, meta),
        }
    }

    /// Instantiate the plugin for a Docker root.
    pub fn plugin(self, root: &Path, meta: MetadataReader) -> Box<dyn StorageDriver> {
        match self {
            DriverKind::Aufs => Box::new(Aufs::new(root, meta)),
            DriverKind::Overlay => Box::new(Overlay::overlay(root, meta)),
            DriverKind::Overlay2 => Box::new(Overlay::overlay2(root, meta)),
        }
    }
}

impl fmt::Display for DriverKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for DriverKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        DriverKind::ALL
            .into_iter()
            .find(|kind| kind.name() == s)
            .ok_or_else(|| format!("unknown storage driver {s:?}"))
    }
}

/// Determine the single driver whose layout `root` carries.
///
/// # Errors
///
/// - [`ExplorerError::UnsupportedDriver`] if no driver matches.
/// - [`ExplorerError::AmbiguousDriver`] if more than one does; an analyst has
///   to decide which layout is the evidence, it is never guessed.
pub fn detect(meta: &MetadataReader, root: &Path) -> Result<DriverKind> {
    let candidates: Vec<DriverKind> = DriverKind::ALL
        .into_iter()
        .filter(|kind| kind.detect(meta))
        .collect();
    log::debug!("driver candidates under {}: {candidates:?}", root.display());

    match candidates.as_slice() {
        [] => Err(ExplorerError::UnsupportedDriver {
            root: root.to_path_buf(),
        }),
        [kind] => Ok(*kind),
        _ => Err(ExplorerError::AmbiguousDriver { candidates }),
    }
}

/// Driver-specific knowledge of on-disk layer data and union mount syntax.
pub trait StorageDriver: fmt::Debug + Send + Sync {
    /// Which driver this is.
    fn kind(&self) -> DriverKind;

    /// Whether the root's subdirectory layout matches this driver.
    fn detect(meta: &MetadataReader) -> bool
    where
        Self: Sized;

    /// Absolute path of the directory holding `layer`'s file delta.
    fn diff_path(&self, layer: &LayerRecord) -> PathBuf;

    /// The ID of a container's writable layer.
    ///
    /// # Errors
    ///
    /// [`ExplorerError::MetadataNotFound`] if the container has no mount record.
    fn container_top_layer(&self, container_id: &str) -> Result<LayerId>;

    /// The driver's own record of the layers below `layer`, as cache IDs from
    /// the topmost down, or `None` if the driver keeps no such record for it.
    fn recorded_lowers(&self, layer: &LayerRecord) -> Result<Option<Vec<String>>>;

    /// How deletions are marked inside this driver's layer directories.
    fn whiteout_convention(&self) -> WhiteoutConvention;

    /// Build the read-only stacked mount of `layers` (base first) at `target`.
    ///
    /// Higher layers shadow lower ones and every whiteout hides its path from
    /// all layers below it, exactly as the running container saw it.
    ///
    /// # Errors
    ///
    /// [`ExplorerError::LayerContentMissing`] if a layer's directory is gone.
    fn build_mount_instructions(&self, layers: &[&LayerRecord], target: &Path)
        -> Result<MountPlan>;
}

/// Read `layerdb/mounts/<container-id>/mount-id` from a driver's metadata store.
pub(crate) fn read_mount_id(
    meta: &MetadataReader,
    kind: DriverKind,
    container_id: &str,
) -> Result<LayerId> {
    let path = paths::mount(kind.name(), container_id).join("mount-id");
    meta.read_pointer(path).map(LayerId::new)
}

/// Checks shared by every driver before it lays out its instructions: each
/// layer directory must exist. Returns the directories, base first.
pub(crate) fn layer_dirs(
    driver: &dyn StorageDriver,
    layers: &[&LayerRecord],
) -> Result<Vec<PathBuf>> {
    layers
        .iter()
        .map(|layer| {
            let path = driver.diff_path(layer);
            if path.is_dir() {
                Ok(path)
            } else {
                Err(ExplorerError::LayerContentMissing {
                    layer: layer.id.clone(),
                    path,
                })
            }
        })
        .collect()
}

/// Compare the resolved stack below `layers`' top with the driver's own
/// bookkeeping, describing every disagreement.
pub(crate) fn lower_discrepancies(
    driver: &dyn StorageDriver,
    layers: &[&LayerRecord],
    expected: Vec<String>,
) -> Result<Vec<String>> {
    let Some(top) = layers.last() else {
        return Ok(Vec::new());
    };
    let Some(recorded) = driver.recorded_lowers(top)? else {
        return Ok(Vec::new());
    };
    if recorded == expected {
        return Ok(Vec::new());
    }
    let message = format!(
        "{} records lower layers [{}] for {} but its parent chain resolves to [{}]",
        driver.kind(),
        recorded.join(", "),
        top.id,
        expected.join(", "),
    );
    log::warn!("{message}");
    Ok(vec![message])
}

/// Assemble a plan from a driver's mount instructions: scan the stack for
/// whiteouts and add the matching teardown.
pub(crate) fn finish_plan(
    driver: &dyn StorageDriver,
    layers: &[&LayerRecord],
    dirs: &[PathBuf],
    target: &Path,
    mounts: Vec<MountInstruction>,
    mut discrepancies: Vec<String>,
) -> Result<MountPlan> {
    let stack: Vec<(&LayerRecord, &Path)> = layers
        .iter()
        .copied()
        .zip(dirs.iter().map(PathBuf::as_path))
        .collect();
    let scan = whiteout::scan_stack(driver.whiteout_convention(), &stack)?;
    discrepancies.extend(scan.discrepancies);

    Ok(MountPlan {
        driver: driver.kind(),
        target: target.to_path_buf(),
        layers: layers.iter().map(|layer| layer.id.clone()).collect(),
        mounts,
        unmounts: vec![UnmountInstruction::new(target)],
        whiteouts: scan.whiteouts,
        discrepancies,
    })
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;

    use super::*;
    use crate::test::DockerRoot;

    #[test]
    fn test_detect_single() {
        for kind in DriverKind::ALL {
            let root = DockerRoot::new(kind);
            assert_eq!(detect(&root.reader(), root.path()).unwrap(), kind);
        }
    }

    #[test]
    fn test_detect_ambiguous() {
        let root = DockerRoot::new(DriverKind::Overlay2);
        root.add_driver_markers(DriverKind::Aufs);
        match detect(&root.reader(), root.path()) {
            Err(ExplorerError::AmbiguousDriver { candidates }) => {
                assert_eq!(candidates, vec![DriverKind::Aufs, DriverKind::Overlay2]);
            }
            other => panic!("expected ambiguity, got {other:?}"),
        }
    }

    #[test]
    fn test_detect_requires_metadata_store() {
        let root = DockerRoot::new(DriverKind::Overlay2);
        // a leftover data directory without its image/ store is not a layout
        root.mkdir("aufs/diff");
        assert_eq!(
            detect(&root.reader(), root.path()).unwrap(),
            DriverKind::Overlay2
        );
    }

    #[test]
    fn test_detect_none() {
        let tmp = tempfile::tempdir().unwrap();
        let meta = MetadataReader::new(
            cap_std::fs::Dir::open_ambient_dir(tmp.path(), cap_std::ambient_authority()).unwrap(),
        );
        assert!(matches!(
            detect(&meta, tmp.path()),
            Err(ExplorerError::UnsupportedDriver { root }) if root == tmp.path()
        ));
    }

    #[test]
    fn test_parse_kind() {
        assert_eq!("overlay2".parse::<DriverKind>().unwrap(), DriverKind::Overlay2);
        assert!("btrfs".parse::<DriverKind>().is_err());
        assert_eq!(
            DriverKind::join(&[DriverKind::Aufs, DriverKind::Overlay]),
            "aufs, overlay"
        );
    }
}
