//! OverlayFS drivers (`overlay` and `overlay2`).
//!
//! # overlay2 layout
//!
//! ```text
//! overlay2/
//! +-- <cache-id>/
//! |   +-- diff/     # layer delta; whiteouts are 0/0 character devices
//! |   +-- link      # short 26-character link ID
//! |   +-- lower     # "l/<link>:l/<link>:..." topmost first, absent for base layers
//! +-- l/<link>      # symlink to ../<cache-id>/diff
//! ```
//!
//! # overlay layout
//!
//! The original driver only supports a single lower directory, so every image
//! layer is a complete hardlinked snapshot in `root/`. Container layers have
//! an `upper/` directory and a `lower-id` naming the snapshot below them; the
//! init layer's upper content is copied into the writable layer's `upper/`.
//!
//! # Mounting
//!
//! Overlayfs stacks `lowerdir` entries leftmost-highest, so the topmost layer
//! comes first. Without an `upperdir` the mount is read-only and overlayfs
//! needs at least two lower directories; a stack that reduces to one directory
//! is bind mounted read-only instead.

use std::path::{Path, PathBuf};

use crate::driver::{self, DriverKind, StorageDriver};
use crate::error::{ExplorerError, Result};
use crate::layer::{LayerId, LayerRecord};
use crate::metadata::{paths, MetadataReader};
use crate::mount::{MountInstruction, MountPlan};
use crate::whiteout::WhiteoutConvention;

/// Directory of overlay2's short links.
const LINK_DIR: &str = "l";

/// An OverlayFS storage driver.
#[derive(Debug)]
pub struct Overlay {
    kind: DriverKind,
    root: PathBuf,
    meta: MetadataReader,
}

impl Overlay {
    /// The original single-lower `overlay` driver.
    pub fn overlay(root: &Path, meta: MetadataReader) -> Self {
        Self {
            kind: DriverKind::Overlay,
            root: root.to_path_buf(),
            meta,
        }
    }

    /// The multi-lower `overlay2` driver.
    pub fn overlay2(root: &Path, meta: MetadataReader) -> Self {
        Self {
            kind: DriverKind::Overlay2,
            root: root.to_path_buf(),
            meta,
        }
    }

    pub(crate) fn detect_variant(kind: DriverKind, meta: &MetadataReader) -> bool {
        meta.is_dir(kind.name()) && meta.is_dir(paths::store(kind.name()))
    }

    /// `<driver>/<cache-id>`, relative to the Docker root.
    fn layer_dir(&self, cache_id: &str) -> PathBuf {
        Path::new(self.kind.name()).join(cache_id)
    }

    /// Whether an `overlay` layer is a full snapshot (has `root/`).
    fn is_snapshot(&self, layer: &LayerRecord) -> bool {
        self.meta
            .is_dir(self.layer_dir(&layer.cache_id).join("root"))
    }

    /// Read an overlay2 layer's short link ID.
    fn read_link_id(&self, cache_id: &str) -> Result<Option<String>> {
        self.meta
            .read_optional_pointer(self.layer_dir(cache_id).join("link"))
    }

    /// Read an overlay2 layer's `lower` file as link IDs, topmost first.
    fn read_lower(&self, cache_id: &str) -> Result<Option<Vec<String>>> {
        let lower = self
            .meta
            .read_optional_pointer(self.layer_dir(cache_id).join("lower"))?;
        Ok(lower.map(|content| {
            content
                .split(':')
                .filter_map(|s| s.strip_prefix("l/"))
                .map(|s| s.to_string())
                .collect()
        }))
    }

    /// Resolve an overlay2 link ID to the cache ID it points at.
    fn resolve_link(&self, link_id: &str) -> Result<String> {
        let link = Path::new(self.kind.name()).join(LINK_DIR).join(link_id);
        let target = self.meta.read_link(&link)?;
        Self::extract_cache_id(&target).ok_or_else(|| ExplorerError::MetadataCorrupt {
            path: link,
            reason: format!("unexpected link target {}", target.display()),
        })
    }

    /// Extract the cache ID from a link target of the form `../<cache-id>/diff`.
    fn extract_cache_id(target: &Path) -> Option<String> {
        let target = target.to_str()?;
        let components: Vec<&str> = target.split('/').collect();
        match components.as_slice() {
            [.., id, "diff"] if !id.is_empty() && *id != ".." => Some(id.to_string()),
            _ => None,
        }
    }

    /// The `lowerdir` entry for an overlay2 layer: its short link when there is
    /// one, else its diff directory.
    fn lowerdir_entry(&self, layer: &LayerRecord, dir: &Path) -> Result<PathBuf> {
        if let Some(link_id) = self.read_link_id(&layer.cache_id)? {
            let link = Path::new(self.kind.name()).join(LINK_DIR).join(&link_id);
            if self.meta.exists(&link) {
                return Ok(self.root.join(link));
            }
            log::debug!("short link {link_id} of {} is missing", layer.id);
        }
        Ok(dir.to_path_buf())
    }

    fn overlay2_mounts(
        &self,
        layers: &[&LayerRecord],
        dirs: &[PathBuf],
        target: &Path,
        discrepancies: &mut Vec<String>,
    ) -> Result<Vec<MountInstruction>> {
        if let [single] = dirs {
            return Ok(vec![MountInstruction::bind(single, target)]);
        }

        let mut lowers = Vec::with_capacity(dirs.len());
        for (layer, dir) in layers.iter().zip(dirs).rev() {
            lowers.push(self.lowerdir_entry(layer, dir)?);
        }
        let options = format!("ro,lowerdir={}", join_paths(&lowers));
        if options.len() > MOUNT_OPTIONS_MAX {
            let message = format!(
                "mount options for the {} layers up to {} are {} bytes, more than mount(2) accepts ({MOUNT_OPTIONS_MAX})",
                layers.len(),
                layers.last().map_or_else(|| "?".to_string(), |layer| layer.id.to_string()),
                options.len()
            );
            log::warn!("{message}");
            discrepancies.push(message);
        }
        Ok(vec![MountInstruction::union(
            "overlay",
            "overlay",
            options,
            dirs.iter().rev().cloned().collect(),
            target,
        )])
    }

    /// The snapshot nearest below the top of an `overlay` stack.
    fn nearest_snapshot<'a>(
        &self,
        layers: &[&'a LayerRecord],
        dirs: &'a [PathBuf],
    ) -> Option<(&'a LayerRecord, &'a PathBuf)> {
        let below_top = layers.len().saturating_sub(1);
        layers[..below_top]
            .iter()
            .copied()
            .zip(dirs)
            .rev()
            .find(|(layer, _)| self.is_snapshot(layer))
    }

    fn overlay_mounts(
        &self,
        layers: &[&LayerRecord],
        dirs: &[PathBuf],
        target: &Path,
        discrepancies: &mut Vec<String>,
    ) -> Vec<MountInstruction> {
        let (Some(top), Some(top_dir)) = (layers.last(), dirs.last()) else {
            return Vec::new();
        };
        if self.is_snapshot(top) {
            return vec![MountInstruction::bind(top_dir, target)];
        }

        match self.nearest_snapshot(layers, dirs) {
            Some((_, lower_dir)) => vec![MountInstruction::union(
                "overlay",
                "overlay",
                format!(
                    "ro,lowerdir={}",
                    join_paths(&[top_dir.clone(), lower_dir.clone()])
                ),
                vec![top_dir.clone(), lower_dir.clone()],
                target,
            )],
            None => {
                let message = format!(
                    "no snapshot layer below {}; only its upper directory can be mounted",
                    top.id
                );
                log::warn!("{message}");
                discrepancies.push(message);
                vec![MountInstruction::bind(top_dir, target)]
            }
        }
    }
}

/// mount(2) copies one page of option data, terminating NUL included.
const MOUNT_OPTIONS_MAX: usize = 4095;

fn join_paths(paths: &[PathBuf]) -> String {
    paths
        .iter()
        .map(|path| path.display().to_string())
        .collect::<Vec<_>>()
        .join(":")
}

impl StorageDriver for Overlay {
    fn kind(&self) -> DriverKind {
        self.kind
    }

    fn detect(meta: &MetadataReader) -> bool {
        Self::detect_variant(DriverKind::Overlay2, meta)
            || Self::detect_variant(DriverKind::Overlay, meta)
    }

    fn diff_path(&self, layer: &LayerRecord) -> PathBuf {
        let dir = self.layer_dir(&layer.cache_id);
        let leaf = match self.kind {
            DriverKind::Overlay if self.is_snapshot(layer) => "root",
            DriverKind::Overlay => "upper",
            _ => "diff",
        };
        self.root.join(dir).join(leaf)
    }

    fn container_top_layer(&self, container_id: &str) -> Result<LayerId> {
        driver::read_mount_id(&self.meta, self.kind, container_id)
    }

    fn recorded_lowers(&self, layer: &LayerRecord) -> Result<Option<Vec<String>>> {
        if !self.meta.is_dir(self.layer_dir(&layer.cache_id)) {
            return Ok(None);
        }
        match self.kind {
            DriverKind::Overlay => {
                let lower_id = self
                    .meta
                    .read_optional_pointer(self.layer_dir(&layer.cache_id).join("lower-id"))?;
                Ok(Some(lower_id.into_iter().collect()))
            }
            _ => match self.read_lower(&layer.cache_id)? {
                Some(links) => links
                    .iter()
                    .map(|link| self.resolve_link(link))
                    .collect::<Result<Vec<_>>>()
                    .map(Some),
                None => Ok(Some(Vec::new())),
            },
        }
    }

    fn whiteout_convention(&self) -> WhiteoutConvention {
        WhiteoutConvention::Overlay
    }

    fn build_mount_instructions(
        &self,
        layers: &[&LayerRecord],
        target: &Path,
    ) -> Result<MountPlan> {
        let dirs = driver::layer_dirs(self, layers)?;

        let mut discrepancies = Vec::new();
        let (mounts, expected) = match self.kind {
            DriverKind::Overlay => {
                let mounts = self.overlay_mounts(layers, &dirs, target, &mut discrepancies);
                let expected = match layers.last() {
                    Some(top) if !self.is_snapshot(top) => self
                        .nearest_snapshot(layers, &dirs)
                        .map(|(layer, _)| layer.cache_id.clone())
                        .into_iter()
                        .collect(),
                    _ => Vec::new(),
                };
                (mounts, expected)
            }
            _ => {
                let mounts = self.overlay2_mounts(layers, &dirs, target, &mut discrepancies)?;
                let expected = layers
                    .iter()
                    .rev()
                    .skip(1)
                    .map(|layer| layer.cache_id.clone())
                    .collect();
                (mounts, expected)
            }
        };
        discrepancies.extend(driver::lower_discrepancies(self, layers, expected)?);

        driver::finish_plan(self, layers, &dirs, target, mounts, discrepancies)
    }
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;

    use super::*;
    use crate::test::DockerRoot;

    #[test]
    fn test_extract_cache_id() {
        assert_eq!(
            Overlay::extract_cache_id(Path::new("../92fd3b3e7d61/diff")),
            Some("92fd3b3e7d61".to_string())
        );
        assert_eq!(Overlay::extract_cache_id(Path::new("../diff")), None);
        assert_eq!(Overlay::extract_cache_id(Path::new("elsewhere")), None);
    }

    #[test]
    fn test_overlay2_lowerdir_uses_short_links() {
        let root = DockerRoot::new(DriverKind::Overlay2);
        let base = root.add_layer_data("base", &[]);
        let mid = root.add_layer_data("mid", &["base"]);
        let top = root.add_layer_data("top", &["mid", "base"]);

        let driver = Overlay::overlay2(root.path(), root.reader());
        let plan = driver
            .build_mount_instructions(&[&base, &mid, &top], Path::new("/mnt/x"))
            .unwrap();

        let link = |id: &str| {
            root.path()
                .join("overlay2/l")
                .join(DockerRoot::link_id(id))
                .display()
                .to_string()
        };
        assert_eq!(plan.mounts().len(), 1);
        assert_eq!(
            plan.mounts()[0].options,
            format!("ro,lowerdir={}:{}:{}", link("top"), link("mid"), link("base"))
        );
        assert_eq!(
            plan.mounts()[0].sources,
            vec![
                root.path().join("overlay2/top/diff"),
                root.path().join("overlay2/mid/diff"),
                root.path().join("overlay2/base/diff"),
            ]
        );
        let argv = plan.mounts()[0].argv();
        assert_eq!(argv[..3].join(" "), "/bin/mount -t overlay");
        assert_eq!(argv[5], "overlay");
        assert!(plan.discrepancies().is_empty(), "{:?}", plan.discrepancies());
    }

    #[test]
    fn test_overlay2_oversized_options_are_reported() {
        let root = DockerRoot::new(DriverKind::Overlay2);
        let ids: Vec<String> = (0..80).map(|i| format!("layer{i:02}")).collect();
        let records: Vec<LayerRecord> = ids
            .iter()
            .enumerate()
            .map(|(i, id)| {
                let lowers: Vec<&str> = ids[..i].iter().rev().map(String::as_str).collect();
                root.add_layer_data(id, &lowers)
            })
            .collect();
        let stack: Vec<&LayerRecord> = records.iter().collect();

        let driver = Overlay::overlay2(root.path(), root.reader());
        let plan = driver.build_mount_instructions(&stack, Path::new("/mnt/x")).unwrap();

        assert!(plan.mounts()[0].options.len() > MOUNT_OPTIONS_MAX);
        assert_eq!(plan.discrepancies().len(), 1, "{:?}", plan.discrepancies());
        assert!(plan.discrepancies()[0].contains("80 layers up to layer79"));
    }

    #[test]
    fn test_overlay2_single_layer_is_bind_mount() {
        let root = DockerRoot::new(DriverKind::Overlay2);
        let base = root.add_layer_data("base", &[]);

        let driver = Overlay::overlay2(root.path(), root.reader());
        let plan = driver
            .build_mount_instructions(&[&base], Path::new("/mnt/x"))
            .unwrap();
        assert_eq!(
            plan.mounts()[0].argv(),
            vec![
                "/bin/mount".to_string(),
                "--bind".into(),
                "-o".into(),
                "ro".into(),
                root.path().join("overlay2/base/diff").display().to_string(),
                "/mnt/x".into(),
            ]
        );
    }

    #[test]
    fn test_overlay2_recorded_lowers() {
        let root = DockerRoot::new(DriverKind::Overlay2);
        let base = root.add_layer_data("base", &[]);
        let top = root.add_layer_data("top", &["base"]);
        let driver = Overlay::overlay2(root.path(), root.reader());

        assert_eq!(driver.recorded_lowers(&base).unwrap(), Some(vec![]));
        assert_eq!(
            driver.recorded_lowers(&top).unwrap(),
            Some(vec!["base".to_string()])
        );
    }

    #[test]
    fn test_overlay_uses_upper_over_snapshot() {
        let root = DockerRoot::new(DriverKind::Overlay);
        let image = root.add_layer_data("image", &[]);
        let init = root.add_layer_data("ctr-init", &["image"]);
        let rw = root.add_layer_data("ctr", &["image"]);
        let driver = Overlay::overlay(root.path(), root.reader());

        assert_eq!(
            driver.diff_path(&image),
            root.path().join("overlay/image/root")
        );
        assert_eq!(driver.diff_path(&rw), root.path().join("overlay/ctr/upper"));

        let plan = driver
            .build_mount_instructions(&[&image, &init, &rw], Path::new("/mnt/x"))
            .unwrap();
        assert_eq!(
            plan.mounts()[0].options,
            format!(
                "ro,lowerdir={}:{}",
                root.path().join("overlay/ctr/upper").display(),
                root.path().join("overlay/image/root").display()
            )
        );
        assert_eq!(
            plan.layers()
                .iter()
                .map(LayerId::as_str)
                .collect::<Vec<_>>(),
            vec!["image", "ctr-init", "ctr"]
        );
        assert!(plan.discrepancies().is_empty(), "{:?}", plan.discrepancies());
    }
}
