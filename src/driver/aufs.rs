//! AuFS driver.
//!
//! # Layout
//!
//! ```text
//! aufs/
//! +-- diff/<cache-id>/     # layer delta, whiteouts as .wh.<name> files
//! +-- layers/<cache-id>    # lower cache IDs, topmost first, one per line
//! +-- mnt/<cache-id>/      # union mount point on the live host (unused)
//! ```
//!
//! A read-only AuFS union is built by mounting the topmost branch and
//! appending each lower branch in turn. AuFS gives the leftmost branch the
//! highest priority and `append` adds at the lowest, so appending from the top
//! down reproduces the layer order. Every branch carries `=ro+wh` so that its
//! whiteouts keep hiding entries of the branches below it.

use std::path::{Path, PathBuf};

use crate::driver::{self, DriverKind, StorageDriver};
use crate::error::Result;
use crate::layer::{LayerId, LayerRecord};
use crate::metadata::{paths, MetadataReader};
use crate::mount::{MountInstruction, MountPlan};
use crate::whiteout::WhiteoutConvention;

const DATA_DIR: &str = "aufs";

/// Branch permission: read-only, whiteouts honoured.
const BRANCH_MODE: &str = "ro+wh";

/// The AuFS storage driver.
#[derive(Debug)]
pub struct Aufs {
    root: PathBuf,
    meta: MetadataReader,
}

impl Aufs {
    /// Driver for the Docker root at `root`.
    pub fn new(root: &Path, meta: MetadataReader) -> Self {
        Self {
            root: root.to_path_buf(),
            meta,
        }
    }

    fn layers_file(cache_id: &str) -> PathBuf {
        Path::new(DATA_DIR).join("layers").join(cache_id)
    }
}

impl StorageDriver for Aufs {
    fn kind(&self) -> DriverKind {
        DriverKind::Aufs
    }

    fn detect(meta: &MetadataReader) -> bool {
        meta.is_dir(Path::new(DATA_DIR).join("diff")) && meta.is_dir(paths::store(DATA_DIR))
    }

    fn diff_path(&self, layer: &LayerRecord) -> PathBuf {
        self.root.join(DATA_DIR).join("diff").join(&layer.cache_id)
    }

    fn container_top_layer(&self, container_id: &str) -> Result<LayerId> {
        driver::read_mount_id(&self.meta, DriverKind::Aufs, container_id)
    }

    fn recorded_lowers(&self, layer: &LayerRecord) -> Result<Option<Vec<String>>> {
        let path = Self::layers_file(&layer.cache_id);
        if !self.meta.exists(&path) {
            return Ok(None);
        }
        let content = self.meta.read_bytes(&path)?;
        Ok(Some(
            String::from_utf8_lossy(&content)
                .split_whitespace()
                .map(str::to_string)
                .collect(),
        ))
    }

    fn whiteout_convention(&self) -> WhiteoutConvention {
        WhiteoutConvention::Aufs
    }

    fn build_mount_instructions(
        &self,
        layers: &[&LayerRecord],
        target: &Path,
    ) -> Result<MountPlan> {
        let dirs = driver::layer_dirs(self, layers)?;

        let mut mounts = Vec::with_capacity(dirs.len());
        let mut branches = dirs.iter().rev();
        if let Some(top) = branches.next() {
            mounts.push(MountInstruction::union(
                "aufs",
                "none",
                format!("ro,br={}={BRANCH_MODE}", top.display()),
                vec![top.clone()],
                target,
            ));
        }
        for lower in branches {
            mounts.push(MountInstruction::union(
                "aufs",
                "none",
                format!("ro,remount,append:{}={BRANCH_MODE}", lower.display()),
                vec![lower.clone()],
                target,
            ));
        }

        let expected = layers
            .iter()
            .rev()
            .skip(1)
            .map(|layer| layer.cache_id.clone())
            .collect();
        let discrepancies = driver::lower_discrepancies(self, layers, expected)?;

        driver::finish_plan(self, layers, &dirs, target, mounts, discrepancies)
    }
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;

    use super::*;
    use crate::test::DockerRoot;

    #[test]
    fn test_mount_syntax() {
        let root = DockerRoot::new(DriverKind::Aufs);
        let base = root.add_layer_data("base", &[]);
        let mid = root.add_layer_data("mid", &["base"]);
        let top = root.add_layer_data("top", &["mid", "base"]);

        let driver = Aufs::new(root.path(), root.reader());
        let plan = driver
            .build_mount_instructions(&[&base, &mid, &top], Path::new("/mnt/x"))
            .unwrap();

        let diff = |id: &str| root.path().join("aufs/diff").join(id);
        let options: Vec<String> = plan.mounts().iter().map(|m| m.options.clone()).collect();
        assert_eq!(
            options,
            vec![
                format!("ro,br={}=ro+wh", diff("top").display()),
                format!("ro,remount,append:{}=ro+wh", diff("mid").display()),
                format!("ro,remount,append:{}=ro+wh", diff("base").display()),
            ]
        );
        assert_eq!(
            plan.mounts()[1].argv(),
            vec![
                "/bin/mount".to_string(),
                "-t".into(),
                "aufs".into(),
                "-o".into(),
                format!("ro,remount,append:{}=ro+wh", diff("mid").display()),
                "none".into(),
                "/mnt/x".into(),
            ]
        );
        assert_eq!(plan.unmounts().len(), 1);
        assert!(plan.discrepancies().is_empty(), "{:?}", plan.discrepancies());
    }

    #[test]
    fn test_lower_mismatch_is_reported() {
        let root = DockerRoot::new(DriverKind::Aufs);
        let base = root.add_layer_data("base", &[]);
        // aufs/layers claims a different lower than the parent chain
        let top = root.add_layer_data("top", &["forged"]);

        let driver = Aufs::new(root.path(), root.reader());
        let plan = driver
            .build_mount_instructions(&[&base, &top], Path::new("/mnt/x"))
            .unwrap();
        assert_eq!(plan.discrepancies().len(), 1);
        assert!(plan.discrepancies()[0].contains("forged"));
    }

    #[test]
    fn test_missing_diff_dir() {
        let root = DockerRoot::new(DriverKind::Aufs);
        let base = root.add_layer_data("base", &[]);
        let ghost = LayerRecord::new("ghost".into(), Some(base.id.clone()), "ghost");

        let driver = Aufs::new(root.path(), root.reader());
        match driver.build_mount_instructions(&[&base, &ghost], Path::new("/mnt/x")) {
            Err(crate::error::ExplorerError::LayerContentMissing { layer, path }) => {
                assert_eq!(layer.as_str(), "ghost");
                assert_eq!(path, root.path().join("aufs/diff/ghost"));
            }
            other => panic!("expected missing content, got {other:?}"),
        }
    }
}
