//! Mount plans and the planner that builds them.
//!
//! A [`MountPlan`] is data only: ordered `mount(8)` invocations that present a
//! container's or image's filesystem read-only at a target directory, plus the
//! teardown that undoes them. Nothing here executes a command or touches the
//! analysed filesystem.

use std::path::{Component, Path, PathBuf};

use serde::Serialize;

use crate::catalog::{Catalog, ContainerRecord, MountPointRecord};
use crate::driver::{DriverKind, StorageDriver};
use crate::error::{ExplorerError, Result};
use crate::layer::LayerId;
use crate::root::StorageRoot;
use crate::whiteout::Whiteout;

const MOUNT: &str = "/bin/mount";
const UMOUNT: &str = "/bin/umount";

/// One `mount(8)` invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MountInstruction {
    /// Filesystem type passed with `-t`; `None` for a bind mount.
    pub fstype: Option<String>,
    /// The device argument (`none`, `overlay`, or the bind source).
    pub device: String,
    /// The `-o` option string.
    pub options: String,
    /// The layer or volume directories this mount draws from, highest first.
    pub sources: Vec<PathBuf>,
    pub target: PathBuf,
}

impl MountInstruction {
    /// A union filesystem mount.
    pub fn union(
        fstype: &str,
        device: &str,
        options: String,
        sources: Vec<PathBuf>,
        target: &Path,
    ) -> Self {
        Self {
            fstype: Some(fstype.to_string()),
            device: device.to_string(),
            options,
            sources,
            target: target.to_path_buf(),
        }
    }

    /// A read-only bind mount of `source` at `target`.
    pub fn bind(source: &Path, target: &Path) -> Self {
        Self {
            fstype: None,
            device: source.display().to_string(),
            options: "ro".to_string(),
            sources: vec![source.to_path_buf()],
            target: target.to_path_buf(),
        }
    }

    /// The command line for the execution collaborator.
    pub fn argv(&self) -> Vec<String> {
        let mut argv = vec![MOUNT.to_string()];
        match &self.fstype {
            Some(fstype) => argv.extend(["-t".to_string(), fstype.clone()]),
            None => argv.push("--bind".to_string()),
        }
        argv.extend([
            "-o".to_string(),
            self.options.clone(),
            self.device.clone(),
            self.target.display().to_string(),
        ]);
        argv
    }
}

/// One `umount(8)` invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UnmountInstruction {
    pub target: PathBuf,
}

impl UnmountInstruction {
    pub fn new(target: &Path) -> Self {
        Self {
            target: target.to_path_buf(),
        }
    }

    pub fn argv(&self) -> Vec<String> {
        vec![UMOUNT.to_string(), self.target.display().to_string()]
    }
}

/// The mounts presenting one layer stack at a target directory, and their teardown.
#[derive(Debug, Clone, Serialize)]
pub struct MountPlan {
    pub(crate) driver: DriverKind,
    pub(crate) target: PathBuf,
    /// The stack, base first.
    pub(crate) layers: Vec<LayerId>,
    pub(crate) mounts: Vec<MountInstruction>,
    pub(crate) unmounts: Vec<UnmountInstruction>,
    pub(crate) whiteouts: Vec<Whiteout>,
    pub(crate) discrepancies: Vec<String>,
}

impl MountPlan {
    pub fn driver(&self) -> DriverKind {
        self.driver
    }

    pub fn target(&self) -> &Path {
        &self.target
    }

    /// The layer stack this plan presents, base first.
    pub fn layers(&self) -> &[LayerId] {
        &self.layers
    }

    /// Mount instructions, in execution order.
    pub fn mounts(&self) -> &[MountInstruction] {
        &self.mounts
    }

    /// Teardown instructions, in execution order.
    pub fn unmounts(&self) -> &[UnmountInstruction] {
        &self.unmounts
    }

    /// Every deletion marker in the stack, including superseded ones.
    pub fn whiteouts(&self) -> &[Whiteout] {
        &self.whiteouts
    }

    /// Disagreements between the resolved stack and the driver's own records.
    pub fn discrepancies(&self) -> &[String] {
        &self.discrepancies
    }

    /// Paths a whiteout removes from the composed view. A re-created path is
    /// left out, though the lower contents of a re-created directory stay
    /// hidden (see [`MountPlan::masks_from`]).
    pub fn hidden_paths(&self) -> impl Iterator<Item = &Path> {
        self.whiteouts
            .iter()
            .filter(|w| w.superseded_by.is_none())
            .map(|w| w.path.as_path())
    }

    /// The whiteout that hides `path` (relative to the root of the view) from
    /// the layers below it, if any.
    pub fn masks(&self, path: impl AsRef<Path>) -> Option<&Whiteout> {
        let path = path.as_ref();
        let path = path.strip_prefix("/").unwrap_or(path);
        self.whiteouts.iter().find(|w| w.covers(path))
    }

    /// The whiteout that hides the copy of `path` held by `layer`, if any.
    /// Only markers in layers above `layer` count. `None` if `layer` is not
    /// part of this plan.
    pub fn masks_from(&self, path: impl AsRef<Path>, layer: &LayerId) -> Option<&Whiteout> {
        let path = path.as_ref();
        let path = path.strip_prefix("/").unwrap_or(path);
        let position = self.layers.iter().position(|l| l == layer)?;
        let above = &self.layers[position + 1..];
        self.whiteouts
            .iter()
            .find(|w| above.contains(&w.layer) && w.hides_lower(path))
    }

    /// Mount and teardown command lines, mounts first.
    pub fn commands(&self) -> (Vec<Vec<String>>, Vec<Vec<String>>) {
        (
            self.mounts.iter().map(MountInstruction::argv).collect(),
            self.unmounts.iter().map(UnmountInstruction::argv).collect(),
        )
    }

    /// Add a read-only bind of `source` at `destination` inside the view. Its
    /// unmount runs before those of everything mounted earlier.
    ///
    /// A `destination` with `..` components could place the bind outside the
    /// view, so it is recorded as a discrepancy and no bind is added.
    pub(crate) fn add_bind(&mut self, source: &Path, destination: &Path) {
        if has_parent_dir(destination) {
            let message = format!(
                "refusing to bind {} at {}, which leaves {}",
                source.display(),
                destination.display(),
                self.target.display()
            );
            log::warn!("{message}");
            self.discrepancies.push(message);
            return;
        }
        let destination = destination.strip_prefix("/").unwrap_or(destination);
        let target = self.target.join(destination);
        self.unmounts.insert(0, UnmountInstruction::new(&target));
        self.mounts.push(MountInstruction::bind(source, &target));
    }
}

fn has_parent_dir(path: &Path) -> bool {
    path.components().any(|c| c == Component::ParentDir)
}

/// Turns containers and images into mount plans for the active driver.
#[derive(Debug)]
pub struct MountPlanner<'a> {
    root: &'a StorageRoot,
    catalog: &'a Catalog,
    driver: Box<dyn StorageDriver>,
}

impl<'a> MountPlanner<'a> {
    /// A planner for `root`'s active driver.
    ///
    /// # Errors
    ///
    /// [`ExplorerError::UnsupportedDriver`] or [`ExplorerError::AmbiguousDriver`]
    /// if detection did not settle on exactly one driver.
    pub fn new(root: &'a StorageRoot, catalog: &'a Catalog) -> Result<Self> {
        Ok(Self {
            root,
            catalog,
            driver: root.driver()?,
        })
    }

    pub fn driver(&self) -> &dyn StorageDriver {
        self.driver.as_ref()
    }

    /// Plan the mount of a container or image, tried in that order.
    pub fn plan_mount(&self, id: &str, target: &Path) -> Result<MountPlan> {
        match self.plan_container(id, target) {
            Err(ExplorerError::ContainerNotFound(_)) => self.plan_image(id, target),
            result => result,
        }
    }

    /// Plan the mount of a container's filesystem, volumes included when
    /// configured.
    pub fn plan_container(&self, container_id: &str, target: &Path) -> Result<MountPlan> {
        let container = self.catalog.get_container(container_id)?;
        let top = self.driver.container_top_layer(&container.id)?;
        let mut plan = self.plan_layers(&top, target)?;
        if self.root.config().mount_volumes {
            self.add_volumes(container, &mut plan);
        }
        Ok(plan)
    }

    /// Plan the mount of an image, by exact ID or repository tag.
    pub fn plan_image(&self, id_or_tag: &str, target: &Path) -> Result<MountPlan> {
        let image = self.catalog.find_image(id_or_tag)?;
        let top = image
            .top_layer
            .as_ref()
            .ok_or_else(|| ExplorerError::EmptyImage(image.id.clone()))?;
        self.plan_layers(top, target)
    }

    /// Plan the mount of the stack ending at `top`.
    pub fn plan_layers(&self, top: &LayerId, target: &Path) -> Result<MountPlan> {
        let layers = self.catalog.layers().resolve_records(top)?;
        log::debug!(
            "planning {} mount of {} layers ending at {top}",
            self.driver.kind(),
            layers.len()
        );
        self.driver.build_mount_instructions(&layers, target)
    }

    fn add_volumes(&self, container: &ContainerRecord, plan: &mut MountPlan) {
        for mount_point in &container.mount_points {
            match self.volume_source(mount_point) {
                Ok(source) => plan.add_bind(&source, Path::new(&mount_point.destination)),
                Err(reason) => {
                    let message = format!(
                        "mount point {} of container {} {reason}",
                        mount_point.destination, container.id
                    );
                    log::warn!("{message}");
                    plan.discrepancies.push(message);
                }
            }
        }
    }

    /// Where the data of `mount_point` lives in the evidence. The source and
    /// volume name come from the analysed host, so neither may climb out of
    /// its directory.
    fn volume_source(&self, mount_point: &MountPointRecord) -> std::result::Result<PathBuf, String> {
        match mount_point.source.trim_start_matches('/') {
            "" => {
                let name = mount_point
                    .name
                    .as_deref()
                    .ok_or("has neither a source nor a volume name")?;
                let mut components = Path::new(name).components();
                match (components.next(), components.next()) {
                    (Some(Component::Normal(_)), None) => {
                        Ok(self.root.path().join("volumes").join(name).join("_data"))
                    }
                    _ => Err(format!("names volume {name:?}, which is not a directory name")),
                }
            }
            host_path if has_parent_dir(Path::new(host_path)) => {
                Err(format!("has source {}, which leaves the host root", mount_point.source))
            }
            host_path => Ok(self.root.host_root().join(host_path)),
        }
    }
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;

    use super::*;
    use crate::config::ExplorerConfig;
    use crate::test::DockerRoot;
    use crate::whiteout::WhiteoutKind;

    fn plan() -> MountPlan {
        MountPlan {
            driver: DriverKind::Overlay2,
            target: "/mnt/x".into(),
            layers: vec![],
            mounts: vec![MountInstruction::union(
                "overlay",
                "overlay",
                "ro,lowerdir=/a:/b".to_string(),
                vec!["/a".into(), "/b".into()],
                Path::new("/mnt/x"),
            )],
            unmounts: vec![UnmountInstruction::new(Path::new("/mnt/x"))],
            whiteouts: vec![],
            discrepancies: vec![],
        }
    }

    #[test]
    fn test_argv() {
        let plan = plan();
        let (mounts, unmounts) = plan.commands();
        assert_eq!(
            mounts,
            vec![vec![
                "/bin/mount",
                "-t",
                "overlay",
                "-o",
                "ro,lowerdir=/a:/b",
                "overlay",
                "/mnt/x"
            ]]
        );
        assert_eq!(unmounts, vec![vec!["/bin/umount", "/mnt/x"]]);
    }

    #[test]
    fn test_binds_unmount_first_in_reverse() {
        let mut plan = plan();
        plan.add_bind(Path::new("/evidence/data"), Path::new("/data"));
        plan.add_bind(Path::new("/evidence/logs"), Path::new("/var/log/app"));

        let (mounts, unmounts) = plan.commands();
        assert_eq!(
            mounts[1],
            vec!["/bin/mount", "--bind", "-o", "ro", "/evidence/data", "/mnt/x/data"]
        );
        assert_eq!(
            unmounts,
            vec![
                vec!["/bin/umount", "/mnt/x/var/log/app"],
                vec!["/bin/umount", "/mnt/x/data"],
                vec!["/bin/umount", "/mnt/x"],
            ]
        );
    }

    fn container_fixture() -> DockerRoot {
        let fixture = DockerRoot::new(DriverKind::Aufs);
        let image = fixture.add_image(&["sha256:d1", "sha256:d2"]);
        let layers = fixture.image_layers(&image);
        fixture.add_file(&layers[0].1, "etc/secret", "s3cr3t");
        fixture.add_aufs_whiteout(&layers[1].1, "etc/secret");
        fixture.add_container("c1", &image, true, "2024-01-01T00:00:00Z");
        fixture.add_mount_point("c1", "/data", "", "appdata");
        fixture
    }

    #[test]
    fn test_plan_container() {
        let fixture = container_fixture();
        let root = StorageRoot::open_path(fixture.path()).unwrap();
        let catalog = Catalog::build(&root).unwrap();
        let planner = MountPlanner::new(&root, &catalog).unwrap();

        let plan = planner.plan_container("c1", Path::new("/mnt/c1")).unwrap();
        let mount_id = DockerRoot::mount_id("c1");
        assert_eq!(
            plan.layers().last().map(LayerId::as_str),
            Some(mount_id.as_str())
        );
        assert_eq!(plan.layers().len(), 4);
        assert!(plan.masks("etc/secret").is_some());
        assert!(plan.discrepancies().is_empty(), "{:?}", plan.discrepancies());

        let bind = plan.mounts().last().unwrap();
        assert_eq!(bind.fstype, None);
        assert_eq!(
            bind.sources,
            vec![fixture.path().join("volumes/appdata/_data")]
        );
        assert_eq!(bind.target, PathBuf::from("/mnt/c1/data"));
        assert_eq!(plan.unmounts().len(), 2);

        // an image is planned without any container layers
        let image = &catalog.get_container("c1").unwrap().image_id;
        let plan = planner.plan_mount(image, Path::new("/mnt/img")).unwrap();
        assert_eq!(plan.layers().len(), 2);
        assert!(plan.masks("etc/secret").is_some());
    }

    #[test]
    fn test_volumes_can_be_left_out() {
        let fixture = container_fixture();
        let config = ExplorerConfig::new(fixture.path()).with_mount_volumes(false);
        let root = StorageRoot::open(config).unwrap();
        let catalog = Catalog::build(&root).unwrap();

        let plan = MountPlanner::new(&root, &catalog)
            .unwrap()
            .plan_container("c1", Path::new("/mnt/c1"))
            .unwrap();
        assert!(plan.mounts().iter().all(|m| m.fstype.as_deref() == Some("aufs")));
        assert_eq!(plan.unmounts().len(), 1);
    }

    #[test]
    fn test_bind_outside_target_is_refused() {
        let mut plan = plan();
        plan.add_bind(Path::new("/evidence/vol"), Path::new("/../../etc"));

        assert_eq!(plan.mounts().len(), 1);
        assert_eq!(plan.unmounts().len(), 1);
        assert_eq!(plan.discrepancies().len(), 1);
        assert!(plan.discrepancies()[0].contains("/../../etc"));
    }

    #[test]
    fn test_volume_sources_stay_in_evidence() {
        let fixture = container_fixture();
        fixture.add_mount_point("c1", "/shadow", "/../../etc/shadow", "");
        fixture.add_mount_point("c1", "/cache", "", "../../escape");
        let root = StorageRoot::open_path(fixture.path()).unwrap();
        let catalog = Catalog::build(&root).unwrap();

        let plan = MountPlanner::new(&root, &catalog)
            .unwrap()
            .plan_container("c1", Path::new("/mnt/c1"))
            .unwrap();
        let binds: Vec<&Path> = plan
            .mounts()
            .iter()
            .filter(|m| m.fstype.is_none())
            .map(|m| m.target.as_path())
            .collect();
        assert_eq!(binds, vec![Path::new("/mnt/c1/data")]);
        assert_eq!(plan.discrepancies().len(), 2, "{:?}", plan.discrepancies());
        assert_eq!(plan.unmounts().len(), 2);
    }

    #[test]
    fn test_masks_from_takes_the_layer_into_account() {
        let (l1, l2, l3) = (LayerId::from("l1"), LayerId::from("l2"), LayerId::from("l3"));
        let mut plan = plan();
        plan.layers = vec![l1.clone(), l2.clone(), l3.clone()];
        plan.whiteouts = vec![Whiteout {
            layer: l2.clone(),
            path: "etc/conf".into(),
            kind: WhiteoutKind::Entry,
            superseded_by: Some(l3.clone()),
        }];

        assert!(plan.masks_from("/etc/conf/old-evidence", &l1).is_some());
        assert!(plan.masks_from("etc/conf", &l1).is_some());
        assert!(plan.masks_from("etc/conf/new", &l3).is_none());
        assert!(plan.masks_from("etc/conf/other", &l2).is_none());
        assert!(plan.masks_from("etc/conf", &LayerId::from("l9")).is_none());
        assert_eq!(plan.hidden_paths().count(), 0);
    }
}
