//! The index of every container, image and layer found under a Docker root.
//!
//! A [`Catalog`] is built once per session and is immutable afterwards, so it
//! can be shared between threads answering independent requests. Building it
//! parses each container and image document independently; depending on the
//! [`ScanPolicy`], a document that fails to parse either aborts construction
//! or is skipped with a [`CatalogWarning`].
//!
//! Besides parse failures, warnings record integrity problems that an analyst
//! should know about but that do not prevent the record from being used:
//! image configs whose digest does not match their content-addressed name,
//! and layers whose ChainID does not match their `diff` and `parent`.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use rayon::prelude::*;
use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::config::ScanPolicy;
use crate::error::{ExplorerError, Result};
use crate::history;
use crate::layer::{chain_id, top_chain_id, LayerGraph, LayerId, LayerKind, LayerRecord};
use crate::metadata::{
    parse_json, paths, ContainerDocument, HistoryDocument, ImageDocument, MetadataReader,
    RepositoriesDocument,
};
use crate::root::StorageRoot;

/// One volume or bind mount of a container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MountPointRecord {
    /// Host path of a bind mount; empty for named volumes.
    pub source: String,
    /// Path inside the container.
    pub destination: String,
    /// Volume name, for named volumes.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub rw: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
}

/// A container found under `containers/`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ContainerRecord {
    pub id: String,
    /// Name without Docker's leading `/`.
    pub name: String,
    /// ID of the image the container was created from.
    pub image_id: String,
    /// Image name as given when the container was created.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<String>,
    pub running: bool,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    /// Storage driver recorded in the container's config.
    pub driver: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub mount_points: Vec<MountPointRecord>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_path: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub exposed_ports: Vec<String>,
    /// The container's writable layer (its mount ID), when the image store
    /// records one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_layer: Option<LayerId>,
}

impl ContainerRecord {
    fn from_document(doc: ContainerDocument, top_layer: Option<LayerId>) -> Self {
        let state = doc.state.unwrap_or_default();
        let config = doc.config.unwrap_or_default();
        let mount_points = doc
            .mount_points
            .unwrap_or_default()
            .into_values()
            .map(|mp| MountPointRecord {
                source: mp.source,
                destination: mp.destination,
                name: Some(mp.name).filter(|name| !name.is_empty()),
                rw: mp.rw,
                kind: Some(mp.kind).filter(|kind| !kind.is_empty()),
            })
            .collect();

        Self {
            name: doc.name.trim_start_matches('/').to_string(),
            id: doc.id,
            image_id: doc.image,
            image_name: config.image,
            created: doc.created,
            started_at: state.started_at,
            finished_at: state.finished_at,
            running: state.running,
            labels: config.labels.unwrap_or_default(),
            driver: doc.driver,
            mount_points,
            log_path: doc.log_path.filter(|path| !path.is_empty()),
            exposed_ports: config.exposed_ports.unwrap_or_default().into_keys().collect(),
            top_layer,
        }
    }

    /// Registry domain of the image name (`k8s.gcr.io` for
    /// `k8s.gcr.io/pause:3.1`), or its first path component.
    pub fn registry(&self) -> Option<&str> {
        self.image_name
            .as_deref()
            .and_then(|name| name.split('/').next())
    }
}

/// An image config found under `imagedb/content/`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ImageRecord {
    /// `sha256:<hex>`.
    pub id: String,
    /// ChainID of the topmost filesystem layer; `None` for an image without layers.
    pub top_layer: Option<LayerId>,
    /// Uncompressed layer digests, base first.
    pub diff_ids: Vec<String>,
    /// Repository references pointing at this image.
    pub names: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created: Option<String>,
    /// `container_config.Cmd` of the top layer's build step.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub os: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub architecture: Option<String>,
    /// The config's `history`, in build order.
    #[serde(skip)]
    pub(crate) steps: Vec<HistoryDocument>,
}

impl ImageRecord {
    /// The hex part of the ID.
    pub fn hex(&self) -> &str {
        self.id.strip_prefix("sha256:").unwrap_or(&self.id)
    }
}

/// A problem found while building a catalog.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CatalogWarning {
    /// The file the problem was found in, relative to the Docker root.
    pub path: PathBuf,
    pub message: String,
}

/// Which containers [`Catalog::list_containers`] returns.
#[derive(Debug, Clone, Default)]
pub struct ContainerFilter {
    /// Only containers that were running.
    pub only_running: bool,
    /// Skip containers whose image comes from one of these registries.
    pub exclude_registries: Vec<String>,
}

impl ContainerFilter {
    pub fn running() -> Self {
        Self {
            only_running: true,
            ..Self::default()
        }
    }

    fn matches(&self, container: &ContainerRecord) -> bool {
        if self.only_running && !container.running {
            return false;
        }
        match container.registry() {
            Some(registry) => !self.exclude_registries.iter().any(|r| r == registry),
            None => true,
        }
    }
}

type RepositoryIndex = BTreeMap<String, BTreeMap<String, String>>;

/// Containers, images and layers of one Docker root.
#[derive(Debug, Default)]
pub struct Catalog {
    store: Option<String>,
    containers: BTreeMap<String, ContainerRecord>,
    images: BTreeMap<String, ImageRecord>,
    repositories: RepositoryIndex,
    layers: LayerGraph,
    warnings: Vec<CatalogWarning>,
}

/// Collects the outcome of scanning documents under a [`ScanPolicy`].
struct Scan {
    policy: ScanPolicy,
    warnings: Vec<CatalogWarning>,
}

impl Scan {
    fn warn(&mut self, path: impl Into<PathBuf>, message: String) {
        let path = path.into();
        log::warn!("{}: {message}", path.display());
        self.warnings.push(CatalogWarning { path, message });
    }

    /// Keep `result`'s value, or record its error as a warning (best-effort)
    /// or propagate it (fail-fast).
    fn keep<T>(&mut self, path: &Path, result: Result<T>) -> Result<Option<T>> {
        match result {
            Ok(value) => Ok(Some(value)),
            Err(e) if self.policy == ScanPolicy::FailFast => Err(e),
            Err(e) => {
                self.warn(path, e.to_string());
                Ok(None)
            }
        }
    }
}

/// The start time of `container` in UTC. Unparseable or missing times sort
/// first.
fn start_time(container: &ContainerRecord) -> Option<DateTime<Utc>> {
    let started_at = container.started_at.as_deref()?;
    match DateTime::parse_from_rfc3339(started_at) {
        Ok(time) => Some(time.with_timezone(&Utc)),
        Err(e) => {
            log::debug!("container {} has start time {started_at:?}: {e}", container.id);
            None
        }
    }
}

fn image_layerdb_dir(store: &str, hex: &str) -> PathBuf {
    paths::layers(store).join(hex)
}

fn read_size(meta: &MetadataReader, path: &Path) -> Result<Option<u64>> {
    meta.read_optional_pointer(path)?
        .map(|size| {
            size.parse().map_err(|_| ExplorerError::MetadataCorrupt {
                path: path.to_path_buf(),
                reason: format!("size {size:?} is not a number"),
            })
        })
        .transpose()
}

/// Read `layerdb/sha256/<hex>/`.
fn read_image_layer(meta: &MetadataReader, store: &str, hex: &str) -> Result<LayerRecord> {
    let dir = image_layerdb_dir(store, hex);
    let diff_id = meta.read_pointer(dir.join("diff"))?;
    let parent = meta.read_optional_pointer(dir.join("parent"))?.map(LayerId::new);
    let cache_id = meta.read_pointer(dir.join("cache-id"))?;
    let size = read_size(meta, &dir.join("size"))?;

    let mut record = LayerRecord::new(LayerId::new(format!("sha256:{hex}")), parent, cache_id);
    record.diff_id = Some(diff_id);
    record.size = size;
    Ok(record)
}

/// Read `layerdb/mounts/<container-id>/` into the container's init and
/// writable layers.
fn read_container_layers(
    meta: &MetadataReader,
    store: &str,
    container_id: &str,
) -> Result<Vec<LayerRecord>> {
    let dir = paths::mount(store, container_id);
    let mount_id = LayerId::new(meta.read_pointer(dir.join("mount-id"))?);
    let init_id = meta.read_optional_pointer(dir.join("init-id"))?.map(LayerId::new);
    let image_top = meta.read_optional_pointer(dir.join("parent"))?.map(LayerId::new);

    let mut layers = Vec::with_capacity(2);
    let writable_parent = match init_id {
        Some(init_id) => {
            let mut init = LayerRecord::new(init_id.clone(), image_top, init_id.as_str());
            init.kind = LayerKind::Init;
            layers.push(init);
            Some(init_id)
        }
        None => image_top,
    };
    let mut writable = LayerRecord::new(mount_id.clone(), writable_parent, mount_id.as_str());
    writable.kind = LayerKind::Container;
    layers.push(writable);
    Ok(layers)
}

fn read_container(
    meta: &MetadataReader,
    store: Option<&str>,
    container_id: &str,
) -> Result<ContainerRecord> {
    let path = paths::container_config(container_id);
    let doc: ContainerDocument = meta.read_json(&path)?;
    if doc.id != container_id {
        return Err(ExplorerError::MetadataCorrupt {
            path,
            reason: format!("ID {} does not match its directory", doc.id),
        });
    }
    let top_layer = match store {
        Some(store) => meta
            .read_optional_pointer(paths::mount(store, container_id).join("mount-id"))?
            .map(LayerId::new),
        None => None,
    };
    Ok(ContainerRecord::from_document(doc, top_layer))
}

/// Read one image config. The second value is set when the config's digest
/// does not match its name.
fn read_image(meta: &MetadataReader, store: &str, hex: &str) -> Result<(ImageRecord, Option<String>)> {
    let path = paths::image_contents(store).join(hex);
    let data = meta.read_bytes(&path)?;
    let doc: ImageDocument = parse_json(&path, &data)?;

    let digest = hex::encode(Sha256::digest(&data));
    let mismatch = (digest != hex).then(|| format!("config digest is sha256:{digest}"));

    let top_layer = top_chain_id(doc.rootfs.diff_ids.iter().map(String::as_str));
    let parent = meta.read_optional_pointer(paths::image_parent(store, hex))?;
    let command = doc
        .container_config
        .as_ref()
        .and_then(|config| config.cmd.as_ref())
        .filter(|cmd| !cmd.is_empty())
        .map(|cmd| cmd.join(" "));

    let record = ImageRecord {
        id: format!("sha256:{hex}"),
        top_layer,
        diff_ids: doc.rootfs.diff_ids,
        names: Vec::new(),
        created: doc.created,
        command,
        parent,
        author: doc.author,
        comment: doc.comment,
        os: doc.os,
        architecture: doc.architecture,
        steps: doc.history,
    };
    Ok((record, mismatch))
}

impl Catalog {
    /// Scan every container, image and layer under `root`.
    ///
    /// # Errors
    ///
    /// With [`ScanPolicy::FailFast`], the first document that cannot be read.
    /// With [`ScanPolicy::BestEffort`], only failures to list directories.
    pub fn build(root: &StorageRoot) -> Result<Self> {
        let meta = root.meta();
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(root.config().scan_threads())
            .build()?;
        let store = root.image_store()?;
        let mut scan = Scan {
            policy: root.config().scan_policy,
            warnings: Vec::new(),
        };

        let mut layers = LayerGraph::new();
        let mut repositories = RepositoryIndex::new();
        let mut images = BTreeMap::new();

        if let Some(store) = store.as_deref() {
            for hex in meta.list_names(paths::layers(store))? {
                let dir = image_layerdb_dir(store, &hex);
                let Some(record) = scan.keep(&dir, read_image_layer(meta, store, &hex))? else {
                    continue;
                };
                let expected = chain_id(record.parent.as_ref(), record.diff_id.as_deref().unwrap_or(""));
                if expected != record.id {
                    scan.warn(dir, format!("layer ChainID does not match its contents ({expected})"));
                }
                layers.insert(record);
            }

            let mounts = paths::mounts(store);
            for container_id in meta.list_names(&mounts)? {
                let result = read_container_layers(meta, store, &container_id);
                for record in scan.keep(&mounts.join(&container_id), result)?.into_iter().flatten() {
                    layers.insert(record);
                }
            }

            let path = paths::repositories(store);
            match meta.read_json::<RepositoriesDocument>(&path) {
                Ok(doc) => repositories = doc.repositories,
                Err(ExplorerError::MetadataNotFound { .. }) => {
                    log::debug!("no repository index at {}", path.display());
                }
                Err(e) => {
                    scan.keep::<()>(&path, Err(e))?;
                }
            }

            let hexes = meta.list_names(paths::image_contents(store))?;
            let results: Vec<_> =
                pool.install(|| hexes.par_iter().map(|hex| read_image(meta, store, hex)).collect());
            for (hex, result) in hexes.iter().zip(results) {
                let path = paths::image_contents(store).join(hex);
                let Some((image, mismatch)) = scan.keep(&path, result)? else {
                    continue;
                };
                if let Some(message) = mismatch {
                    scan.warn(&path, message);
                }
                images.insert(image.id.clone(), image);
            }
        }

        for refs in repositories.values() {
            for (reference, image_id) in refs {
                match images.get_mut(image_id) {
                    Some(image) => image.names.push(reference.clone()),
                    None => log::debug!("{reference} points at unknown image {image_id}"),
                }
            }
        }

        for image in images.values() {
            if let Some(top) = &image.top_layer {
                if !layers.contains(top) {
                    scan.warn(
                        paths::image_contents(store.as_deref().unwrap_or_default()).join(image.hex()),
                        format!("top layer {top} has no layerdb record"),
                    );
                    continue;
                }
            }
            history::annotate_layers(image, &mut layers);
        }

        let container_ids = meta.list_names(paths::CONTAINERS)?;
        let results: Vec<_> = pool.install(|| {
            container_ids
                .par_iter()
                .map(|id| read_container(meta, store.as_deref(), id))
                .collect()
        });
        let mut containers = BTreeMap::new();
        for (id, result) in container_ids.iter().zip(results) {
            if let Some(container) = scan.keep(&paths::container_config(id), result)? {
                containers.insert(container.id.clone(), container);
            }
        }

        log::debug!(
            "catalog of {}: {} containers, {} images, {} layers, {} warnings",
            root.path().display(),
            containers.len(),
            images.len(),
            layers.len(),
            scan.warnings.len()
        );

        Ok(Self {
            store,
            containers,
            images,
            repositories,
            layers,
            warnings: scan.warnings,
        })
    }

    /// The `image/<store>` the catalog was read from.
    pub fn store(&self) -> Option<&str> {
        self.store.as_deref()
    }

    /// Problems recorded while building the catalog.
    pub fn warnings(&self) -> &[CatalogWarning] {
        &self.warnings
    }

    pub fn layers(&self) -> &LayerGraph {
        &self.layers
    }

    /// Containers matching `filter`, by start time and then ID.
    pub fn list_containers(&self, filter: &ContainerFilter) -> Vec<&ContainerRecord> {
        let mut containers: Vec<&ContainerRecord> = self
            .containers
            .values()
            .filter(|c| filter.matches(c))
            .collect();
        containers.sort_by_cached_key(|c| (start_time(c), c.started_at.clone(), c.id.clone()));
        containers
    }

    /// Containers that were running when the evidence was captured.
    pub fn list_running_containers(&self) -> Vec<&ContainerRecord> {
        self.list_containers(&ContainerFilter::running())
    }

    /// Every image, by ID.
    pub fn list_images(&self) -> Vec<&ImageRecord> {
        self.images.values().collect()
    }

    /// The repository index: repository, then reference, then image ID.
    pub fn repositories(&self) -> &BTreeMap<String, BTreeMap<String, String>> {
        &self.repositories
    }

    /// The image ID a repository reference (`busybox:latest`,
    /// `busybox@sha256:...`) points at.
    pub fn resolve_repository_tag(&self, reference: &str) -> Result<&str> {
        self.repositories
            .values()
            .find_map(|refs| refs.get(reference))
            .map(String::as_str)
            .ok_or_else(|| ExplorerError::ImageNotFound(reference.to_string()))
    }

    pub fn get_container(&self, id: &str) -> Result<&ContainerRecord> {
        self.containers
            .get(id)
            .ok_or_else(|| ExplorerError::ContainerNotFound(id.to_string()))
    }

    pub fn get_image(&self, id: &str) -> Result<&ImageRecord> {
        self.images
            .get(id)
            .ok_or_else(|| ExplorerError::ImageNotFound(id.to_string()))
    }

    /// Look an image up by exact ID, then by repository reference.
    pub fn find_image(&self, id_or_reference: &str) -> Result<&ImageRecord> {
        match self.get_image(id_or_reference) {
            Err(ExplorerError::ImageNotFound(_)) => {
                let id = self.resolve_repository_tag(id_or_reference)?;
                self.get_image(id)
            }
            result => result,
        }
    }
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;

    use super::*;
    use crate::config::ExplorerConfig;
    use crate::driver::DriverKind;
    use crate::test::DockerRoot;

    fn open(fixture: &DockerRoot, policy: ScanPolicy) -> StorageRoot {
        StorageRoot::open(
            ExplorerConfig::new(fixture.path())
                .with_scan_policy(policy)
                .with_scan_threads(3),
        )
        .unwrap()
    }

    #[test]
    fn test_running_containers() {
        let fixture = DockerRoot::new(DriverKind::Overlay2);
        let image = fixture.add_image(&["sha256:d1"]);
        for (id, running, started) in [
            ("c3", true, "2024-01-03T00:00:00Z"),
            ("c1", true, "2024-01-01T00:00:00Z"),
            ("c2", false, "2024-01-02T00:00:00Z"),
            ("c4", false, "2024-01-04T00:00:00Z"),
        ] {
            fixture.add_container(id, &image, running, started);
        }

        let root = open(&fixture, ScanPolicy::BestEffort);
        let catalog = Catalog::build(&root).unwrap();

        let running = catalog.list_running_containers();
        assert_eq!(
            running.iter().map(|c| c.id.as_str()).collect::<Vec<_>>(),
            vec!["c1", "c3"]
        );
        assert!(running.iter().all(|c| c.image_id == image));
        assert_eq!(catalog.list_containers(&ContainerFilter::default()).len(), 4);
        assert!(catalog.warnings().is_empty(), "{:?}", catalog.warnings());
    }

    #[test]
    fn test_containers_sorted_by_start_instant() {
        let fixture = DockerRoot::new(DriverKind::Overlay2);
        let image = fixture.add_image(&["sha256:d1"]);
        for (id, started) in [
            ("whole", "2024-01-01T00:00:05Z"),
            ("fraction", "2024-01-01T00:00:05.1Z"),
            ("offset", "2024-01-01T01:00:00+02:00"),
        ] {
            fixture.add_container(id, &image, true, started);
        }

        let catalog = Catalog::build(&open(&fixture, ScanPolicy::BestEffort)).unwrap();
        assert_eq!(
            catalog
                .list_running_containers()
                .iter()
                .map(|c| c.id.as_str())
                .collect::<Vec<_>>(),
            vec!["offset", "whole", "fraction"]
        );
    }

    #[test]
    fn test_worker_count_does_not_change_the_catalog() {
        let fixture = DockerRoot::new(DriverKind::Overlay2);
        let images: Vec<String> = (0..5)
            .map(|i| fixture.add_image(&[format!("sha256:d{i}").as_str()]))
            .collect();
        for i in 0..12 {
            let started = format!("2024-01-01T00:00:{:02}Z", 59 - i);
            fixture.add_container(&format!("c{i:02}"), &images[i % images.len()], i % 3 != 0, &started);
        }
        fixture.write("containers/broken/config.v2.json", "{");

        let summary = |threads: usize| {
            let root = StorageRoot::open(
                ExplorerConfig::new(fixture.path()).with_scan_threads(threads),
            )
            .unwrap();
            let catalog = Catalog::build(&root).unwrap();
            let containers: Vec<String> = catalog
                .list_containers(&ContainerFilter::default())
                .iter()
                .map(|c| c.id.clone())
                .collect();
            let images: Vec<String> = catalog.list_images().iter().map(|i| i.id.clone()).collect();
            (containers, images, catalog.warnings().to_vec())
        };

        let (containers, images, warnings) = summary(1);
        assert_eq!(containers.len(), 12);
        assert_eq!(containers.first().map(String::as_str), Some("c11"));
        assert_eq!(images.len(), 5);
        assert_eq!(warnings.len(), 1);
        assert_eq!(summary(8), (containers, images, warnings));
    }

    #[test]
    fn test_exclude_registries() {
        let fixture = DockerRoot::new(DriverKind::Overlay2);
        let image = fixture.add_image(&["sha256:d1"]);
        fixture.add_container("app", &image, true, "2024-01-01T00:00:00Z");
        fixture.add_container("pause", &image, true, "2024-01-01T00:00:00Z");
        fixture.set_container_image_name("pause", "k8s.gcr.io/pause:3.1");

        let root = open(&fixture, ScanPolicy::BestEffort);
        let catalog = Catalog::build(&root).unwrap();
        let filter = ContainerFilter {
            only_running: true,
            exclude_registries: vec!["k8s.gcr.io".to_string()],
        };
        assert_eq!(
            catalog
                .list_containers(&filter)
                .iter()
                .map(|c| c.id.as_str())
                .collect::<Vec<_>>(),
            vec!["app"]
        );
    }

    #[test]
    fn test_best_effort_skips_malformed_documents() {
        let fixture = DockerRoot::new(DriverKind::Aufs);
        let image = fixture.add_image(&["sha256:d1"]);
        fixture.add_container("good", &image, true, "2024-01-01T00:00:00Z");
        fixture.write("containers/bad/config.v2.json", "{\"ID\": ");
        fixture.write("image/aufs/imagedb/content/sha256/0bad", "[]");

        let root = open(&fixture, ScanPolicy::BestEffort);
        let catalog = Catalog::build(&root).unwrap();

        assert_eq!(catalog.list_running_containers().len(), 1);
        assert_eq!(catalog.list_images().len(), 1);
        let paths: Vec<PathBuf> = catalog.warnings().iter().map(|w| w.path.clone()).collect();
        assert!(paths.contains(&PathBuf::from("containers/bad/config.v2.json")));
        assert!(paths.contains(&PathBuf::from("image/aufs/imagedb/content/sha256/0bad")));
    }

    #[test]
    fn test_fail_fast_aborts() {
        let fixture = DockerRoot::new(DriverKind::Aufs);
        fixture.write("containers/bad/config.v2.json", "{\"ID\": ");

        let root = open(&fixture, ScanPolicy::FailFast);
        assert!(matches!(
            Catalog::build(&root),
            Err(ExplorerError::MetadataCorrupt { path, .. })
                if path == Path::new("containers/bad/config.v2.json")
        ));
    }

    #[test]
    fn test_container_id_must_match_directory() {
        let fixture = DockerRoot::new(DriverKind::Aufs);
        let image = fixture.add_image(&["sha256:d1"]);
        fixture.add_container("c1", &image, true, "2024-01-01T00:00:00Z");
        std::fs::rename(
            fixture.path().join("containers/c1"),
            fixture.path().join("containers/c2"),
        )
        .unwrap();

        let root = open(&fixture, ScanPolicy::BestEffort);
        let catalog = Catalog::build(&root).unwrap();
        assert!(catalog.list_containers(&ContainerFilter::default()).is_empty());
        assert!(catalog.warnings()[0].message.contains("does not match"));
    }

    #[test]
    fn test_repositories_and_lookup() {
        let fixture = DockerRoot::new(DriverKind::Overlay2);
        let image = fixture.add_image(&["sha256:d1", "sha256:d2"]);
        fixture.add_repository("busybox", "busybox:latest", &image);

        let root = open(&fixture, ScanPolicy::BestEffort);
        let catalog = Catalog::build(&root).unwrap();

        assert_eq!(catalog.resolve_repository_tag("busybox:latest").unwrap(), image);
        assert!(matches!(
            catalog.resolve_repository_tag("busybox"),
            Err(ExplorerError::ImageNotFound(name)) if name == "busybox"
        ));
        let record = catalog.find_image("busybox:latest").unwrap();
        assert_eq!(record.id, image);
        assert_eq!(record.names, vec!["busybox:latest".to_string()]);
        assert_eq!(
            record.top_layer,
            top_chain_id(["sha256:d1", "sha256:d2"])
        );
        assert_eq!(catalog.get_image(&image).unwrap().diff_ids.len(), 2);
        assert!(catalog.get_image("busybox:latest").is_err());
    }

    #[test]
    fn test_integrity_warnings() {
        let fixture = DockerRoot::new(DriverKind::Overlay2);
        let image = fixture.add_image(&["sha256:d1"]);
        // tamper with the config after it was stored under its digest
        let hex = image.strip_prefix("sha256:").unwrap();
        let path = format!("image/overlay2/imagedb/content/sha256/{hex}");
        let tampered = std::fs::read_to_string(fixture.path().join(&path))
            .unwrap()
            .replace("\"os\":\"linux\"", "\"os\":\"plan9\"");
        fixture.write(&path, &tampered);
        // and record a layer whose diff does not hash to its ChainID
        fixture.add_layerdb("sha256:aaaa", None, "sha256:bbbb", "forged");

        let root = open(&fixture, ScanPolicy::BestEffort);
        let catalog = Catalog::build(&root).unwrap();

        let messages: Vec<&str> = catalog.warnings().iter().map(|w| w.message.as_str()).collect();
        assert_eq!(messages.len(), 2, "{messages:?}");
        assert!(messages.iter().any(|m| m.contains("ChainID")));
        assert!(messages.iter().any(|m| m.contains("config digest")));
        // both records remain usable
        assert!(catalog.get_image(&image).is_ok());
        assert!(catalog.layers().contains(&LayerId::from("sha256:aaaa")));
    }
}
