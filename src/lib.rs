//! Offline exploration of Docker storage directories.
//!
//! Given a copy of a host's Docker data directory, this crate finds its
//! containers and images, resolves their layer stacks, and computes the
//! read-only mounts that reproduce the filesystem each of them presented.
//! It never writes to the evidence and never talks to a Docker daemon.
//!
//! ```no_run
//! use std::path::Path;
//!
//! use docker_explorer::{Catalog, MountPlanner, StorageRoot};
//!
//! # fn main() -> docker_explorer::Result<()> {
//! let root = StorageRoot::open_path("/mnt/evidence/var/lib/docker")?;
//! let catalog = Catalog::build(&root)?;
//! for container in catalog.list_running_containers() {
//!     println!("{} {}", container.id, container.image_id);
//! }
//! let plan = MountPlanner::new(&root, &catalog)?.plan_mount("c1", Path::new("/mnt/c1"))?;
//! for argv in plan.commands().0 {
//!     println!("{}", argv.join(" "));
//! }
//! # Ok(())
//! # }
//! ```

pub mod catalog;
pub mod config;
pub mod driver;
pub mod error;
pub mod history;
pub mod layer;
pub mod metadata;
pub mod mount;
pub mod root;
pub mod whiteout;


pub use catalog::{Catalog, CatalogWarning, ContainerFilter, ContainerRecord, ImageRecord};
pub use config::{ExplorerConfig, ScanPolicy};
pub use driver::{DriverKind, StorageDriver};
pub use error::{ExplorerError, Result};
pub use history::HistoryEntry;
pub use layer::{LayerGraph, LayerId, LayerRecord};
pub use mount::{MountInstruction, MountPlan, MountPlanner, UnmountInstruction};
pub use root::StorageRoot;
