//! Layer identities, records and the parent-pointer layer graph.
//!
//! Docker addresses every filesystem delta by a content-derived identifier.
//! Image layers are named by their *ChainID*, a digest over the layer's own
//! diff ID and every diff ID below it, so the same diff on top of different
//! parents yields different layers. Container layers (the init layer and the
//! writable layer) are named by the random IDs Docker gave their driver
//! directories.
//!
//! All layers of a storage root live in one [`LayerGraph`], an arena keyed by
//! [`LayerId`]. Relationships are parent IDs resolved by lookup, never live
//! references.

use std::collections::{BTreeMap, HashSet};
use std::fmt;

use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::error::{ExplorerError, Result};

/// Opaque identifier of one filesystem delta.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(transparent)]
pub struct LayerId(String);

impl LayerId {
    /// Wrap an identifier string as-is.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The identifier string.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The identifier without any `sha256:` algorithm prefix, as used for
    /// directory names.
    pub fn hex(&self) -> &str {
        self.0.strip_prefix("sha256:").unwrap_or(&self.0)
    }
}

impl fmt::Display for LayerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for LayerId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

/// Compute the ChainID of a layer from its parent's ChainID and its own diff ID.
///
/// A base layer's ChainID is its diff ID; every other layer's is
/// `sha256(parent + " " + diff_id)`.
pub fn chain_id(parent: Option<&LayerId>, diff_id: &str) -> LayerId {
    match parent {
        None => LayerId::new(diff_id),
        Some(parent) => {
            let digest = Sha256::digest(format!("{parent} {diff_id}").as_bytes());
            LayerId::new(format!("sha256:{}", hex::encode(digest)))
        }
    }
}

/// Compute the ChainID of the topmost layer of a diff ID stack (base first).
pub fn top_chain_id<'a>(diff_ids: impl IntoIterator<Item = &'a str>) -> Option<LayerId> {
    diff_ids
        .into_iter()
        .fold(None, |parent, diff_id| Some(chain_id(parent.as_ref(), diff_id)))
}

/// Where a layer came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum LayerKind {
    /// A read-only image layer from `layerdb/sha256/`.
    Image,
    /// A container's init layer (`/etc/hosts`, `/etc/resolv.conf` stubs).
    Init,
    /// A container's writable layer.
    Container,
}

/// Metadata for one layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LayerRecord {
    /// The layer's identifier.
    pub id: LayerId,
    /// Parent layer, absent for base layers.
    pub parent: Option<LayerId>,
    /// Name of the driver directory holding this layer's data.
    pub cache_id: String,
    /// What kind of layer this is.
    pub kind: LayerKind,
    /// Digest of the uncompressed layer tarball, for image layers.
    pub diff_id: Option<String>,
    /// Command that created the layer.
    pub command: Option<String>,
    /// Creation timestamp as recorded by Docker.
    pub created: Option<String>,
    /// Size in bytes of the layer's delta.
    pub size: Option<u64>,
    /// Free-text comment attached to the build step.
    pub comment: Option<String>,
}

impl LayerRecord {
    /// A record with only the structural fields set.
    pub fn new(id: LayerId, parent: Option<LayerId>, cache_id: impl Into<String>) -> Self {
        Self {
            id,
            parent,
            cache_id: cache_id.into(),
            kind: LayerKind::Image,
            diff_id: None,
            command: None,
            created: None,
            size: None,
            comment: None,
        }
    }
}

/// Arena of every known layer, keyed by ID.
#[derive(Debug, Clone, Default)]
pub struct LayerGraph {
    layers: BTreeMap<LayerId, LayerRecord>,
}

impl LayerGraph {
    /// An empty graph.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a record, returning the one it replaced if the ID was already present.
    pub fn insert(&mut self, record: LayerRecord) -> Option<LayerRecord> {
        self.layers.insert(record.id.clone(), record)
    }

    /// Look up a record by exact ID.
    pub fn get(&self, id: &LayerId) -> Option<&LayerRecord> {
        self.layers.get(id)
    }

    /// Mutable access for annotating records while a catalog is being built.
    pub(crate) fn get_mut(&mut self, id: &LayerId) -> Option<&mut LayerRecord> {
        self.layers.get_mut(id)
    }

    /// Whether a record exists for `id`.
    pub fn contains(&self, id: &LayerId) -> bool {
        self.layers.contains_key(id)
    }

    /// Number of layers.
    pub fn len(&self) -> usize {
        self.layers.len()
    }

    /// Whether the graph has no layers.
    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    /// All records, ordered by ID.
    pub fn iter(&self) -> impl Iterator<Item = &LayerRecord> {
        self.layers.values()
    }

    /// Resolve the ordered stack of layers ending at `top`, base first.
    ///
    /// Follows parent pointers until a layer without a parent is reached. The
    /// result always ends with `top` and has one entry per layer in the chain.
    ///
    /// # Errors
    ///
    /// - [`ExplorerError::LayerNotFound`] if `top` itself has no record.
    /// - [`ExplorerError::BrokenLayerChain`] naming the first missing parent.
    /// - [`ExplorerError::CyclicLayerGraph`] if a layer is reached twice.
    pub fn resolve(&self, top: &LayerId) -> Result<Vec<LayerId>> {
        let mut current = self
            .get(top)
            .ok_or_else(|| ExplorerError::LayerNotFound(top.clone()))?;
        let mut visited = HashSet::from([&current.id]);
        let mut chain = vec![current.id.clone()];

        while let Some(parent) = &current.parent {
            if !visited.insert(parent) {
                return Err(ExplorerError::CyclicLayerGraph {
                    layer: top.clone(),
                    repeated: parent.clone(),
                });
            }
            current = self
                .get(parent)
                .ok_or_else(|| ExplorerError::BrokenLayerChain {
                    layer: current.id.clone(),
                    missing: parent.clone(),
                })?;
            chain.push(current.id.clone());
        }

        chain.reverse();
        Ok(chain)
    }

    /// Like [`resolve`](Self::resolve), but returns the records themselves.
    pub fn resolve_records(&self, top: &LayerId) -> Result<Vec<&LayerRecord>> {
        Ok(self
            .resolve(top)?
            .iter()
            .filter_map(|id| self.get(id))
            .collect())
    }
}

impl FromIterator<LayerRecord> for LayerGraph {
    fn from_iter<I: IntoIterator<Item = LayerRecord>>(iter: I) -> Self {
        let mut graph = Self::new();
        for record in iter {
            graph.insert(record);
        }
        graph
    }
}
