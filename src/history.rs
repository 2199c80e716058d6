//! Build histories of images and containers.
//!
//! An image config lists its build steps in `history`; steps that produced a
//! filesystem layer (those without `empty_layer`) line up with `rootfs.diff_ids`.
//! Older or hand-crafted images may have no usable history, in which case only
//! the top layer is described, with the image's creation time and the command
//! of the container it was committed from.

use std::collections::HashMap;

use serde::Serialize;

use crate::catalog::{Catalog, ImageRecord};
use crate::error::Result;
use crate::layer::{chain_id, LayerGraph, LayerId};

/// One layer of a history, base first.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HistoryEntry {
    pub layer: LayerId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub diff_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    /// Normalised with [`format_timestamp`].
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
}

/// What an image config says about the step that produced one layer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct LayerStep {
    pub command: Option<String>,
    pub created: Option<String>,
    pub comment: Option<String>,
}

/// The build step of each of `image`'s layers, keyed by ChainID.
pub(crate) fn layer_steps(image: &ImageRecord) -> HashMap<LayerId, LayerStep> {
    let mut chain = Vec::with_capacity(image.diff_ids.len());
    let mut parent: Option<LayerId> = None;
    for diff_id in &image.diff_ids {
        let id = chain_id(parent.as_ref(), diff_id);
        chain.push(id.clone());
        parent = Some(id);
    }

    let steps: Vec<_> = image.steps.iter().filter(|step| !step.empty_layer).collect();
    if steps.len() == chain.len() {
        return chain
            .into_iter()
            .zip(steps)
            .map(|(id, step)| {
                let step = LayerStep {
                    command: step.created_by.clone(),
                    created: step.created.clone(),
                    comment: step.comment.clone(),
                };
                (id, step)
            })
            .collect();
    }

    if !image.steps.is_empty() {
        log::debug!(
            "{}: {} layer steps for {} layers, describing the top layer only",
            image.id,
            steps.len(),
            chain.len()
        );
    }
    chain
        .pop()
        .map(|top| {
            let step = LayerStep {
                command: image.command.clone(),
                created: image.created.clone(),
                comment: image.comment.clone(),
            };
            (top, step)
        })
        .into_iter()
        .collect()
}

/// Copy `image`'s build steps onto the layer records they describe. Layers
/// shared between images keep the first description they were given.
pub(crate) fn annotate_layers(image: &ImageRecord, layers: &mut LayerGraph) {
    for (id, step) in layer_steps(image) {
        let Some(record) = layers.get_mut(&id) else {
            continue;
        };
        if record.command.is_some() || record.created.is_some() {
            continue;
        }
        record.command = step.command;
        record.created = step.created;
        record.comment = step.comment;
    }
}

/// The history of an image, found by exact ID or repository reference, base first.
///
/// # Errors
///
/// Propagates lookup misses and [`BrokenLayerChain`](crate::ExplorerError::BrokenLayerChain)
/// or [`CyclicLayerGraph`](crate::ExplorerError::CyclicLayerGraph) from resolving the
/// image's layers.
pub fn image_history(catalog: &Catalog, id_or_reference: &str) -> Result<Vec<HistoryEntry>> {
    let image = catalog.find_image(id_or_reference)?;
    let Some(top) = &image.top_layer else {
        return Ok(Vec::new());
    };
    let steps = layer_steps(image);

    Ok(catalog
        .layers()
        .resolve_records(top)?
        .into_iter()
        .map(|record| {
            let step = steps.get(&record.id).cloned().unwrap_or_else(|| LayerStep {
                command: record.command.clone(),
                created: record.created.clone(),
                comment: record.comment.clone(),
            });
            HistoryEntry {
                layer: record.id.clone(),
                diff_id: record.diff_id.clone(),
                command: step.command,
                created: step.created.as_deref().map(format_timestamp),
                size: record.size,
                comment: step.comment,
            }
        })
        .collect())
}

/// The history of the image a container was created from.
pub fn container_history(catalog: &Catalog, container_id: &str) -> Result<Vec<HistoryEntry>> {
    let container = catalog.get_container(container_id)?;
    image_history(catalog, &container.image_id)
}

/// History of a container or image, tried in that order.
pub fn history(catalog: &Catalog, id: &str) -> Result<Vec<HistoryEntry>> {
    match catalog.get_container(id) {
        Ok(container) => image_history(catalog, &container.image_id),
        Err(_) => image_history(catalog, id),
    }
}

/// Normalise a Docker timestamp: fractional seconds are truncated to
/// microseconds and the zone designator is dropped. A timestamp whose fraction
/// is not all digits is returned as given.
///
/// ```
/// use docker_explorer::history::format_timestamp;
///
/// assert_eq!(
///     format_timestamp("2018-12-27T10:53:17.096746609Z"),
///     "2018-12-27T10:53:17.096746"
/// );
/// ```
pub fn format_timestamp(timestamp: &str) -> String {
    let timestamp = timestamp.trim();
    let (date, time) = match timestamp.split_once('T') {
        Some(parts) => parts,
        None => return timestamp.to_string(),
    };

    let time = time.strip_suffix(['Z', 'z']).unwrap_or(time);
    let time = match time.rfind(['+', '-']) {
        Some(offset) => &time[..offset],
        None => time,
    };
    let time = match time.split_once('.') {
        Some((seconds, "")) => seconds.to_string(),
        Some((seconds, fraction)) if fraction.bytes().all(|b| b.is_ascii_digit()) => {
            format!("{seconds}.{}", &fraction[..fraction.len().min(6)])
        }
        Some(_) => return timestamp.to_string(),
        None => time.to_string(),
    };
    format!("{date}T{time}")
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;

    use super::*;
    use crate::config::ExplorerConfig;
    use crate::driver::DriverKind;
    use crate::root::StorageRoot;
    use crate::test::DockerRoot;

    #[test]
    fn test_format_timestamp() {
        assert_eq!(
            format_timestamp("2018-12-27T10:53:17.096746609Z"),
            "2018-12-27T10:53:17.096746"
        );
        assert_eq!(format_timestamp("2024-01-01T00:00:00Z"), "2024-01-01T00:00:00");
        assert_eq!(
            format_timestamp("2024-01-01T08:00:00.5+02:00"),
            "2024-01-01T08:00:00.5"
        );
        assert_eq!(format_timestamp("not a date"), "not a date");
        assert_eq!(
            format_timestamp("2024-01-01T00:00:00.a\u{20ac}\u{20ac}Z"),
            "2024-01-01T00:00:00.a\u{20ac}\u{20ac}Z"
        );
    }

    fn catalog(fixture: &DockerRoot) -> Catalog {
        let root = StorageRoot::open(ExplorerConfig::new(fixture.path())).unwrap();
        Catalog::build(&root).unwrap()
    }

    #[test]
    fn test_history_from_build_steps() {
        let fixture = DockerRoot::new(DriverKind::Overlay2);
        let image = fixture.add_image(&["sha256:d1", "sha256:d2"]);
        let catalog = catalog(&fixture);

        let history = image_history(&catalog, &image).unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].layer, LayerId::from("sha256:d1"));
        assert_eq!(history[0].diff_id.as_deref(), Some("sha256:d1"));
        assert_eq!(history[0].command.as_deref(), Some("step 1"));
        assert_eq!(history[1].command.as_deref(), Some("step 2"));
        assert_eq!(history[1].size, Some(1024));
        assert_eq!(
            history[1].created.as_deref(),
            Some("2024-01-01T00:00:00.123456")
        );
        // deterministic
        assert_eq!(history, image_history(&catalog, &image).unwrap());
    }

    #[test]
    fn test_history_falls_back_to_image_command() {
        let fixture = DockerRoot::new(DriverKind::Overlay2);
        let image = fixture.add_image_with_steps(&["sha256:d1", "sha256:d2"], 0);
        let catalog = catalog(&fixture);

        let history = image_history(&catalog, &image).unwrap();
        assert_eq!(history[0].command, None);
        assert_eq!(history[1].command.as_deref(), Some("/bin/sh -c #(nop) CMD [\"sh\"]"));
    }

    #[test]
    fn test_container_history_uses_image() {
        let fixture = DockerRoot::new(DriverKind::Aufs);
        let image = fixture.add_image(&["sha256:d1"]);
        fixture.add_container("c1", &image, false, "2024-01-01T00:00:00Z");
        let catalog = catalog(&fixture);

        assert_eq!(
            container_history(&catalog, "c1").unwrap(),
            image_history(&catalog, &image).unwrap()
        );
        assert_eq!(history(&catalog, "c1").unwrap().len(), 1);
        assert!(container_history(&catalog, "c9").is_err());
    }
}
