//! Deletion markers inside layer directories.
//!
//! A whiteout in layer *k* hides a path from every layer below *k*, and from
//! nothing above it. Whiteouts are therefore scoped to the stack they are
//! scanned in: the same layer directory can hide a file in one plan and be
//! irrelevant in another that stops below it.
//!
//! AuFS marks deletions with specially named files. OverlayFS uses 0/0
//! character devices for deleted entries and an `opaque` xattr on
//! directories whose lower contents are hidden.

use std::ffi::OsStr;
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};

use rustix::fs::{lgetxattr, lstat, FileType};
use rustix::io::Errno;
use serde::Serialize;

use crate::error::Result;
use crate::layer::{LayerId, LayerRecord};

/// Prefix of AuFS whiteout files.
pub const AUFS_WHITEOUT_PREFIX: &str = ".wh.";

/// AuFS marker that makes its directory opaque.
pub const AUFS_OPAQUE_MARKER: &str = ".wh..wh..opq";

/// Prefix of AuFS-internal names (hardlink and orphan bookkeeping).
const AUFS_META_PREFIX: &str = ".wh..wh.";

/// xattrs that mark an overlayfs directory opaque.
const OVERLAY_OPAQUE_XATTRS: [&str; 2] = ["trusted.overlay.opaque", "user.overlay.opaque"];

/// How a driver marks deletions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum WhiteoutConvention {
    /// `.wh.<name>` files.
    Aufs,
    /// 0/0 character devices and opaque xattrs.
    Overlay,
}

/// What a whiteout hides.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum WhiteoutKind {
    /// One entry (and, for a directory, everything below it).
    Entry,
    /// The lower contents of a directory; the directory itself stays.
    Opaque,
}

/// A deletion marker found in one layer of a stack.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Whiteout {
    /// The layer carrying the marker.
    pub layer: LayerId,
    /// The hidden path, relative to the layer root.
    pub path: PathBuf,
    pub kind: WhiteoutKind,
    /// The lowest higher layer that re-creates the path, if any. The
    /// re-created entry is visible again, but a re-created directory does not
    /// bring back what the layers below the marker held inside it.
    pub superseded_by: Option<LayerId>,
}

impl Whiteout {
    /// Whether a layer below this marker has its copy of `path` hidden.
    /// Re-creation above the marker does not change this.
    pub fn hides_lower(&self, path: &Path) -> bool {
        match self.kind {
            WhiteoutKind::Entry => path.starts_with(&self.path),
            WhiteoutKind::Opaque => path != self.path && path.starts_with(&self.path),
        }
    }

    /// Whether `path` (relative to the root), as held by the layers below this
    /// marker, is missing from the composed view. Once a higher layer re-creates
    /// the entry, the entry itself shows again but its lower contents do not.
    pub fn covers(&self, path: &Path) -> bool {
        match (self.kind, &self.superseded_by) {
            (WhiteoutKind::Entry, None) => path.starts_with(&self.path),
            // lookup through the re-created directory stops at this layer
            (WhiteoutKind::Entry, Some(_)) | (WhiteoutKind::Opaque, _) => {
                path != self.path && path.starts_with(&self.path)
            }
        }
    }
}

/// What an AuFS directory entry name means.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum AufsName<'a> {
    /// An ordinary file.
    Plain,
    /// `.wh.<name>`: hides `<name>`.
    Whiteout(&'a OsStr),
    /// `.wh..wh..opq`.
    Opaque,
    /// `.wh..wh.*` bookkeeping; neither content nor a marker.
    Meta,
}

pub(crate) fn classify_aufs(name: &OsStr) -> AufsName<'_> {
    let bytes = name.as_bytes();
    if bytes == AUFS_OPAQUE_MARKER.as_bytes() {
        AufsName::Opaque
    } else if bytes.starts_with(AUFS_META_PREFIX.as_bytes()) {
        AufsName::Meta
    } else if let Some(target) = bytes.strip_prefix(AUFS_WHITEOUT_PREFIX.as_bytes()) {
        AufsName::Whiteout(OsStr::from_bytes(target))
    } else {
        AufsName::Plain
    }
}

/// Whether the file at `path` is an overlayfs whiteout (a 0/0 character device).
fn is_overlay_whiteout(path: &Path) -> bool {
    match lstat(path) {
        Ok(stat) => {
            FileType::from_raw_mode(stat.st_mode) == FileType::CharacterDevice
                && stat.st_rdev == 0
        }
        Err(_) => false,
    }
}

/// Whether the directory at `path` carries an overlayfs opaque xattr.
fn is_overlay_opaque(path: &Path) -> Result<bool> {
    for name in OVERLAY_OPAQUE_XATTRS {
        let mut value = [0u8; 8];
        match lgetxattr(path, name, &mut value[..]) {
            Ok(len) if &value[..len] == b"y" => return Ok(true),
            Ok(_) | Err(Errno::NODATA | Errno::NOTSUP | Errno::RANGE) => {}
            Err(e) => return Err(std::io::Error::from(e).into()),
        }
    }
    Ok(false)
}

/// The whiteouts of a stack, plus anything about them an analyst should see.
#[derive(Debug, Default)]
pub struct StackScan {
    /// Markers ordered by layer (base first), then path.
    pub whiteouts: Vec<Whiteout>,
    pub discrepancies: Vec<String>,
}

/// Find the whiteouts of every layer in `stack` (base first) and mark those a
/// higher layer re-creates.
pub fn scan_stack(convention: WhiteoutConvention, stack: &[(&LayerRecord, &Path)]) -> Result<StackScan> {
    let mut scan = StackScan::default();

    for &(layer, dir) in stack {
        let mut walker = LayerWalker {
            convention,
            layer,
            root: dir,
            scan: &mut scan,
        };
        walker.walk(Path::new(""))?;
    }

    for whiteout in &mut scan.whiteouts {
        if whiteout.kind != WhiteoutKind::Entry {
            continue;
        }
        let Some(position) = stack.iter().position(|(l, _)| l.id == whiteout.layer) else {
            continue;
        };
        whiteout.superseded_by = stack[position + 1..]
            .iter()
            .find(|(_, dir)| recreates(convention, dir, &whiteout.path))
            .map(|(layer, _)| layer.id.clone());
        if let Some(by) = &whiteout.superseded_by {
            log::debug!(
                "whiteout of {} in {} is superseded by {by}",
                whiteout.path.display(),
                whiteout.layer
            );
        }
    }

    Ok(scan)
}

/// Whether `dir` holds a real entry (not a marker) at `path`.
fn recreates(convention: WhiteoutConvention, dir: &Path, path: &Path) -> bool {
    let full = dir.join(path);
    match convention {
        WhiteoutConvention::Aufs => lstat(&full).is_ok(),
        WhiteoutConvention::Overlay => lstat(&full).is_ok() && !is_overlay_whiteout(&full),
    }
}

struct LayerWalker<'a> {
    convention: WhiteoutConvention,
    layer: &'a LayerRecord,
    root: &'a Path,
    scan: &'a mut StackScan,
}

impl LayerWalker<'_> {
    fn record(&mut self, path: PathBuf, kind: WhiteoutKind) {
        log::trace!("{kind:?} whiteout {} in {}", path.display(), self.layer.id);
        self.scan.whiteouts.push(Whiteout {
            layer: self.layer.id.clone(),
            path,
            kind,
            superseded_by: None,
        });
    }

    fn walk(&mut self, rel: &Path) -> Result<()> {
        let dir = self.root.join(rel);
        if self.convention == WhiteoutConvention::Overlay
            && !rel.as_os_str().is_empty()
            && is_overlay_opaque(&dir)?
        {
            self.record(rel.to_path_buf(), WhiteoutKind::Opaque);
        }

        let mut entries = std::fs::read_dir(&dir)?.collect::<std::io::Result<Vec<_>>>()?;
        entries.sort_by_key(|entry| entry.file_name());

        for entry in entries {
            let name = entry.file_name();
            let path = rel.join(&name);
            let file_type = entry.file_type()?;

            match self.convention {
                WhiteoutConvention::Aufs => match classify_aufs(&name) {
                    AufsName::Opaque => {
                        self.record(rel.to_path_buf(), WhiteoutKind::Opaque);
                        continue;
                    }
                    AufsName::Whiteout(target) => {
                        self.record(rel.join(target), WhiteoutKind::Entry);
                        continue;
                    }
                    AufsName::Meta => continue,
                    AufsName::Plain => {}
                },
                WhiteoutConvention::Overlay => {
                    if name.as_bytes().starts_with(AUFS_WHITEOUT_PREFIX.as_bytes()) {
                        let message = format!(
                            "{} in overlay layer {} has an AuFS whiteout name, which overlayfs does not honour",
                            path.display(),
                            self.layer.id
                        );
                        log::warn!("{message}");
                        self.scan.discrepancies.push(message);
                    }
                    if is_overlay_whiteout(&entry.path()) {
                        self.record(path, WhiteoutKind::Entry);
                        continue;
                    }
                }
            }

            if file_type.is_dir() {
                self.walk(&path)?;
            }
        }
        Ok(())
    }
}
