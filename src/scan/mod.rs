//! Whole-archive health scan.
//!
//! # How it works
//!
//! [`scan`] parses every image and decodes every canvas once, without
//! retaining decoded rasters, and records what happened.  Nothing found in the
//! data makes it fail: undecodable images and canvases become entries in the
//! report.  Only errors outside the data (I/O on the backing file, a missing
//! node) propagate.
//!
//! ## Canvas health
//!
//! | Verdict | Meaning |
//! |---------|---------|
//! | `Decoded` | Pixels decoded |
//! | `UnknownFormat` | Format id not understood; payload skipped |
//! | `Failed` | Payload present but could not be decoded |
//!
//! ## Progress
//!
//! `scan()` accepts an optional callback invoked after each image with
//! `(images_done, images_total)`.

use serde::Serialize;
use std::path::Path;

use crate::archive::{Archive, ArchiveError, ArchiveOptions};
use crate::tree::{NodeId, NodeKind, TreeError};

// ── Types ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum CanvasHealth {
    Decoded,
    UnknownFormat,
    Failed { reason: String },
}

impl CanvasHealth {
    pub fn is_usable(&self) -> bool {
        matches!(self, CanvasHealth::Decoded)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CanvasRecord {
    pub path:      String,
    pub width:     u32,
    pub height:    u32,
    pub format:    i32,
    pub list_mode: bool,
    pub health:    CanvasHealth,
}

#[derive(Debug, Clone, Serialize)]
pub struct ImageFailure {
    pub path:   String,
    pub reason: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ScanQuality {
    /// Every image parsed and every canvas decoded.
    Clean,
    /// Some canvases or images are unreadable.
    Degraded,
    /// Fewer than half of the images parse.
    Broken,
}

#[derive(Debug, Clone, Serialize)]
pub struct ScanReport {
    pub images:            usize,
    pub images_failed:     usize,
    pub canvases:          usize,
    pub canvases_decoded:  usize,
    pub canvases_unknown:  usize,
    pub canvases_failed:   usize,
    pub list_mode_canvases: usize,
    /// Bytes of decoded pixel data seen.
    pub decoded_bytes:     u64,
    pub image_failures:    Vec<ImageFailure>,
    pub canvas_log:        Vec<CanvasRecord>,
    pub quality:           ScanQuality,
}

impl ScanReport {
    pub fn health_pct(&self) -> f64 {
        if self.canvases == 0 {
            return 100.0;
        }
        self.canvases_decoded as f64 / self.canvases as f64 * 100.0
    }

    pub fn summary(&self) -> String {
        format!(
            "{:?}: {}/{} images parsed, {}/{} canvases decoded ({:.1}%), \
             {} unknown format, {} list-mode, {:.2} MiB of pixels",
            self.quality,
            self.images - self.images_failed,
            self.images,
            self.canvases_decoded,
            self.canvases,
            self.health_pct(),
            self.canvases_unknown,
            self.list_mode_canvases,
            self.decoded_bytes as f64 / 1024.0 / 1024.0,
        )
    }
}

// ── Scanner ──────────────────────────────────────────────────────────────────

fn scan_canvas(archive: &Archive, id: NodeId) -> Result<CanvasRecord, TreeError> {
    let tree = archive.tree();
    let canvas = tree.canvas(id).ok_or(TreeError::NotCanvas(id))?;
    let health = match tree.decode_canvas(id) {
        Ok(Some(_)) => CanvasHealth::Decoded,
        Ok(None) => CanvasHealth::UnknownFormat,
        Err(TreeError::Io(e)) => return Err(TreeError::Io(e)),
        Err(e) => CanvasHealth::Failed { reason: e.to_string() },
    };
    Ok(CanvasRecord {
        path:      tree.full_path(id),
        width:     canvas.width,
        height:    canvas.height,
        format:    canvas.format,
        list_mode: canvas.is_secondary(),
        health,
    })
}

/// Parse every image of `archive` and try to decode every canvas.
pub fn scan<F>(archive: &mut Archive, mut progress: Option<&mut F>) -> Result<ScanReport, ArchiveError>
where
    F: FnMut(usize, usize),
{
    let images = archive.images();
    let total = images.len();

    let mut image_failures = Vec::new();
    let mut canvas_log = Vec::new();
    let mut decoded_bytes = 0u64;

    for (done, &img) in images.iter().enumerate() {
        if let Err(e) = archive.tree_mut().parse_image(img) {
            tracing::warn!(image = %archive.tree().full_path(img), error = %e, "image unreadable");
            image_failures.push(ImageFailure {
                path:   archive.tree().full_path(img),
                reason: e.to_string(),
            });
        } else {
            let canvases: Vec<NodeId> = archive
                .tree()
                .walk(img)
                .into_iter()
                .filter(|&n| archive.tree().kind(n) == Some(NodeKind::Canvas))
                .collect();
            for c in canvases {
                let record = scan_canvas(archive, c)?;
                if record.health.is_usable() {
                    let format = archive.tree().canvas(c).and_then(|cv| cv.pixel_format());
                    if let Some(n) = format.and_then(|f| f.packed_size(record.width, record.height)) {
                        decoded_bytes += n as u64;
                    }
                }
                if let Some(cv) = archive.tree_mut().canvas_mut(c) {
                    cv.evict();
                }
                canvas_log.push(record);
            }
        }

        if let Some(cb) = progress.as_mut() {
            cb(done + 1, total);
        }
    }

    let count = |pred: fn(&CanvasRecord) -> bool| canvas_log.iter().filter(|r| pred(r)).count();
    let canvases_decoded = count(|r| r.health == CanvasHealth::Decoded);
    let canvases_unknown = count(|r| r.health == CanvasHealth::UnknownFormat);
    let canvases_failed = count(|r| matches!(r.health, CanvasHealth::Failed { .. }));
    let list_mode_canvases = count(|r| r.list_mode);

    let quality = if image_failures.len() * 2 > total {
        ScanQuality::Broken
    } else if image_failures.is_empty() && canvases_decoded == canvas_log.len() {
        ScanQuality::Clean
    } else {
        ScanQuality::Degraded
    };

    Ok(ScanReport {
        images: total,
        images_failed: image_failures.len(),
        canvases: canvas_log.len(),
        canvases_decoded,
        canvases_unknown,
        canvases_failed,
        list_mode_canvases,
        decoded_bytes,
        image_failures,
        canvas_log,
        quality,
    })
}

/// Convenience: open `path` and scan it.
pub fn scan_file(path: &Path, opts: ArchiveOptions) -> Result<ScanReport, ArchiveError> {
    let mut archive = Archive::open(path, opts)?;
    scan::<fn(usize, usize)>(&mut archive, None)
}
