//! The single active slide and the single active annotation file.
//!
//! Each slot is replaced wholesale by a successful load and never cleared.
//! Concurrent loads race and the last one to finish wins; a reader sees
//! either the old or the new value, never a mix.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::Serialize;
use tracing::{debug, info};

use crate::annotations::{AnnotationSource, NpzStore, SEGMENTATION_GROUP};
use crate::core::pyramid::PyramidDescriptor;
use crate::core::ResampleFilter;
use crate::error::{Result, ServiceError};
use crate::slide::{open_slide, SlideBackend, SlideError};

/// An opened slide together with the path it came from.
pub struct ActiveImage {
    pub path: PathBuf,
    /// Distinct for every successful load, even of the same path.
    pub generation: u64,
    pub slide: Arc<dyn SlideBackend>,
}

/// Reply to a successful annotation load.
///
/// This is an acknowledgment that the file opened, not a description of its
/// contents: the counts are fixed values the viewer expects.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LoadSummary {
    pub status: &'static str,
    pub centroids_count: u32,
    pub has_contours: bool,
    pub segmentation_found: bool,
}

impl LoadSummary {
    pub fn acknowledged() -> Self {
        Self {
            status: "success",
            centroids_count: 100,
            has_contours: true,
            segmentation_found: true,
        }
    }
}

#[derive(Default)]
pub struct SessionState {
    image: RwLock<Option<Arc<ActiveImage>>>,
    generation: AtomicU64,
    annotations: RwLock<Option<PathBuf>>,
}

impl SessionState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn load_image(&self, path: &Path, filter: ResampleFilter) -> Result<PyramidDescriptor> {
        self.load_image_with(path, |p| open_slide(p, filter))
    }

    /// Like [`load_image`](Self::load_image) with a caller-supplied backend.
    pub fn load_image_with<F>(&self, path: &Path, open: F) -> Result<PyramidDescriptor>
    where
        F: FnOnce(&Path) -> std::result::Result<Arc<dyn SlideBackend>, SlideError>,
    {
        if !path.exists() {
            return Err(ServiceError::FileNotFound(path.to_path_buf()));
        }
        let slide = open(path).map_err(ServiceError::ImageOpen)?;
        let descriptor = slide.descriptor().clone();
        info!(
            "slide loaded path={} backend={} dimensions={}x{} levels={}",
            path.display(),
            slide.name(),
            descriptor.dimensions.0,
            descriptor.dimensions.1,
            descriptor.level_count
        );
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        *self.image.write() = Some(Arc::new(ActiveImage {
            path: path.to_path_buf(),
            generation,
            slide,
        }));
        Ok(descriptor)
    }

    pub fn active_image(&self) -> Option<Arc<ActiveImage>> {
        self.image.read().clone()
    }

    pub fn load_annotations(&self, path: &Path) -> Result<LoadSummary> {
        if !path.exists() {
            return Err(ServiceError::FileNotFound(path.to_path_buf()));
        }
        let store = NpzStore::open(path).map_err(ServiceError::AnnotationOpen)?;
        let names: Vec<&str> = store.names().collect();
        debug!("annotation file structure: {:?}", names);
        info!(
            "segmentation loaded path={} arrays={} segmentation_group={}",
            path.display(),
            names.len(),
            store.is_group(SEGMENTATION_GROUP)
        );
        *self.annotations.write() = Some(path.to_path_buf());
        Ok(LoadSummary::acknowledged())
    }

    pub fn active_annotations(&self) -> Option<PathBuf> {
        self.annotations.read().clone()
    }
}
