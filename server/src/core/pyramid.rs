use serde::Serialize;
use thiserror::Error;

/// Default edge length of a requested tile, in pixels.
pub const DEFAULT_TILE_SIZE: u32 = 256;

/// Level layout reported by a slide backend for one open image.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PyramidDescriptor {
    /// Width and height at level 0.
    pub dimensions: (u64, u64),
    pub level_count: u32,
    pub level_dimensions: Vec<(u64, u64)>,
    pub level_downsamples: Vec<f64>,
}

#[derive(Debug, Error, PartialEq)]
pub enum PyramidError {
    #[error("level {level} out of range (level_count={level_count})")]
    InvalidLevel { level: u32, level_count: u32 },
    #[error("inconsistent pyramid: {0}")]
    Inconsistent(String),
}

/// One tile addressed by pyramid level and grid position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TileRequest {
    pub level: u32,
    pub grid_x: u32,
    pub grid_y: u32,
    pub tile_size: u32,
}

/// Absolute region to read: origin in level-0 pixels, size at `level`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PixelRegion {
    pub origin_x: u64,
    pub origin_y: u64,
    pub level: u32,
    pub size: (u32, u32),
}

impl PyramidDescriptor {
    /// Build a descriptor, checking the per-level tables agree with each other.
    pub fn new(
        level_dimensions: Vec<(u64, u64)>,
        level_downsamples: Vec<f64>,
    ) -> Result<Self, PyramidError> {
        if level_dimensions.is_empty() {
            return Err(PyramidError::Inconsistent("no levels".into()));
        }
        if level_dimensions.len() != level_downsamples.len() {
            return Err(PyramidError::Inconsistent(format!(
                "{} level dimensions vs {} downsamples",
                level_dimensions.len(),
                level_downsamples.len()
            )));
        }
        if level_downsamples[0] != 1.0 {
            return Err(PyramidError::Inconsistent(format!(
                "level 0 downsample must be 1.0, got {}",
                level_downsamples[0]
            )));
        }
        if level_downsamples
            .windows(2)
            .any(|pair| pair[1] < pair[0])
            || level_downsamples.iter().any(|d| !(*d > 0.0))
        {
            return Err(PyramidError::Inconsistent(format!(
                "downsamples must be positive and non-decreasing: {:?}",
                level_downsamples
            )));
        }
        Ok(Self {
            dimensions: level_dimensions[0],
            level_count: level_dimensions.len() as u32,
            level_dimensions,
            level_downsamples,
        })
    }

    pub fn downsample(&self, level: u32) -> Result<f64, PyramidError> {
        self.level_downsamples
            .get(level as usize)
            .copied()
            .ok_or(PyramidError::InvalidLevel {
                level,
                level_count: self.level_count,
            })
    }

    /// Map a tile request onto the level-0 region it covers, using this
    /// pyramid's own downsample for the requested level.
    pub fn resolve_region(&self, request: &TileRequest) -> Result<PixelRegion, PyramidError> {
        let downsample = self.downsample(request.level)?;
        Ok(region_from_downsample(request, downsample))
    }
}

/// Level-0 origin of a grid cell: `grid * tile_size * downsample`, truncated.
pub fn region_from_downsample(request: &TileRequest, downsample: f64) -> PixelRegion {
    let scale = request.tile_size as f64 * downsample;
    PixelRegion {
        origin_x: (request.grid_x as f64 * scale) as u64,
        origin_y: (request.grid_y as f64 * scale) as u64,
        level: request.level,
        size: (request.tile_size, request.tile_size),
    }
}
