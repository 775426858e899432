//! Tile grid → annotation-space bounding boxes.
//!
//! Annotation coordinates use their own fixed magnification scheme: a tile at
//! level `L` spans `tile_size * 2^L` pixels per side regardless of what the
//! slide backend reports for that level, and pixel bounds are divided by a
//! constant divisor to land in annotation space.

use thiserror::Error;

/// Ratio between pixel space and annotation coordinate space.
pub const DEFAULT_MAGNIFICATION_DIVISOR: u32 = 16;

#[derive(Debug, Clone, Error, PartialEq)]
pub enum ViewportError {
    #[error("tile_size must be positive")]
    ZeroTileSize,
    #[error("magnification divisor must be positive")]
    ZeroDivisor,
    #[error("viewport for level={level} x={x} y={y} tile_size={tile_size} overflows")]
    Overflow {
        level: u32,
        x: u32,
        y: u32,
        tile_size: u32,
    },
}

/// Tile bounds in pixel space, before the divisor is applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PixelBox {
    pub x_min: u64,
    pub y_min: u64,
    pub x_max: u64,
    pub y_max: u64,
}

/// Tile bounds in annotation space; the upper bound is exclusive.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ViewportBox {
    pub x_min: f64,
    pub y_min: f64,
    pub x_max: f64,
    pub y_max: f64,
}

/// Both views of one requested tile plus the divisor that relates them.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Viewport {
    pub pixels: PixelBox,
    pub bounds: ViewportBox,
    pub divisor: u32,
}

impl PixelBox {
    pub fn resolve(level: u32, x: u32, y: u32, tile_size: u32) -> Result<Self, ViewportError> {
        if tile_size == 0 {
            return Err(ViewportError::ZeroTileSize);
        }
        let overflow = ViewportError::Overflow {
            level,
            x,
            y,
            tile_size,
        };
        let span = 1u64
            .checked_shl(level)
            .and_then(|scale| scale.checked_mul(tile_size as u64))
            .ok_or_else(|| overflow.clone())?;
        let edge = |cell: u32| -> Option<(u64, u64)> {
            let min = (cell as u64).checked_mul(span)?;
            let max = (cell as u64 + 1).checked_mul(span)?;
            Some((min, max))
        };
        let (x_min, x_max) = edge(x).ok_or_else(|| overflow.clone())?;
        let (y_min, y_max) = edge(y).ok_or(overflow)?;
        Ok(Self {
            x_min,
            y_min,
            x_max,
            y_max,
        })
    }

    /// Integer centre of the box in annotation space: `(min + max) // 2 // divisor`.
    pub fn annotation_center(&self, divisor: u32) -> (i64, i64) {
        let mid = |min: u64, max: u64| ((min as u128 + max as u128) / 2 / divisor as u128) as i64;
        (mid(self.x_min, self.x_max), mid(self.y_min, self.y_max))
    }
}

impl ViewportBox {
    pub fn from_pixels(pixels: &PixelBox, divisor: u32) -> Self {
        let d = divisor as f64;
        Self {
            x_min: pixels.x_min as f64 / d,
            y_min: pixels.y_min as f64 / d,
            x_max: pixels.x_max as f64 / d,
            y_max: pixels.y_max as f64 / d,
        }
    }

    /// Half-open containment: `min <= v < max` on both axes.
    pub fn contains(&self, x: f64, y: f64) -> bool {
        x >= self.x_min && x < self.x_max && y >= self.y_min && y < self.y_max
    }

    /// Whether the closed rectangle `[min, max]` touches this box.
    pub fn intersects(&self, min: (f64, f64), max: (f64, f64)) -> bool {
        min.0 < self.x_max && max.0 >= self.x_min && min.1 < self.y_max && max.1 >= self.y_min
    }
}

/// Resolve the annotation-space viewport for one tile.
pub fn resolve_viewport(
    level: u32,
    x: u32,
    y: u32,
    tile_size: u32,
    divisor: u32,
) -> Result<Viewport, ViewportError> {
    if divisor == 0 {
        return Err(ViewportError::ZeroDivisor);
    }
    let pixels = PixelBox::resolve(level, x, y, tile_size)?;
    Ok(Viewport {
        bounds: ViewportBox::from_pixels(&pixels, divisor),
        pixels,
        divisor,
    })
}
