//! Pyramidal image backends.
//!
//! A backend opens one image file, reports its level layout and returns
//! RGBA pixel blocks for `(origin, level, size)` requests. Blocks always
//! have exactly the requested size; anything outside the image is
//! transparent.

use std::path::Path;
use std::sync::Arc;

use image::{imageops, RgbaImage};
use thiserror::Error;
use tracing::debug;

use crate::core::pyramid::{PixelRegion, PyramidDescriptor, PyramidError};
use crate::core::ResampleFilter;

/// Raster pyramids stop halving once the longer edge fits in this many pixels.
const RASTER_MIN_LEVEL_EDGE: u64 = 256;
const RASTER_MAX_LEVELS: u32 = 32;

#[derive(Debug, Error)]
pub enum SlideError {
    #[error("image decode failed: {0}")]
    Image(#[from] image::ImageError),
    #[error(transparent)]
    Pyramid(#[from] PyramidError),
    #[error("openslide: {0}")]
    OpenSlide(String),
    #[error("region origin ({x}, {y}) outside backend address range")]
    OutOfRange { x: u64, y: u64 },
}

pub trait SlideBackend: Send + Sync {
    fn descriptor(&self) -> &PyramidDescriptor;
    fn read_region(&self, region: &PixelRegion) -> Result<RgbaImage, SlideError>;
    fn name(&self) -> &str;
}

/// Open `path` with the best available backend.
pub fn open_slide(path: &Path, filter: ResampleFilter) -> Result<Arc<dyn SlideBackend>, SlideError> {
    #[cfg(feature = "openslide")]
    {
        match OpenSlideBackend::open(path) {
            Ok(slide) => return Ok(Arc::new(slide)),
            Err(err) => debug!(
                "openslide could not open {}: {}; trying raster decoder",
                path.display(),
                err
            ),
        }
    }
    let slide = RasterSlide::open(path, filter)?;
    debug!(
        "raster slide opened path={} levels={}",
        path.display(),
        slide.descriptor.level_count
    );
    Ok(Arc::new(slide))
}

/// A single decoded image exposed as a power-of-two pyramid.
pub struct RasterSlide {
    image: RgbaImage,
    descriptor: PyramidDescriptor,
    filter: ResampleFilter,
}

impl RasterSlide {
    pub fn open(path: &Path, filter: ResampleFilter) -> Result<Self, SlideError> {
        let image = image::open(path)?.to_rgba8();
        Self::from_image(image, filter)
    }

    pub fn from_image(image: RgbaImage, filter: ResampleFilter) -> Result<Self, SlideError> {
        let (dims, downsamples) = raster_levels(image.width() as u64, image.height() as u64);
        Ok(Self {
            image,
            descriptor: PyramidDescriptor::new(dims, downsamples)?,
            filter,
        })
    }
}

fn raster_levels(width: u64, height: u64) -> (Vec<(u64, u64)>, Vec<f64>) {
    let mut dims = Vec::new();
    let mut downsamples = Vec::new();
    for level in 0..RASTER_MAX_LEVELS {
        let factor = 1u64 << level;
        let level_w = width.div_ceil(factor).max(1);
        let level_h = height.div_ceil(factor).max(1);
        dims.push((level_w, level_h));
        downsamples.push(factor as f64);
        if level_w.max(level_h) <= RASTER_MIN_LEVEL_EDGE {
            break;
        }
    }
    (dims, downsamples)
}

impl SlideBackend for RasterSlide {
    fn descriptor(&self) -> &PyramidDescriptor {
        &self.descriptor
    }

    fn read_region(&self, region: &PixelRegion) -> Result<RgbaImage, SlideError> {
        let downsample = self.descriptor.downsample(region.level)?;
        let (tile_w, tile_h) = region.size;
        let mut out = RgbaImage::new(tile_w, tile_h);
        let (src_w, src_h) = (self.image.width() as u64, self.image.height() as u64);
        if region.origin_x >= src_w || region.origin_y >= src_h {
            return Ok(out);
        }

        // Level-0 extent covered by the tile, clipped to the image.
        let span_w = (tile_w as f64 * downsample).ceil() as u64;
        let span_h = (tile_h as f64 * downsample).ceil() as u64;
        let avail_w = (src_w - region.origin_x).min(span_w) as u32;
        let avail_h = (src_h - region.origin_y).min(span_h) as u32;
        let dst_w = ((avail_w as f64 / downsample).round() as u32).clamp(1, tile_w);
        let dst_h = ((avail_h as f64 / downsample).round() as u32).clamp(1, tile_h);

        let crop = imageops::crop_imm(
            &self.image,
            region.origin_x as u32,
            region.origin_y as u32,
            avail_w,
            avail_h,
        )
        .to_image();
        let scaled = if (dst_w, dst_h) == (avail_w, avail_h) {
            crop
        } else {
            imageops::resize(&crop, dst_w, dst_h, self.filter.to_image_filter())
        };
        imageops::replace(&mut out, &scaled, 0, 0);
        Ok(out)
    }

    fn name(&self) -> &str {
        "raster"
    }
}

#[cfg(feature = "openslide")]
pub use openslide_backend::OpenSlideBackend;

#[cfg(feature = "openslide")]
mod openslide_backend {
    use std::path::Path;

    use image::RgbaImage;
    use openslide_rs::{Address, OpenSlide, Region, Size};

    use super::{SlideBackend, SlideError};
    use crate::core::color::rgba_from_premultiplied_bgra;
    use crate::core::pyramid::{PixelRegion, PyramidDescriptor};

    /// Vendor slide formats read through libopenslide.
    pub struct OpenSlideBackend {
        slide: OpenSlide,
        descriptor: PyramidDescriptor,
    }

    fn openslide_err<E: std::fmt::Debug>(context: &str) -> impl FnOnce(E) -> SlideError + '_ {
        move |e| SlideError::OpenSlide(format!("{}: {:?}", context, e))
    }

    impl OpenSlideBackend {
        pub fn open(path: &Path) -> Result<Self, SlideError> {
            let slide = OpenSlide::new(path).map_err(openslide_err("failed to open slide"))?;
            let level_count = slide
                .get_level_count()
                .map_err(openslide_err("failed to get level count"))?;
            let mut dims = Vec::with_capacity(level_count as usize);
            let mut downsamples = Vec::with_capacity(level_count as usize);
            for level in 0..level_count {
                let size = slide
                    .get_level_dimensions(level)
                    .map_err(openslide_err("failed to get dimensions"))?;
                dims.push((size.w as u64, size.h as u64));
                downsamples.push(
                    slide
                        .get_level_downsample(level)
                        .map_err(openslide_err("failed to get downsample"))?,
                );
            }
            Ok(Self {
                slide,
                descriptor: PyramidDescriptor::new(dims, downsamples)?,
            })
        }
    }

    impl SlideBackend for OpenSlideBackend {
        fn descriptor(&self) -> &PyramidDescriptor {
            &self.descriptor
        }

        fn read_region(&self, region: &PixelRegion) -> Result<RgbaImage, SlideError> {
            let out_of_range = || SlideError::OutOfRange {
                x: region.origin_x,
                y: region.origin_y,
            };
            let (w, h) = region.size;
            let request = Region {
                address: Address {
                    x: u32::try_from(region.origin_x).map_err(|_| out_of_range())?,
                    y: u32::try_from(region.origin_y).map_err(|_| out_of_range())?,
                },
                level: region.level,
                size: Size { w, h },
            };
            let bgra = self.slide.read_region(&request).map_err(openslide_err(&format!(
                "read_region({},{}) failed",
                region.origin_x, region.origin_y
            )))?;
            Ok(rgba_from_premultiplied_bgra(&bgra, w, h))
        }

        fn name(&self) -> &str {
            "openslide"
        }
    }
}
