use std::time::Duration;

use bytes::Bytes;
use moka::sync::Cache;
use tracing::debug;

use crate::core::color::flatten_on_white;
use crate::core::jpeg::JpegEncoder;
use crate::core::pyramid::{PixelRegion, TileRequest};
use crate::error::{Result, ServiceError};
use crate::session::ActiveImage;
use crate::slide::SlideBackend;

/// Keyed by load generation, not path: a reloaded file must not be served
/// tiles encoded from its previous contents.
#[derive(Clone, Debug, Hash, Eq, PartialEq)]
struct TileKey {
    generation: u64,
    level: u32,
    x: u32,
    y: u32,
    tile_size: u32,
}

impl TileKey {
    fn new(image: &ActiveImage, request: &TileRequest) -> Self {
        Self {
            generation: image.generation,
            level: request.level,
            x: request.grid_x,
            y: request.grid_y,
            tile_size: request.tile_size,
        }
    }
}

pub struct FetchedTile {
    pub bytes: Bytes,
    pub cache_hit: bool,
}

/// Encodes tiles of the active slide and keeps recent ones in memory.
pub struct TileFetcher {
    encoder: Box<dyn JpegEncoder>,
    quality: u8,
    cache: Cache<TileKey, Bytes>,
}

impl TileFetcher {
    pub fn new(encoder: Box<dyn JpegEncoder>, quality: u8, cache_entries: u64) -> Self {
        let cache = Cache::builder()
            .max_capacity(cache_entries)
            .time_to_idle(Duration::from_secs(300))
            .build();
        Self {
            encoder,
            quality,
            cache,
        }
    }

    pub fn encoder_name(&self) -> &str {
        self.encoder.name()
    }

    /// Blocking: reads from the backend and encodes on a miss.
    pub fn fetch(&self, image: &ActiveImage, request: &TileRequest) -> Result<FetchedTile> {
        let key = TileKey::new(image, request);
        if let Some(bytes) = self.cache.get(&key) {
            return Ok(FetchedTile {
                bytes,
                cache_hit: true,
            });
        }
        let region = image.slide.descriptor().resolve_region(request)?;
        let bytes = Bytes::from(fetch_tile(
            image.slide.as_ref(),
            &region,
            self.encoder.as_ref(),
            self.quality,
        )?);
        self.cache.insert(key, bytes.clone());
        Ok(FetchedTile {
            bytes,
            cache_hit: false,
        })
    }

    /// Drop every cached tile. Called whenever a new slide is loaded.
    pub fn invalidate(&self) {
        self.cache.invalidate_all();
    }
}

/// Read one region and encode it as JPEG, compositing transparency onto white.
pub fn fetch_tile(
    slide: &dyn SlideBackend,
    region: &PixelRegion,
    encoder: &dyn JpegEncoder,
    quality: u8,
) -> Result<Vec<u8>> {
    let rgba = slide.read_region(region).map_err(ServiceError::ImageRead)?;
    let rgb = flatten_on_white(&rgba);
    let jpeg = encoder
        .encode_rgb(rgb.as_raw(), rgb.width(), rgb.height(), quality)
        .map_err(|err| ServiceError::Internal(format!("{:#}", err)))?;
    debug!(
        "tile encoded level={} origin=({}, {}) size={}x{} bytes={}",
        region.level,
        region.origin_x,
        region.origin_y,
        region.size.0,
        region.size.1,
        jpeg.len()
    );
    Ok(jpeg)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::jpeg::ImageJpegEncoder;
    use crate::core::pyramid::PyramidDescriptor;
    use crate::slide::SlideError;
    use image::{Rgba, RgbaImage};
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct CountingSlide {
        descriptor: PyramidDescriptor,
        reads: AtomicUsize,
        fail: bool,
    }

    impl CountingSlide {
        fn new(fail: bool) -> Self {
            Self {
                descriptor: PyramidDescriptor::new(
                    vec![(4096, 4096), (1024, 1024), (256, 256)],
                    vec![1.0, 4.0, 16.0],
                ).unwrap(),
                reads: AtomicUsize::new(0),
                fail,
            }
        }
    }

    impl SlideBackend for CountingSlide {
        fn descriptor(&self) -> &PyramidDescriptor {
            &self.descriptor
        }

        fn read_region(&self, region: &PixelRegion) -> std::result::Result<RgbaImage, SlideError> {
            self.reads.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(SlideError::OutOfRange {
                    x: region.origin_x,
                    y: region.origin_y,
                });
            }
            Ok(RgbaImage::from_pixel(region.size.0, region.size.1, Rgba([200, 10, 10, 255])))
        }

        fn name(&self) -> &str {
            "counting"
        }
    }

    fn active(slide: Arc<CountingSlide>) -> ActiveImage {
        loaded(slide, 1)
    }

    fn loaded(slide: Arc<CountingSlide>, generation: u64) -> ActiveImage {
        ActiveImage {
            path: PathBuf::from("/slides/a.svs"),
            generation,
            slide,
        }
    }

    fn fetcher() -> TileFetcher {
        TileFetcher::new(Box::new(ImageJpegEncoder), 90, 16)
    }

    fn request(level: u32, x: u32, y: u32) -> TileRequest {
        TileRequest {
            level,
            grid_x: x,
            grid_y: y,
            tile_size: 256,
        }
    }

    #[test]
    fn test_fetch_encodes_jpeg() {
        let slide = Arc::new(CountingSlide::new(false));
        let tile = fetcher().fetch(&active(slide.clone()), &request(1, 2, 3)).unwrap();
        assert!(!tile.cache_hit);
        assert_eq!(&tile.bytes[..2], &[0xFF, 0xD8]);
        let decoded = image::load_from_memory(&tile.bytes).unwrap();
        assert_eq!((decoded.width(), decoded.height()), (256, 256));
        assert_eq!(slide.reads.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_invalid_level_makes_no_backend_call() {
        let slide = Arc::new(CountingSlide::new(false));
        let err = fetcher()
            .fetch(&active(slide.clone()), &request(3, 0, 0))
            .err()
            .unwrap();
        assert!(matches!(err, ServiceError::InvalidLevel { level: 3, level_count: 3 }));
        assert_eq!(slide.reads.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_cache_hit_skips_backend() {
        let slide = Arc::new(CountingSlide::new(false));
        let image = active(slide.clone());
        let fetcher = fetcher();
        let first = fetcher.fetch(&image, &request(0, 1, 1)).unwrap();
        let second = fetcher.fetch(&image, &request(0, 1, 1)).unwrap();
        assert!(second.cache_hit);
        assert_eq!(first.bytes, second.bytes);
        assert_eq!(slide.reads.load(Ordering::SeqCst), 1);

        fetcher.invalidate();
        let third = fetcher.fetch(&image, &request(0, 1, 1)).unwrap();
        assert!(!third.cache_hit);
        assert_eq!(slide.reads.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_stale_insert_is_not_served_after_reload() {
        let fetcher = fetcher();
        let old_slide = Arc::new(CountingSlide::new(false));
        let old = loaded(old_slide.clone(), 1);

        // Reload of the same path lands between an in-flight fetch and its insert.
        fetcher.invalidate();
        fetcher.fetch(&old, &request(0, 2, 2)).unwrap();

        let new_slide = Arc::new(CountingSlide::new(false));
        let new = loaded(new_slide.clone(), 2);
        let tile = fetcher.fetch(&new, &request(0, 2, 2)).unwrap();
        assert!(!tile.cache_hit);
        assert_eq!(new_slide.reads.load(Ordering::SeqCst), 1);
        assert_eq!(old_slide.reads.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_read_failure_maps_to_image_read() {
        let slide = Arc::new(CountingSlide::new(true));
        let err = fetcher()
            .fetch(&active(slide), &request(0, 0, 0))
            .err()
            .unwrap();
        assert!(matches!(err, ServiceError::ImageRead(_)));
        assert_eq!(err.status(), axum::http::StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn test_transparent_region_encodes_white() {
        struct Clear(PyramidDescriptor);
        impl SlideBackend for Clear {
            fn descriptor(&self) -> &PyramidDescriptor {
                &self.0
            }
            fn read_region(&self, r: &PixelRegion) -> std::result::Result<RgbaImage, SlideError> {
                Ok(RgbaImage::new(r.size.0, r.size.1))
            }
            fn name(&self) -> &str {
                "clear"
            }
        }
        let slide = Clear(PyramidDescriptor::new(vec![(64, 64)], vec![1.0]).unwrap());
        let region = slide.0.resolve_region(&request(0, 0, 0)).unwrap();
        let jpeg = fetch_tile(&slide, &region, &ImageJpegEncoder, 90).unwrap();
        let rgb = image::load_from_memory(&jpeg).unwrap().to_rgb8();
        let px = rgb.get_pixel(100, 100);
        assert!(px.0.iter().all(|&c| c > 245), "expected white, got {:?}", px);
    }
}
