use anyhow::{Context, Result};
use image::codecs::jpeg::JpegEncoder as ImageCrateJpegEncoder;
use image::ExtendedColorType;

/// Default JPEG quality for served tiles.
pub const DEFAULT_TILE_QUALITY: u8 = 90;

/// Trait for JPEG encoding backends
pub trait JpegEncoder: Send + Sync {
    fn encode_rgb(&self, pixels: &[u8], width: u32, height: u32, quality: u8) -> Result<Vec<u8>>;
    fn name(&self) -> &str;
}

/// Pure-Rust encoder from the `image` crate (default).
pub struct ImageJpegEncoder;

impl JpegEncoder for ImageJpegEncoder {
    fn encode_rgb(&self, pixels: &[u8], width: u32, height: u32, quality: u8) -> Result<Vec<u8>> {
        let mut buf = Vec::with_capacity((width * height / 4) as usize);
        let encoder = ImageCrateJpegEncoder::new_with_quality(&mut buf, quality.clamp(1, 100));
        image::ImageEncoder::write_image(encoder, pixels, width, height, ExtendedColorType::Rgb8)
            .context("JPEG encoding failed")?;
        Ok(buf)
    }

    fn name(&self) -> &str {
        "image"
    }
}

/// TurboJPEG encoder backend (fastest, needs libjpeg-turbo at build time)
#[cfg(feature = "turbojpeg")]
pub struct TurboJpegEncoder;

#[cfg(feature = "turbojpeg")]
impl JpegEncoder for TurboJpegEncoder {
    fn encode_rgb(&self, pixels: &[u8], width: u32, height: u32, quality: u8) -> Result<Vec<u8>> {
        use turbojpeg::{Compressor, Image, PixelFormat, Subsamp};

        let mut compressor = Compressor::new().context("TurboJPEG init failed")?;
        compressor.set_quality(quality as i32);
        compressor.set_subsamp(Subsamp::Sub2x2);

        let image = Image {
            pixels,
            width: width as usize,
            height: height as usize,
            pitch: (width * 3) as usize,
            format: PixelFormat::RGB,
        };

        compressor
            .compress_to_vec(image)
            .context("TurboJPEG compression failed")
    }

    fn name(&self) -> &str {
        "turbojpeg"
    }
}

/// Create an encoder by name
pub fn create_encoder(name: &str) -> Result<Box<dyn JpegEncoder>> {
    match name {
        "image" => Ok(Box::new(ImageJpegEncoder)),
        #[cfg(feature = "turbojpeg")]
        "turbojpeg" => Ok(Box::new(TurboJpegEncoder)),
        other => {
            let mut available = String::from("image");
            if cfg!(feature = "turbojpeg") {
                available.push_str(", turbojpeg");
            }
            anyhow::bail!(
                "unknown encoder: '{}'. Available: {} \
                 (turbojpeg requires --features turbojpeg at build time)",
                other,
                available,
            );
        }
    }
}
