use image::{Rgb, RgbImage, Rgba, RgbaImage};

/// Convert OpenSlide's premultiplied BGRA buffer into straight-alpha RGBA.
/// Fully transparent pixels stay `(0, 0, 0, 0)`.
pub fn rgba_from_premultiplied_bgra(bgra: &[u8], width: u32, height: u32) -> RgbaImage {
    let n = (width * height) as usize;
    let mut rgba = vec![0u8; n * 4];
    for i in 0..n.min(bgra.len() / 4) {
        let a = bgra[i * 4 + 3];
        if a == 0 {
            continue;
        }
        if a == 255 {
            rgba[i * 4] = bgra[i * 4 + 2];
            rgba[i * 4 + 1] = bgra[i * 4 + 1];
            rgba[i * 4 + 2] = bgra[i * 4];
        } else {
            // Un-premultiply: pixel = premultiplied * 255 / alpha
            let af = a as f32;
            rgba[i * 4] = ((bgra[i * 4 + 2] as f32 * 255.0 / af).round().min(255.0)) as u8;
            rgba[i * 4 + 1] = ((bgra[i * 4 + 1] as f32 * 255.0 / af).round().min(255.0)) as u8;
            rgba[i * 4 + 2] = ((bgra[i * 4] as f32 * 255.0 / af).round().min(255.0)) as u8;
        }
        rgba[i * 4 + 3] = a;
    }
    // from_raw only fails on a length mismatch, which the allocation above rules out
    RgbaImage::from_raw(width, height, rgba).unwrap_or_else(|| RgbaImage::new(width, height))
}

/// Drop the alpha channel by compositing over a white background, so padding
/// outside the slide bounds renders as blank glass rather than black.
pub fn flatten_on_white(rgba: &RgbaImage) -> RgbImage {
    let mut rgb = RgbImage::new(rgba.width(), rgba.height());
    for (dst, src) in rgb.pixels_mut().zip(rgba.pixels()) {
        let Rgba([r, g, b, a]) = *src;
        *dst = match a {
            255 => Rgb([r, g, b]),
            0 => Rgb([255, 255, 255]),
            _ => {
                let af = a as f32 / 255.0;
                let blend = |c: u8| (c as f32 * af + 255.0 * (1.0 - af)).round().clamp(0.0, 255.0) as u8;
                Rgb([blend(r), blend(g), blend(b)])
            }
        };
    }
    rgb
}
