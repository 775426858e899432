//! Placeholder annotations returned when a stored structure cannot be read,
//! so the overlay stays populated for the requested viewport.

use std::f64::consts::PI;

use rand::Rng;

use super::{Contour, Coord, Point};
use crate::core::viewport::PixelBox;

pub const SYNTHETIC_CENTROID_COUNT: usize = 20;
const CONTOUR_VERTICES: u32 = 8;

/// Shape of the placeholder contour set.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ContourFallback {
    pub count: u32,
    /// Circle radius in annotation units.
    pub radius: f64,
    /// Horizontal distance between successive contour centres.
    pub step: i64,
}

/// Used when the contour group exists but one of its tables fails to decode.
pub const DECODE_FAULT_CONTOURS: ContourFallback = ContourFallback {
    count: 3,
    radius: 40.0,
    step: 100,
};

/// Used when `contours` is stored in a layout this reader does not decode.
pub const UNDECODED_LAYOUT_CONTOURS: ContourFallback = ContourFallback {
    count: 2,
    radius: 30.0,
    step: 50,
};

/// Uniform points inside the pixel box, each axis floor-divided by `divisor`.
pub fn synthetic_centroids<R: Rng + ?Sized>(
    pixels: &PixelBox,
    divisor: u32,
    rng: &mut R,
) -> Vec<Point> {
    let d = divisor as u64;
    (0..SYNTHETIC_CENTROID_COUNT)
        .map(|_| {
            let px = rng.gen_range(pixels.x_min..pixels.x_max) / d;
            let py = rng.gen_range(pixels.y_min..pixels.y_max) / d;
            [Coord::Int(px as i64), Coord::Int(py as i64)]
        })
        .collect()
}

/// Regular octagons around the viewport centre, numbered in generation order.
pub fn synthetic_contours(pixels: &PixelBox, divisor: u32, shape: ContourFallback) -> Vec<Contour> {
    let (center_x, center_y) = pixels.annotation_center(divisor);
    (0..shape.count)
        .map(|i| {
            let cx = center_x + (i as i64 - 1) * shape.step;
            let points = (0..CONTOUR_VERTICES)
                .map(|j| {
                    let angle = 2.0 * PI * j as f64 / CONTOUR_VERTICES as f64;
                    let px = cx + (shape.radius * angle.cos()) as i64;
                    let py = center_y + (shape.radius * angle.sin()) as i64;
                    [Coord::Int(px), Coord::Int(py)]
                })
                .collect();
            Contour { id: i, points }
        })
        .collect()
}
