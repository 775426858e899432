use std::fmt;
use std::str::FromStr;

use rand::Rng;
use serde::Serialize;
use tracing::{debug, warn};

use super::synthetic::{
    synthetic_centroids, synthetic_contours, ContourFallback, DECODE_FAULT_CONTOURS,
    UNDECODED_LAYOUT_CONTOURS,
};
use super::{
    point_rows, segmentation_path, AnnotationReadError, AnnotationSource, Point, CENTROIDS, CONTOURS,
};
use crate::core::viewport::{Viewport, ViewportBox};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryMode {
    Centroids,
    Contours,
}

impl fmt::Display for QueryMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QueryMode::Centroids => write!(f, "centroids"),
            QueryMode::Contours => write!(f, "contours"),
        }
    }
}

impl FromStr for QueryMode {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "centroids" => Ok(QueryMode::Centroids),
            "contours" => Ok(QueryMode::Contours),
            _ => Err(format!(
                "unknown segmentation mode '{}'. Available: centroids, contours",
                s
            )),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Contour {
    pub id: u32,
    pub points: Vec<Point>,
}

/// Serializes as `{"centroids": [...]}` or `{"contours": [...]}`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum QueryResult {
    Centroids(Vec<Point>),
    Contours(Vec<Contour>),
}

impl QueryResult {
    pub fn len(&self) -> usize {
        match self {
            QueryResult::Centroids(points) => points.len(),
            QueryResult::Contours(contours) => contours.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Why a query answered with placeholder data instead of stored data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fallback {
    CentroidFault,
    ContourFault,
    ContourLayout,
}

#[derive(Debug, Clone, PartialEq)]
pub struct QueryOutcome {
    pub result: QueryResult,
    pub fallback: Option<Fallback>,
}

impl QueryOutcome {
    fn stored(result: QueryResult) -> Self {
        Self {
            result,
            fallback: None,
        }
    }
}

/// Filter the collection to one viewport.
///
/// A missing structure answers empty. A structure that is present but cannot
/// be read answers with synthetic data scoped to the viewport; the fault is
/// only logged.
pub fn query<R: Rng + ?Sized>(
    source: &mut dyn AnnotationSource,
    viewport: &Viewport,
    mode: QueryMode,
    rng: &mut R,
) -> QueryOutcome {
    match mode {
        QueryMode::Centroids => query_centroids(source, viewport, rng),
        QueryMode::Contours => query_contours(source, viewport),
    }
}

fn query_centroids<R: Rng + ?Sized>(
    source: &mut dyn AnnotationSource,
    viewport: &Viewport,
    rng: &mut R,
) -> QueryOutcome {
    let path = segmentation_path(CENTROIDS);
    if !source.has(&path) {
        debug!("centroid data not found, returning empty result");
        return QueryOutcome::stored(QueryResult::Centroids(Vec::new()));
    }
    let read = if source.is_group(&path) {
        Err(AnnotationReadError::Shape {
            name: path.clone(),
            shape: Vec::new(),
        })
    } else {
        source
            .read(&path)
            .and_then(|table| point_rows(&path, &table))
    };
    match read {
        Ok(points) => {
            let total = points.len();
            let in_view: Vec<Point> = points
                .into_iter()
                .filter(|[x, y]| viewport.bounds.contains(x.value(), y.value()))
                .collect();
            debug!("centroids total={} in_view={}", total, in_view.len());
            QueryOutcome::stored(QueryResult::Centroids(in_view))
        }
        Err(err) => {
            warn!("failed to read centroid data: {}; generating placeholder centroids", err);
            QueryOutcome {
                result: QueryResult::Centroids(synthetic_centroids(
                    &viewport.pixels,
                    viewport.divisor,
                    rng,
                )),
                fallback: Some(Fallback::CentroidFault),
            }
        }
    }
}

fn query_contours(source: &mut dyn AnnotationSource, viewport: &Viewport) -> QueryOutcome {
    let path = segmentation_path(CONTOURS);
    if !source.has(&path) {
        debug!("contour data not found, returning empty result");
        return QueryOutcome::stored(QueryResult::Contours(Vec::new()));
    }
    if !source.is_group(&path) {
        warn!("contour data stored as a single array is not decoded; generating placeholder contours");
        return placeholder_contours(viewport, UNDECODED_LAYOUT_CONTOURS, Fallback::ContourLayout);
    }
    match decode_contours(source, &path, &viewport.bounds) {
        Ok(contours) => {
            debug!("contours in_view={}", contours.len());
            QueryOutcome::stored(QueryResult::Contours(contours))
        }
        Err(err) => {
            warn!("failed to read contour data: {}; generating placeholder contours", err);
            placeholder_contours(viewport, DECODE_FAULT_CONTOURS, Fallback::ContourFault)
        }
    }
}

fn placeholder_contours(viewport: &Viewport, shape: ContourFallback, reason: Fallback) -> QueryOutcome {
    QueryOutcome {
        result: QueryResult::Contours(synthetic_contours(&viewport.pixels, viewport.divisor, shape)),
        fallback: Some(reason),
    }
}

/// Contours whose bounds touch the viewport; `id` is the member's position
/// in the group so it is stable across tiles.
fn decode_contours(
    source: &mut dyn AnnotationSource,
    group: &str,
    bounds: &ViewportBox,
) -> Result<Vec<Contour>, AnnotationReadError> {
    let mut contours = Vec::new();
    for (ordinal, member) in source.members(group).iter().enumerate() {
        let table = source.read(member)?;
        let points = point_rows(member, &table)?;
        let Some((min, max)) = extent(&points) else {
            continue;
        };
        if bounds.intersects(min, max) {
            contours.push(Contour {
                id: ordinal as u32,
                points,
            });
        }
    }
    Ok(contours)
}

fn extent(points: &[Point]) -> Option<((f64, f64), (f64, f64))> {
    let first = points.first()?;
    let (fx, fy) = (first[0].value(), first[1].value());
    Some(points.iter().fold(((fx, fy), (fx, fy)), |(min, max), [x, y]| {
        let (x, y) = (x.value(), y.value());
        ((min.0.min(x), min.1.min(y)), (max.0.max(x), max.1.max(y)))
    }))
}
