//! Precomputed segmentation annotations.
//!
//! A collection is a hierarchy of named numeric arrays. Everything the
//! service reads lives under the [`SEGMENTATION_GROUP`] group:
//!
//! - `centroids`: an `N x >=2` table, one point per row.
//! - `contours`: a group of `N x >=2` point tables, one per labelled region.
//!
//! Either child may be missing; that is a valid collection.

mod npz;
pub mod query;
pub mod synthetic;

use ndarray::ArrayD;
use serde::Serialize;
use thiserror::Error;

pub use npz::NpzStore;
pub use query::{query, Contour, Fallback, QueryMode, QueryOutcome, QueryResult};

pub const SEGMENTATION_GROUP: &str = "SegmentationNode";
pub const CENTROIDS: &str = "centroids";
pub const CONTOURS: &str = "contours";

#[derive(Debug, Error)]
pub enum AnnotationReadError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("npz archive error: {0}")]
    Npz(#[from] ndarray_npy::ReadNpzError),
    #[error("no array named {0}")]
    Missing(String),
    #[error("{name} has shape {shape:?}, expected N x >=2")]
    Shape { name: String, shape: Vec<usize> },
}

/// One annotation coordinate. Integer data stays integral on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Coord {
    Int(i64),
    Float(f64),
}

impl Coord {
    pub fn value(self) -> f64 {
        match self {
            Coord::Int(v) => v as f64,
            Coord::Float(v) => v,
        }
    }
}

/// `[x, y]` in annotation space.
pub type Point = [Coord; 2];

/// A stored array, widened to one integer or one float type.
#[derive(Debug, Clone, PartialEq)]
pub enum Table {
    Int(ArrayD<i64>),
    Float(ArrayD<f64>),
}

impl Table {
    pub fn shape(&self) -> &[usize] {
        match self {
            Table::Int(t) => t.shape(),
            Table::Float(t) => t.shape(),
        }
    }

    fn coord(&self, row: usize, col: usize) -> Coord {
        match self {
            Table::Int(t) => Coord::Int(t[[row, col]]),
            Table::Float(t) => Coord::Float(t[[row, col]]),
        }
    }
}

/// Read access to a hierarchical array collection. Names are `/`-separated
/// paths; a group exists when at least one array lives beneath it.
pub trait AnnotationSource {
    fn has(&self, name: &str) -> bool;
    fn is_group(&self, name: &str) -> bool;
    /// Arrays directly under `group`, in storage order.
    fn members(&self, group: &str) -> Vec<String>;
    fn read(&mut self, name: &str) -> Result<Table, AnnotationReadError>;
}

/// `SegmentationNode/<child>`
pub fn segmentation_path(child: &str) -> String {
    format!("{}/{}", SEGMENTATION_GROUP, child)
}

/// Rows of an `N x >=2` table as `[x, y]` pairs; extra columns are ignored.
pub fn point_rows(name: &str, table: &Table) -> Result<Vec<Point>, AnnotationReadError> {
    let shape = table.shape();
    if shape.len() != 2 || shape[1] < 2 {
        return Err(AnnotationReadError::Shape {
            name: name.to_string(),
            shape: shape.to_vec(),
        });
    }
    Ok((0..shape[0])
        .map(|row| [table.coord(row, 0), table.coord(row, 1)])
        .collect())
}
