use std::fs::File;
use std::path::Path;

use ndarray::{IxDyn, OwnedRepr};
use ndarray_npy::NpzReader;
use tracing::debug;

use super::{AnnotationReadError, AnnotationSource, Table};

/// Annotation collection stored as a NumPy `.npz` archive. Member paths
/// such as `SegmentationNode/contours/12.npy` form the hierarchy.
pub struct NpzStore {
    reader: NpzReader<File>,
    /// (normalized name, name as stored in the archive), in archive order.
    entries: Vec<(String, String)>,
}

impl NpzStore {
    pub fn open(path: &Path) -> Result<Self, AnnotationReadError> {
        let file = File::open(path)?;
        let mut reader = NpzReader::new(file)?;
        let entries = reader
            .names()?
            .into_iter()
            .map(|raw| (normalize(&raw), raw))
            .collect::<Vec<_>>();
        debug!("npz opened path={} arrays={}", path.display(), entries.len());
        Ok(Self { reader, entries })
    }

    /// Normalized names of every array in the archive.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(name, _)| name.as_str())
    }

    fn raw_name(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(normalized, _)| normalized == name)
            .map(|(_, raw)| raw.as_str())
    }
}

fn normalize(raw: &str) -> String {
    raw.trim_start_matches('/').trim_end_matches(".npy").to_string()
}

impl AnnotationSource for NpzStore {
    fn has(&self, name: &str) -> bool {
        self.raw_name(name).is_some() || self.is_group(name)
    }

    fn is_group(&self, name: &str) -> bool {
        let prefix = format!("{}/", name);
        self.names().any(|n| n.starts_with(&prefix))
    }

    fn members(&self, group: &str) -> Vec<String> {
        let prefix = format!("{}/", group);
        self.names()
            .filter(|n| n.strip_prefix(&prefix).is_some_and(|rest| !rest.contains('/')))
            .map(str::to_string)
            .collect()
    }

    fn read(&mut self, name: &str) -> Result<Table, AnnotationReadError> {
        let raw = self
            .raw_name(name)
            .ok_or_else(|| AnnotationReadError::Missing(name.to_string()))?
            .to_string();
        // Tables are stored with whatever dtype the producer used.
        let first_err = match self.reader.by_name::<OwnedRepr<f64>, IxDyn>(&raw) {
            Ok(table) => return Ok(Table::Float(table)),
            Err(err) => err,
        };
        if let Ok(table) = self.reader.by_name::<OwnedRepr<f32>, IxDyn>(&raw) {
            return Ok(Table::Float(table.mapv(|v| v as f64)));
        }
        if let Ok(table) = self.reader.by_name::<OwnedRepr<i64>, IxDyn>(&raw) {
            return Ok(Table::Int(table));
        }
        if let Ok(table) = self.reader.by_name::<OwnedRepr<i32>, IxDyn>(&raw) {
            return Ok(Table::Int(table.mapv(|v| v as i64)));
        }
        Err(first_err.into())
    }
}
