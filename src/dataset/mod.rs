//! Pre-built dataset accessor.
//!
//! A dataset directory holds a `manifest.json` describing the feature
//! tables, one raw little-endian `f32` file per table, and an
//! `indices.csv` artifact with one `(name, start, end)` row per utterance.
//! Tables are read-only; everything downstream addresses them through row
//! ranges taken from the utterance indices.

use std::{collections::HashMap, fs, path::Path, path::PathBuf, sync::Arc};

use parking_lot::Mutex;
use serde::Deserialize;
use strum::{EnumString, IntoStaticStr};
use thiserror::Error;

use crate::constants::{INDICES_FILE, MANIFEST_FILE, STATS_MEAN_SUFFIX, STATS_STD_SUFFIX};

mod indices;
pub use indices::{
    IndexSplit, UtteranceIndex, class_frequencies, longest_utterance, parse_indices,
    split_indices,
};

/* --------------------------------------------------------------------- */
/*  Error type                                                           */

#[derive(Debug, Error)]
pub enum DatasetError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("manifest: {0}")]
    Manifest(#[from] serde_json::Error),
    #[error("unknown feature table \"{0}\"")]
    UnknownTable(String),
    #[error("table \"{name}\": file holds {got} floats, manifest promises {want}")]
    TableShape {
        name: String,
        got: usize,
        want: usize,
    },
    #[error("statistics table \"{0}\" must have exactly one row")]
    StatsShape(String),
    #[error("indices line {line}: {reason}")]
    Parse { line: usize, reason: String },
    #[error("rows {start}..{end} out of range for a table of {rows} rows")]
    RowRange {
        start: usize,
        end: usize,
        rows: usize,
    },
    #[error("index sequence is empty")]
    EmptyIndices,
}

/* --------------------------------------------------------------------- */
/*  Feature kind                                                         */

/// Feature table families shipped with the spoken-digit dataset.
#[derive(Clone, Copy, Debug, PartialEq, Eq, EnumString, IntoStaticStr)]
#[strum(serialize_all = "lowercase")]
pub enum FeatureKind {
    Mfcc,
    Mspec,
    Spec,
}

impl FeatureKind {
    /// Manifest key of the feature table.
    pub fn key(&self) -> &'static str {
        <&'static str>::from(self)
    }
}

impl std::fmt::Display for FeatureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.key())
    }
}

/* --------------------------------------------------------------------- */
/*  Manifest                                                             */

#[derive(Debug, Deserialize)]
struct Manifest {
    tables: HashMap<String, TableEntry>,
}

#[derive(Debug, Deserialize)]
struct TableEntry {
    file: String,
    rows: usize,
    cols: usize,
}

/* --------------------------------------------------------------------- */
/*  Feature table                                                        */

/// Dense row-major `f32` table of per-frame feature vectors.
#[derive(Debug, Clone)]
pub struct FeatureTable {
    rows: usize,
    cols: usize,
    data: Vec<f32>,
}

impl FeatureTable {
    /// Wrap an in-memory buffer; `data.len()` must be a multiple of `cols`.
    pub fn from_vec(data: Vec<f32>, cols: usize) -> Result<Self, DatasetError> {
        if cols == 0 || !data.len().is_multiple_of(cols) {
            return Err(DatasetError::TableShape {
                name: "<memory>".into(),
                got: data.len(),
                want: cols.max(1),
            });
        }
        Ok(Self {
            rows: data.len() / cols,
            cols,
            data,
        })
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn cols(&self) -> usize {
        self.cols
    }

    /// Row-major slice of rows `start..end`.
    pub fn range(&self, start: usize, end: usize) -> Result<&[f32], DatasetError> {
        if start > end || end > self.rows {
            return Err(DatasetError::RowRange {
                start,
                end,
                rows: self.rows,
            });
        }
        Ok(&self.data[start * self.cols..end * self.cols])
    }

    /// Single row as a slice.
    pub fn row(&self, ix: usize) -> Result<&[f32], DatasetError> {
        self.range(ix, ix + 1)
    }
}

/* --------------------------------------------------------------------- */
/*  Dataset accessor                                                     */

/// Read-only accessor over a pre-built dataset directory.
pub struct Dataset {
    root: PathBuf,
    manifest: Manifest,
    cache: Mutex<HashMap<String, Arc<FeatureTable>>>,
}

impl Dataset {
    /// Open a dataset directory by reading its manifest.
    pub fn open(root: impl AsRef<Path>) -> Result<Self, DatasetError> {
        let root = root.as_ref().to_path_buf();
        let manifest: Manifest = serde_json::from_str(&fs::read_to_string(root.join(MANIFEST_FILE))?)?;
        Ok(Self {
            root,
            manifest,
            cache: Mutex::new(HashMap::new()),
        })
    }

    /// Fetch (and cache) a feature table by manifest key.
    pub fn table(&self, name: &str) -> Result<Arc<FeatureTable>, DatasetError> {
        if let Some(t) = self.cache.lock().get(name) {
            return Ok(t.clone());
        }

        let entry = self
            .manifest
            .tables
            .get(name)
            .ok_or_else(|| DatasetError::UnknownTable(name.to_owned()))?;
        let bytes = fs::read(self.root.join(&entry.file))?;
        let data: Vec<f32> = bytes
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect();
        if data.len() != entry.rows * entry.cols {
            return Err(DatasetError::TableShape {
                name: name.to_owned(),
                got: data.len(),
                want: entry.rows * entry.cols,
            });
        }

        let table = Arc::new(FeatureTable {
            rows: entry.rows,
            cols: entry.cols,
            data,
        });
        self.cache.lock().insert(name.to_owned(), table.clone());
        Ok(table)
    }

    /// Dataset-global `(mean, std)` statistics for a feature table, read
    /// from its `<name>_mean` / `<name>_std` sibling tables.
    pub fn stats(&self, name: &str) -> Result<(Vec<f32>, Vec<f32>), DatasetError> {
        let mut out = Vec::with_capacity(2);
        for suffix in [STATS_MEAN_SUFFIX, STATS_STD_SUFFIX] {
            let key = format!("{name}{suffix}");
            let table = self.table(&key)?;
            if table.rows() != 1 {
                return Err(DatasetError::StatsShape(key));
            }
            out.push(table.range(0, 1)?.to_vec());
        }
        let std = out.pop().unwrap_or_default();
        let mean = out.pop().unwrap_or_default();
        Ok((mean, std))
    }

    /// Parse the `indices.csv` artifact into utterance index records.
    pub fn indices(&self) -> Result<Vec<UtteranceIndex>, DatasetError> {
        let text = fs::read_to_string(self.root.join(INDICES_FILE))?;
        parse_indices(&text)
    }
}
