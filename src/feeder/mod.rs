//! Feeder: turns an index subsequence plus the shared feature table into a
//! lazy, restartable stream of fixed-shape batches.
//!
//! The pipeline applies the configured [`Recipe`] steps per utterance and
//! groups the produced windows into mini-batches. Every call to
//! [`Feeder::epoch`] restarts the stream; exhausting one stream is one
//! epoch over the subsequence.
//!
//! With `ncpu > 1` a prefetch pool transforms upcoming utterances on
//! background workers while the caller consumes earlier batches. Workers
//! may reorder utterances, so deterministic-order runs must use
//! `ncpu = 1` (fully synchronous, exact index order).

use std::{collections::VecDeque, sync::Arc, thread, vec::IntoIter};

use candle_core::{Device, Tensor};
use crossbeam_channel::{Receiver, bounded, unbounded};
use rand::{rngs::StdRng, seq::SliceRandom};
use thiserror::Error;

use crate::dataset::{DatasetError, FeatureTable, UtteranceIndex};

pub mod recipes;
pub use recipes::{LabelExtract, Normalize, Recipe, Sequencing, Utterance};

/* --------------------------------------------------------------------- */
/*  Error type                                                           */

#[derive(Debug, Error)]
pub enum FeederError {
    #[error("dataset: {0}")]
    Dataset(#[from] DatasetError),
    #[error("no recipes installed")]
    NoRecipes,
    #[error("utterance \"{name}\": leading character is not a digit")]
    Label { name: String },
    #[error("utterance \"{name}\" reached batch assembly without a label")]
    MissingLabel { name: String },
    #[error("normalization statistics cover {stats} features but frames carry {cols}")]
    StatShape { stats: usize, cols: usize },
    #[error("window \"{name}\" has shape ({frames}, {cols}), batch expects ({want_frames}, {want_cols})")]
    RaggedBatch {
        name: String,
        frames: usize,
        cols: usize,
        want_frames: usize,
        want_cols: usize,
    },
}

/* --------------------------------------------------------------------- */
/*  Batch                                                                */

/// One fixed-shape mini-batch: a `(len, frames, cols)` row-major feature
/// buffer plus a parallel label vector.
#[derive(Debug, Clone)]
pub struct Batch {
    pub data: Vec<f32>,
    pub len: usize,
    pub frames: usize,
    pub cols: usize,
    pub labels: Vec<u32>,
}

impl Batch {
    pub fn shape(&self) -> (usize, usize, usize) {
        (self.len, self.frames, self.cols)
    }

    /// Materialize the batch as candle tensors on `dev`.
    pub fn to_tensors(&self, dev: &Device) -> candle_core::Result<(Tensor, Tensor)> {
        let x = Tensor::from_slice(&self.data, (self.len, self.frames, self.cols), dev)?;
        let y = Tensor::from_slice(&self.labels, (self.labels.len(),), dev)?;
        Ok((x, y))
    }
}

/* --------------------------------------------------------------------- */
/*  Feeder                                                               */

/// Batch producer for one dataset split.
pub struct Feeder {
    table: Arc<FeatureTable>,
    indices: Vec<UtteranceIndex>,
    recipes: Arc<Vec<Box<dyn Recipe>>>,
    ncpu: usize,
}

impl Feeder {
    /// `ncpu` is the prefetch worker count; `<= 1` keeps production fully
    /// synchronous and order-preserving.
    pub fn new(table: Arc<FeatureTable>, indices: Vec<UtteranceIndex>, ncpu: usize) -> Self {
        Self {
            table,
            indices,
            recipes: Arc::new(Vec::new()),
            ncpu: ncpu.max(1),
        }
    }

    /// Install the recipe pipeline. Every index row is validated against
    /// every recipe here, so a malformed row fails the construction, not
    /// some later batch.
    pub fn set_recipes(&mut self, recipes: Vec<Box<dyn Recipe>>) -> Result<(), FeederError> {
        for recipe in &recipes {
            for index in &self.indices {
                recipe.check(index)?;
            }
        }
        self.recipes = Arc::new(recipes);
        Ok(())
    }

    /// Number of utterances in this split.
    pub fn len(&self) -> usize {
        self.indices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }

    /// Reorder the utterance sequence in place (between epochs).
    pub fn shuffle(&mut self, rng: &mut StdRng) {
        self.indices.shuffle(rng);
    }

    /// `(frames, cols)` of every produced window, folded through the
    /// recipes' shape contracts.
    pub fn shape(&self) -> (usize, usize) {
        let rows = self.indices.iter().map(UtteranceIndex::len).max().unwrap_or(0);
        let mut shape = (rows, self.table.cols());
        for recipe in self.recipes.iter() {
            shape = recipe.output_shape(shape);
        }
        shape
    }

    /// Total windows one epoch produces.
    pub fn num_windows(&self) -> usize {
        self.indices
            .iter()
            .map(|ix| {
                let mut rows = ix.len();
                let mut count = 1usize;
                for recipe in self.recipes.iter() {
                    count *= recipe.window_count(rows);
                    rows = recipe.output_shape((rows, self.table.cols())).0;
                }
                count
            })
            .sum()
    }

    /// Batches per epoch for a given batch size.
    pub fn num_batches(&self, batch_size: usize) -> usize {
        self.num_windows().div_ceil(batch_size.max(1))
    }

    /// Start one epoch over the current utterance order.
    pub fn epoch(&self, batch_size: usize) -> Result<BatchStream, FeederError> {
        if self.recipes.is_empty() {
            return Err(FeederError::NoRecipes);
        }
        let source = if self.ncpu <= 1 {
            Source::Sync {
                table: self.table.clone(),
                recipes: self.recipes.clone(),
                indices: self.indices.clone().into_iter(),
            }
        } else {
            Source::Prefetch {
                rx: spawn_workers(
                    self.table.clone(),
                    self.recipes.clone(),
                    self.indices.clone(),
                    self.ncpu,
                ),
            }
        };
        Ok(BatchStream {
            source,
            pending: VecDeque::new(),
            batch_size: batch_size.max(1),
            done: false,
        })
    }
}

/// Run one utterance through the full recipe chain.
fn process(
    table: &FeatureTable,
    recipes: &[Box<dyn Recipe>],
    ix: &UtteranceIndex,
) -> Result<Vec<Utterance>, FeederError> {
    let slice = table.range(ix.start, ix.end)?;
    let frames: Vec<Vec<f32>> = slice.chunks(table.cols()).map(<[f32]>::to_vec).collect();
    let mut items = vec![Utterance {
        name: ix.name.clone(),
        label: None,
        frames,
    }];
    for recipe in recipes {
        let mut next = Vec::with_capacity(items.len());
        for item in items {
            next.extend(recipe.apply(item)?);
        }
        items = next;
    }
    Ok(items)
}

fn spawn_workers(
    table: Arc<FeatureTable>,
    recipes: Arc<Vec<Box<dyn Recipe>>>,
    indices: Vec<UtteranceIndex>,
    ncpu: usize,
) -> Receiver<Result<Vec<Utterance>, FeederError>> {
    let (in_tx, in_rx) = unbounded::<UtteranceIndex>();
    let (out_tx, out_rx) = bounded(ncpu * 4);

    for _ in 0..ncpu {
        let in_rx = in_rx.clone();
        let out_tx = out_tx.clone();
        let table = table.clone();
        let recipes = recipes.clone();
        thread::spawn(move || {
            while let Ok(ix) = in_rx.recv() {
                let res = process(&table, &recipes, &ix);
                let failed = res.is_err();
                if out_tx.send(res).is_err() || failed {
                    break;
                }
            }
        });
    }

    for ix in indices {
        // Receivers only vanish if every worker died; the consumer will
        // observe the closed output channel either way.
        if in_tx.send(ix).is_err() {
            break;
        }
    }
    out_rx
}

/* --------------------------------------------------------------------- */
/*  Batch stream                                                         */

enum Source {
    Sync {
        table: Arc<FeatureTable>,
        recipes: Arc<Vec<Box<dyn Recipe>>>,
        indices: IntoIter<UtteranceIndex>,
    },
    Prefetch {
        rx: Receiver<Result<Vec<Utterance>, FeederError>>,
    },
}

impl Source {
    fn pull(&mut self) -> Option<Result<Vec<Utterance>, FeederError>> {
        match self {
            Source::Sync {
                table,
                recipes,
                indices,
            } => indices.next().map(|ix| process(table, recipes, &ix)),
            Source::Prefetch { rx } => rx.recv().ok(),
        }
    }
}

/// Lazy, finite iterator of batches; one exhaustion = one epoch.
pub struct BatchStream {
    source: Source,
    pending: VecDeque<Utterance>,
    batch_size: usize,
    done: bool,
}

impl BatchStream {
    fn assemble(&mut self) -> Result<Batch, FeederError> {
        let count = self.batch_size.min(self.pending.len());
        let first = &self.pending[0];
        let frames = first.frames.len();
        let cols = first.frames.first().map_or(0, Vec::len);

        let mut data = Vec::with_capacity(count * frames * cols);
        let mut labels = Vec::with_capacity(count);
        let mut taken = 0usize;
        while taken < count {
            let Some(utt) = self.pending.pop_front() else {
                break;
            };
            taken += 1;
            let got_frames = utt.frames.len();
            let got_cols = utt.frames.first().map_or(0, Vec::len);
            if got_frames != frames || got_cols != cols {
                return Err(FeederError::RaggedBatch {
                    name: utt.name,
                    frames: got_frames,
                    cols: got_cols,
                    want_frames: frames,
                    want_cols: cols,
                });
            }
            let label = utt
                .label
                .ok_or_else(|| FeederError::MissingLabel {
                    name: utt.name.clone(),
                })?;
            labels.push(label);
            for frame in &utt.frames {
                data.extend_from_slice(frame);
            }
        }
        Ok(Batch {
            data,
            len: taken,
            frames,
            cols,
            labels,
        })
    }
}

impl Iterator for BatchStream {
    type Item = Result<Batch, FeederError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        while self.pending.len() < self.batch_size {
            match self.source.pull() {
                Some(Ok(items)) => self.pending.extend(items),
                Some(Err(e)) => {
                    self.done = true;
                    return Some(Err(e));
                }
                None => break,
            }
        }
        if self.pending.is_empty() {
            self.done = true;
            return None;
        }
        match self.assemble() {
            Ok(batch) => Some(Ok(batch)),
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}
