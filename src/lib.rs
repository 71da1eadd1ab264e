//! digit-audio – public crate root
//! ===============================
//! Spoken-digit classifier training stack (feature-table front-end +
//! Candle back-end).
//!
//! The library is **self-contained**: point it at a feature directory
//! (manifest, raw feature tables, utterance index), wire up a
//! [`MainLoop`] with a model and callbacks, and run. The `digit-audio`
//! binary does exactly that; everything it uses is public here so other
//! front-ends can recombine the pieces.
//!
//! Pipeline in one line: [`Dataset`] → [`split_indices`] → [`Feeder`]
//! (recipes: label extraction, normalization, windowing) → batches →
//! [`DigitModel`] under the [`MainLoop`] orchestrator.
#![deny(unsafe_code)]

/* ────────────────────────  sub-modules  ─────────────────────────────── */
pub mod constants;
pub mod dataset;
pub mod feeder;
pub mod model;
pub mod snapshot;
pub mod training;

/* ────────── public façade & re-exports ───────────────────────────────── */
pub use constants::*;
pub use dataset::{
    Dataset, DatasetError, FeatureKind, FeatureTable, IndexSplit, UtteranceIndex,
    class_frequencies, longest_utterance, parse_indices, split_indices,
};
pub use feeder::{
    Batch, Feeder, FeederError, LabelExtract, Normalize, Recipe, Sequencing, Utterance,
};
pub use model::{DigitModel, accuracy, scalar};
pub use snapshot::{
    Checkpoint, ModelSnapshot, SnapshotError, SnapshotLoad, SnapshotSave, TensorData,
};
pub use training::{
    Callback, EarlyStopGeneralizationLoss, Event, EventKind, History, MainLoop, NaNDetector,
    Outcome, ProgressMonitor, RunReport, Signal, TrainError, Trigger,
};
