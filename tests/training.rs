//! Integration tests for the training orchestrator: trigger schedules,
//! callback control flow, history bookkeeping and divergence recovery.

use std::sync::{
    Arc,
    atomic::{AtomicUsize, Ordering},
};

use anyhow::Result;
use digit_audio::{
    Batch, Checkpoint, EarlyStopGeneralizationLoss, EventKind, Feeder, FeatureTable, History,
    LabelExtract, MainLoop, ModelSnapshot, NaNDetector, Outcome, Recipe, Sequencing,
    SnapshotError, TrainError, Trigger, UtteranceIndex,
};
use indexmap::IndexMap;

/// A feeder over `n` synthetic utterances of 3 frames x 2 columns; the
/// windowing recipe keeps them 1:1, so `n` utterances = `n` windows.
fn feeder(n: usize) -> Feeder {
    let cols = 2;
    let frames_per_utt = 3;
    let data: Vec<f32> = (0..n * frames_per_utt * cols).map(|i| i as f32 * 0.1).collect();
    let table = Arc::new(FeatureTable::from_vec(data, cols).unwrap());
    let indices: Vec<UtteranceIndex> = (0..n)
        .map(|i| UtteranceIndex {
            name: format!("{}_u{i}", i % 10),
            start: i * frames_per_utt,
            end: (i + 1) * frames_per_utt,
        })
        .collect();
    let mut f = Feeder::new(table, indices, 1);
    let recipes: Vec<Box<dyn Recipe>> = vec![
        Box::new(LabelExtract),
        Box::new(Sequencing::new(frames_per_utt, 1, 0.0)),
    ];
    f.set_recipes(recipes).unwrap();
    f
}

fn constant(values: Vec<f32>) -> impl FnMut(&Batch) -> Result<Vec<f32>, TrainError> {
    move |_| Ok(values.clone())
}

/// Parameterless checkpoint that counts captures and restores.
struct CountingCheckpoint {
    captures: AtomicUsize,
    restores: AtomicUsize,
}

impl CountingCheckpoint {
    fn new() -> Self {
        Self {
            captures: AtomicUsize::new(0),
            restores: AtomicUsize::new(0),
        }
    }
}

impl Checkpoint for CountingCheckpoint {
    fn capture(&self) -> Result<ModelSnapshot, SnapshotError> {
        self.captures.fetch_add(1, Ordering::SeqCst);
        Ok(ModelSnapshot::new(IndexMap::new()))
    }

    fn restore(&self, _snapshot: &ModelSnapshot) -> Result<(), SnapshotError> {
        self.restores.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[test]
fn completed_run_reports_its_counters() -> Result<()> {
    let history = History::new();
    let mut ml = MainLoop::new(2, 1208, 0);
    ml.set_task("train", constant(vec![0.5, 0.9]), feeder(4), 2);
    ml.add_callback(history.clone());

    let report = ml.run()?;
    assert_eq!(report.outcome, Outcome::Completed);
    assert_eq!(report.epochs, 2);
    // 4 windows / batch size 2 = 2 batches per epoch.
    assert_eq!(report.batches, 4);
    assert_eq!(history.records("train", EventKind::BatchEnd).len(), 4);
    assert_eq!(history.records("train", EventKind::EpochEnd).len(), 2);
    Ok(())
}

#[test]
fn missing_main_task_is_an_error() {
    let ml = MainLoop::new(2, 1208, 0);
    assert!(matches!(ml.run(), Err(TrainError::NoMainTask)));
}

#[test]
fn history_means_cover_every_appended_value() -> Result<()> {
    let history = History::new();
    let mut ml = MainLoop::new(2, 1208, 0);
    ml.set_task("train", constant(vec![1.0, 3.0]), feeder(4), 1);
    ml.add_callback(history.clone());
    ml.run()?;

    // Two batches, each reporting [1.0, 3.0], flattened mean 2.0.
    assert_eq!(history.mean("train", EventKind::BatchEnd)?, 2.0);
    assert!(matches!(
        history.mean("valid", EventKind::BatchEnd),
        Err(TrainError::EmptyHistory { .. })
    ));
    Ok(())
}

#[test]
fn fraction_trigger_fires_mid_epoch_and_at_the_boundary() -> Result<()> {
    let history = History::new();
    let mut ml = MainLoop::new(2, 1208, 0);
    // 6 windows / batch size 2 = 3 main batches per epoch.
    ml.set_task("train", constant(vec![0.5]), feeder(6), 1);
    // Fires once at progress 2/3 > 0.4 and once at the epoch boundary.
    ml.set_subtask("valid", constant(vec![0.4]), feeder(2), Trigger::Fraction(0.4));
    ml.add_callback(history.clone());
    ml.run()?;

    assert_eq!(history.records("valid", EventKind::EpochEnd).len(), 2);
    Ok(())
}

#[test]
fn final_epoch_subtask_runs_once_after_the_last_epoch() -> Result<()> {
    let history = History::new();
    let mut ml = MainLoop::new(2, 1208, 0);
    ml.set_task("train", constant(vec![0.5]), feeder(4), 3);
    ml.set_subtask("test", constant(vec![0.3]), feeder(2), Trigger::FinalEpoch);
    ml.add_callback(history.clone());
    ml.run()?;

    let records = history.records("test", EventKind::EpochEnd);
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].epoch, 3);
    Ok(())
}

#[test]
fn early_stop_aborts_and_skips_the_final_subtask() -> Result<()> {
    let history = History::new();
    let mut ml = MainLoop::new(2, 1208, 0);
    ml.set_task("train", constant(vec![0.5]), feeder(2), 10);

    // The first evaluation sets the minimum; every later one is 4x worse,
    // so with patience 0 the second evaluation already stops the run.
    let evals = Arc::new(AtomicUsize::new(0));
    let evals_fn = evals.clone();
    let valid = move |_: &Batch| -> Result<Vec<f32>, TrainError> {
        let n = evals_fn.fetch_add(1, Ordering::SeqCst);
        Ok(vec![if n == 0 { 1.0 } else { 4.0 }])
    };
    ml.set_subtask("valid", valid, feeder(1), Trigger::Fraction(0.6));
    ml.set_subtask("test", constant(vec![0.3]), feeder(1), Trigger::FinalEpoch);
    ml.add_callback(history.clone());
    ml.add_callback(EarlyStopGeneralizationLoss::new("valid", 2.0, 0));

    let report = ml.run()?;
    assert_eq!(report.outcome, Outcome::Aborted);
    assert_eq!(report.epochs, 2);
    assert!(history.records("test", EventKind::EpochEnd).is_empty());
    Ok(())
}

#[test]
fn nan_detector_rolls_back_to_the_initial_snapshot() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let cp = CountingCheckpoint::new();

    let mut ml = MainLoop::new(2, 1208, 0);
    ml.set_save(dir.path().join("model.ai"), &cp);
    // Every batch diverges; patience 1 means every second consecutive
    // report requests a rollback.
    ml.set_task("train", constant(vec![f32::NAN]), feeder(4), 1);
    ml.add_callback(NaNDetector::new(["train"], 1, true));

    let report = ml.run()?;
    assert_eq!(report.outcome, Outcome::Completed);
    assert!(cp.captures.load(Ordering::SeqCst) >= 1);
    assert_eq!(cp.restores.load(Ordering::SeqCst), 1);
    Ok(())
}

#[test]
fn rollback_without_a_snapshot_source_stops_the_run() -> Result<()> {
    let mut ml = MainLoop::new(2, 1208, 0);
    ml.set_task("train", constant(vec![f32::NAN]), feeder(8), 1);
    ml.add_callback(NaNDetector::new(["train"], 0, true));

    let report = ml.run()?;
    assert_eq!(report.outcome, Outcome::Aborted);
    Ok(())
}

#[test]
fn snapshot_is_written_when_the_monitored_metric_improves() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("model.ai");
    let cp = CountingCheckpoint::new();

    let mut ml = MainLoop::new(2, 1208, 0);
    ml.set_save(&path, &cp);
    ml.set_task("train", constant(vec![0.5]), feeder(2), 1);
    ml.set_subtask("valid", constant(vec![0.8]), feeder(2), Trigger::Fraction(0.6));
    ml.run()?;

    // Initial capture plus the best-metric capture.
    assert_eq!(cp.captures.load(Ordering::SeqCst), 2);
    assert!(path.exists());
    Ok(())
}
