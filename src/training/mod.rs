//! Training orchestrator: a single control thread drives the epoch/batch
//! loop over the primary task, fires subtask evaluations on their
//! triggers, feeds every observation to the registered callbacks and
//! persists the best model snapshot.
//!
//! Lifecycle: `Idle → Running → {Completed, Aborted}`. A `Stop` signal
//! from any callback aborts the run cooperatively (end-of-run hooks still
//! fire); a `Rollback` signal restores the last known-good snapshot
//! between batches and continues. Compute or callback errors are never
//! retried: they propagate, and whatever history the caller's [`History`]
//! handle collected stays available.

use std::{
    path::{Path, PathBuf},
    time::Instant,
};

use rand::{SeedableRng, rngs::StdRng};
use thiserror::Error;

use crate::feeder::{Batch, Feeder, FeederError};
use crate::snapshot::{Checkpoint, ModelSnapshot, SnapshotError, SnapshotSave};

pub mod callbacks;
pub use callbacks::{
    Aggregate, Callback, EarlyStopGeneralizationLoss, Event, EventKind, History, HistoryRecord,
    NaNDetector, ProgressMonitor, Signal,
};

/* --------------------------------------------------------------------- */
/*  Error type                                                           */

#[derive(Debug, Error)]
pub enum TrainError {
    #[error("feeder: {0}")]
    Feeder(#[from] FeederError),
    #[error("candle: {0}")]
    Candle(#[from] candle_core::Error),
    #[error("snapshot: {0}")]
    Snapshot(#[from] SnapshotError),
    #[error("no primary task configured")]
    NoMainTask,
    #[error("history is empty for task \"{task}\", event {event}")]
    EmptyHistory { task: String, event: EventKind },
}

/* --------------------------------------------------------------------- */
/*  Tasks and triggers                                                   */

/// Compute function of a task: consumes one batch, reports its metric
/// vector. The primary task's function is also where parameter updates
/// happen; evaluation tasks just score.
pub type TaskFn<'a> = Box<dyn FnMut(&Batch) -> Result<Vec<f32>, TrainError> + 'a>;

/// When a subtask evaluation runs.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Trigger {
    /// Every time epoch progress crosses a multiple of the fraction, and
    /// once more at the epoch boundary.
    Fraction(f32),
    /// Once, after the final epoch of a completed run.
    FinalEpoch,
}

struct Task<'a> {
    name: String,
    func: TaskFn<'a>,
    feeder: Feeder,
}

struct SubTask<'a> {
    task: Task<'a>,
    trigger: Trigger,
    fired: usize,
}

/* --------------------------------------------------------------------- */
/*  Run outcome                                                          */

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Completed,
    Aborted,
}

/// What `run` hands back: how the state machine ended plus counters.
#[derive(Debug, Clone, Copy)]
pub struct RunReport {
    pub outcome: Outcome,
    pub epochs: usize,
    pub batches: usize,
}

/// Mutable run state, owned exclusively by the orchestrator.
struct TrainingState {
    step: usize,
    best: Option<f32>,
    last_good: Option<ModelSnapshot>,
}

impl TrainingState {
    fn new() -> Self {
        Self {
            step: 0,
            best: None,
            last_good: None,
        }
    }
}

/* --------------------------------------------------------------------- */
/*  MainLoop                                                             */

/// The training loop configuration and driver.
pub struct MainLoop<'a> {
    batch_size: usize,
    seed: u64,
    shuffle_level: u8,
    epochs: usize,
    save_path: Option<PathBuf>,
    checkpoint: Option<&'a dyn Checkpoint>,
    main: Option<Task<'a>>,
    subtasks: Vec<SubTask<'a>>,
    callbacks: Vec<Box<dyn Callback + 'a>>,
}

impl<'a> MainLoop<'a> {
    /// `shuffle_level`: 0 = fixed order, 1 = one shuffle at run start,
    /// 2 = reshuffle before every epoch.
    pub fn new(batch_size: usize, seed: u64, shuffle_level: u8) -> Self {
        Self {
            batch_size: batch_size.max(1),
            seed,
            shuffle_level,
            epochs: 1,
            save_path: None,
            checkpoint: None,
            main: None,
            subtasks: Vec::new(),
            callbacks: Vec::new(),
        }
    }

    /// Persist the best snapshot of `model` to `path` (best effort,
    /// overwrites) and keep it as the rollback target.
    pub fn set_save(&mut self, path: impl Into<PathBuf>, model: &'a dyn Checkpoint) {
        self.save_path = Some(path.into());
        self.checkpoint = Some(model);
    }

    /// Configure the primary task and the epoch count.
    pub fn set_task<F>(&mut self, name: impl Into<String>, func: F, feeder: Feeder, epochs: usize)
    where
        F: FnMut(&Batch) -> Result<Vec<f32>, TrainError> + 'a,
    {
        self.epochs = epochs.max(1);
        self.main = Some(Task {
            name: name.into(),
            func: Box::new(func),
            feeder,
        });
    }

    /// Register an evaluation subtask with its trigger.
    pub fn set_subtask<F>(
        &mut self,
        name: impl Into<String>,
        func: F,
        feeder: Feeder,
        trigger: Trigger,
    ) where
        F: FnMut(&Batch) -> Result<Vec<f32>, TrainError> + 'a,
    {
        self.subtasks.push(SubTask {
            task: Task {
                name: name.into(),
                func: Box::new(func),
                feeder,
            },
            trigger,
            fired: 0,
        });
    }

    /// Register a callback; invocation follows registration order.
    pub fn add_callback(&mut self, cb: impl Callback + 'a) {
        self.callbacks.push(Box::new(cb));
    }

    /// Drive the whole run. Consumes the loop; the returned report tells
    /// whether it completed or aborted.
    pub fn run(self) -> Result<RunReport, TrainError> {
        let MainLoop {
            batch_size,
            seed,
            shuffle_level,
            epochs,
            save_path,
            checkpoint,
            main,
            mut subtasks,
            mut callbacks,
        } = self;

        let mut main = main.ok_or(TrainError::NoMainTask)?;
        let mut rng = StdRng::seed_from_u64(seed);
        let mut state = TrainingState::new();

        // The initial parameters are the first rollback target.
        if let Some(cp) = checkpoint {
            state.last_good = Some(cp.capture()?);
        }
        if shuffle_level == 1 {
            main.feeder.shuffle(&mut rng);
        }

        // The first fractional subtask is the monitored one: its primary
        // metric decides when a snapshot is worth keeping.
        let monitored: Option<String> = subtasks
            .iter()
            .find(|s| matches!(s.trigger, Trigger::Fraction(_)))
            .map(|s| s.task.name.clone());

        let mut outcome = Outcome::Completed;
        let mut epochs_run = 0usize;

        'run: for epoch in 1..=epochs {
            if shuffle_level >= 2 {
                main.feeder.shuffle(&mut rng);
            }
            for sub in &mut subtasks {
                sub.fired = 0;
            }

            let batches_total = main.feeder.num_batches(batch_size).max(1);
            let mut sums: Vec<f32> = Vec::new();
            let mut batch_count = 0usize;
            let epoch_start = Instant::now();

            for item in main.feeder.epoch(batch_size)? {
                let batch = item?;
                let t0 = Instant::now();
                let values = (main.func)(&batch)?;
                state.step += 1;
                batch_count += 1;
                accumulate(&mut sums, &values);

                let sig = dispatch(
                    &mut callbacks,
                    &Event {
                        task: &main.name,
                        kind: EventKind::BatchEnd,
                        epoch,
                        step: state.step,
                        values: &values,
                        elapsed: t0.elapsed(),
                    },
                )?;
                if settle(sig, checkpoint, &mut state)? == Signal::Stop {
                    epochs_run = epoch;
                    outcome = Outcome::Aborted;
                    break 'run;
                }

                // Mid-epoch fractional triggers.
                let progress = batch_count as f32 / batches_total as f32;
                for sub in &mut subtasks {
                    let Trigger::Fraction(f) = sub.trigger else {
                        continue;
                    };
                    if f <= 0.0 || progress >= 1.0 {
                        continue;
                    }
                    let due = (progress / f) as usize;
                    if due > sub.fired {
                        sub.fired = due;
                        let sig = run_eval(
                            &mut sub.task,
                            batch_size,
                            epoch,
                            &mut state,
                            &mut callbacks,
                            checkpoint,
                            save_path.as_deref(),
                            monitored.as_deref(),
                        )?;
                        if sig == Signal::Stop {
                            epochs_run = epoch;
                            outcome = Outcome::Aborted;
                            break 'run;
                        }
                    }
                }
            }

            epochs_run = epoch;

            // Main-task epoch boundary.
            let means = means_of(&sums, batch_count);
            let sig = dispatch(
                &mut callbacks,
                &Event {
                    task: &main.name,
                    kind: EventKind::EpochEnd,
                    epoch,
                    step: state.step,
                    values: &means,
                    elapsed: epoch_start.elapsed(),
                },
            )?;
            if settle(sig, checkpoint, &mut state)? == Signal::Stop {
                outcome = Outcome::Aborted;
                break 'run;
            }

            // Epoch-boundary fractional triggers.
            for sub in &mut subtasks {
                if !matches!(sub.trigger, Trigger::Fraction(_)) {
                    continue;
                }
                let sig = run_eval(
                    &mut sub.task,
                    batch_size,
                    epoch,
                    &mut state,
                    &mut callbacks,
                    checkpoint,
                    save_path.as_deref(),
                    monitored.as_deref(),
                )?;
                if sig == Signal::Stop {
                    outcome = Outcome::Aborted;
                    break 'run;
                }
            }
        }

        // One-shot subtasks run only after a fully completed run.
        if outcome == Outcome::Completed {
            for sub in &mut subtasks {
                if sub.trigger != Trigger::FinalEpoch {
                    continue;
                }
                let sig = run_eval(
                    &mut sub.task,
                    batch_size,
                    epochs_run,
                    &mut state,
                    &mut callbacks,
                    checkpoint,
                    save_path.as_deref(),
                    monitored.as_deref(),
                )?;
                if sig == Signal::Stop {
                    outcome = Outcome::Aborted;
                    break;
                }
            }
        }

        for cb in &mut callbacks {
            cb.on_run_end()?;
        }

        Ok(RunReport {
            outcome,
            epochs: epochs_run,
            batches: state.step,
        })
    }
}

/* --------------------------------------------------------------------- */
/*  Loop internals                                                       */

/// One full pass over a subtask's feeder: batch events per batch, one
/// epoch event with per-metric means, snapshot bookkeeping for the
/// monitored task.
#[allow(clippy::too_many_arguments)]
fn run_eval<'a>(
    task: &mut Task<'a>,
    batch_size: usize,
    epoch: usize,
    state: &mut TrainingState,
    callbacks: &mut [Box<dyn Callback + 'a>],
    checkpoint: Option<&dyn Checkpoint>,
    save_path: Option<&Path>,
    monitored: Option<&str>,
) -> Result<Signal, TrainError> {
    let mut sums: Vec<f32> = Vec::new();
    let mut count = 0usize;
    let started = Instant::now();

    for item in task.feeder.epoch(batch_size)? {
        let batch = item?;
        let t0 = Instant::now();
        let values = (task.func)(&batch)?;
        count += 1;
        accumulate(&mut sums, &values);

        let sig = dispatch(
            callbacks,
            &Event {
                task: &task.name,
                kind: EventKind::BatchEnd,
                epoch,
                step: state.step,
                values: &values,
                elapsed: t0.elapsed(),
            },
        )?;
        if settle(sig, checkpoint, state)? == Signal::Stop {
            return Ok(Signal::Stop);
        }
    }

    let means = means_of(&sums, count);

    // Snapshot on improvement of the monitored primary metric.
    if monitored == Some(task.name.as_str())
        && let Some(&primary) = means.first()
        && primary.is_finite()
        && state.best.is_none_or(|b| primary < b)
    {
        state.best = Some(primary);
        if let Some(cp) = checkpoint {
            let snap = cp.capture()?;
            if let Some(path) = save_path
                && let Err(e) = snap.save_to_file(path)
            {
                // Persistence is best effort; the in-memory copy still
                // serves as the rollback target.
                log::warn!("snapshot save to {} failed: {e}", path.display());
            }
            state.last_good = Some(snap);
            log::debug!("task \"{}\": new best {primary:.6}", task.name);
        }
    }

    let sig = dispatch(
        callbacks,
        &Event {
            task: &task.name,
            kind: EventKind::EpochEnd,
            epoch,
            step: state.step,
            values: &means,
            elapsed: started.elapsed(),
        },
    )?;
    settle(sig, checkpoint, state)
}

/// Deliver one event to every callback in registration order and combine
/// their signals (`Stop` dominates `Rollback` dominates `Continue`).
fn dispatch<'a>(
    callbacks: &mut [Box<dyn Callback + 'a>],
    ev: &Event<'_>,
) -> Result<Signal, TrainError> {
    let mut out = Signal::Continue;
    for cb in callbacks.iter_mut() {
        let sig = match ev.kind {
            EventKind::BatchEnd => cb.on_batch_end(ev)?,
            EventKind::EpochEnd => cb.on_epoch_end(ev)?,
        };
        out = match (out, sig) {
            (Signal::Stop, _) | (_, Signal::Stop) => Signal::Stop,
            (Signal::Rollback, _) | (_, Signal::Rollback) => Signal::Rollback,
            _ => Signal::Continue,
        };
    }
    Ok(out)
}

/// Act on a combined signal: perform rollbacks here, between batches,
/// where the orchestrator holds exclusive access to the parameters.
fn settle(
    sig: Signal,
    checkpoint: Option<&dyn Checkpoint>,
    state: &mut TrainingState,
) -> Result<Signal, TrainError> {
    match sig {
        Signal::Rollback => {
            if let (Some(cp), Some(snap)) = (checkpoint, state.last_good.as_ref()) {
                cp.restore(snap)?;
                log::warn!("rolled back to last known-good snapshot");
                Ok(Signal::Continue)
            } else {
                log::warn!("rollback requested without a snapshot source; stopping");
                Ok(Signal::Stop)
            }
        }
        other => Ok(other),
    }
}

fn accumulate(sums: &mut Vec<f32>, values: &[f32]) {
    if sums.len() < values.len() {
        sums.resize(values.len(), 0.0);
    }
    for (s, v) in sums.iter_mut().zip(values) {
        *s += v;
    }
}

fn means_of(sums: &[f32], count: usize) -> Vec<f32> {
    if count == 0 {
        return Vec::new();
    }
    sums.iter().map(|s| s / count as f32).collect()
}
