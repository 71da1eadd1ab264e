//! Callback observers: side-effect handlers invoked at batch / epoch
//! boundaries of the training loop.
//!
//! Every callback sees the same ordered stream of [`Event`]s, in
//! registration order. A callback influences the loop only through its
//! returned [`Signal`]; there is no inter-callback contract beyond that
//! ordering.

use std::{collections::BTreeMap, sync::Arc, time::Duration};

use parking_lot::Mutex;

use super::TrainError;

/* --------------------------------------------------------------------- */
/*  Events and signals                                                   */

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EventKind {
    BatchEnd,
    EpochEnd,
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            EventKind::BatchEnd => "batch_end",
            EventKind::EpochEnd => "epoch_end",
        })
    }
}

/// One observation handed to every callback.
#[derive(Debug, Clone, Copy)]
pub struct Event<'e> {
    pub task: &'e str,
    pub kind: EventKind,
    pub epoch: usize,
    /// Global batch counter across the whole run.
    pub step: usize,
    /// Metric vector reported by the task's compute function (batch end)
    /// or its per-metric means (epoch end).
    pub values: &'e [f32],
    pub elapsed: Duration,
}

/// Cooperative control request returned by a callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    Continue,
    /// Orderly termination: the orchestrator aborts after this event.
    Stop,
    /// Restore the last known-good snapshot, then keep training.
    Rollback,
}

/// Observer over the training event stream.
pub trait Callback {
    fn name(&self) -> &str;

    fn on_batch_end(&mut self, _ev: &Event<'_>) -> Result<Signal, TrainError> {
        Ok(Signal::Continue)
    }

    fn on_epoch_end(&mut self, _ev: &Event<'_>) -> Result<Signal, TrainError> {
        Ok(Signal::Continue)
    }

    fn on_run_end(&mut self) -> Result<(), TrainError> {
        Ok(())
    }
}

/* --------------------------------------------------------------------- */
/*  ProgressMonitor                                                      */

/// Aggregation applied to a tracked metric's per-batch column before
/// display.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Aggregate {
    Sum,
    Mean,
    Last,
}

impl Aggregate {
    fn apply(&self, xs: &[f32]) -> f32 {
        match self {
            Aggregate::Sum => xs.iter().sum(),
            Aggregate::Mean => {
                if xs.is_empty() {
                    f32::NAN
                } else {
                    xs.iter().sum::<f32>() / xs.len() as f32
                }
            }
            Aggregate::Last => xs.last().copied().unwrap_or(f32::NAN),
        }
    }
}

/// Formats and prints the latest metrics for one named task at each epoch
/// boundary. Display only: never feeds back into control flow.
pub struct ProgressMonitor {
    task: String,
    format: String,
    tracking: Vec<(usize, Aggregate)>,
    columns: Vec<Vec<f32>>,
}

impl ProgressMonitor {
    /// `format` uses `{}` / `{:.N}` placeholders, one per metric.
    pub fn new(task: impl Into<String>, format: impl Into<String>) -> Self {
        Self {
            task: task.into(),
            format: format.into(),
            tracking: Vec::new(),
            columns: Vec::new(),
        }
    }

    /// Replace metric `ix` with `agg` over its per-batch column before
    /// display.
    pub fn with_tracking(mut self, ix: usize, agg: Aggregate) -> Self {
        self.tracking.push((ix, agg));
        self
    }
}

impl Callback for ProgressMonitor {
    fn name(&self) -> &str {
        "ProgressMonitor"
    }

    fn on_batch_end(&mut self, ev: &Event<'_>) -> Result<Signal, TrainError> {
        if ev.task == self.task {
            if self.columns.len() < ev.values.len() {
                self.columns.resize(ev.values.len(), Vec::new());
            }
            for (col, v) in self.columns.iter_mut().zip(ev.values) {
                col.push(*v);
            }
        }
        Ok(Signal::Continue)
    }

    fn on_epoch_end(&mut self, ev: &Event<'_>) -> Result<Signal, TrainError> {
        if ev.task != self.task {
            return Ok(Signal::Continue);
        }
        let mut display = ev.values.to_vec();
        for (ix, agg) in &self.tracking {
            if let Some(col) = self.columns.get(*ix)
                && *ix < display.len()
            {
                display[*ix] = agg.apply(col);
            }
        }
        println!(
            "[{}] epoch {:>3}: {}",
            self.task,
            ev.epoch,
            format_metrics(&self.format, &display)
        );
        self.columns.clear();
        Ok(Signal::Continue)
    }
}

/// Render a runtime format string: each `{}` or `{:.N}` placeholder
/// consumes the next value; surplus placeholders render as `-`.
fn format_metrics(fmt: &str, values: &[f32]) -> String {
    let mut out = String::with_capacity(fmt.len() + 8);
    let mut vals = values.iter().copied();
    let mut rest = fmt;
    while let Some(open) = rest.find('{') {
        out.push_str(&rest[..open]);
        let Some(close) = rest[open..].find('}') else {
            out.push_str(&rest[open..]);
            return out;
        };
        let spec = &rest[open + 1..open + close];
        match vals.next() {
            None => out.push('-'),
            Some(v) => {
                let prec = spec
                    .strip_prefix(":.")
                    .and_then(|s| s.trim_end_matches('f').parse::<usize>().ok());
                match prec {
                    Some(p) => out.push_str(&format!("{v:.p$}")),
                    None => out.push_str(&format!("{v}")),
                }
            }
        }
        rest = &rest[open + close + 1..];
    }
    out.push_str(rest);
    out
}

/* --------------------------------------------------------------------- */
/*  History                                                              */

/// One appended history entry.
#[derive(Debug, Clone)]
pub struct HistoryRecord {
    pub task: String,
    pub kind: EventKind,
    pub epoch: usize,
    pub step: usize,
    pub values: Vec<f32>,
    pub elapsed: Duration,
}

/// Append-only log of every reported metric, shared by handle: keep a
/// clone, register another with the loop, query after the run.
#[derive(Clone, Default)]
pub struct History {
    inner: Arc<Mutex<Vec<HistoryRecord>>>,
}

impl History {
    pub fn new() -> Self {
        Self::default()
    }

    /// All entries for a `(task, event)` pair, in append order.
    pub fn records(&self, task: &str, kind: EventKind) -> Vec<HistoryRecord> {
        self.inner
            .lock()
            .iter()
            .filter(|r| r.task == task && r.kind == kind)
            .cloned()
            .collect()
    }

    /// Arithmetic mean over every value appended for the pair.
    pub fn mean(&self, task: &str, kind: EventKind) -> Result<f32, TrainError> {
        let (sum, n) = self
            .inner
            .lock()
            .iter()
            .filter(|r| r.task == task && r.kind == kind)
            .flat_map(|r| r.values.iter().copied())
            .fold((0f64, 0usize), |(s, n), v| (s + v as f64, n + 1));
        if n == 0 {
            return Err(TrainError::EmptyHistory {
                task: task.to_owned(),
                event: kind,
            });
        }
        Ok((sum / n as f64) as f32)
    }

    /// Mean wall-clock seconds per event for the pair.
    pub fn benchmark(&self, task: &str, kind: EventKind) -> Result<f32, TrainError> {
        let (sum, n) = self
            .inner
            .lock()
            .iter()
            .filter(|r| r.task == task && r.kind == kind)
            .fold((0f64, 0usize), |(s, n), r| (s + r.elapsed.as_secs_f64(), n + 1));
        if n == 0 {
            return Err(TrainError::EmptyHistory {
                task: task.to_owned(),
                event: kind,
            });
        }
        Ok((sum / n as f64) as f32)
    }

    /// Event counts per `(task, event)` pair.
    pub fn print_info(&self) {
        let mut counts: BTreeMap<(String, EventKind), usize> = BTreeMap::new();
        for r in self.inner.lock().iter() {
            *counts.entry((r.task.clone(), r.kind)).or_default() += 1;
        }
        println!("History: {} records", self.inner.lock().len());
        for ((task, kind), n) in counts {
            println!("  {task:<8} {kind:<10} x{n}");
        }
    }

    /// Per-batch value summary for one task.
    pub fn print_batch(&self, task: &str) {
        self.print_kind(task, EventKind::BatchEnd);
    }

    /// Per-epoch value summary for one task.
    pub fn print_epoch(&self, task: &str) {
        self.print_kind(task, EventKind::EpochEnd);
    }

    fn print_kind(&self, task: &str, kind: EventKind) {
        match self.mean(task, kind) {
            Ok(mean) => {
                let n = self.records(task, kind).len();
                println!("[{task}] {kind}: {n} events, mean value {mean:.6}");
            }
            Err(_) => println!("[{task}] {kind}: no records"),
        }
    }
}

impl Callback for History {
    fn name(&self) -> &str {
        "History"
    }

    fn on_batch_end(&mut self, ev: &Event<'_>) -> Result<Signal, TrainError> {
        self.push(ev);
        Ok(Signal::Continue)
    }

    fn on_epoch_end(&mut self, ev: &Event<'_>) -> Result<Signal, TrainError> {
        self.push(ev);
        Ok(Signal::Continue)
    }
}

impl History {
    fn push(&self, ev: &Event<'_>) {
        self.inner.lock().push(HistoryRecord {
            task: ev.task.to_owned(),
            kind: ev.kind,
            epoch: ev.epoch,
            step: ev.step,
            values: ev.values.to_vec(),
            elapsed: ev.elapsed,
        });
    }
}

/* --------------------------------------------------------------------- */
/*  EarlyStopGeneralizationLoss                                          */

/// Stops the run when the monitored task's loss, relative to its
/// historical minimum, stays above `threshold` for `patience + 1`
/// consecutive epoch-end evaluations.
pub struct EarlyStopGeneralizationLoss {
    task: String,
    threshold: f32,
    patience: usize,
    min: f32,
    over: usize,
}

impl EarlyStopGeneralizationLoss {
    pub fn new(task: impl Into<String>, threshold: f32, patience: usize) -> Self {
        Self {
            task: task.into(),
            threshold,
            patience,
            min: f32::INFINITY,
            over: 0,
        }
    }
}

impl Callback for EarlyStopGeneralizationLoss {
    fn name(&self) -> &str {
        "EarlyStopGeneralizationLoss"
    }

    fn on_epoch_end(&mut self, ev: &Event<'_>) -> Result<Signal, TrainError> {
        if ev.task != self.task {
            return Ok(Signal::Continue);
        }
        let Some(&loss) = ev.values.first() else {
            return Ok(Signal::Continue);
        };
        if !loss.is_finite() {
            // NaNDetector's territory.
            return Ok(Signal::Continue);
        }

        if loss < self.min {
            self.min = loss;
        }
        let gl = loss / self.min;
        if gl > self.threshold {
            self.over += 1;
        } else {
            self.over = 0;
        }
        if self.over > self.patience {
            log::info!(
                "early stop: \"{}\" generalization loss {gl:.3} > {:.3} for {} evaluations",
                self.task,
                self.threshold,
                self.over
            );
            return Ok(Signal::Stop);
        }
        Ok(Signal::Continue)
    }
}

/* --------------------------------------------------------------------- */
/*  NaNDetector                                                          */

/// Counts consecutive NaN / infinite metric reports for the watched
/// tasks; past `patience` it either requests a rollback to the last
/// known-good snapshot or stops the run, then starts counting afresh.
pub struct NaNDetector {
    tasks: Vec<String>,
    patience: usize,
    rollback: bool,
    counter: usize,
}

impl NaNDetector {
    pub fn new<I, S>(tasks: I, patience: usize, rollback: bool) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            tasks: tasks.into_iter().map(Into::into).collect(),
            patience,
            rollback,
            counter: 0,
        }
    }

    fn inspect(&mut self, ev: &Event<'_>) -> Signal {
        if !self.tasks.iter().any(|t| t == ev.task) {
            return Signal::Continue;
        }
        if ev.values.iter().all(|v| v.is_finite()) {
            self.counter = 0;
            return Signal::Continue;
        }

        self.counter += 1;
        if self.counter > self.patience {
            self.counter = 0;
            log::warn!(
                "divergence on task \"{}\" ({} consecutive non-finite reports)",
                ev.task,
                self.patience + 1
            );
            return if self.rollback {
                Signal::Rollback
            } else {
                Signal::Stop
            };
        }
        Signal::Continue
    }
}

impl Callback for NaNDetector {
    fn name(&self) -> &str {
        "NaNDetector"
    }

    fn on_batch_end(&mut self, ev: &Event<'_>) -> Result<Signal, TrainError> {
        Ok(self.inspect(ev))
    }

    fn on_epoch_end(&mut self, ev: &Event<'_>) -> Result<Signal, TrainError> {
        Ok(self.inspect(ev))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ev(task: &'static str, kind: EventKind, values: &'static [f32]) -> Event<'static> {
        Event {
            task,
            kind,
            epoch: 1,
            step: 1,
            values,
            elapsed: Duration::ZERO,
        }
    }

    #[test]
    fn format_metrics_handles_precision_and_surplus() {
        assert_eq!(
            format_metrics("Results: {:.4}-{:.4}", &[1.0, 0.25]),
            "Results: 1.0000-0.2500"
        );
        assert_eq!(format_metrics("{} / {}", &[2.5]), "2.5 / -");
        assert_eq!(format_metrics("{:.2f}", &[0.125]), "0.12");
    }

    #[test]
    fn nan_detector_needs_consecutive_failures() {
        let mut det = NaNDetector::new(["train"], 2, false);
        let bad = ev("train", EventKind::BatchEnd, &[f32::NAN]);
        let good = ev("train", EventKind::BatchEnd, &[1.0]);

        assert_eq!(det.inspect(&bad), Signal::Continue);
        assert_eq!(det.inspect(&bad), Signal::Continue);
        assert_eq!(det.inspect(&good), Signal::Continue); // resets
        assert_eq!(det.inspect(&bad), Signal::Continue);
        assert_eq!(det.inspect(&bad), Signal::Continue);
        assert_eq!(det.inspect(&bad), Signal::Stop);
    }

    #[test]
    fn nan_detector_ignores_other_tasks() {
        let mut det = NaNDetector::new(["valid"], 0, false);
        assert_eq!(
            det.inspect(&ev("train", EventKind::BatchEnd, &[f32::NAN])),
            Signal::Continue
        );
    }

    #[test]
    fn early_stop_fires_after_patience_plus_one() {
        let mut stop = EarlyStopGeneralizationLoss::new("valid", 2.0, 1);
        // establish the minimum
        assert_eq!(
            stop.on_epoch_end(&ev("valid", EventKind::EpochEnd, &[1.0]))
                .unwrap(),
            Signal::Continue
        );
        // ratio 3.0 > 2.0, first exceedance
        assert_eq!(
            stop.on_epoch_end(&ev("valid", EventKind::EpochEnd, &[3.0]))
                .unwrap(),
            Signal::Continue
        );
        // second consecutive exceedance = patience + 1 -> STOP
        assert_eq!(
            stop.on_epoch_end(&ev("valid", EventKind::EpochEnd, &[3.0]))
                .unwrap(),
            Signal::Stop
        );
    }

    #[test]
    fn early_stop_counter_resets_on_recovery() {
        let mut stop = EarlyStopGeneralizationLoss::new("valid", 2.0, 1);
        let mut signal_for = |v: f32| {
            let values = [v];
            stop.on_epoch_end(&Event {
                task: "valid",
                kind: EventKind::EpochEnd,
                epoch: 1,
                step: 1,
                values: &values,
                elapsed: Duration::ZERO,
            })
            .unwrap()
        };
        assert_eq!(signal_for(1.0), Signal::Continue);
        assert_eq!(signal_for(3.0), Signal::Continue);
        assert_eq!(signal_for(1.1), Signal::Continue); // recovery resets the streak
        assert_eq!(signal_for(3.0), Signal::Continue);
        assert_eq!(signal_for(3.0), Signal::Stop);
    }
}
