//! digit-audio CLI binary
//! Trains the spoken-digit classifier over a pre-built feature directory.

use anyhow::{Context, Result};
use candle_core::{DType, Device};
use clap::Parser;
use env_logger::Env;
use log::info;

use candle_nn::{AdamW, Optimizer, ParamsAdamW};
use digit_audio::{
    Batch, DigitModel, EarlyStopGeneralizationLoss, Feeder, History, LabelExtract, MainLoop,
    NaNDetector, Normalize, PAD_VALUE, ProgressMonitor, Sequencing, TrainError, Trigger, accuracy,
    class_frequencies, scalar, split_indices,
    training::Aggregate,
};

mod cli;
use cli::{Cli, ComputeDevice, Precision};

fn main() -> Result<()> {
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();

    let args = Cli::parse();

    let device = match args.device {
        ComputeDevice::Cpu => Device::Cpu,
        ComputeDevice::Cuda => Device::cuda_if_available(0)?,
    };
    let dtype = match args.dtype {
        Precision::F32 => DType::F32,
        Precision::F16 => DType::F16,
    };

    /* ---------- dataset ---------- */

    let dataset = digit_audio::Dataset::open(&args.data)
        .with_context(|| format!("opening dataset at {}", args.data.display()))?;
    let indices = dataset.indices()?;
    let longest = digit_audio::longest_utterance(&indices);
    info!("{} utterances, longest window {longest} frames", indices.len());

    let split = split_indices(indices, args.seed)?;
    info!(
        "split: {} train / {} valid / {} test",
        split.train.len(),
        split.valid.len(),
        split.test.len()
    );
    info!("train class frequencies: {:?}", class_frequencies(&split.train));

    let feat = args.feat.key();
    let table = dataset.table(feat)?;
    let (mean, std) = dataset.stats(feat)?;

    /* ---------- feeders ---------- */

    let recipes = |mean: Vec<f32>, std: Vec<f32>| -> Vec<Box<dyn digit_audio::Recipe>> {
        vec![
            Box::new(LabelExtract),
            Box::new(Normalize::global(mean, std)),
            Box::new(Sequencing::new(longest, 1, PAD_VALUE)),
        ]
    };

    // The training feeder stays synchronous so batch order follows the
    // shuffled index order exactly.
    let mut train_feeder = Feeder::new(table.clone(), split.train, 1);
    train_feeder.set_recipes(recipes(mean.clone(), std.clone()))?;
    let mut valid_feeder = Feeder::new(table.clone(), split.valid, args.ncpu);
    valid_feeder.set_recipes(recipes(mean.clone(), std.clone()))?;
    let mut test_feeder = Feeder::new(table.clone(), split.test, args.ncpu);
    test_feeder.set_recipes(recipes(mean, std))?;

    let (frames, cols) = train_feeder.shape();
    info!("feature shape: ({frames}, {cols})");

    /* ---------- model & optimizer ---------- */

    let model = DigitModel::new(frames, cols, digit_audio::NB_CLASSES, dtype, &device)?;
    let params = ParamsAdamW {
        lr: args.lr,
        ..Default::default()
    };
    let mut opt = AdamW::new(model.varmap().all_vars(), params)?;

    let train_step = |batch: &Batch| -> Result<Vec<f32>, TrainError> {
        let (x, y) = batch.to_tensors(&device)?;
        let x = x.to_dtype(dtype)?;
        let logits = model.forward_t(&x, true)?;
        let loss = candle_nn::loss::cross_entropy(&logits, &y)?;
        opt.backward_step(&loss)?;
        Ok(vec![scalar(&loss)?, accuracy(&logits, &y)?])
    };
    let eval_step = |batch: &Batch| -> Result<Vec<f32>, TrainError> {
        let (x, y) = batch.to_tensors(&device)?;
        let x = x.to_dtype(dtype)?;
        let logits = model.forward_t(&x, false)?;
        let loss = candle_nn::loss::cross_entropy(&logits, &y)?;
        Ok(vec![scalar(&loss)?, accuracy(&logits, &y)?])
    };

    /* ---------- orchestration ---------- */

    let history = History::new();
    let mut main_loop = MainLoop::new(args.batch_size, args.seed, 2);
    main_loop.set_save(&args.save, &model);
    main_loop.set_task("train", train_step, train_feeder, args.epochs);
    main_loop.set_subtask("valid", eval_step, valid_feeder, Trigger::Fraction(0.6));
    main_loop.set_subtask("test", eval_step, test_feeder, Trigger::FinalEpoch);

    main_loop.add_callback(
        ProgressMonitor::new("train", "Results: {:.4}-{:.4}").with_tracking(1, Aggregate::Mean),
    );
    main_loop.add_callback(ProgressMonitor::new("valid", "Results: {:.4}-{:.4}"));
    main_loop.add_callback(ProgressMonitor::new("test", "Results: {:.4}-{:.4}"));
    main_loop.add_callback(history.clone());
    main_loop.add_callback(EarlyStopGeneralizationLoss::new("valid", 5.0, 3));
    main_loop.add_callback(NaNDetector::new(["train", "valid"], 3, true));

    let report = main_loop.run()?;
    info!(
        "run {:?}: {} epochs, {} update steps",
        report.outcome, report.epochs, report.batches
    );

    /* ---------- summary ---------- */

    history.print_info();
    history.print_batch("train");
    history.print_batch("valid");
    history.print_epoch("test");
    for task in ["train", "valid"] {
        if let Ok(secs) = history.benchmark(task, digit_audio::EventKind::BatchEnd) {
            info!("mean {task} batch time: {secs:.4}s");
        }
    }
    info!("best snapshot at {}", args.save.display());

    Ok(())
}
