//! Command line surface of the `digit-audio` trainer.

use clap::{Parser, ValueEnum};
use std::path::PathBuf;

use digit_audio::FeatureKind;

/// Spoken-digit classifier trainer
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Directory with the feature manifest, tables and utterance index
    #[arg(short, long)]
    pub data: PathBuf,

    /// Compute device
    #[arg(long, default_value = "cpu")]
    pub device: ComputeDevice,

    /// Parameter precision
    #[arg(long, default_value = "f32")]
    pub dtype: Precision,

    /// Feature table to train on (mfcc, mspec, spec)
    #[arg(long, default_value = "mspec")]
    pub feat: FeatureKind,

    /// Learning rate
    #[arg(long, default_value_t = 1e-4)]
    pub lr: f64,

    /// Number of training epochs
    #[arg(short, long, default_value_t = 8)]
    pub epochs: usize,

    /// Batch size
    #[arg(short, long, default_value_t = 8)]
    pub batch_size: usize,

    /// Output path for the best model snapshot
    #[arg(short, long, default_value = "digit_audio.ai")]
    pub save: PathBuf,

    /// Seed for the split and shuffle RNG
    #[arg(long, default_value_t = digit_audio::DEFAULT_SEED)]
    pub seed: u64,

    /// Prefetch workers for the evaluation feeders
    #[arg(long, default_value_t = 2)]
    pub ncpu: usize,
}

/// Where tensors live.
#[derive(ValueEnum, Clone, Copy, Debug)]
pub enum ComputeDevice {
    Cpu,
    Cuda,
}

/// Supported parameter dtypes.
#[derive(ValueEnum, Clone, Copy, Debug)]
pub enum Precision {
    F32,
    F16,
}
