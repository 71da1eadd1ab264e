//! The spoken-digit network: two padded conv + batch-norm blocks, a 2×2
//! max-pool, an LSTM over the pooled frame sequence and a three-layer
//! dense head emitting one logit per digit class.
//!
//! The layer math itself is candle's responsibility; this module only
//! composes the stack and wires its parameters into a [`VarMap`] so the
//! orchestrator can snapshot and restore them.

use candle_core::{D, DType, Device, Tensor};
use candle_nn::{
    BatchNorm, BatchNormConfig, Conv2d, Conv2dConfig, LSTM, LSTMConfig, Linear, Module, ModuleT,
    RNN, VarBuilder, VarMap, batch_norm, conv2d, linear, lstm,
};

use crate::snapshot::{Checkpoint, ModelSnapshot, SnapshotError};

/// Hidden width of the recurrent layer.
const LSTM_HIDDEN: usize = 128;

/// Widths of the dense head.
const DENSE_1: usize = 1024;
const DENSE_2: usize = 512;

/// CNN + LSTM + dense digit classifier over `(batch, frames, cols)` input.
pub struct DigitModel {
    conv1: Conv2d,
    bn1: BatchNorm,
    conv2: Conv2d,
    bn2: BatchNorm,
    lstm: LSTM,
    fc1: Linear,
    fc2: Linear,
    out: Linear,
    varmap: VarMap,
    frames: usize,
    cols: usize,
}

impl DigitModel {
    /// Build the stack for windows of `frames × cols` features.
    pub fn new(
        frames: usize,
        cols: usize,
        nb_classes: usize,
        dtype: DType,
        dev: &Device,
    ) -> candle_core::Result<Self> {
        if frames < 2 || cols < 2 {
            candle_core::bail!("window shape ({frames}, {cols}) too small for a 2x2 pool");
        }

        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, dtype, dev);

        let pad_same = Conv2dConfig {
            padding: 1,
            ..Default::default()
        };
        let conv1 = conv2d(1, 32, 3, pad_same, vb.pp("conv1"))?;
        let bn1 = batch_norm(32, BatchNormConfig::default(), vb.pp("bn1"))?;
        let conv2 = conv2d(32, 64, 3, pad_same, vb.pp("conv2"))?;
        let bn2 = batch_norm(64, BatchNormConfig::default(), vb.pp("bn2"))?;

        // After the 2x2 max-pool the sequence is frames/2 steps of
        // 64 * (cols/2) features.
        let lstm_in = 64 * (cols / 2);
        let lstm = lstm(lstm_in, LSTM_HIDDEN, LSTMConfig::default(), vb.pp("lstm"))?;

        let fc1 = linear(LSTM_HIDDEN, DENSE_1, vb.pp("fc1"))?;
        let fc2 = linear(DENSE_1, DENSE_2, vb.pp("fc2"))?;
        let out = linear(DENSE_2, nb_classes, vb.pp("out"))?;

        Ok(Self {
            conv1,
            bn1,
            conv2,
            bn2,
            lstm,
            fc1,
            fc2,
            out,
            varmap,
            frames,
            cols,
        })
    }

    /// Forward pass; `train` switches batch-norm statistics handling.
    /// Input `(batch, frames, cols)`, output `(batch, nb_classes)` logits.
    pub fn forward_t(&self, x: &Tensor, train: bool) -> candle_core::Result<Tensor> {
        // (b, frames, cols) -> (b, 1, frames, cols)
        let x = x.unsqueeze(1)?;

        let x = self.conv1.forward(&x)?;
        let x = self.bn1.forward_t(&x, train)?.relu()?;
        let x = self.conv2.forward(&x)?;
        let x = self.bn2.forward_t(&x, train)?.relu()?;
        let x = x.max_pool2d(2)?;

        // (b, 64, frames/2, cols/2) -> (b, frames/2, 64 * cols/2)
        let x = x.permute((0, 2, 1, 3))?.contiguous()?.flatten_from(2)?;

        let states = self.lstm.seq(&x)?;
        let Some(last) = states.last() else {
            candle_core::bail!("lstm produced no states for a non-empty batch");
        };
        let h = last.h().clone();

        let h = self.fc1.forward(&h)?.relu()?;
        let h = self.fc2.forward(&h)?.relu()?;
        self.out.forward(&h)
    }

    /// Trainable parameters, for optimizer construction.
    pub fn varmap(&self) -> &VarMap {
        &self.varmap
    }

    /// Expected window shape `(frames, cols)`.
    pub fn input_shape(&self) -> (usize, usize) {
        (self.frames, self.cols)
    }
}

impl Checkpoint for DigitModel {
    fn capture(&self) -> Result<ModelSnapshot, SnapshotError> {
        self.varmap.capture()
    }

    fn restore(&self, snapshot: &ModelSnapshot) -> Result<(), SnapshotError> {
        self.varmap.restore(snapshot)
    }
}

/* --------------------------------------------------------------------- */
/*  Metric helpers                                                       */

/// Scalar loss tensor to `f32`, via an f32 view for reduced precisions.
pub fn scalar(t: &Tensor) -> candle_core::Result<f32> {
    t.to_dtype(DType::F32)?.to_scalar::<f32>()
}

/// Fraction of rows whose arg-max matches the target label.
pub fn accuracy(logits: &Tensor, targets: &Tensor) -> candle_core::Result<f32> {
    let preds = logits.argmax(D::Minus1)?;
    let hits = preds
        .eq(targets)?
        .to_dtype(DType::F32)?
        .sum_all()?
        .to_scalar::<f32>()?;
    Ok(hits / targets.dims1()?.max(1) as f32)
}
