//! Recipes: the pure transformation steps a feeder applies, in fixed
//! order, to every utterance before batch assembly.
//!
//! Each recipe declares its shape contract through [`Recipe::output_shape`]
//! and [`Recipe::window_count`], which lets the feeder report the feature
//! shape and the number of batches per epoch without producing anything.

use super::FeederError;
use crate::dataset::UtteranceIndex;

/// One utterance (or one produced window) travelling through the pipeline.
#[derive(Debug, Clone)]
pub struct Utterance {
    pub name: String,
    /// Integer class label; set by [`LabelExtract`].
    pub label: Option<u32>,
    /// Per-frame feature vectors, one inner `Vec` per frame.
    pub frames: Vec<Vec<f32>>,
}

/// A pure transformation step in the batching pipeline.
///
/// Recipes are stateless across batches; the only held state is
/// configuration fixed at construction time (e.g. normalization
/// statistics, which are read-only during training).
pub trait Recipe: Send + Sync {
    fn name(&self) -> &'static str;

    /// Validate one index row at pipeline-construction time. Failing here
    /// aborts `Feeder::set_recipes` before any batch is produced.
    fn check(&self, _index: &UtteranceIndex) -> Result<(), FeederError> {
        Ok(())
    }

    /// Shape contract: `(frames, cols)` in, `(frames, cols)` out.
    fn output_shape(&self, input: (usize, usize)) -> (usize, usize) {
        input
    }

    /// How many items one utterance of `frames` rows fans out into.
    fn window_count(&self, _frames: usize) -> usize {
        1
    }

    /// Apply the step. May fan one item out into several (sequencing).
    fn apply(&self, utt: Utterance) -> Result<Vec<Utterance>, FeederError>;
}

/* --------------------------------------------------------------------- */
/*  Label extraction                                                     */

/// Maps the leading digit of the utterance name to an integer class label.
#[derive(Debug, Default, Clone, Copy)]
pub struct LabelExtract;

impl LabelExtract {
    fn digit_of(name: &str) -> Result<u32, FeederError> {
        name.chars()
            .next()
            .and_then(|c| c.to_digit(10))
            .ok_or_else(|| FeederError::Label {
                name: name.to_owned(),
            })
    }
}

impl Recipe for LabelExtract {
    fn name(&self) -> &'static str {
        "label_extract"
    }

    fn check(&self, index: &UtteranceIndex) -> Result<(), FeederError> {
        Self::digit_of(&index.name).map(|_| ())
    }

    fn apply(&self, mut utt: Utterance) -> Result<Vec<Utterance>, FeederError> {
        utt.label = Some(Self::digit_of(&utt.name)?);
        Ok(vec![utt])
    }
}

/* --------------------------------------------------------------------- */
/*  Normalization                                                        */

/// Subtracts a dataset-global per-feature mean and divides by the
/// per-feature standard deviation.
#[derive(Debug, Clone)]
pub struct Normalize {
    mean: Vec<f32>,
    std: Vec<f32>,
}

impl Normalize {
    /// Build from precomputed dataset-global statistics.
    pub fn global(mean: Vec<f32>, std: Vec<f32>) -> Self {
        Self { mean, std }
    }
}

impl Recipe for Normalize {
    fn name(&self) -> &'static str {
        "normalize"
    }

    fn apply(&self, mut utt: Utterance) -> Result<Vec<Utterance>, FeederError> {
        for frame in &mut utt.frames {
            if frame.len() != self.mean.len() || frame.len() != self.std.len() {
                return Err(FeederError::StatShape {
                    stats: self.mean.len().min(self.std.len()),
                    cols: frame.len(),
                });
            }
            for (j, v) in frame.iter_mut().enumerate() {
                let sd = self.std[j];
                *v = if sd > f32::EPSILON {
                    (*v - self.mean[j]) / sd
                } else {
                    *v - self.mean[j]
                };
            }
        }
        Ok(vec![utt])
    }
}

/* --------------------------------------------------------------------- */
/*  Sequencing                                                           */

/// Slides a fixed-length window over the utterance frames.
///
/// Utterances shorter than the window are right-padded with
/// `pad_value` rows up to the window length; the label of a produced
/// window is the label carried by its last real frame (per-utterance
/// labels simply propagate).
#[derive(Debug, Clone, Copy)]
pub struct Sequencing {
    pub frame_length: usize,
    pub hop: usize,
    pub pad_value: f32,
}

impl Sequencing {
    pub fn new(frame_length: usize, hop: usize, pad_value: f32) -> Self {
        Self {
            frame_length,
            hop: hop.max(1),
            pad_value,
        }
    }
}

impl Recipe for Sequencing {
    fn name(&self) -> &'static str {
        "sequencing"
    }

    fn output_shape(&self, input: (usize, usize)) -> (usize, usize) {
        (self.frame_length, input.1)
    }

    fn window_count(&self, frames: usize) -> usize {
        if frames <= self.frame_length {
            1
        } else {
            (frames - self.frame_length) / self.hop + 1
        }
    }

    fn apply(&self, utt: Utterance) -> Result<Vec<Utterance>, FeederError> {
        let cols = utt.frames.first().map_or(0, Vec::len);
        let n = utt.frames.len();

        if n <= self.frame_length {
            // Single right-padded window.
            let mut frames = utt.frames;
            frames.resize(self.frame_length, vec![self.pad_value; cols]);
            return Ok(vec![Utterance { frames, ..utt }]);
        }

        let mut windows = Vec::with_capacity(self.window_count(n));
        let mut start = 0;
        while start + self.frame_length <= n {
            windows.push(Utterance {
                name: utt.name.clone(),
                label: utt.label,
                frames: utt.frames[start..start + self.frame_length].to_vec(),
            });
            start += self.hop;
        }
        Ok(windows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn utt(name: &str, frames: Vec<Vec<f32>>) -> Utterance {
        Utterance {
            name: name.to_owned(),
            label: None,
            frames,
        }
    }

    #[test]
    fn short_utterance_is_right_padded() {
        let seq = Sequencing::new(4, 1, 0.0);
        let out = seq
            .apply(utt("3_a", vec![vec![1.0, 2.0], vec![3.0, 4.0]]))
            .unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].frames.len(), 4);
        assert_eq!(out[0].frames[2], vec![0.0, 0.0]);
        assert_eq!(out[0].frames[3], vec![0.0, 0.0]);
        assert_eq!(out[0].frames[0], vec![1.0, 2.0]);
    }

    #[test]
    fn long_utterance_fans_out_with_hop_one() {
        let seq = Sequencing::new(2, 1, 0.0);
        let frames: Vec<Vec<f32>> = (0..5).map(|i| vec![i as f32]).collect();
        let out = seq.apply(utt("1_b", frames)).unwrap();
        assert_eq!(out.len(), seq.window_count(5));
        assert_eq!(out.len(), 4);
        assert_eq!(out[3].frames, vec![vec![3.0], vec![4.0]]);
    }

    #[test]
    fn normalize_applies_global_stats_per_column() {
        let norm = Normalize::global(vec![1.0, 2.0], vec![2.0, 4.0]);
        let out = norm.apply(utt("0_c", vec![vec![3.0, 10.0]])).unwrap();
        assert_eq!(out[0].frames[0], vec![1.0, 2.0]);
    }

    #[test]
    fn label_extract_rejects_non_digit_names() {
        let err = LabelExtract.apply(utt("x_d", vec![])).unwrap_err();
        assert!(matches!(err, FeederError::Label { .. }));
    }
}
