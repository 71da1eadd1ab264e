/// NB_CLASSES is the number of digit classes (0-9).
pub const NB_CLASSES: usize = 10;

/// DEFAULT_SEED seeds every deterministic shuffle in the experiment.
pub const DEFAULT_SEED: u64 = 1208;

/// TRAIN_FRACTION is the cut point for the training subsequence.
pub const TRAIN_FRACTION: f64 = 0.6;

/// VALID_FRACTION is the cut point width for the validation subsequence;
/// the remainder past `TRAIN_FRACTION + VALID_FRACTION` is the test set.
pub const VALID_FRACTION: f64 = 0.2;

/// PAD_VALUE fills the tail of utterances shorter than the window length.
pub const PAD_VALUE: f32 = 0.0;

/// MANIFEST_FILE names the dataset manifest inside a dataset directory.
pub const MANIFEST_FILE: &str = "manifest.json";

/// INDICES_FILE names the whitespace-delimited utterance index artifact.
pub const INDICES_FILE: &str = "indices.csv";

/// STATS_MEAN_SUFFIX / STATS_STD_SUFFIX name the per-feature statistics
/// tables stored next to each feature table.
pub const STATS_MEAN_SUFFIX: &str = "_mean";
pub const STATS_STD_SUFFIX: &str = "_std";
