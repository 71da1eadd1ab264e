//! Utterance index metadata: parsing, the deterministic train/valid/test
//! split and a few helpers over the index sequence.

use rand::{SeedableRng, rngs::StdRng, seq::SliceRandom};

use super::DatasetError;
use crate::constants::{NB_CLASSES, TRAIN_FRACTION, VALID_FRACTION};

/// One variable-length utterance inside the shared feature table.
///
/// `name` is the raw utterance id (its first character is the digit label),
/// `start..end` the row range the utterance occupies.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct UtteranceIndex {
    pub name: String,
    pub start: usize,
    pub end: usize,
}

impl UtteranceIndex {
    /// Number of feature rows the utterance spans.
    pub fn len(&self) -> usize {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    /// Digit class encoded in the first character of the name, if any.
    pub fn digit(&self) -> Option<u32> {
        self.name
            .chars()
            .next()
            .and_then(|c| c.to_digit(10))
            .filter(|&d| (d as usize) < NB_CLASSES)
    }
}

/// Parse the whitespace-delimited `(name, start, end)` rows of an
/// `indices.csv` artifact. Malformed rows abort the load.
pub fn parse_indices(text: &str) -> Result<Vec<UtteranceIndex>, DatasetError> {
    let mut out = Vec::new();
    for (ix, raw) in text.lines().enumerate() {
        let line = raw.trim();
        if line.is_empty() {
            continue;
        }
        let mut fields = line.split_whitespace();
        let (name, start, end) = match (fields.next(), fields.next(), fields.next()) {
            (Some(n), Some(s), Some(e)) => (n, s, e),
            _ => {
                return Err(DatasetError::Parse {
                    line: ix + 1,
                    reason: format!("expected 3 fields, got {}", line.split_whitespace().count()),
                });
            }
        };
        let start: usize = start.parse().map_err(|_| DatasetError::Parse {
            line: ix + 1,
            reason: format!("non-numeric start offset \"{start}\""),
        })?;
        let end: usize = end.parse().map_err(|_| DatasetError::Parse {
            line: ix + 1,
            reason: format!("non-numeric end offset \"{end}\""),
        })?;
        if end < start {
            return Err(DatasetError::Parse {
                line: ix + 1,
                reason: format!("end {end} precedes start {start}"),
            });
        }
        out.push(UtteranceIndex {
            name: name.to_owned(),
            start,
            end,
        });
    }
    Ok(out)
}

/// Window length used by the sequencing recipe: the longest utterance span
/// in the index sequence (the historic `end - start - 1` definition).
pub fn longest_utterance(indices: &[UtteranceIndex]) -> usize {
    indices
        .iter()
        .map(|i| i.len().saturating_sub(1))
        .max()
        .unwrap_or(0)
}

/// Per-class utterance counts, keyed by digit. Names without a leading
/// digit are not counted.
pub fn class_frequencies(indices: &[UtteranceIndex]) -> [usize; NB_CLASSES] {
    let mut freq = [0usize; NB_CLASSES];
    for ix in indices {
        if let Some(d) = ix.digit() {
            freq[d as usize] += 1;
        }
    }
    freq
}

/// The three disjoint subsequences produced by [`split_indices`].
#[derive(Debug, Clone)]
pub struct IndexSplit {
    pub train: Vec<UtteranceIndex>,
    pub valid: Vec<UtteranceIndex>,
    pub test: Vec<UtteranceIndex>,
}

/// Deterministically shuffle `indices` with `seed` and cut at the 0.6 / 0.8
/// fractions. Same seed, same split, every run.
pub fn split_indices(
    mut indices: Vec<UtteranceIndex>,
    seed: u64,
) -> Result<IndexSplit, DatasetError> {
    if indices.is_empty() {
        return Err(DatasetError::EmptyIndices);
    }

    let mut rng = StdRng::seed_from_u64(seed);
    indices.shuffle(&mut rng);

    let n = indices.len();
    let train_end = (TRAIN_FRACTION * n as f64) as usize;
    let valid_end = ((TRAIN_FRACTION + VALID_FRACTION) * n as f64) as usize;

    let test = indices.split_off(valid_end);
    let valid = indices.split_off(train_end);
    Ok(IndexSplit {
        train: indices,
        valid,
        test,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn idx(name: &str, start: usize, end: usize) -> UtteranceIndex {
        UtteranceIndex {
            name: name.to_owned(),
            start,
            end,
        }
    }

    #[test]
    fn parse_rejects_non_numeric_offsets() {
        let err = parse_indices("3_a 0 x\n").unwrap_err();
        assert!(matches!(err, DatasetError::Parse { line: 1, .. }));
    }

    #[test]
    fn parse_skips_blank_lines() {
        let rows = parse_indices("3_a 0 5\n\n7_b 5 9\n").unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[1], idx("7_b", 5, 9));
    }

    #[test]
    fn longest_matches_historic_definition() {
        let rows = vec![idx("1_a", 0, 5), idx("2_b", 5, 14)];
        assert_eq!(longest_utterance(&rows), 8);
    }

    #[test]
    fn digit_comes_from_first_character() {
        assert_eq!(idx("7_jackson_12", 0, 1).digit(), Some(7));
        assert_eq!(idx("x_b", 0, 1).digit(), None);
    }
}
