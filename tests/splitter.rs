//! Integration tests for the deterministic index splitter.

use digit_audio::{
    DatasetError, UtteranceIndex, class_frequencies, longest_utterance, split_indices,
};

fn indices(n: usize) -> Vec<UtteranceIndex> {
    (0..n)
        .map(|i| UtteranceIndex {
            name: format!("{}_speaker_{i}", i % 10),
            start: i * 4,
            end: i * 4 + 4,
        })
        .collect()
}

#[test]
fn split_sizes_follow_the_fractions() {
    for n in [5usize, 10, 37, 100] {
        let split = split_indices(indices(n), 1208).unwrap();
        let train_end = (0.6 * n as f64) as usize;
        let valid_end = (0.8 * n as f64) as usize;
        assert_eq!(split.train.len(), train_end, "train size for n={n}");
        assert_eq!(split.valid.len(), valid_end - train_end, "valid size for n={n}");
        assert_eq!(split.test.len(), n - valid_end, "test size for n={n}");
    }
}

#[test]
fn split_partitions_without_overlap() {
    let split = split_indices(indices(50), 1208).unwrap();
    let mut seen: Vec<&str> = split
        .train
        .iter()
        .chain(&split.valid)
        .chain(&split.test)
        .map(|ix| ix.name.as_str())
        .collect();
    assert_eq!(seen.len(), 50);
    seen.sort_unstable();
    seen.dedup();
    assert_eq!(seen.len(), 50, "subsequences share an utterance");
}

#[test]
fn same_seed_reproduces_the_split() {
    let a = split_indices(indices(40), 1208).unwrap();
    let b = split_indices(indices(40), 1208).unwrap();
    assert_eq!(a.train, b.train);
    assert_eq!(a.valid, b.valid);
    assert_eq!(a.test, b.test);
}

#[test]
fn different_seeds_reorder() {
    let a = split_indices(indices(40), 1208).unwrap();
    let b = split_indices(indices(40), 42).unwrap();
    assert_ne!(a.train, b.train);
}

#[test]
fn ten_utterances_split_six_two_two() {
    let split = split_indices(indices(10), 1208).unwrap();
    assert_eq!(
        (split.train.len(), split.valid.len(), split.test.len()),
        (6, 2, 2)
    );
}

#[test]
fn empty_index_sequence_is_an_error() {
    assert!(matches!(
        split_indices(Vec::new(), 1208),
        Err(DatasetError::EmptyIndices)
    ));
}

#[test]
fn helpers_over_the_index_sequence() {
    let rows = indices(10);
    // Every utterance spans 4 rows, historic window length is len - 1.
    assert_eq!(longest_utterance(&rows), 3);
    assert_eq!(class_frequencies(&rows), [1usize; 10]);
}
