use super::*;

fn assert_close(actual: f32, expected: f32) {
    assert!(
        (actual - expected).abs() < 1e-6,
        "expected {expected}, got {actual}"
    );
}

#[test]
fn first_insert_fixes_dimension() {
    let mut store = FlatStore::new();
    assert_eq!(store.dimension(), None);
    assert!(store.is_empty());

    let first = store
        .add(&[vec![3.0, 4.0], vec![1.0, 0.0]])
        .expect("valid vectors");

    assert_eq!(first, 0);
    assert_eq!(store.dimension(), Some(2));
    assert_eq!(store.len(), 2);

    let error = store.add(&[vec![1.0, 2.0, 3.0]]).expect_err("wrong dimension");
    assert!(matches!(
        error,
        RagError::DimensionMismatch {
            expected: 2,
            actual: 3
        }
    ));
    assert_eq!(store.len(), 2);
}

#[test]
fn vectors_are_normalized_on_insert() {
    let mut store = FlatStore::new();
    store.add(&[vec![3.0, 4.0]]).expect("valid vector");

    let stored = store.vector(0).expect("slot 0");
    assert_close(stored[0], 0.6);
    assert_close(stored[1], 0.8);
    assert!(store.vector(1).is_none());
}

#[test]
fn mixed_dimensions_in_one_batch_are_rejected() {
    let mut store = FlatStore::new();
    let error = store
        .add(&[vec![1.0, 0.0], vec![1.0, 0.0, 0.0]])
        .expect_err("mixed batch");

    assert!(matches!(error, RagError::DimensionMismatch { .. }));
    assert!(store.is_empty());
    assert_eq!(store.dimension(), None);
}

#[test]
fn zero_vector_rejects_whole_batch() {
    let mut store = FlatStore::new();
    let error = store
        .add(&[vec![1.0, 0.0], vec![0.0, 0.0]])
        .expect_err("zero vector");

    assert!(matches!(error, RagError::InvalidRequest(_)));
    assert!(store.is_empty());
}

#[test]
fn search_ranks_by_inner_product() {
    let mut store = FlatStore::new();
    store
        .add(&[vec![1.0, 0.0], vec![0.0, 1.0], vec![1.0, 1.0]])
        .expect("valid vectors");

    let query = l2_normalize(&[1.0, 0.2]).expect("query");
    let hits = store.search(&query, 2);

    assert_eq!(hits.len(), 2);
    assert_eq!(hits[0].0, 0);
    assert_eq!(hits[1].0, 2);
    assert!(hits[0].1 > hits[1].1);
}

#[test]
fn ties_break_by_slot() {
    let mut store = FlatStore::new();
    store
        .add(&[vec![0.0, 1.0], vec![1.0, 0.0], vec![2.0, 0.0], vec![5.0, 0.0]])
        .expect("valid vectors");

    let hits = store.search(&[1.0, 0.0], 3);
    let slots: Vec<usize> = hits.iter().map(|(slot, _)| *slot).collect();

    assert_eq!(slots, vec![1, 2, 3]);
}

#[test]
fn search_handles_small_and_empty_stores() {
    let store = FlatStore::new();
    assert!(store.search(&[1.0, 0.0], 5).is_empty());

    let mut store = FlatStore::new();
    store.add(&[vec![1.0, 0.0]]).expect("valid vector");
    assert_eq!(store.search(&[1.0, 0.0], 5).len(), 1);
    assert!(store.search(&[1.0, 0.0], 0).is_empty());
    assert!(store.search(&[1.0, 0.0, 0.0], 5).is_empty());
}

#[test]
fn from_raw_validates_shape() {
    let store = FlatStore::from_raw(2, vec![1.0, 0.0, 0.0, 1.0]).expect("valid raw data");
    assert_eq!(store.len(), 2);

    assert!(matches!(
        FlatStore::from_raw(3, vec![1.0, 0.0]),
        Err(RagError::IndexCorruption(_))
    ));
    assert!(FlatStore::from_raw(0, Vec::new()).is_err());
}

#[test]
fn normalize_rejects_degenerate_input() {
    assert!(l2_normalize(&[]).is_none());
    assert!(l2_normalize(&[0.0, 0.0]).is_none());
    assert!(l2_normalize(&[f32::NAN, 1.0]).is_none());
}

#[test]
fn truncate_to_zero_releases_dimension() {
    let mut store = FlatStore::new();
    store
        .add(&[vec![1.0, 0.0], vec![0.0, 1.0]])
        .expect("valid vectors");

    store.truncate(1);
    assert_eq!(store.len(), 1);
    assert_eq!(store.dimension(), Some(2));

    store.truncate(0);
    assert!(store.is_empty());
    assert_eq!(store.dimension(), None);
}
