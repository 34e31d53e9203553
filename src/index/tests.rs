use super::*;

fn ids(hits: &[SearchHit]) -> Vec<usize> {
    hits.iter().map(|h| h.id).collect()
}

fn sample() -> Vec<Embedding> {
    vec![
        vec![1.0, 0.0, 0.0],
        vec![0.0, 1.0, 0.0],
        vec![0.7, 0.7, 0.0],
        vec![0.0, 0.0, 5.0],
    ]
}

#[test]
fn build_rejects_empty_input() {
    let result = FlatIndex::build(&[], Metric::InnerProduct);
    assert!(matches!(result, Err(RagError::Index(_))));
}

#[test]
fn build_rejects_zero_dimensions() {
    let result = FlatIndex::build(&[Vec::new()], Metric::Euclidean);
    assert!(matches!(result, Err(RagError::Index(_))));
}

#[test]
fn build_rejects_inconsistent_rows() {
    let result = FlatIndex::build(&[vec![1.0, 0.0], vec![1.0]], Metric::InnerProduct);
    assert!(matches!(result, Err(RagError::Index(msg)) if msg.contains("row 1")));
}

#[test]
fn build_reports_shape() {
    let index = FlatIndex::build(&sample(), Metric::InnerProduct).expect("index builds");
    assert_eq!(index.len(), 4);
    assert_eq!(index.dimension(), 3);
    assert_eq!(index.metric(), Metric::InnerProduct);
    assert!(!index.is_empty());
}

#[test]
fn inner_product_ranks_by_cosine() {
    let index = FlatIndex::build(&sample(), Metric::InnerProduct).expect("index builds");

    // Magnitude does not matter once both sides are normalized
    let hits = index.search(&[10.0, 0.0, 0.0], 4).expect("search succeeds");

    assert_eq!(ids(&hits), vec![0, 2, 1, 3]);
    assert!((hits[0].score - 1.0).abs() < 1e-6);
    assert!((hits[1].score - std::f32::consts::FRAC_1_SQRT_2).abs() < 1e-4);
    for hit in &hits {
        assert!((-1.0..=1.0).contains(&hit.score));
    }
}

#[test]
fn inner_product_matches_scaled_row() {
    let index = FlatIndex::build(&sample(), Metric::InnerProduct).expect("index builds");

    let hits = index.search(&[0.0, 0.0, 1.0], 1).expect("search succeeds");
    assert_eq!(ids(&hits), vec![3]);
    assert!((hits[0].score - 1.0).abs() < 1e-6);
}

#[test]
fn euclidean_ranks_lowest_distance_first() {
    let index = FlatIndex::build(&sample(), Metric::Euclidean).expect("index builds");

    let hits = index.search(&[0.0, 0.0, 4.0], 2).expect("search succeeds");

    // Row 2 is slightly closer than rows 0 and 1 (16.98 vs 17 squared)
    assert_eq!(ids(&hits), vec![3, 2]);
    assert!((hits[0].score - 1.0).abs() < 1e-6);
    assert!(hits[0].score <= hits[1].score);
}

#[test]
fn euclidean_keeps_raw_vectors() {
    let index = FlatIndex::build(&[vec![3.0, 4.0]], Metric::Euclidean).expect("index builds");
    let hits = index.search(&[0.0, 0.0], 1).expect("search succeeds");
    assert!((hits[0].score - 5.0).abs() < 1e-6);
}

#[test]
fn k_is_capped_at_index_size() {
    let index = FlatIndex::build(&sample(), Metric::InnerProduct).expect("index builds");

    let hits = index.search(&[1.0, 1.0, 1.0], 100).expect("search succeeds");
    assert_eq!(hits.len(), 4);

    let mut seen = ids(&hits);
    seen.sort_unstable();
    seen.dedup();
    assert_eq!(seen.len(), 4);
}

#[test]
fn zero_k_returns_nothing() {
    let index = FlatIndex::build(&sample(), Metric::InnerProduct).expect("index builds");
    let hits = index.search(&[1.0, 0.0, 0.0], 0).expect("search succeeds");
    assert!(hits.is_empty());
}

#[test]
fn query_dimension_must_match() {
    let index = FlatIndex::build(&sample(), Metric::InnerProduct).expect("index builds");
    let result = index.search(&[1.0, 0.0], 1);
    assert!(matches!(result, Err(RagError::Index(_))));
}

#[test]
fn ties_go_to_lower_id() {
    let rows = vec![vec![0.0, 1.0], vec![1.0, 0.0], vec![1.0, 0.0], vec![2.0, 0.0]];
    let index = FlatIndex::build(&rows, Metric::InnerProduct).expect("index builds");

    let hits = index.search(&[1.0, 0.0], 3).expect("search succeeds");
    assert_eq!(ids(&hits), vec![1, 2, 3]);
}

#[test]
fn search_is_deterministic() {
    let index = FlatIndex::build(&sample(), Metric::InnerProduct).expect("index builds");
    let query = [0.3, 0.9, 0.1];

    let first = index.search(&query, 3).expect("search succeeds");
    let second = index.search(&query, 3).expect("search succeeds");
    assert_eq!(first, second);
}

#[test]
fn zero_vectors_are_left_alone() {
    let mut vector = vec![0.0, 0.0];
    l2_normalize(&mut vector);
    assert_eq!(vector, vec![0.0, 0.0]);

    let mut vector = vec![3.0, 4.0];
    l2_normalize(&mut vector);
    assert!((vector[0] - 0.6).abs() < 1e-6);
    assert!((vector[1] - 0.8).abs() < 1e-6);
}

#[test]
fn metric_parses_aliases() {
    assert_eq!("inner_product".parse::<Metric>().ok(), Some(Metric::InnerProduct));
    assert_eq!("Cosine".parse::<Metric>().ok(), Some(Metric::InnerProduct));
    assert_eq!(" l2 ".parse::<Metric>().ok(), Some(Metric::Euclidean));
    assert!(matches!("manhattan".parse::<Metric>(), Err(RagError::Config(_))));
}

#[test]
fn metric_display_round_trips() {
    for metric in [Metric::InnerProduct, Metric::Euclidean] {
        assert_eq!(metric.to_string().parse::<Metric>().ok(), Some(metric));
        assert_eq!(Metric::from_tag(metric.tag()), Some(metric));
    }
    assert_eq!(Metric::from_tag(7), None);
}
