//! Brute-force vector ranking: cosine top-k and salience-weighted top-k.
//!
//! Salience combines similarity with a logarithmic reinforcement factor and
//! an exponential recency half-life, so frequently reinforced, recently
//! touched memories outrank stale one-offs of equal similarity. Because the
//! score is not a pure distance function it is always computed in process,
//! even when a storage backend can serve plain similarity natively.

use chrono::{DateTime, Utc};
use uuid::Uuid;

const SECONDS_PER_DAY: f64 = 86_400.0;

/// Cosine similarity between two vectors, in `[-1, 1]`.
///
/// Mismatched dimensionalities and zero vectors score 0.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    let denom = norm_a * norm_b;
    if denom == 0.0 {
        return 0.0;
    }
    dot / denom
}

/// Logarithmic reinforcement factor: `ln(count + 1)`.
///
/// The logarithm keeps a dominant fact from crowding out every other result.
pub fn reinforcement_factor(reinforcement_count: u64) -> f64 {
    ((reinforcement_count + 1) as f64).ln()
}

/// Exponential recency factor with half-life decay.
///
/// After `half_life_days` the factor is 0.5; unknown recency gets a fixed
/// neutral 0.5.
pub fn recency_factor(days_since_reinforced: Option<f64>, half_life_days: f64) -> f64 {
    match days_since_reinforced {
        None => 0.5,
        Some(days) => (-std::f64::consts::LN_2 * days / half_life_days).exp(),
    }
}

/// Salience score: `similarity * ln(count + 1) * recency_decay`.
pub fn salience_score(
    similarity: f32,
    reinforcement_count: u64,
    last_reinforced_at: Option<DateTime<Utc>>,
    half_life_days: f64,
) -> f32 {
    let days = last_reinforced_at.map(|at| {
        let elapsed = Utc::now().signed_duration_since(at);
        elapsed.num_milliseconds() as f64 / 1_000.0 / SECONDS_PER_DAY
    });
    let score = f64::from(similarity)
        * reinforcement_factor(reinforcement_count)
        * recency_factor(days, half_life_days);
    score as f32
}

/// Pure cosine top-k over an id/embedding corpus.
///
/// Entries without an embedding are skipped. `k` larger than the corpus
/// returns every row, sorted. Ties keep insertion order for determinism.
pub fn cosine_topk(
    query: &[f32],
    corpus: impl IntoIterator<Item = (Uuid, Option<Vec<f32>>)>,
    k: usize,
) -> Vec<(Uuid, f32)> {
    let mut scored: Vec<(Uuid, f32)> = corpus
        .into_iter()
        .filter_map(|(id, vec)| vec.map(|v| (id, cosine_similarity(query, &v))))
        .collect();
    sort_and_truncate(&mut scored, k);
    scored
}

/// A salience-ranking candidate: embedding plus reinforcement metadata.
#[derive(Debug, Clone)]
pub struct SalienceCandidate {
    pub id: Uuid,
    pub embedding: Option<Vec<f32>>,
    pub reinforcement_count: u64,
    pub last_reinforced_at: Option<DateTime<Utc>>,
}

/// Top-k retrieval using salience-aware scoring.
pub fn cosine_topk_salience(
    query: &[f32],
    corpus: impl IntoIterator<Item = SalienceCandidate>,
    k: usize,
    half_life_days: f64,
) -> Vec<(Uuid, f32)> {
    let mut scored: Vec<(Uuid, f32)> = corpus
        .into_iter()
        .filter_map(|candidate| {
            let embedding = candidate.embedding?;
            let similarity = cosine_similarity(query, &embedding);
            Some((
                candidate.id,
                salience_score(
                    similarity,
                    candidate.reinforcement_count,
                    candidate.last_reinforced_at,
                    half_life_days,
                ),
            ))
        })
        .collect();
    sort_and_truncate(&mut scored, k);
    scored
}

fn sort_and_truncate(scored: &mut Vec<(Uuid, f32)>, k: usize) {
    // Stable sort: equal scores keep insertion order.
    scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
    scored.truncate(k);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn uid(n: u128) -> Uuid {
        Uuid::from_u128(n)
    }

    #[test]
    fn cosine_identical_vectors_score_one() {
        let v = vec![1.0, 2.0, 3.0];
        assert!((cosine_similarity(&v, &v) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn cosine_orthogonal_vectors_score_zero() {
        assert!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]).abs() < 1e-6);
    }

    #[test]
    fn cosine_mismatched_dimensions_score_zero() {
        assert_eq!(cosine_similarity(&[1.0, 2.0], &[1.0, 2.0, 3.0]), 0.0);
    }

    #[test]
    fn topk_empty_corpus_returns_empty() {
        assert!(cosine_topk(&[1.0, 0.0], Vec::new(), 5).is_empty());
    }

    #[test]
    fn topk_larger_k_returns_all_sorted() {
        let corpus = vec![
            (uid(1), Some(vec![0.0, 1.0])),
            (uid(2), Some(vec![1.0, 0.0])),
            (uid(3), None),
        ];
        let hits = cosine_topk(&[1.0, 0.0], corpus, 10);
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].0, uid(2));
        assert_eq!(hits[1].0, uid(1));
    }

    #[test]
    fn topk_ties_keep_insertion_order() {
        let corpus = vec![
            (uid(1), Some(vec![1.0, 0.0])),
            (uid(2), Some(vec![1.0, 0.0])),
        ];
        let hits = cosine_topk(&[1.0, 0.0], corpus, 2);
        assert_eq!(hits[0].0, uid(1));
        assert_eq!(hits[1].0, uid(2));
    }

    #[test]
    fn recency_factor_unknown_is_exactly_half() {
        assert_eq!(recency_factor(None, 30.0), 0.5);
    }

    #[test]
    fn recency_factor_halves_at_half_life() {
        assert!((recency_factor(Some(30.0), 30.0) - 0.5).abs() < 1e-9);
    }

    #[test]
    fn reinforcement_factor_single_count_is_ln_two() {
        assert!((reinforcement_factor(1) - std::f64::consts::LN_2).abs() < 1e-12);
    }

    #[test]
    fn salience_prefers_reinforced_memory_over_exact_match() {
        // B at cosine 0.9 with 10 reinforcements beats A at cosine 1.0 with
        // one: 0.9 * ln(11) > 1.0 * ln(2).
        let now = Utc::now();
        let query = vec![1.0, 0.0];
        let corpus = vec![
            SalienceCandidate {
                id: uid(1),
                embedding: Some(vec![1.0, 0.0]),
                reinforcement_count: 1,
                last_reinforced_at: Some(now),
            },
            SalienceCandidate {
                id: uid(2),
                embedding: Some(vec![0.9, 0.43589]),
                reinforcement_count: 10,
                last_reinforced_at: Some(now),
            },
        ];
        let hits = cosine_topk_salience(&query, corpus, 2, 30.0);
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].0, uid(2));
        assert_eq!(hits[1].0, uid(1));
    }

    #[test]
    fn salience_skips_missing_embeddings() {
        let corpus = vec![SalienceCandidate {
            id: uid(1),
            embedding: None,
            reinforcement_count: 5,
            last_reinforced_at: None,
        }];
        assert!(cosine_topk_salience(&[1.0], corpus, 5, 30.0).is_empty());
    }
}
