//! Second stage: score shortlisted codes against the dense query.

use bpr_core::CandidateIndex;
use bpr_embeddings::{EmbeddingError, EmbeddingResult};

/// Re-rank a Hamming shortlist by `dense_query · unpack(code)`.
///
/// Each shortlisted code is reconstructed from `index` and compared in its
/// ±1 form. The sort is stable and descending, so equal scores keep their
/// shortlist order (ascending Hamming distance, then ascending id).
///
/// # Errors
/// - `Index(NotFound)` if a shortlisted id is no longer in the index
/// - `ShapeMismatch` if `dense_query` and the index disagree on width
pub fn rerank<I>(
    dense_query: &[f32],
    shortlist: &[(u64, u32)],
    index: &I,
) -> EmbeddingResult<Vec<(u64, f32)>>
where
    I: CandidateIndex + ?Sized,
{
    let mut scored = Vec::with_capacity(shortlist.len());
    for &(id, _) in shortlist {
        let code = index.reconstruct(id)?;
        let score = code
            .signed_dot(dense_query)
            .ok_or_else(|| EmbeddingError::shape("dense query width", code.bits(), dense_query.len()))?;
        scored.push((id, score));
    }
    scored.sort_by(|a, b| b.1.total_cmp(&a.1));
    Ok(scored)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bpr_core::{BinaryCode, FlatHammingIndex};

    fn index() -> FlatHammingIndex {
        let mut index = FlatHammingIndex::new(4).unwrap();
        for (id, signs) in [
            (10u64, [1.0f32, 1.0, -1.0, -1.0]),
            (11, [1.0, -1.0, 1.0, -1.0]),
            (12, [-1.0, -1.0, 1.0, 1.0]),
        ] {
            index.insert(id, &BinaryCode::from_signs(&signs)).unwrap();
        }
        index
    }

    #[test]
    fn test_orders_by_dense_score() {
        let dense = [0.0f32, 0.0, 1.0, 1.0];
        let shortlist = [(10, 0), (11, 2), (12, 4)];
        let ranked = rerank(&dense, &shortlist, &index()).unwrap();
        let ids: Vec<u64> = ranked.iter().map(|(id, _)| *id).collect();
        assert_eq!(ids, vec![12, 11, 10]);
        assert_eq!(ranked[0].1, 2.0);
        assert_eq!(ranked[2].1, -2.0);
    }

    #[test]
    fn test_ties_keep_shortlist_order() {
        // Scores: id 10 → 0, id 11 → 0, id 12 → 0.
        let dense = [1.0f32, 1.0, 1.0, 1.0];
        let shortlist = [(12, 0), (10, 1), (11, 1)];
        let ranked = rerank(&dense, &shortlist, &index()).unwrap();
        let ids: Vec<u64> = ranked.iter().map(|(id, _)| *id).collect();
        assert_eq!(ids, vec![12, 10, 11]);
    }

    #[test]
    fn test_width_mismatch() {
        let err = rerank(&[1.0, 2.0], &[(10, 0)], &index()).unwrap_err();
        assert!(matches!(err, EmbeddingError::ShapeMismatch { .. }), "got {:?}", err);
    }

    #[test]
    fn test_missing_id() {
        let err = rerank(&[0.0; 4], &[(99, 0)], &index()).unwrap_err();
        assert!(matches!(err, EmbeddingError::Index(_)), "got {:?}", err);
    }
}
