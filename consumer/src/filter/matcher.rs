use thiserror::Error;

use super::orb::{Descriptor, DescriptorSet};

#[derive(Debug, Error)]
pub enum MatchError {
    #[error("cannot match against an empty descriptor set")]
    EmptySet,
}

/// Index and distance of the nearest descriptor by Hamming distance.
/// Ties go to the lowest index.
fn nearest(query: &Descriptor, candidates: &[Descriptor]) -> Option<(usize, u32)> {
    let mut best: Option<(usize, u32)> = None;
    for (i, candidate) in candidates.iter().enumerate() {
        let d = query.hamming(candidate);
        if best.map_or(true, |(_, best_d)| d < best_d) {
            best = Some((i, d));
        }
    }
    best
}

/// Number of mutual nearest-neighbour pairs between two descriptor lists
/// whose distance is at most `max_distance`.
///
/// A pair (i, j) counts when j is the best match for `query[i]` in `train`
/// and i is the best match for `train[j]` in `query`.
pub fn cross_check_matches(query: &[Descriptor], train: &[Descriptor], max_distance: u32) -> usize {
    let backward: Vec<Option<usize>> = train
        .iter()
        .map(|d| nearest(d, query).map(|(i, _)| i))
        .collect();
    query
        .iter()
        .enumerate()
        .filter(|(i, d)| match nearest(d, train) {
            Some((j, distance)) => distance <= max_distance && backward[j] == Some(*i),
            None => false,
        })
        .count()
}

/// Fraction of the smaller set that found a mutual match in the other.
pub fn match_ratio(
    frame: &DescriptorSet,
    reference: &DescriptorSet,
    max_distance: u32,
) -> Result<f64, MatchError> {
    let smaller = frame.len().min(reference.len());
    if smaller == 0 {
        return Err(MatchError::EmptySet);
    }
    let matches = cross_check_matches(frame.as_slice(), reference.as_slice(), max_distance);
    Ok(matches as f64 / smaller as f64)
}
