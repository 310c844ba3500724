/// Reciprocal-Rank-Fusion constant; ranks are 1-based.
pub const RRF_K: f32 = 60.0;

pub const fn clamp_unit(value: f32) -> f32 {
    value.clamp(0.0, 1.0)
}

/// RRF contribution of one engine's rank (1-based).
pub fn rrf_contribution(rank: usize) -> f32 {
    1.0 / (RRF_K + rank as f32)
}

/// Min-max normalize into [0,1] within one engine's returned set.
/// A constant set normalizes to all-ones; non-finite inputs become zero.
pub fn min_max_normalize(scores: &[f32]) -> Vec<f32> {
    if scores.is_empty() {
        return Vec::new();
    }

    let mut min = f32::MAX;
    let mut max = f32::MIN;

    for s in scores {
        if !s.is_finite() {
            continue;
        }
        if *s < min {
            min = *s;
        }
        if *s > max {
            max = *s;
        }
    }

    if !min.is_finite() || !max.is_finite() {
        return scores.iter().map(|_| 0.0).collect();
    }

    if (max - min).abs() < f32::EPSILON {
        return vec![1.0; scores.len()];
    }

    scores
        .iter()
        .map(|score| {
            if score.is_finite() {
                clamp_unit((score - min) / (max - min))
            } else {
                0.0
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_empty_is_empty() {
        assert!(min_max_normalize(&[]).is_empty());
    }

    #[test]
    fn normalize_constant_set_is_all_ones() {
        assert_eq!(min_max_normalize(&[0.4, 0.4, 0.4]), vec![1.0, 1.0, 1.0]);
    }

    #[test]
    fn normalize_spreads_to_unit_interval() {
        let normalized = min_max_normalize(&[1.0, 3.0, 2.0]);
        assert!((normalized[0] - 0.0).abs() < f32::EPSILON);
        assert!((normalized[1] - 1.0).abs() < f32::EPSILON);
        assert!((normalized[2] - 0.5).abs() < f32::EPSILON);
    }

    #[test]
    fn normalize_zeroes_non_finite_values() {
        let normalized = min_max_normalize(&[f32::NAN, 1.0, 2.0]);
        assert!((normalized[0] - 0.0).abs() < f32::EPSILON);
    }

    #[test]
    fn rrf_decreases_with_rank() {
        assert!(rrf_contribution(1) > rrf_contribution(2));
        assert!((rrf_contribution(1) - 1.0 / 61.0).abs() < f32::EPSILON);
    }
}
