//! Deterministic feature sampling.

use crate::domain::feature::Feature;

#[derive(Debug, Clone, PartialEq)]
pub struct Limited {
    pub features: Vec<Feature>,
    /// Count before sampling.
    pub total_count: usize,
}

/// Keep at most `max_features`, spread evenly across the layer.
///
/// Inputs within the cap are returned untouched. Otherwise features are ordered by id
/// and index `floor(i * total / max)` is kept for every `i` in `0..max`, so the same
/// input always yields the same sample regardless of read order.
pub fn limit(mut features: Vec<Feature>, max_features: usize) -> Limited {
    let total = features.len();
    if total <= max_features {
        return Limited {
            features,
            total_count: total,
        };
    }

    features.sort_by(|a, b| a.id.cmp(&b.id));

    let mut picked = Vec::with_capacity(max_features);
    let mut next = 0usize;
    for (index, feature) in features.into_iter().enumerate() {
        if picked.len() == max_features {
            break;
        }
        if index == stride_index(next, total, max_features) {
            picked.push(feature);
            next += 1;
        }
    }

    Limited {
        features: picked,
        total_count: total,
    }
}

fn stride_index(i: usize, total: usize, max: usize) -> usize {
    ((i as u128 * total as u128) / max as u128) as usize
}
