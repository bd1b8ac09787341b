//! Zoom-dependent render policy.
//!
//! Lower zoom levels show more of the map at once, so they get coarser geometry and
//! fewer features. Every tier table must stay monotonic: as zoom increases the
//! tolerance never grows and the feature cap never shrinks. Each tier also says how
//! long its payloads stay in memory; coarse views change less, so they live longer.

use std::{num::NonZeroUsize, time::Duration};

use serde::{Deserialize, Serialize};

use super::error::DomainError;

pub const MIN_ZOOM: u8 = 0;
pub const MAX_ZOOM: u8 = 22;

/// Simplification tolerance and feature cap applied to one request.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct RenderPolicy {
    pub tolerance: f64,
    pub max_features: NonZeroUsize,
    /// How long a payload rendered under this policy is kept in memory.
    pub memory_ttl: Duration,
}

/// One row of the tier table; applies from `min_zoom` until the next tier starts.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PolicyTier {
    pub min_zoom: u8,
    pub tolerance: f64,
    pub max_features: usize,
    /// Falls back to [`default_memory_ttl`] for `min_zoom`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_ttl_seconds: Option<u64>,
}

/// Validated, ascending tier table.
#[derive(Debug, Clone, PartialEq)]
pub struct ZoomPolicy {
    tiers: Vec<(u8, RenderPolicy)>,
}

impl ZoomPolicy {
    pub fn new(tiers: &[PolicyTier]) -> Result<Self, DomainError> {
        let Some(first) = tiers.first() else {
            return Err(DomainError::policy("at least one tier is required"));
        };
        if first.min_zoom != MIN_ZOOM {
            return Err(DomainError::policy(format!(
                "first tier must start at zoom {MIN_ZOOM}, found {}",
                first.min_zoom
            )));
        }

        let mut validated: Vec<(u8, RenderPolicy)> = Vec::with_capacity(tiers.len());
        for tier in tiers {
            if tier.min_zoom > MAX_ZOOM {
                return Err(DomainError::policy(format!(
                    "tier zoom {} exceeds {MAX_ZOOM}",
                    tier.min_zoom
                )));
            }
            if !tier.tolerance.is_finite() || tier.tolerance < 0.0 {
                return Err(DomainError::policy(format!(
                    "tolerance at zoom {} must be a finite non-negative number",
                    tier.min_zoom
                )));
            }
            let Some(max_features) = NonZeroUsize::new(tier.max_features) else {
                return Err(DomainError::policy(format!(
                    "max_features at zoom {} must be greater than zero",
                    tier.min_zoom
                )));
            };
            let memory_ttl = match tier.memory_ttl_seconds {
                Some(0) => {
                    return Err(DomainError::policy(format!(
                        "memory_ttl_seconds at zoom {} must be greater than zero",
                        tier.min_zoom
                    )));
                }
                Some(seconds) => Duration::from_secs(seconds),
                None => default_memory_ttl(tier.min_zoom),
            };

            if let Some((prev_zoom, prev)) = validated.last() {
                if tier.min_zoom <= *prev_zoom {
                    return Err(DomainError::policy("tiers must be sorted by ascending zoom"));
                }
                if tier.tolerance > prev.tolerance {
                    return Err(DomainError::policy(format!(
                        "tolerance grows between zoom {prev_zoom} and {}",
                        tier.min_zoom
                    )));
                }
                if max_features < prev.max_features {
                    return Err(DomainError::policy(format!(
                        "max_features shrinks between zoom {prev_zoom} and {}",
                        tier.min_zoom
                    )));
                }
            }

            validated.push((
                tier.min_zoom,
                RenderPolicy {
                    tolerance: tier.tolerance,
                    max_features,
                    memory_ttl,
                },
            ));
        }

        Ok(Self { tiers: validated })
    }

    /// Clamp a requested zoom into the supported range.
    pub fn clamp_zoom(zoom: i64) -> u8 {
        zoom.clamp(i64::from(MIN_ZOOM), i64::from(MAX_ZOOM)) as u8
    }

    /// Policy for `zoom`, clamped to `MIN_ZOOM..=MAX_ZOOM`.
    pub fn resolve(&self, zoom: i64) -> RenderPolicy {
        let zoom = Self::clamp_zoom(zoom);
        self.tiers
            .iter()
            .rev()
            .find(|(min_zoom, _)| *min_zoom <= zoom)
            .map(|(_, policy)| *policy)
            .unwrap_or(self.tiers[0].1)
    }

    pub fn tiers(&self) -> impl Iterator<Item = PolicyTier> + '_ {
        self.tiers.iter().map(|(min_zoom, policy)| PolicyTier {
            min_zoom: *min_zoom,
            tolerance: policy.tolerance,
            max_features: policy.max_features.get(),
            memory_ttl_seconds: Some(policy.memory_ttl.as_secs()),
        })
    }
}

/// Memory lifetime for payloads of a tier starting at `zoom`.
pub fn default_memory_ttl(zoom: u8) -> Duration {
    let hours = match zoom {
        0..=7 => 24,
        8..=12 => 6,
        13..=15 => 2,
        _ => 1,
    };
    Duration::from_secs(hours * 60 * 60)
}

pub fn default_tiers() -> Vec<PolicyTier> {
    vec![
        PolicyTier {
            min_zoom: 0,
            tolerance: 0.01,
            max_features: 5_000,
            memory_ttl_seconds: None,
        },
        PolicyTier {
            min_zoom: 11,
            tolerance: 0.005,
            max_features: 10_000,
            memory_ttl_seconds: None,
        },
        PolicyTier {
            min_zoom: 13,
            tolerance: 0.002,
            max_features: 15_000,
            memory_ttl_seconds: None,
        },
        PolicyTier {
            min_zoom: 15,
            tolerance: 0.001,
            max_features: 25_000,
            memory_ttl_seconds: None,
        },
    ]
}

impl Default for ZoomPolicy {
    fn default() -> Self {
        let tiers = default_tiers()
            .into_iter()
            .map(|tier| {
                (
                    tier.min_zoom,
                    RenderPolicy {
                        tolerance: tier.tolerance,
                        max_features: NonZeroUsize::new(tier.max_features)
                            .unwrap_or(NonZeroUsize::MIN),
                        memory_ttl: default_memory_ttl(tier.min_zoom),
                    },
                )
            })
            .collect();
        Self { tiers }
    }
}
