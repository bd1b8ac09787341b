use serde::Serialize;

use super::layer::LayerId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgressPhase {
    Reading,
    Simplifying,
    Limiting,
    Done,
}

impl ProgressPhase {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Reading => "reading",
            Self::Simplifying => "simplifying",
            Self::Limiting => "limiting",
            Self::Done => "done",
        }
    }
}

/// Best-effort notification emitted while a layer payload is generated.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProgressEvent {
    pub layer_id: LayerId,
    pub phase: ProgressPhase,
    pub percent: u8,
    pub loaded_features: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_features: Option<u64>,
}

impl ProgressEvent {
    /// Reading progress; percent is derived when the total is known.
    ///
    /// Reading maps onto 0..=80 so the later phases still have room to advance.
    pub fn reading(layer_id: LayerId, loaded: u64, total: Option<u64>) -> Self {
        let percent = match total {
            Some(total) if total > 0 => ((loaded.min(total) * 80) / total) as u8,
            _ => 0,
        };
        Self {
            layer_id,
            phase: ProgressPhase::Reading,
            percent,
            loaded_features: loaded,
            total_features: total,
        }
    }

    pub fn phase(layer_id: LayerId, phase: ProgressPhase, loaded: u64, total: Option<u64>) -> Self {
        let percent = match phase {
            ProgressPhase::Reading => 0,
            ProgressPhase::Simplifying => 85,
            ProgressPhase::Limiting => 95,
            ProgressPhase::Done => 100,
        };
        Self {
            layer_id,
            phase,
            percent,
            loaded_features: loaded,
            total_features: total,
        }
    }
}
