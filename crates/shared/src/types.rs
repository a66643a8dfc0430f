//! Types shared across crates

use serde::{Deserialize, Serialize};

/// Plan status stored on a user's profile
///
/// `Free` is the default; a completed one-off purchase moves the profile to
/// `Paid`, a completed subscription checkout to `Subscriber`. Subscription
/// cancellation resets the profile to `Free`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanStatus {
    #[default]
    Free,
    Paid,
    Subscriber,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown plan status: {0}")]
pub struct UnknownPlanStatus(pub String);

impl PlanStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PlanStatus::Free => "free",
            PlanStatus::Paid => "paid",
            PlanStatus::Subscriber => "subscriber",
        }
    }

    pub fn is_paid(&self) -> bool {
        !matches!(self, PlanStatus::Free)
    }
}

impl std::fmt::Display for PlanStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for PlanStatus {
    type Err = UnknownPlanStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "free" => Ok(PlanStatus::Free),
            "paid" => Ok(PlanStatus::Paid),
            "subscriber" => Ok(PlanStatus::Subscriber),
            other => Err(UnknownPlanStatus(other.to_string())),
        }
    }
}
