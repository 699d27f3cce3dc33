use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum SettlementOutcome {
    Pending,
    /// The gateway accepted the payment request.
    Paid,
    /// The gateway rejected the request but its payment history shows the
    /// charge went through.
    Reconciled,
    /// Retries were exhausted without a definitive answer.
    Unresolved { last_error: String },
    /// The gateway history disagrees with the local completed-ride count.
    Diverged { expected: usize, actual: usize },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FareSettlement {
    pub ride_id: Uuid,
    pub fare: i64,
    pub outcome: SettlementOutcome,
    pub attempts: u32,
    pub created_at: DateTime<Utc>,
    pub settled_at: Option<DateTime<Utc>>,
}

impl FareSettlement {
    pub fn pending(ride_id: Uuid, fare: i64) -> Self {
        Self {
            ride_id,
            fare,
            outcome: SettlementOutcome::Pending,
            attempts: 0,
            created_at: Utc::now(),
            settled_at: None,
        }
    }

    pub fn is_settled(&self) -> bool {
        matches!(
            self.outcome,
            SettlementOutcome::Paid | SettlementOutcome::Reconciled
        )
    }
}
