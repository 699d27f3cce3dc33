use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: Uuid,
    pub name: String,
    #[serde(skip_serializing)]
    pub access_token: String,
    /// Credential presented to the payment gateway on the user's behalf.
    #[serde(skip_serializing)]
    pub payment_token: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl User {
    pub fn new(name: String, access_token: String, payment_token: Option<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name,
            access_token,
            payment_token,
            created_at: Utc::now(),
        }
    }
}
