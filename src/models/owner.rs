use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Owner {
    pub id: Uuid,
    pub name: String,
    #[serde(skip_serializing)]
    pub access_token: String,
    /// Presented when registering a chair under this owner.
    #[serde(skip_serializing)]
    pub chair_register_token: String,
    pub created_at: DateTime<Utc>,
}

impl Owner {
    pub fn new(name: String, access_token: String, chair_register_token: String) -> Self {
        Self {
            id: Uuid::new_v4(),
            name,
            access_token,
            chair_register_token,
            created_at: Utc::now(),
        }
    }
}
