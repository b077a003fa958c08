//! Fulfillment record

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FulfillmentState {
    /// Recorded, pipeline not started
    Pending,
    /// Pipeline running
    Downloading,
    /// All artifacts present and the license validated
    Completed,
    Failed,
    /// Stopped by the caller
    Cancelled,
}

impl FulfillmentState {
    pub fn as_str(&self) -> &'static str {
        match self {
            FulfillmentState::Pending => "pending",
            FulfillmentState::Downloading => "downloading",
            FulfillmentState::Completed => "completed",
            FulfillmentState::Failed => "failed",
            FulfillmentState::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            FulfillmentState::Completed | FulfillmentState::Failed | FulfillmentState::Cancelled
        )
    }

    pub fn can_transition_to(&self, target: FulfillmentState) -> bool {
        match (self, target) {
            (FulfillmentState::Pending, FulfillmentState::Downloading) => true,
            (FulfillmentState::Pending, FulfillmentState::Cancelled) => true,
            (FulfillmentState::Pending, FulfillmentState::Failed) => true,
            (FulfillmentState::Downloading, t) => t.is_terminal(),
            _ => false,
        }
    }
}

impl std::fmt::Display for FulfillmentState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for FulfillmentState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pending" => Ok(FulfillmentState::Pending),
            "downloading" => Ok(FulfillmentState::Downloading),
            "completed" => Ok(FulfillmentState::Completed),
            "failed" => Ok(FulfillmentState::Failed),
            "cancelled" => Ok(FulfillmentState::Cancelled),
            _ => Err(format!("Unknown fulfillment state: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FulfillmentRecord {
    pub id: String,
    pub isbn: String,
    pub vault_id: String,
    pub book_dir: String,
    pub state: FulfillmentState,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl FulfillmentRecord {
    pub fn new(isbn: String, vault_id: String, book_dir: String) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            isbn,
            vault_id,
            book_dir,
            state: FulfillmentState::Pending,
            error: None,
            created_at: Utc::now(),
            completed_at: None,
        }
    }
}
