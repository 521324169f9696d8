use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub enum StoreStatus {
    Provisioning,
    Ready,
    Failed,
    Deleting,
    Deleted,
}

impl StoreStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            StoreStatus::Provisioning => "Provisioning",
            StoreStatus::Ready => "Ready",
            StoreStatus::Failed => "Failed",
            StoreStatus::Deleting => "Deleting",
            StoreStatus::Deleted => "Deleted",
        }
    }
}

impl std::str::FromStr for StoreStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Provisioning" => Ok(StoreStatus::Provisioning),
            "Ready" => Ok(StoreStatus::Ready),
            "Failed" => Ok(StoreStatus::Failed),
            "Deleting" => Ok(StoreStatus::Deleting),
            "Deleted" => Ok(StoreStatus::Deleted),
            other => Err(anyhow::anyhow!("unknown store status '{}'", other)),
        }
    }
}

/// A provisioned workload instance owned by a tenant.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Store {
    pub id: String,
    pub tenant_id: String,
    pub namespace: String,
    pub host: String,
    pub status: StoreStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provisioning_started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ready_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deletion_started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deleted_at: Option<DateTime<Utc>>,
}

/// Response body for `DELETE /stores/{id}`.
#[derive(Debug, Serialize)]
pub struct DeleteResponse {
    pub message: String,
    pub store: Store,
}

/// Response body for `GET /health`.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub database: &'static str,
}

/// Options reserved for future use; the body is accepted but currently ignored.
#[derive(Debug, Default, Deserialize)]
pub struct CreateStoreRequest {}

/// Row shape returned by the audit maintenance/gate paths; not exposed over HTTP.
#[derive(Debug, Clone)]
pub struct AuditEntry {
    pub tenant_id: String,
    pub action: String,
    pub resource_type: String,
    pub resource_id: String,
    pub status: String,
    pub details: serde_json::Value,
    pub ip_address: Option<String>,
}
