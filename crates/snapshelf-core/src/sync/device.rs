//! Device identity
//!
//! Every installation gets a stable id on first use, plus a name the user can
//! change. The id goes into every exported envelope; the last-sync time is
//! updated after each completed import.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::storage::{KeyValueStore, get_json, set_json};

/// Storage key for the persisted identity
pub const IDENTITY_KEY: &str = "device/identity";

/// Longest accepted device name, in characters
pub const MAX_DEVICE_NAME_LEN: usize = 64;

/// Identity of this installation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceIdentity {
    /// Immutable once created
    pub device_id: String,
    pub device_name: String,
    /// Epoch milliseconds of the last completed import
    #[serde(default)]
    pub last_sync_timestamp: Option<i64>,
}

/// Host name of this machine, or a generic fallback
pub fn default_device_name() -> String {
    let host = gethostname::gethostname().to_string_lossy().trim().to_string();
    if host.is_empty() {
        "Snapshelf device".to_string()
    } else {
        host.chars().take(MAX_DEVICE_NAME_LEN).collect()
    }
}

fn normalize_name(name: &str) -> Result<String> {
    let name = name.trim();
    if name.is_empty() {
        return Err(Error::InvalidInput("Device name cannot be empty".to_string()));
    }
    if name.chars().count() > MAX_DEVICE_NAME_LEN {
        return Err(Error::InvalidInput(format!(
            "Device name is longer than {} characters",
            MAX_DEVICE_NAME_LEN
        )));
    }
    Ok(name.to_string())
}

/// Issues and persists the device identity
#[derive(Clone)]
pub struct DeviceIdentityManager {
    store: Arc<dyn KeyValueStore>,
    default_name: Option<String>,
}

impl DeviceIdentityManager {
    /// Create a manager over `store`
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self {
            store,
            default_name: None,
        }
    }

    /// Use `name` instead of the host name when creating a new identity
    pub fn with_default_name(mut self, name: impl Into<String>) -> Self {
        self.default_name = Some(name.into());
        self
    }

    /// Read the identity without creating one
    pub async fn current(&self) -> Result<Option<DeviceIdentity>> {
        get_json(self.store.as_ref(), IDENTITY_KEY).await
    }

    /// Read the identity, creating and persisting it on first use
    pub async fn load_or_create(&self) -> Result<DeviceIdentity> {
        if let Some(identity) = self.current().await? {
            return Ok(identity);
        }

        let device_name = match &self.default_name {
            Some(name) => normalize_name(name)?,
            None => default_device_name(),
        };
        let identity = DeviceIdentity {
            device_id: Uuid::new_v4().to_string(),
            device_name,
            last_sync_timestamp: None,
        };
        set_json(self.store.as_ref(), IDENTITY_KEY, &identity).await?;

        info!(
            device_id = %identity.device_id,
            device_name = %identity.device_name,
            "Created device identity"
        );
        Ok(identity)
    }

    /// Change the user-visible device name
    pub async fn rename(&self, name: &str) -> Result<DeviceIdentity> {
        let device_name = normalize_name(name)?;
        let mut identity = self.load_or_create().await?;
        identity.device_name = device_name;
        set_json(self.store.as_ref(), IDENTITY_KEY, &identity).await?;

        info!(device_id = %identity.device_id, device_name = %identity.device_name, "Device renamed");
        Ok(identity)
    }

    /// Record a completed import
    pub async fn record_sync(&self, timestamp: i64) -> Result<DeviceIdentity> {
        let mut identity = self.load_or_create().await?;
        identity.last_sync_timestamp = Some(timestamp);
        set_json(self.store.as_ref(), IDENTITY_KEY, &identity).await?;
        Ok(identity)
    }
}
