//! Astra database operations.
//!
//! REST endpoints (relative to the DevOps base URL):
//! - GET    /databases
//! - POST   /databases
//! - GET    /databases/{id}
//! - POST   /databases/{id}/terminate | park | unpark | resize
//! - POST   /databases/{id}/keyspaces/{ks}
//! - DELETE /databases/{id}/keyspaces/{ks}
//! - POST   /databases/{id}/secureBundleURL
//! - GET | POST | DELETE /databases/{id}/access-list

use std::{fmt, path::Path, time::Duration};

use reqwest::{Method, StatusCode};
use serde::{Deserialize, Serialize};

use crate::astra_devops::{AstraDevopsClient, DevopsError, path_segment, to_json};

/// Lifecycle status of an Astra database.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DatabaseStatus {
    /// Ready to serve traffic.
    Active,
    /// Creation requested.
    Pending,
    /// Being prepared.
    Preparing,
    /// Prepared, not yet initialized.
    Prepared,
    /// Being initialized.
    Initializing,
    /// Being parked.
    Parking,
    /// Parked (classic tiers).
    Parked,
    /// Being unparked.
    Unparking,
    /// Being terminated.
    Terminating,
    /// Terminated.
    Terminated,
    /// Capacity change in progress.
    Resizing,
    /// Failed.
    Error,
    /// Under maintenance.
    Maintenance,
    /// Serverless database put to sleep.
    Hibernated,
    /// Going to sleep.
    Hibernating,
    /// Waking up.
    Resuming,
    /// Status not known to this SDK version.
    #[serde(other)]
    Unknown,
}

impl DatabaseStatus {
    /// Statuses a database never leaves on its own.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Terminated | Self::Error)
    }

    /// Wire name of the status.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Active => "ACTIVE",
            Self::Pending => "PENDING",
            Self::Preparing => "PREPARING",
            Self::Prepared => "PREPARED",
            Self::Initializing => "INITIALIZING",
            Self::Parking => "PARKING",
            Self::Parked => "PARKED",
            Self::Unparking => "UNPARKING",
            Self::Terminating => "TERMINATING",
            Self::Terminated => "TERMINATED",
            Self::Resizing => "RESIZING",
            Self::Error => "ERROR",
            Self::Maintenance => "MAINTENANCE",
            Self::Hibernated => "HIBERNATED",
            Self::Hibernating => "HIBERNATING",
            Self::Resuming => "RESUMING",
            Self::Unknown => "UNKNOWN",
        }
    }
}

impl fmt::Display for DatabaseStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Database as returned by the DevOps API.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Database {
    /// Database id (UUID).
    pub id: String,
    /// Owning organization.
    #[serde(default)]
    pub org_id: Option<String>,
    /// Owner user id.
    #[serde(default)]
    pub owner_id: Option<String>,
    /// Creation parameters.
    pub info: DatabaseInfo,
    /// Current status.
    pub status: DatabaseStatus,
    /// Storage statistics.
    #[serde(default)]
    pub storage: Option<DatabaseStorage>,
    /// Actions currently allowed.
    #[serde(default)]
    pub available_actions: Vec<String>,
    /// Status message.
    #[serde(default)]
    pub message: Option<String>,
    /// Stargate (REST/Document) endpoint.
    #[serde(default)]
    pub data_endpoint_url: Option<String>,
    /// GraphQL endpoint.
    #[serde(default)]
    pub graphql_url: Option<String>,
    /// Web CQL shell.
    #[serde(default)]
    pub cqlsh_url: Option<String>,
    /// Grafana dashboard.
    #[serde(default)]
    pub grafana_url: Option<String>,
}

/// Database creation parameters echoed by the API.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DatabaseInfo {
    /// Database name.
    #[serde(default)]
    pub name: Option<String>,
    /// Initial keyspace.
    #[serde(default)]
    pub keyspace: Option<String>,
    /// Cloud provider (AWS, GCP, AZURE).
    #[serde(default)]
    pub cloud_provider: Option<String>,
    /// Primary region.
    #[serde(default)]
    pub region: Option<String>,
    /// Tier (serverless, ...).
    #[serde(default)]
    pub tier: Option<String>,
    /// Capacity units (classic tiers).
    #[serde(default)]
    pub capacity_units: Option<u32>,
    /// Additional keyspaces.
    #[serde(default)]
    pub additional_keyspaces: Vec<String>,
    /// Datacenters of the database.
    #[serde(default)]
    pub datacenters: Vec<Datacenter>,
}

/// One datacenter (region) of a database.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Datacenter {
    /// Datacenter id (`<dbid>-1`).
    pub id: String,
    /// Datacenter name.
    #[serde(default)]
    pub name: Option<String>,
    /// Cloud provider.
    #[serde(default)]
    pub cloud_provider: Option<String>,
    /// Region.
    #[serde(default)]
    pub region: Option<String>,
    /// Datacenter status.
    #[serde(default)]
    pub status: Option<String>,
    /// Secure bundle URL for this datacenter.
    #[serde(default)]
    pub secure_bundle_url: Option<String>,
}

/// Storage statistics.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DatabaseStorage {
    /// Node count.
    #[serde(default)]
    pub node_count: Option<u32>,
    /// Replication factor.
    #[serde(default)]
    pub replication_factor: Option<u32>,
    /// Total storage in GB.
    #[serde(default)]
    pub total_storage: Option<u64>,
    /// Used storage in GB.
    #[serde(default)]
    pub used_storage: Option<u64>,
}

/// Payload for `POST /databases`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DatabaseCreationRequest {
    /// Database name.
    pub name: String,
    /// Initial keyspace.
    pub keyspace: String,
    /// Cloud provider (AWS, GCP, AZURE).
    pub cloud_provider: String,
    /// Region.
    pub region: String,
    /// Tier.
    pub tier: String,
    /// Capacity units.
    pub capacity_units: u32,
    /// Create a vector-enabled database.
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub db_type_vector: bool,
}

impl DatabaseCreationRequest {
    /// Serverless database on GCP `us-east1`, the Astra free tier default.
    pub fn serverless(name: impl Into<String>, keyspace: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            keyspace: keyspace.into(),
            cloud_provider: "GCP".to_string(),
            region: "us-east1".to_string(),
            tier: "serverless".to_string(),
            capacity_units: 1,
            db_type_vector: false,
        }
    }

    /// Override cloud provider and region.
    #[must_use]
    pub fn in_region(mut self, cloud_provider: impl Into<String>, region: impl Into<String>) -> Self {
        self.cloud_provider = cloud_provider.into();
        self.region = region.into();
        self
    }

    /// Request a vector-enabled database.
    #[must_use]
    pub const fn vector(mut self) -> Self {
        self.db_type_vector = true;
        self
    }
}

/// Filter for `list_databases`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatabaseFilter {
    /// `include` query parameter (`nonterminated`, `all`, `active`, ...).
    pub include: String,
    /// `provider` query parameter (`ALL`, `AWS`, `GCP`, `AZURE`).
    pub provider: String,
    /// Page size.
    pub limit: u32,
}

impl Default for DatabaseFilter {
    fn default() -> Self {
        Self {
            include: "nonterminated".to_string(),
            provider: "ALL".to_string(),
            limit: 25,
        }
    }
}

/// Secure connect bundle download information.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DatabaseBundle {
    /// Signed URL of the zip archive.
    #[serde(rename = "downloadURL")]
    pub download_url: String,
    /// Internal download URL.
    #[serde(default, rename = "downloadURLInternal")]
    pub download_url_internal: Option<String>,
    /// Migration proxy download URL.
    #[serde(default, rename = "downloadURLMigrationProxy")]
    pub download_url_migration_proxy: Option<String>,
}

/// IP access list of a database.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccessList {
    /// Organization id.
    #[serde(default)]
    pub organization_id: Option<String>,
    /// Database id.
    #[serde(default)]
    pub database_id: Option<String>,
    /// Allowed addresses.
    #[serde(default)]
    pub addresses: Vec<AccessListAddress>,
    /// Access list configuration.
    #[serde(default)]
    pub configurations: Option<AccessListConfiguration>,
}

/// Access list switch.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccessListConfiguration {
    /// Whether the access list is enforced.
    #[serde(default)]
    pub access_list_enabled: bool,
}

/// One access list entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccessListAddress {
    /// CIDR block, e.g. `10.0.0.0/16`.
    pub address: String,
    /// Free text description.
    #[serde(default)]
    pub description: String,
    /// Whether the entry is active.
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

const fn default_enabled() -> bool {
    true
}

impl AccessListAddress {
    /// Enabled entry for `address`.
    pub fn new(address: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            description: description.into(),
            enabled: true,
        }
    }
}

impl AstraDevopsClient {
    /// List databases matching `filter`.
    ///
    /// # Errors
    ///
    /// Returns an error if the request fails or the API returns an error.
    pub async fn list_databases(&self, filter: &DatabaseFilter) -> Result<Vec<Database>, DevopsError> {
        let mut url = self.url("databases")?;
        url.query_pairs_mut()
            .append_pair("include", &filter.include)
            .append_pair("provider", &filter.provider)
            .append_pair("limit", &filter.limit.to_string());
        self.get_json(url).await
    }

    /// Find a database by id.
    ///
    /// Returns `None` if the database does not exist.
    ///
    /// # Errors
    ///
    /// Returns an error if the request fails or the API returns an error.
    pub async fn find_database(&self, db_id: &str) -> Result<Option<Database>, DevopsError> {
        let url = self.url(&format!("databases/{}", path_segment("database id", db_id)?))?;
        self.get_optional(url).await
    }

    /// Find non-terminated databases with the given name.
    ///
    /// # Errors
    ///
    /// Returns an error if the request fails or the API returns an error.
    pub async fn find_databases_by_name(&self, name: &str) -> Result<Vec<Database>, DevopsError> {
        let all = self.list_databases(&DatabaseFilter::default()).await?;
        Ok(all
            .into_iter()
            .filter(|db| db.info.name.as_deref() == Some(name))
            .collect())
    }

    /// Check whether a database exists.
    ///
    /// # Errors
    ///
    /// Returns an error if the request fails or the API returns an error.
    pub async fn database_exists(&self, db_id: &str) -> Result<bool, DevopsError> {
        Ok(self.find_database(db_id).await?.is_some())
    }

    /// Create a database and return its id.
    ///
    /// The API answers `201 Created` with the new id in the `Location` header.
    ///
    /// # Errors
    ///
    /// Returns an error if the request is invalid or the API returns an error.
    pub async fn create_database(&self, req: &DatabaseCreationRequest) -> Result<String, DevopsError> {
        if !is_valid_keyspace_name(&req.keyspace) {
            return Err(DevopsError::InvalidArgument(format!(
                "invalid keyspace name: {:?}",
                req.keyspace
            )));
        }
        if req.name.trim().is_empty() {
            return Err(DevopsError::InvalidArgument(
                "database name must not be empty".to_string(),
            ));
        }

        let body = to_json(req)?;
        let resp = self
            .create(self.url("databases")?, body)
            .await?
            .require(StatusCode::CREATED)?;

        let id = resp
            .location
            .as_deref()
            .and_then(|loc| loc.trim_end_matches('/').rsplit('/').next())
            .filter(|id| !id.is_empty())
            .map(ToString::to_string)
            .ok_or_else(|| DevopsError::Api {
                status: resp.status,
                body: "missing Location header in creation response".to_string(),
            })?;

        tracing::info!(db_id = %id, name = %req.name, "database creation requested");
        Ok(id)
    }

    /// Terminate (delete) a database.
    ///
    /// # Errors
    ///
    /// Returns an error if the request fails or the API returns an error.
    pub async fn terminate_database(&self, db_id: &str) -> Result<(), DevopsError> {
        self.database_action(db_id, "terminate", None).await
    }

    /// Park a classic database.
    ///
    /// # Errors
    ///
    /// Returns an error if the request fails or the API returns an error.
    pub async fn park_database(&self, db_id: &str) -> Result<(), DevopsError> {
        self.database_action(db_id, "park", None).await
    }

    /// Unpark a parked database.
    ///
    /// # Errors
    ///
    /// Returns an error if the request fails or the API returns an error.
    pub async fn unpark_database(&self, db_id: &str) -> Result<(), DevopsError> {
        self.database_action(db_id, "unpark", None).await
    }

    /// Change the capacity units of a classic database.
    ///
    /// # Errors
    ///
    /// Returns an error if `capacity_units` is zero or the API returns an error.
    pub async fn resize_database(&self, db_id: &str, capacity_units: u32) -> Result<(), DevopsError> {
        if capacity_units == 0 {
            return Err(DevopsError::InvalidArgument(
                "capacity units must be at least 1".to_string(),
            ));
        }
        let body = serde_json::json!({ "capacityUnits": capacity_units });
        self.database_action(db_id, "resize", Some(body)).await
    }

    /// Create a keyspace in a database.
    ///
    /// # Errors
    ///
    /// Returns an error if the keyspace name is invalid or the API returns an error.
    pub async fn create_keyspace(&self, db_id: &str, keyspace: &str) -> Result<(), DevopsError> {
        let url = self.keyspace_url(db_id, keyspace)?;
        self.expect_status(Method::POST, url, None, StatusCode::CREATED)
            .await?;
        tracing::info!(db_id, keyspace, "keyspace created");
        Ok(())
    }

    /// Delete a keyspace from a database.
    ///
    /// # Errors
    ///
    /// Returns an error if the keyspace name is invalid or the API returns an error.
    pub async fn delete_keyspace(&self, db_id: &str, keyspace: &str) -> Result<(), DevopsError> {
        let url = self.keyspace_url(db_id, keyspace)?;
        self.expect_status(Method::DELETE, url, None, StatusCode::NO_CONTENT)
            .await?;
        tracing::info!(db_id, keyspace, "keyspace deleted");
        Ok(())
    }

    /// Get the secure connect bundle URLs of a database.
    ///
    /// # Errors
    ///
    /// Returns an error if the request fails or the API returns an error.
    pub async fn secure_bundle_url(&self, db_id: &str) -> Result<DatabaseBundle, DevopsError> {
        let url = self.url(&format!(
            "databases/{}/secureBundleURL",
            path_segment("database id", db_id)?
        ))?;
        self.send(Method::POST, url, None)
            .await?
            .ensure_success()?
            .json()
    }

    /// Download the secure connect bundle of a database to `target`.
    ///
    /// Returns the number of bytes written.
    ///
    /// # Errors
    ///
    /// Returns an error if the bundle URL cannot be obtained, downloaded, or written.
    pub async fn download_secure_bundle(&self, db_id: &str, target: &Path) -> Result<u64, DevopsError> {
        let bundle = self.secure_bundle_url(db_id).await?;

        // Signed URL: no bearer token.
        let resp = self
            .http()
            .get(&bundle.download_url)
            .send()
            .await
            .map_err(DevopsError::Http)?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(DevopsError::Api { status, body });
        }
        let bytes = resp.bytes().await.map_err(DevopsError::Http)?;

        if let Some(parent) = target.parent()
            && !parent.as_os_str().is_empty()
        {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(target, &bytes).await?;

        tracing::info!(db_id, path = %target.display(), size = bytes.len(), "secure bundle downloaded");
        Ok(bytes.len() as u64)
    }

    /// Get the access list of a database.
    ///
    /// # Errors
    ///
    /// Returns an error if the request fails or the API returns an error.
    pub async fn access_list(&self, db_id: &str) -> Result<AccessList, DevopsError> {
        self.get_json(self.access_list_url(db_id)?).await
    }

    /// Add addresses to the access list of a database.
    ///
    /// # Errors
    ///
    /// Returns an error if `addresses` is empty or the API returns an error.
    pub async fn add_access_list_addresses(
        &self,
        db_id: &str,
        addresses: &[AccessListAddress],
    ) -> Result<(), DevopsError> {
        if addresses.is_empty() {
            return Err(DevopsError::InvalidArgument(
                "at least one address is required".to_string(),
            ));
        }
        let body = to_json(addresses)?;
        self.send(Method::POST, self.access_list_url(db_id)?, Some(body))
            .await?
            .ensure_success()?;
        Ok(())
    }

    /// Remove the whole access list of a database.
    ///
    /// # Errors
    ///
    /// Returns an error if the request fails or the API returns an error.
    pub async fn delete_access_list(&self, db_id: &str) -> Result<(), DevopsError> {
        self.send(Method::DELETE, self.access_list_url(db_id)?, None)
            .await?
            .ensure_success()?;
        Ok(())
    }

    /// Poll a database until it reaches `expected`.
    ///
    /// Fails fast if the database reaches a terminal status other than `expected`.
    ///
    /// # Errors
    ///
    /// Returns an error on timeout, on an unexpected terminal status, or if the
    /// database disappears.
    pub async fn wait_for_status(
        &self,
        db_id: &str,
        expected: DatabaseStatus,
        timeout: Duration,
        poll_interval: Duration,
    ) -> Result<Database, DevopsError> {
        let start = std::time::Instant::now();

        loop {
            let db = self
                .find_database(db_id)
                .await?
                .ok_or_else(|| DevopsError::NotFound(format!("database {db_id}")))?;

            if db.status == expected {
                return Ok(db);
            }
            if db.status.is_terminal() {
                return Err(DevopsError::UnexpectedStatus {
                    expected: expected.to_string(),
                    actual: db.status.to_string(),
                });
            }
            if start.elapsed() >= timeout {
                return Err(DevopsError::Timeout(format!(
                    "database {db_id} to become {expected} (last status {})",
                    db.status
                )));
            }

            tracing::debug!(db_id, status = %db.status, %expected, "waiting for database status");
            tokio::time::sleep(poll_interval).await;
        }
    }

    async fn database_action(
        &self,
        db_id: &str,
        action: &str,
        body: Option<serde_json::Value>,
    ) -> Result<(), DevopsError> {
        let url = self.url(&format!(
            "databases/{}/{action}",
            path_segment("database id", db_id)?
        ))?;
        self.expect_status(Method::POST, url, body, StatusCode::ACCEPTED)
            .await?;
        tracing::info!(db_id, action, "database action accepted");
        Ok(())
    }

    fn keyspace_url(&self, db_id: &str, keyspace: &str) -> Result<url::Url, DevopsError> {
        if !is_valid_keyspace_name(keyspace) {
            return Err(DevopsError::InvalidArgument(format!(
                "invalid keyspace name: {keyspace:?}"
            )));
        }
        self.url(&format!(
            "databases/{}/keyspaces/{keyspace}",
            path_segment("database id", db_id)?
        ))
    }

    fn access_list_url(&self, db_id: &str) -> Result<url::Url, DevopsError> {
        self.url(&format!(
            "databases/{}/access-list",
            path_segment("database id", db_id)?
        ))
    }
}

/// Keyspace names: a letter, then up to 47 letters, digits or underscores.
#[must_use]
pub fn is_valid_keyspace_name(name: &str) -> bool {
    let mut chars = name.chars();
    let Some(first) = chars.next() else {
        return false;
    };
    first.is_ascii_alphabetic()
        && name.len() <= 48
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}
