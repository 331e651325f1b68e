//! Astra / Stargate SDK.
//!
//! A client library for DataStax Astra and Stargate with:
//! - **Load balancing**: weighted round-robin or random selection with failure quarantine
//! - **Astra DevOps API**: databases, keyspaces, access lists, roles, users and tokens
//! - **Stargate**: load-balanced, token-authenticated calls with node failover
//! - **Document API**: namespaces, collections, documents and paged search
//!
//! ## Quick Start
//!
//! All configuration is loaded from environment variables. Create a `.env` file:
//!
//! ```text
//! ASTRA_DB_APPLICATION_TOKEN=AstraCS:...
//! STARGATE_NODES=http://10.0.0.1:8082,http://10.0.0.2:8082
//! STARGATE_AUTH_URLS=http://10.0.0.1:8081
//! ```
//!
//! ```ignore
//! use astra_stargate_sdk::{AstraDevopsClient, AstraDevopsConfig, StargateClient, StargateConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let devops = AstraDevopsClient::new(AstraDevopsConfig::from_env()?)?;
//!     for db in devops.list_databases(&Default::default()).await? {
//!         println!("{} {}", db.id, db.status);
//!     }
//!
//!     let stargate = StargateClient::new(&StargateConfig::from_env()?)?;
//!     let id = stargate
//!         .create_document("app", "people", &serde_json::json!({"name": "Jo"}))
//!         .await?;
//!     println!("created {id}");
//!     Ok(())
//! }
//! ```

// ============================================================================
// Strict linting - Dangerous or non-idiomatic practices are forbidden
// ============================================================================

#![deny(unsafe_code)]                 // Unsafe code is forbidden
#![deny(missing_docs)]                // All public items must be documented
#![deny(non_camel_case_types)]        // Types must follow CamelCase convention
#![deny(unused_must_use)]             // Must handle Result and Option explicitly
#![deny(non_snake_case)]              // Variables and functions must be snake_case
#![deny(non_upper_case_globals)]      // Constants must be UPPER_CASE
#![deny(nonstandard_style)]           // Non-standard code style is forbidden

// Clippy for strict discipline
#![deny(clippy::unwrap_used)]         // unwrap() is forbidden
#![deny(clippy::expect_used)]         // expect() is forbidden
#![deny(clippy::panic)]               // panic!() is forbidden
#![deny(clippy::print_stdout)]        // println!() is forbidden in production
#![deny(clippy::todo)]                // TODO is forbidden
#![deny(clippy::unimplemented)]       // unimplemented!() is forbidden
#![deny(clippy::unwrap_in_result)]    // unwrap() in Result is forbidden
#![deny(clippy::module_inception)]    // Module with same name as crate is forbidden
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

// Safety and robustness lints
#![deny(overflowing_literals)]        // Overflowing literals are forbidden
#![deny(arithmetic_overflow)]         // Arithmetic overflow is forbidden

// ============================================================================
// Modules
// ============================================================================

/// Environment parsing shared by the `from_env()` constructors.
///
/// Use this module to inspect configuration errors returned by any `from_env()`.
pub mod env_config;

/// Weighted resource selection with failure quarantine.
///
/// Use this module to spread calls across nodes and sideline the ones that fail.
pub mod loadbalancer;

/// Astra DevOps API transport, configuration and errors.
///
/// Use this module to build an authenticated client for the Astra control plane.
pub mod astra_devops;

/// Astra database lifecycle, keyspaces, secure bundles and access lists.
///
/// Use this module to create, park, resize or terminate databases and wait for their status.
pub mod astra_databases;

/// Astra organization: regions, roles, users and tokens.
///
/// Use this module to manage who can access the organization and with which tokens.
pub mod astra_organization;

/// Stargate token providers.
///
/// Use this module to supply a fixed token or fetch and cache one from the auth API.
pub mod stargate_auth;

/// Load-balanced Stargate HTTP client.
///
/// Use this module to call Stargate nodes with automatic failover and token refresh.
pub mod stargate_client;

/// Stargate Document API.
///
/// Use this module to store, fetch and search JSON documents in collections.
pub mod stargate_document;

// ============================================================================
// Re-exports for convenience
// ============================================================================

pub use astra_databases::{Database, DatabaseCreationRequest, DatabaseFilter, DatabaseStatus};
pub use astra_devops::{AstraDevopsClient, AstraDevopsConfig, DevopsError};
pub use env_config::EnvError;
pub use loadbalancer::{LoadBalancer, LoadBalancerError, LoadBalancingPolicy};
pub use stargate_auth::{StaticTokenProvider, TableTokenProvider, TokenProvider};
pub use stargate_client::{StargateClient, StargateConfig, StargateError};
pub use stargate_document::{DocumentQuery, Page};
