//! Astra organization operations: organization, regions, roles, users, tokens.
//!
//! REST endpoints (relative to the DevOps base URL):
//! - GET    /currentOrg
//! - GET    /regions/serverless
//! - GET | POST /organizations/roles, GET | DELETE /organizations/roles/{id}
//! - GET | PUT  /organizations/users, GET | DELETE /organizations/users/{id}
//! - GET | POST /clientIdSecrets, DELETE /clientIdSecrets/{clientId}

use reqwest::{Method, StatusCode};
use serde::{Deserialize, Serialize};

use crate::astra_devops::{AstraDevopsClient, DevopsError, path_segment, to_json};

/// Organization bound to the token.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Organization {
    /// Organization id.
    pub id: String,
    /// Organization name.
    pub name: String,
}

/// A region where serverless databases can be created.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerlessRegion {
    /// Region name, e.g. `us-east1`.
    pub name: String,
    /// Human readable name.
    #[serde(default)]
    pub display_name: Option<String>,
    /// Cloud provider.
    #[serde(default)]
    pub cloud_provider: Option<String>,
    /// Availability zone label.
    #[serde(default)]
    pub zone: Option<String>,
    /// Region classification (standard, premium, ...).
    #[serde(default)]
    pub classification: Option<String>,
    /// Whether the region is open.
    #[serde(default)]
    pub enabled: bool,
    /// Reserved for qualified users only.
    #[serde(default)]
    pub reserved_for_qualified_users: bool,
}

/// Role with its policy.
#[derive(Debug, Clone, Deserialize)]
pub struct Role {
    /// Role id.
    pub id: String,
    /// Role name.
    pub name: String,
    /// Permissions granted by the role.
    pub policy: RolePolicy,
    /// Last update time (RFC 3339).
    #[serde(default)]
    pub last_update_date_time: Option<String>,
    /// User who last updated the role.
    #[serde(default)]
    pub last_updated_by: Option<String>,
}

/// Role policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RolePolicy {
    /// Description.
    #[serde(default)]
    pub description: String,
    /// Resources the policy applies to (`drn:astra:org:<orgid>`, ...).
    #[serde(default)]
    pub resources: Vec<String>,
    /// Permissions (`db-all-keyspace-create`, ...).
    #[serde(default)]
    pub actions: Vec<String>,
    /// `allow` or `deny`.
    #[serde(default = "default_effect")]
    pub effect: String,
}

fn default_effect() -> String {
    "allow".to_string()
}

/// Payload for `POST /organizations/roles`.
#[derive(Debug, Clone, Serialize)]
pub struct CreateRoleRequest {
    /// Role name.
    pub name: String,
    /// Role policy.
    pub policy: RolePolicy,
}

impl CreateRoleRequest {
    /// Allow-role on `resources` with `actions`.
    pub fn allow(
        name: impl Into<String>,
        description: impl Into<String>,
        resources: Vec<String>,
        actions: Vec<String>,
    ) -> Self {
        Self {
            name: name.into(),
            policy: RolePolicy {
                description: description.into(),
                resources,
                actions,
                effect: default_effect(),
            },
        }
    }
}

/// Organization member.
#[derive(Debug, Clone, Deserialize)]
pub struct User {
    /// User id.
    #[serde(rename = "UserID")]
    pub user_id: String,
    /// Email address.
    #[serde(rename = "Email")]
    pub email: String,
    /// `active`, `invited`, ...
    #[serde(rename = "Status", default)]
    pub status: Option<String>,
    /// Roles assigned to the user.
    #[serde(rename = "Roles", default)]
    pub roles: Vec<UserRole>,
}

/// Role reference attached to a user.
#[derive(Debug, Clone, Deserialize)]
pub struct UserRole {
    /// Role id.
    #[serde(rename = "ID")]
    pub id: String,
    /// Role name.
    #[serde(rename = "Name")]
    pub name: String,
}

#[derive(Debug, Deserialize)]
struct UsersResponse {
    #[serde(rename = "Users", default)]
    users: Vec<User>,
}

#[derive(Debug, Serialize)]
struct InviteUserRequest<'a> {
    email: &'a str,
    #[serde(rename = "orgID")]
    org_id: &'a str,
    roles: &'a [String],
}

/// Token (client id / secret pair) as listed.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenSummary {
    /// Client id.
    pub client_id: String,
    /// Role ids bound to the token.
    #[serde(default)]
    pub roles: Vec<String>,
    /// Creation time.
    #[serde(default)]
    pub generated_on: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TokensResponse {
    #[serde(default)]
    clients: Vec<TokenSummary>,
}

/// Newly created token. The secret and token are only returned once.
#[derive(Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IamToken {
    /// Client id.
    pub client_id: String,
    /// Client secret.
    pub secret: String,
    /// Application token (`AstraCS:...`).
    pub token: String,
    /// Organization id.
    #[serde(default)]
    pub org_id: Option<String>,
    /// Role ids bound to the token.
    #[serde(default)]
    pub roles: Vec<String>,
    /// Creation time.
    #[serde(default)]
    pub generated_on: Option<String>,
}

impl std::fmt::Debug for IamToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IamToken")
            .field("client_id", &self.client_id)
            .field("secret", &"***")
            .field("token", &"***")
            .field("org_id", &self.org_id)
            .field("roles", &self.roles)
            .finish()
    }
}

impl AstraDevopsClient {
    /// Organization the token belongs to.
    ///
    /// # Errors
    ///
    /// Returns an error if the request fails or the API returns an error.
    pub async fn current_organization(&self) -> Result<Organization, DevopsError> {
        self.get_json(self.url("currentOrg")?).await
    }

    /// Regions available for serverless databases.
    ///
    /// # Errors
    ///
    /// Returns an error if the request fails or the API returns an error.
    pub async fn serverless_regions(&self) -> Result<Vec<ServerlessRegion>, DevopsError> {
        self.get_json(self.url("regions/serverless")?).await
    }

    /// List the roles of the organization.
    ///
    /// # Errors
    ///
    /// Returns an error if the request fails or the API returns an error.
    pub async fn list_roles(&self) -> Result<Vec<Role>, DevopsError> {
        self.get_json(self.url("organizations/roles")?).await
    }

    /// Find a role by id.
    ///
    /// # Errors
    ///
    /// Returns an error if the request fails or the API returns an error.
    pub async fn find_role(&self, role_id: &str) -> Result<Option<Role>, DevopsError> {
        self.get_optional(self.url(&format!("organizations/roles/{}", path_segment("role id", role_id)?))?)
            .await
    }

    /// Find a role by name (case-sensitive).
    ///
    /// # Errors
    ///
    /// Returns an error if the request fails or the API returns an error.
    pub async fn find_role_by_name(&self, name: &str) -> Result<Option<Role>, DevopsError> {
        Ok(self.list_roles().await?.into_iter().find(|r| r.name == name))
    }

    /// Create a custom role.
    ///
    /// # Errors
    ///
    /// Returns an error if the request is rejected or the API returns an error.
    pub async fn create_role(&self, req: &CreateRoleRequest) -> Result<Role, DevopsError> {
        if req.policy.actions.is_empty() || req.policy.resources.is_empty() {
            return Err(DevopsError::InvalidArgument(
                "role policy needs at least one action and one resource".to_string(),
            ));
        }
        let body = to_json(req)?;
        let role: Role = self
            .create(self.url("organizations/roles")?, body)
            .await?
            .require(StatusCode::CREATED)?
            .json()?;
        tracing::info!(role_id = %role.id, name = %role.name, "role created");
        Ok(role)
    }

    /// Delete a custom role.
    ///
    /// # Errors
    ///
    /// Returns an error if the request fails or the API returns an error.
    pub async fn delete_role(&self, role_id: &str) -> Result<(), DevopsError> {
        let url = self.url(&format!("organizations/roles/{}", path_segment("role id", role_id)?))?;
        self.expect_status(Method::DELETE, url, None, StatusCode::NO_CONTENT)
            .await?;
        tracing::info!(role_id, "role deleted");
        Ok(())
    }

    /// List the members of the organization.
    ///
    /// # Errors
    ///
    /// Returns an error if the request fails or the API returns an error.
    pub async fn list_users(&self) -> Result<Vec<User>, DevopsError> {
        let resp: UsersResponse = self.get_json(self.url("organizations/users")?).await?;
        Ok(resp.users)
    }

    /// Find a member by user id.
    ///
    /// # Errors
    ///
    /// Returns an error if the request fails or the API returns an error.
    pub async fn find_user(&self, user_id: &str) -> Result<Option<User>, DevopsError> {
        self.get_optional(self.url(&format!("organizations/users/{}", path_segment("user id", user_id)?))?)
            .await
    }

    /// Find a member by email (case-insensitive).
    ///
    /// # Errors
    ///
    /// Returns an error if the request fails or the API returns an error.
    pub async fn find_user_by_email(&self, email: &str) -> Result<Option<User>, DevopsError> {
        Ok(self
            .list_users()
            .await?
            .into_iter()
            .find(|u| u.email.eq_ignore_ascii_case(email)))
    }

    /// Invite a user into the current organization with the given role ids.
    ///
    /// # Errors
    ///
    /// Returns an error if the email or roles are invalid or the API returns an error.
    pub async fn invite_user(&self, email: &str, role_ids: &[String]) -> Result<(), DevopsError> {
        if !email.contains('@') {
            return Err(DevopsError::InvalidArgument(format!("invalid email: {email:?}")));
        }
        if role_ids.is_empty() {
            return Err(DevopsError::InvalidArgument(
                "at least one role is required".to_string(),
            ));
        }
        let org = self.current_organization().await?;
        let body = to_json(&InviteUserRequest {
            email,
            org_id: &org.id,
            roles: role_ids,
        })?;
        self.send(Method::PUT, self.url("organizations/users")?, Some(body))
            .await?
            .ensure_success()?;
        tracing::info!(email, org_id = %org.id, "user invited");
        Ok(())
    }

    /// Remove a member from the organization.
    ///
    /// # Errors
    ///
    /// Returns an error if the request fails or the API returns an error.
    pub async fn delete_user(&self, user_id: &str) -> Result<(), DevopsError> {
        let url = self.url(&format!("organizations/users/{}", path_segment("user id", user_id)?))?;
        self.expect_status(Method::DELETE, url, None, StatusCode::NO_CONTENT)
            .await?;
        Ok(())
    }

    /// List the application tokens of the organization.
    ///
    /// # Errors
    ///
    /// Returns an error if the request fails or the API returns an error.
    pub async fn list_tokens(&self) -> Result<Vec<TokenSummary>, DevopsError> {
        let resp: TokensResponse = self.get_json(self.url("clientIdSecrets")?).await?;
        Ok(resp.clients)
    }

    /// Create an application token bound to `role_id`.
    ///
    /// # Errors
    ///
    /// Returns an error if the request fails or the API returns an error.
    pub async fn create_token(&self, role_id: &str) -> Result<IamToken, DevopsError> {
        let role_id = path_segment("role id", role_id)?;
        let body = serde_json::json!({ "roles": [role_id] });
        let token: IamToken = self
            .create(self.url("clientIdSecrets")?, body)
            .await?
            .json()?;
        tracing::info!(client_id = %token.client_id, "token created");
        Ok(token)
    }

    /// Revoke an application token.
    ///
    /// # Errors
    ///
    /// Returns an error if the request fails or the API returns an error.
    pub async fn revoke_token(&self, client_id: &str) -> Result<(), DevopsError> {
        let url = self.url(&format!("clientIdSecrets/{}", path_segment("client id", client_id)?))?;
        self.send(Method::DELETE, url, None)
            .await?
            .ensure_success()?;
        tracing::info!(client_id, "token revoked");
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::astra_devops::tests::client_for;
    use wiremock::matchers::{body_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn role_json(id: &str, name: &str) -> serde_json::Value {
        serde_json::json!({
            "id": id,
            "name": name,
            "policy": {
                "description": name,
                "resources": ["drn:astra:org:org-1"],
                "actions": ["org-read"],
                "effect": "allow"
            },
            "last_update_date_time": "2024-01-01T00:00:00Z"
        })
    }

    #[tokio::test]
    async fn reads_current_organization_and_regions() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v2/currentOrg"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "id": "org-1", "name": "acme"
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/v2/regions/serverless"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([
                {"name": "us-east1", "displayName": "Moncks Corner", "cloudProvider": "GCP", "enabled": true}
            ])))
            .mount(&server)
            .await;

        let client = client_for(&server);
        let org = client.current_organization().await.unwrap();
        assert_eq!(org, Organization { id: "org-1".into(), name: "acme".into() });

        let regions = client.serverless_regions().await.unwrap();
        assert_eq!(regions[0].cloud_provider.as_deref(), Some("GCP"));
        assert!(regions[0].enabled);
        assert!(!regions[0].reserved_for_qualified_users);
    }

    #[tokio::test]
    async fn role_lookup_and_creation() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v2/organizations/roles"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([
                role_json("r1", "Organization Administrator"),
                role_json("r2", "Database Administrator")
            ])))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/v2/organizations/roles/nope"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/v2/organizations/roles"))
            .respond_with(ResponseTemplate::new(201).set_body_json(role_json("r3", "reader")))
            .expect(1)
            .mount(&server)
            .await;

        let client = client_for(&server);
        let dba = client.find_role_by_name("Database Administrator").await.unwrap().unwrap();
        assert_eq!(dba.id, "r2");
        assert!(client.find_role("nope").await.unwrap().is_none());

        let req = CreateRoleRequest::allow(
            "reader",
            "read only",
            vec!["drn:astra:org:org-1".into()],
            vec!["org-read".into()],
        );
        let created = client.create_role(&req).await.unwrap();
        assert_eq!(created.id, "r3");
        assert_eq!(created.policy.effect, "allow");

        let empty = CreateRoleRequest::allow("x", "x", vec![], vec![]);
        assert!(matches!(
            client.create_role(&empty).await,
            Err(DevopsError::InvalidArgument(_))
        ));
    }

    #[tokio::test]
    async fn invites_user_into_current_org() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v2/currentOrg"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "id": "org-1", "name": "acme"
            })))
            .mount(&server)
            .await;
        Mock::given(method("PUT"))
            .and(path("/v2/organizations/users"))
            .and(body_json(serde_json::json!({
                "email": "jo@example.com",
                "orgID": "org-1",
                "roles": ["r2"]
            })))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let client = client_for(&server);
        client
            .invite_user("jo@example.com", &["r2".to_string()])
            .await
            .unwrap();
        assert!(client.invite_user("not-an-email", &["r2".to_string()]).await.is_err());
    }

    #[tokio::test]
    async fn lists_users_from_wrapper() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v2/organizations/users"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "OrgID": "org-1",
                "OrgName": "acme",
                "Users": [
                    {"UserID": "u1", "Email": "Jo@Example.com", "Status": "active",
                     "Roles": [{"ID": "r2", "Name": "Database Administrator"}]}
                ]
            })))
            .mount(&server)
            .await;

        let client = client_for(&server);
        let users = client.list_users().await.unwrap();
        assert_eq!(users[0].roles[0].name, "Database Administrator");
        let jo = client.find_user_by_email("jo@example.com").await.unwrap().unwrap();
        assert_eq!(jo.user_id, "u1");
    }

    #[tokio::test]
    async fn token_lifecycle() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v2/clientIdSecrets"))
            .and(body_json(serde_json::json!({"roles": ["r2"]})))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "clientId": "cid",
                "secret": "s3cr3t",
                "token": "AstraCS:xyz",
                "orgId": "org-1",
                "roles": ["r2"],
                "generatedOn": "2024-01-01T00:00:00Z"
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/v2/clientIdSecrets"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "clients": [{"clientId": "cid", "roles": ["r2"]}]
            })))
            .mount(&server)
            .await;
        Mock::given(method("DELETE"))
            .and(path("/v2/clientIdSecrets/cid"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let client = client_for(&server);
        let token = client.create_token("r2").await.unwrap();
        assert_eq!(token.token, "AstraCS:xyz");
        assert!(!format!("{token:?}").contains("s3cr3t"));

        let tokens = client.list_tokens().await.unwrap();
        assert_eq!(tokens[0].client_id, "cid");
        client.revoke_token("cid").await.unwrap();
        assert!(client.revoke_token("a/b").await.is_err());
        assert!(matches!(
            client.revoke_token("..").await,
            Err(DevopsError::InvalidArgument(_))
        ));
    }

    #[tokio::test]
    async fn deletes_roles_and_users() {
        let server = MockServer::start().await;
        Mock::given(method("DELETE"))
            .and(path("/v2/organizations/roles/r3"))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("DELETE"))
            .and(path("/v2/organizations/users/u1"))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("DELETE"))
            .and(path("/v2/organizations/users/u2"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let client = client_for(&server);
        client.delete_role("r3").await.unwrap();
        client.delete_user("u1").await.unwrap();
        assert!(matches!(
            client.delete_user("u2").await,
            Err(DevopsError::NotFound(_))
        ));
        assert!(client.delete_role("").await.is_err());
    }

    #[tokio::test]
    async fn create_token_is_sent_once_on_server_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v2/clientIdSecrets"))
            .respond_with(ResponseTemplate::new(502))
            .expect(1)
            .mount(&server)
            .await;

        let client = client_for(&server);
        assert!(matches!(
            client.create_token("r2").await,
            Err(DevopsError::Api { status, .. }) if status == StatusCode::BAD_GATEWAY
        ));
    }
}
