//! Stargate Document API (v2).
//!
//! Endpoints used (relative to a node base URL):
//! - GET  /v2/schemas/namespaces[/{ns}]
//! - GET | POST /v2/namespaces/{ns}/collections
//! - POST /v2/namespaces/{ns}/collections/{col}
//! - GET | PUT | DELETE /v2/namespaces/{ns}/collections/{col}/{id}
//! - GET  /v2/namespaces/{ns}/collections/{col}?where=&page-size=&page-state=&fields=
//!
//! Every call goes through [`StargateClient::execute`], so document traffic is
//! load balanced and fails over like any other Stargate call.

use std::collections::BTreeMap;

use reqwest::Method;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::stargate_client::{StargateClient, StargateError};

/// Largest page the Document API serves.
pub const MAX_PAGE_SIZE: u32 = 20;

/// Namespace (keyspace) description.
#[derive(Debug, Clone, Deserialize)]
pub struct Namespace {
    /// Namespace name.
    pub name: String,
    /// Replication factor (simple strategy).
    #[serde(default)]
    pub replicas: Option<u32>,
}

/// Collection description.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Collection {
    /// Collection name.
    pub name: String,
    /// Whether a storage upgrade is available.
    #[serde(default)]
    pub upgrade_available: bool,
}

/// A document with its id.
#[derive(Debug, Clone, PartialEq)]
pub struct Document<T> {
    /// Document id.
    pub id: String,
    /// Document body.
    pub data: T,
}

/// One page of search results.
#[derive(Debug, Clone)]
pub struct Page<T> {
    /// Token for the next page, if any.
    pub page_state: Option<String>,
    /// Documents of this page.
    pub documents: Vec<Document<T>>,
}

impl<T> Page<T> {
    /// True if more results can be fetched.
    #[must_use]
    pub const fn has_next(&self) -> bool {
        self.page_state.is_some()
    }
}

/// Search parameters.
#[derive(Debug, Clone, Default)]
pub struct DocumentQuery {
    /// Filter, e.g. `{"age": {"$gt": 30}}`.
    pub filter: Option<serde_json::Value>,
    /// Page size (1..=20); server default when unset.
    pub page_size: Option<u32>,
    /// Page token from a previous [`Page`].
    pub page_state: Option<String>,
    /// Projection.
    pub fields: Vec<String>,
}

impl DocumentQuery {
    /// Empty query.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the filter.
    #[must_use]
    pub fn filter(mut self, filter: serde_json::Value) -> Self {
        self.filter = Some(filter);
        self
    }

    /// Set the page size.
    #[must_use]
    pub const fn page_size(mut self, size: u32) -> Self {
        self.page_size = Some(size);
        self
    }

    /// Continue from a previous page.
    #[must_use]
    pub fn page_state(mut self, state: impl Into<String>) -> Self {
        self.page_state = Some(state.into());
        self
    }

    /// Only return these fields.
    #[must_use]
    pub fn fields<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.fields = fields.into_iter().map(Into::into).collect();
        self
    }

    fn to_params(&self) -> Result<Vec<(&'static str, String)>, StargateError> {
        let mut params = Vec::new();
        if let Some(filter) = &self.filter {
            params.push(("where", filter.to_string()));
        }
        if let Some(size) = self.page_size {
            if !(1..=MAX_PAGE_SIZE).contains(&size) {
                return Err(StargateError::InvalidArgument(format!(
                    "page size must be between 1 and {MAX_PAGE_SIZE}, got {size}"
                )));
            }
            params.push(("page-size", size.to_string()));
        }
        if let Some(state) = &self.page_state {
            params.push(("page-state", state.clone()));
        }
        if !self.fields.is_empty() {
            let fields = serde_json::to_string(&self.fields).map_err(|source| StargateError::Json {
                source,
                body: String::new(),
            })?;
            params.push(("fields", fields));
        }
        Ok(params)
    }
}

#[derive(Deserialize)]
struct DataWrapper<T> {
    data: T,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct DocumentIdResponse {
    document_id: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SearchResponse<T> {
    #[serde(default)]
    page_state: Option<String>,
    #[serde(default = "BTreeMap::new")]
    data: BTreeMap<String, T>,
}

#[derive(Serialize)]
struct CreateCollection<'a> {
    name: &'a str,
}

impl StargateClient {
    /// List namespaces.
    ///
    /// # Errors
    ///
    /// Returns an error if the call fails on every node.
    pub async fn list_namespaces(&self) -> Result<Vec<Namespace>, StargateError> {
        let wrapped: Option<DataWrapper<Vec<Namespace>>> =
            self.get_json("v2/schemas/namespaces", &[]).await?;
        Ok(wrapped.map(|w| w.data).unwrap_or_default())
    }

    /// Check whether a namespace exists.
    ///
    /// # Errors
    ///
    /// Returns an error if the call fails on every node.
    pub async fn namespace_exists(&self, namespace: &str) -> Result<bool, StargateError> {
        let path = format!("v2/schemas/namespaces/{}", name_segment("namespace", namespace)?);
        Ok(self
            .get_json::<serde_json::Value>(&path, &[])
            .await?
            .is_some())
    }

    /// List the collections of a namespace.
    ///
    /// # Errors
    ///
    /// Returns an error if the call fails on every node.
    pub async fn list_collections(&self, namespace: &str) -> Result<Vec<Collection>, StargateError> {
        let wrapped: Option<DataWrapper<Vec<Collection>>> =
            self.get_json(&collections_path(namespace)?, &[]).await?;
        Ok(wrapped.map(|w| w.data).unwrap_or_default())
    }

    /// Create a collection.
    ///
    /// # Errors
    ///
    /// Returns an error if the names are invalid or the call fails.
    pub async fn create_collection(&self, namespace: &str, collection: &str) -> Result<(), StargateError> {
        let body = serde_json::to_value(CreateCollection {
            name: name_segment("collection", collection)?,
        })
        .map_err(|source| StargateError::Json {
            source,
            body: String::new(),
        })?;
        self.send_ok(Method::POST, &collections_path(namespace)?, Some(&body))
            .await?;
        tracing::info!(namespace, collection, "collection created");
        Ok(())
    }

    /// Create a document with a generated id and return that id.
    ///
    /// # Errors
    ///
    /// Returns an error if the names are invalid or the call fails.
    pub async fn create_document<T: Serialize + ?Sized>(
        &self,
        namespace: &str,
        collection: &str,
        document: &T,
    ) -> Result<String, StargateError> {
        let resp: DocumentIdResponse = self
            .post_json(&collection_path(namespace, collection)?, document)
            .await?;
        Ok(resp.document_id)
    }

    /// Create or replace a document with the given id.
    ///
    /// # Errors
    ///
    /// Returns an error if the names are invalid or the call fails.
    pub async fn upsert_document<T: Serialize + ?Sized>(
        &self,
        namespace: &str,
        collection: &str,
        document_id: &str,
        document: &T,
    ) -> Result<String, StargateError> {
        let resp: DocumentIdResponse = self
            .put_json(&document_path(namespace, collection, document_id)?, document)
            .await?;
        Ok(resp.document_id)
    }

    /// Fetch a document by id; `None` if it does not exist.
    ///
    /// # Errors
    ///
    /// Returns an error if the names are invalid or the call fails.
    pub async fn find_document<T: DeserializeOwned>(
        &self,
        namespace: &str,
        collection: &str,
        document_id: &str,
    ) -> Result<Option<T>, StargateError> {
        self.get_json(
            &document_path(namespace, collection, document_id)?,
            &[("raw", "true")],
        )
        .await
    }

    /// Delete a document.
    ///
    /// # Errors
    ///
    /// Returns an error if the names are invalid or the call fails.
    pub async fn delete_document(
        &self,
        namespace: &str,
        collection: &str,
        document_id: &str,
    ) -> Result<(), StargateError> {
        self.delete(&document_path(namespace, collection, document_id)?)
            .await
    }

    /// Search a collection, one page at a time.
    ///
    /// # Errors
    ///
    /// Returns an error if the query is invalid or the call fails.
    pub async fn search_documents<T: DeserializeOwned>(
        &self,
        namespace: &str,
        collection: &str,
        query: &DocumentQuery,
    ) -> Result<Page<T>, StargateError> {
        let params = query.to_params()?;
        let borrowed: Vec<(&str, &str)> = params.iter().map(|(k, v)| (*k, v.as_str())).collect();

        let resp: Option<SearchResponse<T>> = self
            .get_json(&collection_path(namespace, collection)?, &borrowed)
            .await?;

        Ok(resp.map_or_else(
            || Page {
                page_state: None,
                documents: Vec::new(),
            },
            |r| Page {
                page_state: r.page_state.filter(|s| !s.is_empty()),
                documents: r
                    .data
                    .into_iter()
                    .map(|(id, data)| Document { id, data })
                    .collect(),
            },
        ))
    }
}

/// Namespace, collection and document ids go into the URL path as-is.
fn name_segment<'a>(what: &str, value: &'a str) -> Result<&'a str, StargateError> {
    let ok = !value.is_empty()
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
    if ok {
        Ok(value)
    } else {
        Err(StargateError::InvalidArgument(format!("invalid {what}: {value:?}")))
    }
}

fn collections_path(namespace: &str) -> Result<String, StargateError> {
    Ok(format!(
        "v2/namespaces/{}/collections",
        name_segment("namespace", namespace)?
    ))
}

fn collection_path(namespace: &str, collection: &str) -> Result<String, StargateError> {
    Ok(format!(
        "{}/{}",
        collections_path(namespace)?,
        name_segment("collection", collection)?
    ))
}

fn document_path(namespace: &str, collection: &str, document_id: &str) -> Result<String, StargateError> {
    Ok(format!(
        "{}/{}",
        collection_path(namespace, collection)?,
        name_segment("document id", document_id)?
    ))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::stargate_client::tests::client_for;
    use wiremock::matchers::{body_json, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Person {
        name: String,
        age: u32,
    }

    #[test]
    fn query_parameters_are_encoded() {
        let q = DocumentQuery::new()
            .filter(serde_json::json!({"age": {"$gt": 30}}))
            .page_size(5)
            .page_state("abc")
            .fields(["name"]);
        let params = q.to_params().unwrap();
        assert_eq!(
            params,
            vec![
                ("where", r#"{"age":{"$gt":30}}"#.to_string()),
                ("page-size", "5".to_string()),
                ("page-state", "abc".to_string()),
                ("fields", r#"["name"]"#.to_string()),
            ]
        );
        assert!(DocumentQuery::new().page_size(21).to_params().is_err());
        assert!(DocumentQuery::new().page_size(0).to_params().is_err());
    }

    #[test]
    fn rejects_path_injection() {
        assert!(document_path("ns", "col", "../x").is_err());
        assert!(collection_path("ns", "").is_err());
        assert_eq!(
            document_path("ns", "people", "id-1").unwrap(),
            "v2/namespaces/ns/collections/people/id-1"
        );
    }

    #[tokio::test]
    async fn lists_namespaces_and_collections() {
        let node = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v2/schemas/namespaces"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "data": [{"name": "system"}, {"name": "app", "replicas": 1}]
            })))
            .mount(&node)
            .await;
        Mock::given(method("GET"))
            .and(path("/v2/namespaces/app/collections"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "data": [{"name": "people", "upgradeAvailable": false}]
            })))
            .mount(&node)
            .await;
        Mock::given(method("GET"))
            .and(path("/v2/schemas/namespaces/ghost"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&node)
            .await;

        let client = client_for(&[&node]);
        let ns = client.list_namespaces().await.unwrap();
        assert_eq!(ns[1].replicas, Some(1));
        assert_eq!(client.list_collections("app").await.unwrap()[0].name, "people");
        assert!(!client.namespace_exists("ghost").await.unwrap());
    }

    #[tokio::test]
    async fn document_crud() {
        let node = MockServer::start().await;
        let jo = Person { name: "Jo".into(), age: 41 };
        Mock::given(method("POST"))
            .and(path("/v2/namespaces/app/collections"))
            .and(body_json(serde_json::json!({"name": "people"})))
            .respond_with(ResponseTemplate::new(201))
            .expect(1)
            .mount(&node)
            .await;
        Mock::given(method("POST"))
            .and(path("/v2/namespaces/app/collections/people"))
            .and(body_json(serde_json::json!({"name": "Jo", "age": 41})))
            .respond_with(ResponseTemplate::new(201).set_body_json(serde_json::json!({"documentId": "d1"})))
            .mount(&node)
            .await;
        Mock::given(method("PUT"))
            .and(path("/v2/namespaces/app/collections/people/d2"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"documentId": "d2"})))
            .mount(&node)
            .await;
        Mock::given(method("GET"))
            .and(path("/v2/namespaces/app/collections/people/d1"))
            .and(query_param("raw", "true"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"name": "Jo", "age": 41})))
            .mount(&node)
            .await;
        Mock::given(method("GET"))
            .and(path("/v2/namespaces/app/collections/people/nope"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&node)
            .await;
        Mock::given(method("DELETE"))
            .and(path("/v2/namespaces/app/collections/people/d1"))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&node)
            .await;

        let client = client_for(&[&node]);
        client.create_collection("app", "people").await.unwrap();
        assert_eq!(client.create_document("app", "people", &jo).await.unwrap(), "d1");
        assert_eq!(client.upsert_document("app", "people", "d2", &jo).await.unwrap(), "d2");

        let found: Option<Person> = client.find_document("app", "people", "d1").await.unwrap();
        assert_eq!(found, Some(jo));
        let missing: Option<Person> = client.find_document("app", "people", "nope").await.unwrap();
        assert!(missing.is_none());

        client.delete_document("app", "people", "d1").await.unwrap();
    }

    #[tokio::test]
    async fn searches_with_paging() {
        let node = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v2/namespaces/app/collections/people"))
            .and(query_param("page-size", "2"))
            .and(query_param("where", r#"{"age":{"$gt":30}}"#))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "pageState": "next-1",
                "data": {
                    "a": {"name": "Al", "age": 35},
                    "b": {"name": "Bo", "age": 52}
                }
            })))
            .mount(&node)
            .await;

        let client = client_for(&[&node]);
        let query = DocumentQuery::new()
            .filter(serde_json::json!({"age": {"$gt": 30}}))
            .page_size(2);
        let page: Page<Person> = client.search_documents("app", "people", &query).await.unwrap();
        assert!(page.has_next());
        assert_eq!(page.page_state.as_deref(), Some("next-1"));
        assert_eq!(page.documents.len(), 2);
        assert_eq!(page.documents[0].id, "a");
        assert_eq!(page.documents[1].data.age, 52);
    }

    #[tokio::test]
    async fn search_without_data_is_an_empty_last_page() {
        let node = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v2/namespaces/app/collections/people"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"pageState": ""})))
            .mount(&node)
            .await;

        let client = client_for(&[&node]);
        let page: Page<Person> = client
            .search_documents("app", "people", &DocumentQuery::new())
            .await
            .unwrap();
        assert!(page.documents.is_empty());
        assert!(!page.has_next());
    }
}
