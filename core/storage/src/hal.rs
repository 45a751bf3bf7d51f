//! Remote store for HAL+JSON CRUD APIs.
//!
//! Resources live at `{base}/{collection}/{id}`, collections are paginated
//! through `_links.next.href` and embed their items under
//! `_embedded.{collection}`. Filtering uses OData-style equality
//! expressions in a `filter` query parameter.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, RequestBuilder, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::marker::PhantomData;
use tracing::{debug, warn};
use url::Url;

use mirrorsync_common::{Error, FieldKey, FieldValue, ObjectId, Result, Side};

use crate::provider::{Criteria, ObjectStore, Page, RemoteStore, Snapshot, WriteOutcome};

fn default_api_key_header() -> String {
    "OSDI-API-Token".to_string()
}

fn default_modified_property() -> String {
    "modified_date".to_string()
}

/// Connection settings for a HAL+JSON API.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HalConfig {
    /// API root, e.g. `https://actionnetwork.org/api/v2/`.
    pub base_url: String,
    /// API key sent with every request.
    #[serde(default)]
    pub api_key: Option<String>,
    /// Header carrying the API key.
    #[serde(default = "default_api_key_header")]
    pub api_key_header: String,
    /// Resource property holding the last modification time.
    #[serde(default = "default_modified_property")]
    pub modified_property: String,
    /// Requested page size for listings.
    #[serde(default)]
    pub page_size: Option<u32>,
}

impl HalConfig {
    /// Configuration with defaults for everything but the base URL.
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            api_key: None,
            api_key_header: default_api_key_header(),
            modified_property: default_modified_property(),
            page_size: None,
        }
    }
}

/// Remote store backed by one collection of a HAL+JSON API.
pub struct HalRemoteStore<F: FieldKey> {
    http: Client,
    config: HalConfig,
    base: Url,
    collection: String,
    name: String,
    _fields: PhantomData<fn() -> F>,
}

impl<F: FieldKey> HalRemoteStore<F> {
    /// Create a store for `collection` (e.g. "people", "tags").
    ///
    /// # Errors
    /// - Base URL cannot be parsed
    /// - HTTP client cannot be built
    pub fn new(config: HalConfig, collection: &str) -> Result<Self> {
        let mut raw = config.base_url.clone();
        if !raw.ends_with('/') {
            raw.push('/');
        }
        let base = Url::parse(&raw)
            .map_err(|e| Error::Config(format!("Invalid base URL '{}': {}", config.base_url, e)))?;

        let http = Client::builder()
            .user_agent("mirrorsync/0.1")
            .build()
            .map_err(|e| Error::Network(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            http,
            config,
            base,
            collection: collection.to_string(),
            name: format!("hal:{}", collection),
            _fields: PhantomData,
        })
    }

    fn collection_url(&self) -> Result<Url> {
        self.base
            .join(&self.collection)
            .map_err(|e| Error::Config(format!("Invalid collection URL: {}", e)))
    }

    fn resource_url(&self, id: &ObjectId) -> Result<Url> {
        self.base
            .join(&format!("{}/{}", self.collection, id))
            .map_err(|e| Error::InvalidInput(format!("Cannot build URL for {}: {}", id, e)))
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.config.api_key {
            Some(key) => request.header(self.config.api_key_header.as_str(), key),
            None => request,
        }
    }

    async fn get_json(&self, url: &str) -> Result<Option<Value>> {
        debug!("GET {}", url);
        let response = self
            .authorize(self.http.get(url))
            .send()
            .await
            .map_err(|e| Error::Network(format!("Failed to get {}: {}", url, e)))?;

        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        handle_response(response).await.map(Some)
    }

    async fn get_snapshot(&self, url: &str) -> Result<Option<Snapshot<F>>> {
        match self.get_json(url).await? {
            Some(body) => parse_resource(&body, &self.config.modified_property).map(Some),
            None => Ok(None),
        }
    }
}

/// Map an HTTP response to JSON or an error.
async fn handle_response(response: reqwest::Response) -> Result<Value> {
    let status = response.status();

    if status.is_success() {
        if status == StatusCode::NO_CONTENT {
            return Ok(Value::Null);
        }
        response
            .json()
            .await
            .map_err(|e| Error::Network(format!("Failed to parse response: {}", e)))
    } else if status == StatusCode::NOT_FOUND {
        Err(Error::NotFound("Resource not found".to_string()))
    } else if status == StatusCode::UNAUTHORIZED {
        Err(Error::Authentication("Invalid or expired API key".to_string()))
    } else if status == StatusCode::FORBIDDEN {
        Err(Error::PermissionDenied("Access denied".to_string()))
    } else {
        let body = response.text().await.unwrap_or_default();
        Err(Error::Network(format!("API error: {} - {}", status, body)))
    }
}

/// Whether a write failure status is a business rejection rather than a fault.
fn is_rejection(status: StatusCode) -> bool {
    matches!(
        status,
        StatusCode::BAD_REQUEST | StatusCode::CONFLICT | StatusCode::UNPROCESSABLE_ENTITY
    )
}

/// Extract the identifier of a resource.
///
/// Looks at `id`, then the first entry of `identifiers` (`prefix:value`),
/// then the last path segment of the self link.
fn resource_id(body: &Value) -> Option<ObjectId> {
    match body.get("id") {
        Some(Value::Number(n)) => {
            if let Some(i) = n.as_i64() {
                return Some(ObjectId::Int(i));
            }
        }
        Some(Value::String(s)) if !s.is_empty() => return Some(ObjectId::Text(s.clone())),
        _ => {}
    }

    if let Some(first) = body
        .get("identifiers")
        .and_then(Value::as_array)
        .and_then(|ids| ids.first())
        .and_then(Value::as_str)
    {
        let value = first.rsplit(':').next().unwrap_or(first);
        if !value.is_empty() {
            return Some(ObjectId::Text(value.to_string()));
        }
    }

    self_href(body)
        .and_then(|href| href.trim_end_matches('/').rsplit('/').next().map(str::to_string))
        .filter(|segment| !segment.is_empty())
        .map(ObjectId::Text)
}

fn self_href(body: &Value) -> Option<&str> {
    body.pointer("/_links/self/href").and_then(Value::as_str)
}

/// Parse a single HAL resource.
pub fn parse_resource<F: FieldKey>(body: &Value, modified_property: &str) -> Result<Snapshot<F>> {
    let id = resource_id(body)
        .ok_or_else(|| Error::Serialization("Resource has no identifier".to_string()))?;

    let values = F::all()
        .iter()
        .filter_map(|key| body.get(key.name()).map(|v| (*key, FieldValue::from_json(v))))
        .collect();

    let modified = match body.get(modified_property).and_then(Value::as_str) {
        Some(raw) => Some(
            DateTime::parse_from_rfc3339(raw)
                .map(|t| t.with_timezone(&Utc))
                .map_err(|e| Error::Serialization(format!("Bad {} '{}': {}", modified_property, raw, e)))?,
        ),
        None => None,
    };

    Ok(Snapshot {
        id,
        values,
        modified,
        error_flag: false,
        url: self_href(body).map(str::to_string),
    })
}

/// Parse one page of a HAL collection.
pub fn parse_page<F: FieldKey>(
    body: &Value,
    collection: &str,
    modified_property: &str,
) -> Result<Page<F>> {
    let embedded = body.get("_embedded");
    // Some APIs namespace the embedded key ("osdi:people").
    let items = embedded
        .and_then(|e| e.get(collection))
        .or_else(|| {
            embedded
                .and_then(Value::as_object)
                .and_then(|map| map.values().find(|v| v.is_array()))
        })
        .and_then(Value::as_array);

    let items = match items {
        Some(items) => items
            .iter()
            .map(|item| parse_resource(item, modified_property))
            .collect::<Result<Vec<_>>>()?,
        None => Vec::new(),
    };

    let next = body
        .pointer("/_links/next/href")
        .and_then(Value::as_str)
        .map(str::to_string);

    Ok(Page { items, next })
}

/// Render criteria as an OData-style filter expression.
pub fn filter_expression<F: FieldKey>(criteria: &Criteria<F>) -> Option<String> {
    let parts: Vec<String> = criteria
        .conditions()
        .iter()
        .map(|(key, value)| {
            let literal = match value {
                FieldValue::Text(s) => format!("'{}'", s.replace('\'', "''")),
                FieldValue::Time(t) => format!("'{}'", t.to_rfc3339()),
                other => other.to_json().to_string(),
            };
            format!("{} eq {}", key.name(), literal)
        })
        .collect();

    (!parts.is_empty()).then(|| parts.join(" and "))
}

/// Build a JSON request body from field values.
pub fn request_body<F: FieldKey>(values: &BTreeMap<F, FieldValue>) -> Value {
    let map = values
        .iter()
        .map(|(key, value)| (key.name().to_string(), value.to_json()))
        .collect();
    Value::Object(map)
}

#[async_trait]
impl<F: FieldKey> ObjectStore<F> for HalRemoteStore<F> {
    fn side(&self) -> Side {
        Side::Remote
    }

    fn name(&self) -> &str {
        &self.name
    }

    async fn load(&self, id: &ObjectId) -> Result<Option<Snapshot<F>>> {
        let url = self.resource_url(id)?;
        self.get_snapshot(url.as_str()).await
    }

    async fn save(
        &self,
        id: Option<&ObjectId>,
        values: &BTreeMap<F, FieldValue>,
    ) -> Result<WriteOutcome> {
        let body = request_body(values);
        let request = match id {
            Some(id) => {
                let url = self.resource_url(id)?;
                debug!("PUT {}", url);
                self.http.put(url)
            }
            None => {
                let url = self.collection_url()?;
                debug!("POST {}", url);
                self.http.post(url)
            }
        };

        let response = self
            .authorize(request)
            .json(&body)
            .send()
            .await
            .map_err(|e| Error::Network(format!("Failed to save to {}: {}", self.name, e)))?;

        let status = response.status();
        if is_rejection(status) {
            let reason = response.text().await.unwrap_or_default();
            warn!("{} rejected write: {} {}", self.name, status, reason);
            return Ok(WriteOutcome::Rejected {
                reason: format!("{}: {}", status, reason),
            });
        }

        let saved = handle_response(response).await?;
        let snapshot: Snapshot<F> = parse_resource(&saved, &self.config.modified_property)?;
        Ok(WriteOutcome::Saved { id: snapshot.id })
    }

    async fn delete(&self, id: &ObjectId) -> Result<bool> {
        let url = self.resource_url(id)?;
        debug!("DELETE {}", url);
        let response = self
            .authorize(self.http.delete(url))
            .send()
            .await
            .map_err(|e| Error::Network(format!("Failed to delete {}: {}", id, e)))?;

        if response.status() == StatusCode::NOT_FOUND {
            return Ok(false);
        }
        handle_response(response).await?;
        Ok(true)
    }
}

#[async_trait]
impl<F: FieldKey> RemoteStore<F> for HalRemoteStore<F> {
    async fn fetch_url(&self, url: &str) -> Result<Option<Snapshot<F>>> {
        self.get_snapshot(url).await
    }

    async fn find_page(&self, criteria: &Criteria<F>, cursor: Option<&str>) -> Result<Page<F>> {
        let url = match cursor {
            Some(next) => Url::parse(next)
                .map_err(|e| Error::InvalidInput(format!("Bad page link '{}': {}", next, e)))?,
            None => {
                let mut url = self.collection_url()?;
                {
                    let mut query = url.query_pairs_mut();
                    if let Some(filter) = filter_expression(criteria) {
                        query.append_pair("filter", &filter);
                    }
                    if let Some(size) = self.config.page_size {
                        query.append_pair("per_page", &size.to_string());
                    }
                }
                url
            }
        };

        match self.get_json(url.as_str()).await? {
            Some(body) => parse_page(&body, &self.collection, &self.config.modified_property),
            None => Ok(Page {
                items: Vec::new(),
                next: None,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
    enum Person {
        GivenName,
        Email,
        Tags,
    }

    impl FieldKey for Person {
        fn all() -> &'static [Self] {
            &[Person::GivenName, Person::Email, Person::Tags]
        }

        fn name(&self) -> &'static str {
            match self {
                Person::GivenName => "given_name",
                Person::Email => "email",
                Person::Tags => "tags",
            }
        }
    }

    #[test]
    fn test_parse_resource() {
        let body = json!({
            "identifiers": ["action_network:d91b4b2e-ae0e-4cd3"],
            "given_name": "Bee",
            "email": "bop@yum.com",
            "tags": ["volunteer"],
            "modified_date": "2024-05-01T12:00:00Z",
            "_links": {"self": {"href": "https://api.example.org/api/v2/people/d91b4b2e-ae0e-4cd3"}}
        });

        let snap: Snapshot<Person> = parse_resource(&body, "modified_date").unwrap();
        assert_eq!(snap.id, ObjectId::text("d91b4b2e-ae0e-4cd3").unwrap());
        assert_eq!(snap.get(Person::GivenName), &FieldValue::text("Bee"));
        assert_eq!(snap.get(Person::Tags), &FieldValue::List(vec!["volunteer".into()]));
        assert!(snap.modified.is_some());
        assert_eq!(
            snap.url.as_deref(),
            Some("https://api.example.org/api/v2/people/d91b4b2e-ae0e-4cd3")
        );
    }

    #[test]
    fn test_resource_id_falls_back_to_self_link() {
        let body = json!({"_links": {"self": {"href": "https://x.test/api/tags/abc/"}}});
        assert_eq!(resource_id(&body), Some(ObjectId::text("abc").unwrap()));
        assert_eq!(resource_id(&json!({"id": 12})), Some(ObjectId::Int(12)));
        assert_eq!(resource_id(&json!({})), None);
    }

    #[test]
    fn test_parse_page_with_namespaced_embed() {
        let body = json!({
            "_embedded": {"osdi:people": [
                {"id": "a", "email": "a@x"},
                {"id": "b", "email": "b@x"}
            ]},
            "_links": {"next": {"href": "https://x.test/api/people?page=2"}}
        });
        let page: Page<Person> = parse_page(&body, "people", "modified_date").unwrap();
        assert_eq!(page.items.len(), 2);
        assert_eq!(page.next.as_deref(), Some("https://x.test/api/people?page=2"));

        let last: Page<Person> = parse_page(&json!({"_embedded": {"people": []}}), "people", "modified_date").unwrap();
        assert!(last.items.is_empty());
        assert!(last.next.is_none());
    }

    #[test]
    fn test_filter_expression_quotes_text() {
        let criteria = Criteria::new()
            .eq(Person::Email, "o'neil@x")
            .eq(Person::GivenName, "Bee");
        assert_eq!(
            filter_expression(&criteria).unwrap(),
            "email eq 'o''neil@x' and given_name eq 'Bee'"
        );
        assert!(filter_expression(&Criteria::<Person>::new()).is_none());
    }

    #[test]
    fn test_request_body_uses_field_names() {
        let values = BTreeMap::from([
            (Person::Email, FieldValue::text("bop@yum.com")),
            (Person::Tags, FieldValue::List(vec!["a".into()])),
        ]);
        assert_eq!(
            request_body(&values),
            json!({"email": "bop@yum.com", "tags": ["a"]})
        );
    }

    #[test]
    fn test_store_urls() {
        let store = HalRemoteStore::<Person>::new(HalConfig::new("https://x.test/api/v2"), "people").unwrap();
        assert_eq!(store.collection_url().unwrap().as_str(), "https://x.test/api/v2/people");
        assert_eq!(
            store.resource_url(&ObjectId::text("abc").unwrap()).unwrap().as_str(),
            "https://x.test/api/v2/people/abc"
        );
        assert!(HalRemoteStore::<Person>::new(HalConfig::new("not a url"), "people").is_err());
    }

    #[test]
    fn test_config_defaults() {
        let config: HalConfig = serde_json::from_str(r#"{"base_url": "https://x.test/"}"#).unwrap();
        assert_eq!(config.api_key_header, "OSDI-API-Token");
        assert_eq!(config.modified_property, "modified_date");
    }
}
