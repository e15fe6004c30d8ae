//! Core domain models and strongly-typed identifiers.
//!
//! Defines resources, subscriptions and documents plus the newtype ID
//! wrappers that keep them apart at compile time. Validation here is the
//! create-time gate: anything stored has passed it.

use std::{
    collections::{BTreeMap, HashSet},
    fmt,
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::{
    error::{CoreError, Result},
    retry::RetryPolicy,
    wildcard::{self, Rules, WildcardError},
};

type PgDb = sqlx::Postgres;
type PgValueRef<'r> = sqlx::postgres::PgValueRef<'r>;
type PgTypeInfo = sqlx::postgres::PgTypeInfo;
type PgArgumentBuffer = sqlx::postgres::PgArgumentBuffer;
type EncodeResult =
    std::result::Result<sqlx::encode::IsNull, Box<dyn std::error::Error + Send + Sync + 'static>>;
type BoxDynError = sqlx::error::BoxDynError;

macro_rules! uuid_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub Uuid);

        impl $name {
            /// Creates a new random identifier.
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<Uuid> for $name {
            fn from(uuid: Uuid) -> Self {
                Self(uuid)
            }
        }

        impl sqlx::Type<PgDb> for $name {
            fn type_info() -> PgTypeInfo {
                <Uuid as sqlx::Type<PgDb>>::type_info()
            }
        }

        impl<'r> sqlx::Decode<'r, PgDb> for $name {
            fn decode(value: PgValueRef<'r>) -> std::result::Result<Self, BoxDynError> {
                let uuid = <Uuid as sqlx::Decode<PgDb>>::decode(value)?;
                Ok(Self(uuid))
            }
        }

        impl sqlx::Encode<'_, PgDb> for $name {
            fn encode_by_ref(&self, buf: &mut PgArgumentBuffer) -> EncodeResult {
                <Uuid as sqlx::Encode<PgDb>>::encode_by_ref(&self.0, buf)
            }
        }
    };
}

uuid_id!(
    /// Strongly-typed resource identifier.
    ResourceId
);

uuid_id!(
    /// Strongly-typed subscription identifier.
    SubscriptionId
);

uuid_id!(
    /// Identifier of one subscriber shard of a resource.
    ///
    /// Partitions bound the fan-out width of the spread stage: each holds at
    /// most `partition_limit` subscriptions.
    PartitionId
);

/// Document identifier: the concrete URI the document lives at.
///
/// Absolute URIs route by origin and path; relative ids are bare paths.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DocumentId(pub String);

impl DocumentId {
    /// Returns the path component used for wildcard extraction.
    ///
    /// Query and fragment are dropped. Relative ids are returned up to the
    /// first `?` or `#`.
    pub fn path(&self) -> String {
        match url::Url::parse(&self.0) {
            Ok(url) => url.path().to_string(),
            Err(_) => {
                let end = self.0.find(['?', '#']).unwrap_or(self.0.len());
                self.0[..end].to_string()
            },
        }
    }

    /// Returns the id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DocumentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DocumentId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for DocumentId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Change action carried through the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    /// Document seen for the first time.
    Create,
    /// Document revision advanced.
    Update,
    /// Document removed.
    Delete,
}

impl Action {
    /// Returns the wire name.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where the revision of a document lives and how to read it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeDetection {
    /// Content field holding the revision; dots address nested objects.
    pub field: String,

    /// strftime format for string revisions; empty means RFC 3339.
    #[serde(default)]
    pub format: String,
}

/// Family of documents under a wildcard path template.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resource {
    /// Unique identifier.
    pub id: ResourceId,

    /// Base origins, optionally with a base path.
    pub addresses: Vec<String>,

    /// Path template relative to each address.
    pub path: String,

    /// Revision source.
    pub change: ChangeDetection,

    /// Subscriber count per partition.
    #[serde(default)]
    pub partitions: BTreeMap<PartitionId, u32>,

    /// When the resource was created.
    pub created_at: DateTime<Utc>,
}

impl Resource {
    /// Validates addresses, path template and change detection.
    ///
    /// # Errors
    ///
    /// Returns `InvalidWildcard` for template violations and `InvalidInput`
    /// for malformed addresses or change settings.
    pub fn validate(&self) -> Result<()> {
        if self.addresses.is_empty() {
            return Err(CoreError::invalid_input("resource needs at least one address"));
        }
        for address in &self.addresses {
            let parsed = url::Url::parse(address)
                .map_err(|e| CoreError::invalid_input(format!("address `{address}`: {e}")))?;
            if parsed.host_str().is_none() || parsed.query().is_some() {
                return Err(CoreError::invalid_input(format!(
                    "address `{address}` must be an origin with an optional base path"
                )));
            }
            if wildcard::is_present(address) {
                return Err(CoreError::invalid_input(format!(
                    "address `{address}` must not contain wildcards"
                )));
            }
        }

        if !self.path.starts_with('/') {
            return Err(CoreError::invalid_input("path must start with `/`"));
        }
        wildcard::validate_url(&self.path, &Rules::PATH)?;
        if !wildcard::is_present(&self.path) {
            return Err(WildcardError::Missing.into());
        }

        if self.change.field.trim().is_empty() {
            return Err(CoreError::invalid_input("change field must not be empty"));
        }

        Ok(())
    }

    /// Returns the named wildcards declared by the path.
    pub fn wildcards(&self) -> Vec<String> {
        wildcard::extract(&self.path).unwrap_or_default()
    }
}

/// Per-action endpoint override; unset fields fall back to the endpoint.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointOverride {
    /// URL template.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,

    /// HTTP method.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,

    /// Headers; replaces the default set as a whole.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub headers: Option<BTreeMap<String, String>>,
}

/// Webhook target of a subscription.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoint {
    /// URL template.
    pub url: String,

    /// HTTP method.
    #[serde(default = "default_method")]
    pub method: String,

    /// Extra request headers.
    #[serde(default)]
    pub headers: BTreeMap<String, String>,

    /// Overrides keyed by action.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub actions: BTreeMap<Action, EndpointOverride>,
}

fn default_method() -> String {
    "POST".to_string()
}

/// Endpoint fields after per-action override resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedEndpoint {
    /// URL template, not yet filled.
    pub url: String,
    /// HTTP method.
    pub method: String,
    /// Request headers.
    pub headers: BTreeMap<String, String>,
}

impl Endpoint {
    /// Creates a POST endpoint with no headers or overrides.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            method: default_method(),
            headers: BTreeMap::new(),
            actions: BTreeMap::new(),
        }
    }

    /// Resolves the endpoint for an action, field by field.
    pub fn resolve(&self, action: Action) -> ResolvedEndpoint {
        let overrides = self.actions.get(&action);
        ResolvedEndpoint {
            url: overrides.and_then(|o| o.url.clone()).unwrap_or_else(|| self.url.clone()),
            method: overrides
                .and_then(|o| o.method.clone())
                .unwrap_or_else(|| self.method.clone()),
            headers: overrides
                .and_then(|o| o.headers.clone())
                .unwrap_or_else(|| self.headers.clone()),
        }
    }

    fn url_templates(&self) -> impl Iterator<Item = &str> {
        std::iter::once(self.url.as_str())
            .chain(self.actions.values().filter_map(|o| o.url.as_deref()))
    }

    fn methods(&self) -> impl Iterator<Item = &str> {
        std::iter::once(self.method.as_str())
            .chain(self.actions.values().filter_map(|o| o.method.as_deref()))
    }
}

/// How endpoint responses are classified and failures retried.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryPolicy {
    /// Status codes counted as delivered; empty means any 2xx.
    #[serde(default)]
    pub success_codes: Vec<u16>,

    /// Status codes that end the attempt without retry.
    #[serde(default)]
    pub discard_codes: Vec<u16>,

    /// Retry bookkeeping for failed deliveries.
    #[serde(default)]
    pub retry: RetryPolicy,
}

impl DeliveryPolicy {
    /// Returns true if the status counts as delivered.
    pub fn is_success(&self, status: u16) -> bool {
        if self.success_codes.is_empty() {
            (200..300).contains(&status)
        } else {
            self.success_codes.contains(&status)
        }
    }

    /// Returns true if the status is accepted as a permanent no-op.
    pub fn is_discard(&self, status: u16) -> bool {
        self.discard_codes.contains(&status)
    }
}

/// Shape of the outbound body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentOptions {
    /// Embed the document content in the envelope.
    #[serde(default)]
    pub include_document: bool,

    /// Wrap the body in the notification envelope.
    #[serde(default = "default_envelope")]
    pub envelope: bool,
}

fn default_envelope() -> bool {
    true
}

impl Default for ContentOptions {
    fn default() -> Self {
        Self { include_document: false, envelope: true }
    }
}

/// Webhook registration against a resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subscription {
    /// Unique identifier.
    pub id: SubscriptionId,

    /// Resource subscribed to.
    pub resource_id: ResourceId,

    /// Assigned partition.
    pub partition: PartitionId,

    /// Callback target.
    pub endpoint: Endpoint,

    /// Response classification and retry policy.
    #[serde(default)]
    pub delivery: DeliveryPolicy,

    /// Body shape.
    #[serde(default)]
    pub content: ContentOptions,

    /// Extra templated values added to the envelope.
    #[serde(default)]
    pub data: Map<String, Value>,

    /// When the subscription was created.
    pub created_at: DateTime<Utc>,
}

impl Subscription {
    /// Validates templates and methods against the owning resource.
    ///
    /// Every wildcard used by endpoint URLs and string `data` values must be
    /// declared by the resource path or be `revision`.
    ///
    /// # Errors
    ///
    /// Returns `InvalidWildcard` for template violations and `InvalidInput`
    /// for mismatched resources, bad URLs or methods.
    pub fn validate_against(&self, resource: &Resource) -> Result<()> {
        if self.resource_id != resource.id {
            return Err(CoreError::invalid_input("subscription resource does not match"));
        }

        let mut declared: HashSet<String> = resource.wildcards().into_iter().collect();
        declared.insert(wildcard::REVISION.to_string());

        let templates = self
            .endpoint
            .url_templates()
            .chain(self.data.values().filter_map(Value::as_str));
        for template in templates {
            wildcard::validate(template, &Rules::TEMPLATE)?;
            for name in wildcard::extract(template)? {
                if !declared.contains(&name) {
                    return Err(WildcardError::Undeclared { name }.into());
                }
            }
        }

        for template in self.endpoint.url_templates() {
            let sample = template.replace(['{', '}'], "");
            let parsed = url::Url::parse(&sample)
                .map_err(|e| CoreError::invalid_input(format!("endpoint url `{template}`: {e}")))?;
            if !matches!(parsed.scheme(), "http" | "https") {
                return Err(CoreError::invalid_input(format!(
                    "endpoint url `{template}` must use http or https"
                )));
            }
        }

        for method in self.endpoint.methods() {
            if method.is_empty() || !method.bytes().all(|b| b.is_ascii_uppercase()) {
                return Err(CoreError::invalid_input(format!(
                    "method `{method}` must be an upper-case HTTP token"
                )));
            }
        }

        if self.delivery.retry.max_attempts == 0 {
            return Err(CoreError::invalid_input("retry max_attempts must be at least 1"));
        }

        Ok(())
    }
}

/// Stored snapshot of an external document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Document {
    /// Concrete URI.
    pub id: DocumentId,

    /// Resource the id resolved to.
    pub resource_id: ResourceId,

    /// JSON object content.
    pub content: Map<String, Value>,

    /// Derived revision; larger is newer.
    pub revision: i64,

    /// When this revision was ingested.
    pub updated_at: DateTime<Utc>,
}

impl Document {
    /// Placeholder for a deleted document whose content is gone.
    pub fn tombstone(
        id: DocumentId,
        resource_id: ResourceId,
        revision: i64,
        at: DateTime<Utc>,
    ) -> Self {
        Self { id, resource_id, content: Map::new(), revision, updated_at: at }
    }
}
