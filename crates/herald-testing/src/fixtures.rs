//! Test data builders for resources, subscriptions and documents.
//!
//! Builders start from sensible defaults so tests only spell out what they
//! are about.

use std::collections::BTreeMap;

use chrono::Utc;
use herald_core::{
    retry::RetryPolicy, Action, ChangeDetection, ContentOptions, DeliveryPolicy, Endpoint,
    EndpointOverride, PartitionId, Resource, ResourceId, Subscription, SubscriptionId,
};
use rand::Rng;
use serde_json::{Map, Value};

/// Default resource address used by fixtures.
pub const DEFAULT_ADDRESS: &str = "https://api.example.com";

/// Default resource path template used by fixtures.
pub const DEFAULT_PATH: &str = "/users/{id}";

/// Default change detection field used by fixtures.
pub const DEFAULT_CHANGE_FIELD: &str = "seq";

/// Builder for test resources.
#[derive(Debug, Clone)]
pub struct ResourceBuilder {
    addresses: Vec<String>,
    path: String,
    change: ChangeDetection,
}

impl ResourceBuilder {
    /// Creates a builder for `/users/{id}` under `https://api.example.com`,
    /// with revisions read from `seq`.
    pub fn new() -> Self {
        Self {
            addresses: vec![DEFAULT_ADDRESS.to_string()],
            path: DEFAULT_PATH.to_string(),
            change: ChangeDetection {
                field: DEFAULT_CHANGE_FIELD.to_string(),
                format: String::new(),
            },
        }
    }

    /// Replaces the addresses with a single one.
    #[must_use]
    pub fn address(mut self, address: impl Into<String>) -> Self {
        self.addresses = vec![address.into()];
        self
    }

    /// Adds another address.
    #[must_use]
    pub fn also_at(mut self, address: impl Into<String>) -> Self {
        self.addresses.push(address.into());
        self
    }

    /// Sets the path template.
    #[must_use]
    pub fn path(mut self, path: impl Into<String>) -> Self {
        self.path = path.into();
        self
    }

    /// Sets the revision field.
    #[must_use]
    pub fn change_field(mut self, field: impl Into<String>) -> Self {
        self.change.field = field.into();
        self
    }

    /// Sets the strftime format for string revisions.
    #[must_use]
    pub fn change_format(mut self, format: impl Into<String>) -> Self {
        self.change.format = format.into();
        self
    }

    /// Builds the resource with a fresh id and no partitions.
    pub fn build(self) -> Resource {
        Resource {
            id: ResourceId::new(),
            addresses: self.addresses,
            path: self.path,
            change: self.change,
            partitions: BTreeMap::new(),
            created_at: Utc::now(),
        }
    }
}

impl Default for ResourceBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Builder for test subscriptions.
#[derive(Debug, Clone)]
pub struct SubscriptionBuilder {
    resource_id: ResourceId,
    partition: Option<PartitionId>,
    endpoint: Endpoint,
    delivery: DeliveryPolicy,
    content: ContentOptions,
    data: Map<String, Value>,
}

impl SubscriptionBuilder {
    /// Creates a builder posting to `url` for the given resource.
    pub fn new(resource_id: ResourceId, url: impl Into<String>) -> Self {
        Self {
            resource_id,
            partition: None,
            endpoint: Endpoint::new(url),
            delivery: DeliveryPolicy::default(),
            content: ContentOptions::default(),
            data: Map::new(),
        }
    }

    /// Pins the partition instead of joining one.
    #[must_use]
    pub fn partition(mut self, partition: PartitionId) -> Self {
        self.partition = Some(partition);
        self
    }

    /// Sets the default HTTP method.
    #[must_use]
    pub fn method(mut self, method: impl Into<String>) -> Self {
        self.endpoint.method = method.into();
        self
    }

    /// Adds a default request header.
    #[must_use]
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.endpoint.headers.insert(name.into(), value.into());
        self
    }

    /// Overrides the endpoint for one action.
    #[must_use]
    pub fn on(mut self, action: Action, endpoint: EndpointOverride) -> Self {
        self.endpoint.actions.insert(action, endpoint);
        self
    }

    /// Sets the codes counted as delivered.
    #[must_use]
    pub fn success_codes(mut self, codes: &[u16]) -> Self {
        self.delivery.success_codes = codes.to_vec();
        self
    }

    /// Sets the codes that end an attempt without retry.
    #[must_use]
    pub fn discard_codes(mut self, codes: &[u16]) -> Self {
        self.delivery.discard_codes = codes.to_vec();
        self
    }

    /// Sets the ledger retry policy.
    #[must_use]
    pub fn retry(mut self, retry: RetryPolicy) -> Self {
        self.delivery.retry = retry;
        self
    }

    /// Embeds the document in the envelope.
    #[must_use]
    pub fn include_document(mut self) -> Self {
        self.content.include_document = true;
        self
    }

    /// Sends the document content verbatim instead of the envelope.
    #[must_use]
    pub fn raw_body(mut self) -> Self {
        self.content.envelope = false;
        self
    }

    /// Adds a templated data value.
    #[must_use]
    pub fn data(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.data.insert(key.into(), value.into());
        self
    }

    /// Builds the subscription; without a pinned partition a fresh id is
    /// used as a placeholder.
    pub fn build(self) -> Subscription {
        Subscription {
            id: SubscriptionId::new(),
            resource_id: self.resource_id,
            partition: self.partition.unwrap_or_default(),
            endpoint: self.endpoint,
            delivery: self.delivery,
            content: self.content,
            data: self.data,
            created_at: Utc::now(),
        }
    }

    pub(crate) fn has_partition(&self) -> bool {
        self.partition.is_some()
    }
}

/// Builder for document content.
#[derive(Debug, Clone)]
pub struct DocumentBuilder {
    content: Map<String, Value>,
}

impl DocumentBuilder {
    /// Creates content carrying `revision` in the default change field and a
    /// random name.
    pub fn new(revision: i64) -> Self {
        let mut content = Map::new();
        content.insert(
            "name".to_string(),
            Value::from(format!("user-{}", rand::rng().random_range(1000..9999))),
        );
        content.insert(DEFAULT_CHANGE_FIELD.to_string(), Value::from(revision));
        Self { content }
    }

    /// Sets a top-level field.
    #[must_use]
    pub fn field(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.content.insert(key.into(), value.into());
        self
    }

    /// Builds the content object.
    pub fn build(self) -> Map<String, Value> {
        self.content
    }
}
