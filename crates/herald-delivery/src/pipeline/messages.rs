//! JSON envelopes exchanged between stages.
//!
//! Each hop adds one field: the partition stage adds `partition`, the spread
//! stage adds `subscriptionID`.

use bytes::Bytes;
use herald_core::{Action, DocumentId, PartitionId, ResourceId, SubscriptionId};
use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::error::Result;

/// Input of the partition stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionMessage {
    /// Change kind.
    pub action: Action,
    /// Changed document.
    #[serde(rename = "documentID")]
    pub document_id: DocumentId,
    /// Resource the document belongs to.
    #[serde(rename = "resourceID")]
    pub resource_id: ResourceId,
}

/// Input of the spread stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpreadMessage {
    /// Change kind.
    pub action: Action,
    /// Changed document.
    #[serde(rename = "documentID")]
    pub document_id: DocumentId,
    /// Resource the document belongs to.
    #[serde(rename = "resourceID")]
    pub resource_id: ResourceId,
    /// Partition whose subscriptions are spread.
    pub partition: PartitionId,
}

/// Input of the delivery stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryMessage {
    /// Change kind.
    pub action: Action,
    /// Changed document.
    #[serde(rename = "documentID")]
    pub document_id: DocumentId,
    /// Resource the document belongs to.
    #[serde(rename = "resourceID")]
    pub resource_id: ResourceId,
    /// Partition the subscription came from.
    pub partition: PartitionId,
    /// Subscription to notify.
    #[serde(rename = "subscriptionID")]
    pub subscription_id: SubscriptionId,
}

impl PartitionMessage {
    /// Message for one partition of this change.
    pub fn spread(&self, partition: PartitionId) -> SpreadMessage {
        SpreadMessage {
            action: self.action,
            document_id: self.document_id.clone(),
            resource_id: self.resource_id,
            partition,
        }
    }
}

impl SpreadMessage {
    /// Message for one subscription of this partition.
    pub fn deliver(&self, subscription_id: SubscriptionId) -> DeliveryMessage {
        DeliveryMessage {
            action: self.action,
            document_id: self.document_id.clone(),
            resource_id: self.resource_id,
            partition: self.partition,
            subscription_id,
        }
    }
}

/// Encodes an envelope.
pub fn encode<T: Serialize>(message: &T) -> Result<Bytes> {
    Ok(Bytes::from(serde_json::to_vec(message)?))
}

/// Decodes an envelope.
pub fn decode<T: DeserializeOwned>(payload: &[u8]) -> Result<T> {
    Ok(serde_json::from_slice(payload)?)
}
