//! Rendering and classification of webhook notifications.
//!
//! A notification is built from the subscription endpoint (with its
//! per-action override), the wildcard values captured from the document id
//! and the document revision. Responses are classified against the
//! subscription's delivery policy.

use std::collections::HashMap;

use bytes::Bytes;
use herald_core::{
    models::DeliveryPolicy, resolver, wildcard, Action, Document, Resource, Subscription,
};
use percent_encoding::{utf8_percent_encode, AsciiSet, CONTROLS};
use serde_json::{Map, Value};

use crate::{
    client::{DeliveryResponse, NotificationRequest},
    error::{DeliveryError, Result},
};

/// Characters escaped when a wildcard value lands in an endpoint URL.
const URL_VALUE: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'"')
    .add(b'#')
    .add(b'%')
    .add(b'/')
    .add(b'<')
    .add(b'>')
    .add(b'?')
    .add(b'`')
    .add(b'{')
    .add(b'}');

/// How an endpoint response was accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotificationOutcome {
    /// Status matched the success codes.
    Delivered {
        /// HTTP status code
        status: u16,
    },
    /// Status matched the discard codes; treated as delivered by the ledger.
    Discarded {
        /// HTTP status code
        status: u16,
    },
}

/// Wildcard values available to the endpoint templates of a subscription.
///
/// Values come from matching the resource path against the document id,
/// plus `revision`. They are percent-decoded; [`build_request`] escapes
/// them again for the endpoint URL.
///
/// # Errors
///
/// Returns `Template` when the document id does not fit the resource path.
pub fn template_values(resource: &Resource, document: &Document) -> Result<HashMap<String, String>> {
    let path = resolver::relative_path(resource, document.id.as_str())
        .unwrap_or_else(|| document.id.path());
    let mut values = wildcard::extract_value(&resource.path, &path).map_err(|e| {
        DeliveryError::template(format!(
            "document `{}` does not fit `{}`: {e}",
            document.id, resource.path
        ))
    })?;
    values.insert(wildcard::REVISION.to_string(), document.revision.to_string());
    Ok(values)
}

/// Builds the outbound request for one ledger decision.
///
/// # Errors
///
/// Returns `Template` for unrenderable templates and `Serialization` if the
/// body cannot be encoded.
pub fn build_request(
    subscription: &Subscription,
    resource: &Resource,
    action: Action,
    document: &Document,
) -> Result<NotificationRequest> {
    let endpoint = subscription.endpoint.resolve(action);
    let values = template_values(resource, document)?;
    let escaped: HashMap<_, _> = values
        .iter()
        .map(|(name, value)| (name.clone(), utf8_percent_encode(value, URL_VALUE).to_string()))
        .collect();

    let url = wildcard::replace(&endpoint.url, &escaped)
        .map_err(|e| DeliveryError::template(format!("endpoint url: {e}")))?;
    if wildcard::is_present(&url) {
        return Err(DeliveryError::template(format!("unfilled wildcard in `{url}`")));
    }

    let mut data = Map::with_capacity(subscription.data.len());
    for (key, value) in &subscription.data {
        let rendered = match value {
            Value::String(template) => Value::String(
                wildcard::replace(template, &values)
                    .map_err(|e| DeliveryError::template(format!("data `{key}`: {e}")))?,
            ),
            other => other.clone(),
        };
        data.insert(key.clone(), rendered);
    }

    let body = render_body(subscription, action, document, data)?;

    Ok(NotificationRequest {
        subscription_id: subscription.id,
        document_id: document.id.clone(),
        action,
        revision: document.revision,
        url,
        method: endpoint.method,
        headers: endpoint.headers,
        body,
    })
}

fn render_body(
    subscription: &Subscription,
    action: Action,
    document: &Document,
    data: Map<String, Value>,
) -> Result<Bytes> {
    if !subscription.content.envelope {
        return Ok(Bytes::from(serde_json::to_vec(&document.content)?));
    }

    let mut envelope = Map::new();
    envelope.insert("id".to_string(), Value::String(document.id.to_string()));
    envelope.insert("action".to_string(), Value::String(action.as_str().to_string()));
    envelope.insert("updatedAt".to_string(), Value::String(document.updated_at.to_rfc3339()));
    if !data.is_empty() {
        envelope.insert("data".to_string(), Value::Object(data));
    }
    if subscription.content.include_document {
        envelope.insert("document".to_string(), Value::Object(document.content.clone()));
    }

    Ok(Bytes::from(serde_json::to_vec(&envelope)?))
}

/// Classifies a response against the delivery policy.
///
/// # Errors
///
/// Returns `UnexpectedStatus` for any status outside both code lists.
pub fn classify(policy: &DeliveryPolicy, response: &DeliveryResponse) -> Result<NotificationOutcome> {
    let status = response.status_code;
    if policy.is_success(status) {
        Ok(NotificationOutcome::Delivered { status })
    } else if policy.is_discard(status) {
        Ok(NotificationOutcome::Discarded { status })
    } else {
        Err(DeliveryError::unexpected_status(status, response.body.clone()))
    }
}
