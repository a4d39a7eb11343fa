// ABOUTME: Payment-provider webhook dispatch onto StateManager create/update/delete
// ABOUTME: Transport-agnostic: takes the raw body, returns a status code and a public message

use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;

use crate::manager::StateManager;
use crate::model::RecordKind;

/// Bodies larger than this are rejected unread.
pub const MAX_BODY_BYTES: usize = 65_536;

pub const STATUS_OK: u16 = 200;
pub const STATUS_BAD_REQUEST: u16 = 400;
pub const STATUS_INTERNAL_ERROR: u16 = 500;
pub const STATUS_UNAVAILABLE: u16 = 503;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    CreateOrUpdate,
    Delete,
}

#[derive(Debug, Deserialize)]
struct Event {
    #[serde(rename = "type")]
    event_type: String,
    data: EventData,
}

#[derive(Debug, Deserialize)]
struct EventData {
    object: Value,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WebhookResponse {
    pub status: u16,
    pub message: String,
}

impl WebhookResponse {
    fn new(status: u16, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }
}

/// Map an event type such as `customer.subscription.updated` to the record
/// kind and action it triggers. `None` for events that are not handled.
pub fn route(event_type: &str) -> Option<(RecordKind, Action)> {
    let (object, verb) = event_type.rsplit_once('.')?;
    let kind = match object {
        "customer.subscription" => RecordKind::Subscription,
        "customer" => RecordKind::Customer,
        "plan" => RecordKind::Plan,
        "product" => RecordKind::Product,
        _ => return None,
    };
    let action = match verb {
        "created" | "updated" => Action::CreateOrUpdate,
        "deleted" => Action::Delete,
        _ => return None,
    };
    Some((kind, action))
}

pub struct WebhookHandler {
    manager: Arc<StateManager>,
}

impl WebhookHandler {
    pub fn new(manager: Arc<StateManager>) -> Self {
        Self { manager }
    }

    pub async fn handle(&self, body: &[u8]) -> WebhookResponse {
        if body.len() > MAX_BODY_BYTES {
            tracing::warn!(size = body.len(), "Webhook body exceeds {} bytes", MAX_BODY_BYTES);
            return WebhookResponse::new(STATUS_UNAVAILABLE, "request body too large");
        }

        let event: Event = match serde_json::from_slice(body) {
            Ok(event) => event,
            Err(e) => {
                tracing::warn!("Failed to parse webhook body json: {}", e);
                return WebhookResponse::new(STATUS_BAD_REQUEST, "malformed event");
            }
        };

        let Some((kind, action)) = route(&event.event_type) else {
            tracing::debug!(event_type = %event.event_type, "Unhandled event type");
            return WebhookResponse::new(STATUS_OK, "ignored");
        };

        let result = match action {
            Action::CreateOrUpdate => self
                .manager
                .create_or_update_value(kind, &event.data.object)
                .await
                .map(|_| ()),
            Action::Delete => self
                .manager
                .delete_value(kind, &event.data.object)
                .await
                .map(|_| ()),
        };

        match result {
            Ok(()) => {
                tracing::info!(event_type = %event.event_type, "Handled webhook event");
                WebhookResponse::new(STATUS_OK, "ok")
            }
            Err(e) => {
                tracing::error!(event_type = %event.event_type, "Webhook {:?} failed: {}", action, e);
                WebhookResponse::new(STATUS_INTERNAL_ERROR, e.public_message())
            }
        }
    }
}
