//! Typed event envelopes and fan-out publishing.
//!
//! Every state-changing API and worker publishes an [`EventEnvelope`]
//! after its DB transaction commits. The publisher validates the payload
//! against the event type's registered schema (unknown types are
//! rejected), evicts the user's dashboard/balance cache keys, publishes
//! to the global pub/sub channel, and appends `user:` room events to the
//! user's bounded replay stream.

use std::collections::HashMap;
use std::sync::Arc;

use common::id::UserId;
use common::time::TimestampMs;
use numio_api_core::models::{EventEnvelope, EventMeta};
use serde_json::Value;
use tracing::warn;
use uuid::Uuid;

use crate::constants::USER_STREAM_MAXLEN;
use crate::traits::{EventTransport, KvCache, StoreError};

#[derive(Debug, thiserror::Error)]
pub enum PublishError {
    #[error("Unknown event type '{0}'")]
    UnknownType(String),
    #[error("Payload for '{event_type}' is missing field '{field}'")]
    MissingField {
        event_type: String,
        field: &'static str,
    },
    #[error("Payload must be a JSON object")]
    NotAnObject,
    #[error(transparent)]
    Transport(#[from] StoreError),
}

/// A registered event type: its dotted name and the payload fields it
/// must carry.
struct EventSchema {
    required_fields: &'static [&'static str],
}

/// The registry of every event type this deployment can publish.
/// Publishing an unregistered type is a bug, not data.
pub struct EventRegistry {
    schemas: HashMap<&'static str, EventSchema>,
}

impl Default for EventRegistry {
    fn default() -> Self {
        Self::builtin()
    }
}

impl EventRegistry {
    pub fn builtin() -> Self {
        let mut schemas = HashMap::new();
        let mut register = |name, required_fields| {
            schemas.insert(name, EventSchema { required_fields });
        };

        register("offer.created", &["offer_id"][..]);
        register("offer.updated", &["offer_id"][..]);
        register("offer.deleted", &["offer_id"][..]);
        register("service_aggregate.updated", &[][..]);
        register("provider.synced", &["provider_id"][..]);
        register("provider.balance_low", &["provider_id", "balance"][..]);
        register("provider_request", &["activation_id"][..]);
        register("number.purchased", &["number_id", "phone_number"][..]);
        register("number.updated", &["number_id", "status"][..]);
        register("sms.received", &["number_id", "sender"][..]);
        register("activation.updated", &["activation_id", "state"][..]);
        register("activation.refunded", &["activation_id", "amount"][..]);
        register("wallet.updated", &["balance"][..]);

        Self { schemas }
    }

    pub fn validate(
        &self,
        event_type: &str,
        payload: &Value,
    ) -> Result<(), PublishError> {
        let schema = self.schemas.get(event_type).ok_or_else(|| {
            PublishError::UnknownType(event_type.to_owned())
        })?;
        let object = payload.as_object().ok_or(PublishError::NotAnObject)?;
        for field in schema.required_fields {
            if !object.contains_key(*field) {
                return Err(PublishError::MissingField {
                    event_type: event_type.to_owned(),
                    field,
                });
            }
        }
        Ok(())
    }
}

/// Cache keys invalidated before publishing to a user's room.
pub fn user_cache_keys(user_id: UserId) -> [String; 2] {
    [
        format!("cache:dashboard:{user_id}"),
        format!("cache:balance:{user_id}"),
    ]
}

#[derive(Clone)]
pub struct EventPublisher {
    registry: Arc<EventRegistry>,
    transport: Arc<dyn EventTransport>,
    cache: Arc<dyn KvCache>,
    source: &'static str,
}

impl EventPublisher {
    pub fn new(
        transport: Arc<dyn EventTransport>,
        cache: Arc<dyn KvCache>,
        source: &'static str,
    ) -> Self {
        Self {
            registry: Arc::new(EventRegistry::builtin()),
            transport,
            cache,
            source,
        }
    }

    /// Publishes an event to a user's room (and the global channel).
    pub async fn publish_user(
        &self,
        user_id: UserId,
        event_type: &str,
        payload: Value,
        correlation_id: Option<Uuid>,
    ) -> Result<EventEnvelope, PublishError> {
        let envelope = self.envelope(
            event_type,
            format!("user:{user_id}"),
            payload,
            correlation_id,
        )?;

        // Evict the user's cached dashboard/balance before anyone reacts
        // to the event and re-reads them.
        for key in user_cache_keys(user_id) {
            if let Err(e) = self.cache.del(&key).await {
                warn!("Cache eviction failed for {key}: {e}");
            }
        }

        self.transport.publish_global(&envelope).await?;
        self.transport
            .append_user_stream(user_id, &envelope, USER_STREAM_MAXLEN)
            .await?;
        Ok(envelope)
    }

    /// Publishes an event to a non-user room (e.g. `order:{id}`); global
    /// channel only, no replay stream.
    pub async fn publish_room(
        &self,
        room: String,
        event_type: &str,
        payload: Value,
        correlation_id: Option<Uuid>,
    ) -> Result<EventEnvelope, PublishError> {
        let envelope =
            self.envelope(event_type, room, payload, correlation_id)?;
        self.transport.publish_global(&envelope).await?;
        Ok(envelope)
    }

    fn envelope(
        &self,
        event_type: &str,
        room: String,
        payload: Value,
        correlation_id: Option<Uuid>,
    ) -> Result<EventEnvelope, PublishError> {
        self.registry.validate(event_type, &payload)?;
        Ok(EventEnvelope {
            v: 1,
            event_id: Uuid::new_v4(),
            ts: TimestampMs::now(),
            event_type: event_type.to_owned(),
            room,
            payload,
            seq: None,
            meta: EventMeta {
                correlation_id,
                source: Some(self.source.to_owned()),
            },
        })
    }
}

#[cfg(test)]
mod test {
    use serde_json::json;

    use super::*;
    use crate::store::memory::MemStore;

    #[tokio::test]
    async fn publish_validates_and_fans_out() {
        let store = Arc::new(MemStore::new());
        let publisher = EventPublisher::new(
            store.clone(),
            store.clone(),
            "test",
        );
        let user = UserId(42);

        // Unknown type rejected.
        let err = publisher
            .publish_user(user, "nope.nope", json!({}), None)
            .await
            .unwrap_err();
        assert!(matches!(err, PublishError::UnknownType(_)));

        // Missing required field rejected.
        let err = publisher
            .publish_user(user, "sms.received", json!({"sender": "TG"}), None)
            .await
            .unwrap_err();
        assert!(matches!(err, PublishError::MissingField { .. }));

        // Valid publish reaches global channel and the user stream.
        let envelope = publisher
            .publish_user(
                user,
                "sms.received",
                json!({"number_id": 1, "sender": "TG"}),
                None,
            )
            .await
            .unwrap();
        assert_eq!(envelope.v, 1);
        assert_eq!(envelope.room, "user:42");

        assert_eq!(store.published_events().len(), 1);
        let entries = store
            .read_user_stream(user, None, 10)
            .await
            .unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].1.event_type, "sms.received");
    }

    #[tokio::test]
    async fn stream_replay_after_id() {
        let store = Arc::new(MemStore::new());
        let publisher =
            EventPublisher::new(store.clone(), store.clone(), "test");
        let user = UserId(1);

        for i in 0..5 {
            publisher
                .publish_user(
                    user,
                    "number.updated",
                    json!({"number_id": i, "status": "active"}),
                    None,
                )
                .await
                .unwrap();
        }

        let all = store.read_user_stream(user, None, 10).await.unwrap();
        assert_eq!(all.len(), 5);

        // Reconnect replay: everything after the 3rd entry.
        let after = store
            .read_user_stream(user, Some(all[2].0.as_str()), 10)
            .await
            .unwrap();
        assert_eq!(after.len(), 2);
        assert_eq!(after[0].1.payload["number_id"], json!(3));
    }

    #[tokio::test]
    async fn user_publish_evicts_cache() {
        let store = Arc::new(MemStore::new());
        let publisher =
            EventPublisher::new(store.clone(), store.clone(), "test");
        let user = UserId(9);

        use crate::traits::KvCache;
        for key in user_cache_keys(user) {
            store
                .set(&key, "cached", std::time::Duration::from_secs(60))
                .await
                .unwrap();
        }

        publisher
            .publish_user(
                user,
                "wallet.updated",
                json!({"balance": "10.00"}),
                None,
            )
            .await
            .unwrap();

        for key in user_cache_keys(user) {
            assert_eq!(store.get(&key).await.unwrap(), None);
        }
    }
}
