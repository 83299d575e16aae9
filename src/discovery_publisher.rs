use crate::errors::SyncError;
use crate::home_assistant::{entities, EntityKey, Topics};
use crate::model::Snapshot;
use crate::mqtt_transport::MessageTransport;
use std::collections::BTreeMap;
use tracing::{debug, info};

/// Which entities already had their discovery config sent in this process,
/// and under which object id.
///
/// Append-only. A restart starts empty, so discovery is re-sent once after
/// every restart. A key whose object id changes (a renamed room) counts as
/// unregistered until the new id has been announced.
#[derive(Debug, Default)]
pub struct PublishedEntityRegistry {
    registered: BTreeMap<EntityKey, String>,
}

impl PublishedEntityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_registered(&self, key: &EntityKey) -> bool {
        self.registered.contains_key(key)
    }

    pub fn is_registered_as(&self, key: &EntityKey, object_id: &str) -> bool {
        self.registered.get(key).is_some_and(|id| id == object_id)
    }

    pub fn mark_registered(&mut self, key: EntityKey, object_id: impl Into<String>) {
        self.registered.insert(key, object_id.into());
    }

    pub fn len(&self) -> usize {
        self.registered.len()
    }

    pub fn is_empty(&self) -> bool {
        self.registered.is_empty()
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PublishReport {
    pub discovery_sent: usize,
    pub entities_updated: usize,
}

pub struct DiscoveryPublisher<T> {
    transport: T,
    topics: Topics,
}

impl<T: MessageTransport> DiscoveryPublisher<T> {
    pub fn new(transport: T, topics: Topics) -> Self {
        Self { transport, topics }
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    /// Sends discovery (first time only), state and attributes for every entity.
    ///
    /// Stops at the first transport failure. Whatever went out before that,
    /// registrations included, stays as sent.
    pub async fn publish(
        &mut self,
        snapshot: &Snapshot,
        registry: &mut PublishedEntityRegistry,
    ) -> Result<PublishReport, SyncError> {
        let mut report = PublishReport::default();

        for entity in entities(snapshot) {
            if !registry.is_registered_as(&entity.key, &entity.object_id) {
                let config = serde_json::to_vec(&entity.discovery_config(&self.topics))
                    .map_err(|e| SyncError::Transport(format!("encoding discovery config: {e}")))?;
                self.transport
                    .publish(&self.topics.discovery(&entity.object_id), config, true)
                    .await?;
                registry.mark_registered(entity.key.clone(), entity.object_id.clone());
                report.discovery_sent += 1;
                debug!(object_id = %entity.object_id, "Discovery config sent");
            }

            self.transport
                .publish(
                    &self.topics.state(&entity.object_id),
                    entity.state.into_bytes(),
                    true,
                )
                .await?;
            let attributes = serde_json::to_vec(&entity.attributes)
                .map_err(|e| SyncError::Transport(format!("encoding attributes: {e}")))?;
            self.transport
                .publish(&self.topics.attributes(&entity.object_id), attributes, true)
                .await?;
            report.entities_updated += 1;
        }

        info!(
            entities = report.entities_updated,
            discovery = report.discovery_sent,
            "Data published to MQTT"
        );
        Ok(report)
    }

    pub async fn close(&mut self) {
        self.transport.close().await;
    }
}
