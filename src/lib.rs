//! Minol MQTT Bridge Library
//!
//! Periodically logs into the Minol eMonitoring portal, turns the meter and
//! consumption data into a snapshot and publishes it to an MQTT broker using
//! Home Assistant discovery.

pub mod config;
pub mod data_fetcher;
pub mod discovery_publisher;
pub mod errors;
pub mod home_assistant;
pub mod model;
pub mod mqtt_transport;
pub mod normalizer;
pub mod portal_session;
pub mod snapshot_cache;
pub mod sync_coordinator;

// Re-export commonly used types for easier access
pub use config::BridgeConfig;
pub use data_fetcher::{ConsumptionSource, PortalDataFetcher};
pub use discovery_publisher::{DiscoveryPublisher, PublishedEntityRegistry};
pub use errors::SyncError;
pub use home_assistant::Topics;
pub use model::{ConsumptionTotal, ConsumptionType, CustomerAccount, Device, Snapshot};
pub use mqtt_transport::{MessageTransport, MqttSettings, MqttTransport};
pub use portal_session::{Credentials, HttpSessionProvider, Session, SessionProvider};
pub use snapshot_cache::SnapshotCache;
pub use sync_coordinator::{SyncCoordinator, SyncSettings};
