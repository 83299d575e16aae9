//! Home Assistant MQTT discovery: entity ids, topics and payload shapes.

use crate::model::{alphanumeric, ConsumptionTotal, ConsumptionType, CustomerAccount, Device, Snapshot};
use serde_derive::Serialize;
use serde_json::{json, Value};
use time::format_description::well_known::Rfc3339;

pub const DEFAULT_DISCOVERY_PREFIX: &str = "homeassistant";
pub const DEFAULT_STATE_PREFIX: &str = "minol";

/// State payload for a value the portal did not deliver. Home Assistant
/// renders it as "unknown".
pub const ABSENT_STATE: &str = "None";

/// Registry key for a published entity.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum EntityKey {
    Account,
    Total(ConsumptionType),
    Device(String),
    DinComparison(ConsumptionType),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DiscoveryDevice {
    pub identifiers: Vec<String>,
    pub name: String,
    pub manufacturer: String,
    pub model: String,
}

impl Default for DiscoveryDevice {
    fn default() -> Self {
        Self {
            identifiers: vec!["minol_account".to_string()],
            name: "Minol Customer Portal".to_string(),
            manufacturer: "Minol".to_string(),
            model: "eMonitoring Portal".to_string(),
        }
    }
}

/// Body of a `<prefix>/sensor/minol/<object_id>/config` message.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DiscoveryConfig {
    pub name: String,
    pub unique_id: String,
    pub state_topic: String,
    pub json_attributes_topic: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unit_of_measurement: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_class: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state_class: Option<String>,
    pub icon: String,
    pub platform: String,
    pub device: DiscoveryDevice,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Topics {
    discovery_prefix: String,
    state_prefix: String,
}

impl Default for Topics {
    fn default() -> Self {
        Self::new(DEFAULT_DISCOVERY_PREFIX, DEFAULT_STATE_PREFIX)
    }
}

impl Topics {
    pub fn new(discovery_prefix: impl Into<String>, state_prefix: impl Into<String>) -> Self {
        Self {
            discovery_prefix: discovery_prefix.into().trim_end_matches('/').to_string(),
            state_prefix: state_prefix.into().trim_end_matches('/').to_string(),
        }
    }

    pub fn discovery(&self, object_id: &str) -> String {
        format!("{}/sensor/minol/{object_id}/config", self.discovery_prefix)
    }

    pub fn state(&self, object_id: &str) -> String {
        format!("{}/{object_id}/state", self.state_prefix)
    }

    pub fn attributes(&self, object_id: &str) -> String {
        format!("{}/{object_id}/attributes", self.state_prefix)
    }
}

/// One sensor as Home Assistant sees it, with its current state.
#[derive(Debug, Clone, PartialEq)]
pub struct Entity {
    pub key: EntityKey,
    pub object_id: String,
    pub name: String,
    pub unit: Option<&'static str>,
    pub device_class: Option<&'static str>,
    pub state_class: Option<&'static str>,
    pub icon: &'static str,
    pub state: String,
    pub attributes: Value,
}

impl Entity {
    pub fn discovery_config(&self, topics: &Topics) -> DiscoveryConfig {
        DiscoveryConfig {
            name: self.name.clone(),
            unique_id: format!("minol_{}", self.object_id),
            state_topic: topics.state(&self.object_id),
            json_attributes_topic: topics.attributes(&self.object_id),
            unit_of_measurement: self.unit.map(str::to_string),
            device_class: self.device_class.map(str::to_string),
            state_class: self.state_class.map(str::to_string),
            icon: self.icon.to_string(),
            platform: "mqtt".to_string(),
            device: DiscoveryDevice::default(),
        }
    }
}

fn icon(consumption_type: ConsumptionType) -> &'static str {
    match consumption_type {
        ConsumptionType::Heating => "mdi:radiator",
        ConsumptionType::HotWater => "mdi:water-thermometer",
        ConsumptionType::ColdWater => "mdi:water-pump",
    }
}

fn device_class(consumption_type: ConsumptionType) -> &'static str {
    match consumption_type {
        ConsumptionType::Heating => "energy",
        ConsumptionType::HotWater | ConsumptionType::ColdWater => "water",
    }
}

fn state_value(value: Option<f64>) -> String {
    value.map_or_else(|| ABSENT_STATE.to_string(), |v| v.to_string())
}

pub fn device_object_id(device: &Device) -> String {
    let room = alphanumeric(&device.room).to_lowercase();
    let number = device.device_number.as_deref().map(alphanumeric).unwrap_or_default();
    if number.is_empty() {
        format!("{}_{room}", device.consumption_type.key())
    } else {
        format!("{}_{room}_{number}", device.consumption_type.key())
    }
}

/// All entities of a snapshot in publish order: account, totals, devices
/// sorted by id, then DIN comparison sensors.
pub fn entities(snapshot: &Snapshot) -> Vec<Entity> {
    let last_update = snapshot.fetched_at.format(&Rfc3339).unwrap_or_default();
    let mut out = Vec::new();

    if let Some(account) = &snapshot.account {
        out.push(account_entity(account, &last_update));
    }
    out.extend(snapshot.totals.values().map(|t| total_entity(t, snapshot, &last_update)));
    out.extend(snapshot.devices.values().map(|d| device_entity(d, snapshot, &last_update)));
    out.extend(
        snapshot
            .totals
            .values()
            .filter_map(|t| din_entity(t, &last_update)),
    );
    out
}

fn account_entity(account: &CustomerAccount, last_update: &str) -> Entity {
    let state = if account.customer_number.is_empty() {
        "N/A".to_string()
    } else {
        account.customer_number.clone()
    };
    Entity {
        key: EntityKey::Account,
        object_id: "customer_info".to_string(),
        name: "Minol Customer Info".to_string(),
        unit: None,
        device_class: None,
        state_class: None,
        icon: "mdi:account",
        state,
        attributes: json!({
            "email": account.email,
            "customer_number": account.customer_number,
            "tenant_number": account.tenant_number,
            "property_number": account.property_number,
            "floor": account.floor,
            "position": account.position,
            "address": account.address,
            "name": account.name,
            "move_in_date": account.move_in_date,
            "last_update": last_update,
        }),
    }
}

fn total_entity(total: &ConsumptionTotal, snapshot: &Snapshot, last_update: &str) -> Entity {
    let consumption_type = total.consumption_type;
    let monthly: Vec<Value> = total
        .timeline
        .iter()
        .map(|m| json!({ "period": m.period, "value": m.value }))
        .collect();
    Entity {
        key: EntityKey::Total(consumption_type),
        object_id: format!("{}_total", consumption_type.key()),
        name: format!("Minol {} Total", consumption_type.display_name()),
        unit: Some(total.unit),
        device_class: Some(device_class(consumption_type)),
        state_class: Some("total_increasing"),
        icon: icon(consumption_type),
        state: state_value(total.value),
        attributes: json!({
            "value": total.value,
            "unit": total.unit,
            "available": total.value.is_some(),
            "monthly_data": monthly,
            "din_comparison_percent": total.din_comparison,
            "device_count": snapshot.devices_of(consumption_type).count(),
            "last_update": last_update,
        }),
    }
}

fn device_entity(device: &Device, snapshot: &Snapshot, last_update: &str) -> Entity {
    let consumption_type = device.consumption_type;
    let unit = consumption_type.unit();
    // The portal has no per-meter history; the account-wide timeline is attached instead.
    let overall: Vec<Value> = snapshot
        .total(consumption_type)
        .map(|t| {
            t.timeline
                .iter()
                .map(|m| json!({ "period": m.period, "value": m.value }))
                .collect()
        })
        .unwrap_or_default();
    Entity {
        key: EntityKey::Device(device.device_id.clone()),
        object_id: device_object_id(device),
        name: match &device.device_number {
            Some(number) => format!("Minol {} {} ({number})", device.room, consumption_type.display_name()),
            None => format!("Minol {} {}", device.room, consumption_type.display_name()),
        },
        unit: Some(unit),
        device_class: Some(device_class(consumption_type)),
        state_class: Some("total_increasing"),
        icon: icon(consumption_type),
        state: device.evaluated_consumption.to_string(),
        attributes: json!({
            "room_name": device.room,
            "device_number": device.device_number.as_deref().unwrap_or_default(),
            "consumption_type": consumption_type.key(),
            "current_reading": device.current_reading,
            "initial_reading": device.initial_reading,
            "evaluation_factor": device.evaluation_factor,
            "consumption_evaluated": device.evaluated_consumption,
            "consumption_reported": device.reported_consumption,
            "unit": unit,
            "unit_raw": device.raw_unit,
            "overall_timeline": overall,
            "last_update": last_update,
        }),
    }
}

fn din_entity(total: &ConsumptionTotal, last_update: &str) -> Option<Entity> {
    let percent = total.din_comparison?;
    let consumption_type = total.consumption_type;
    let interpretation = if percent > 0.0 {
        "above average"
    } else {
        "below average"
    };
    Some(Entity {
        key: EntityKey::DinComparison(consumption_type),
        object_id: format!("{}_din_comparison", consumption_type.key()),
        name: format!("Minol {} DIN Comparison", consumption_type.display_name()),
        unit: Some("%"),
        device_class: None,
        state_class: Some("measurement"),
        icon: "mdi:chart-line",
        state: percent.to_string(),
        attributes: json!({
            "interpretation": interpretation,
            "din_comparison_percent": percent,
            "last_update": last_update,
        }),
    })
}
