use serde_derive::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use time::OffsetDateTime;

/// The fixed set of consumption types the portal reports.
///
/// The derived ordering is the publish order: heating, hot water, cold water.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConsumptionType {
    Heating,
    HotWater,
    ColdWater,
}

impl ConsumptionType {
    pub const ALL: [ConsumptionType; 3] = [Self::Heating, Self::HotWater, Self::ColdWater];

    /// Stable key used in topics and entity ids
    pub fn key(self) -> &'static str {
        match self {
            Self::Heating => "heating",
            Self::HotWater => "hot_water",
            Self::ColdWater => "cold_water",
        }
    }

    pub fn unit(self) -> &'static str {
        match self {
            Self::Heating => "kWh",
            Self::HotWater | Self::ColdWater => "m³",
        }
    }

    pub fn display_name(self) -> &'static str {
        match self {
            Self::Heating => "Heating",
            Self::HotWater => "Hot Water",
            Self::ColdWater => "Cold Water",
        }
    }

    /// `consType` value understood by the portal's readData endpoint
    pub fn portal_code(self) -> &'static str {
        match self {
            Self::Heating => "HEIZUNG",
            Self::HotWater => "WARMWASSER",
            Self::ColdWater => "KALTWASSER",
        }
    }

    /// `dlgKey` value paired with [`Self::portal_code`]
    pub fn dialog_key(self) -> &'static str {
        match self {
            Self::Heating => "100EH",
            Self::HotWater => "100WW",
            Self::ColdWater => "100KW",
        }
    }
}

impl fmt::Display for ConsumptionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.key())
    }
}

/// Keeps only alphanumerics (umlauts included), for entity ids and topic segments.
pub fn alphanumeric(value: &str) -> String {
    value.chars().filter(|c| c.is_alphanumeric()).collect()
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CustomerAccount {
    pub customer_number: String,
    pub email: String,
    pub tenant_number: String,
    pub property_number: String,
    pub address: String,
    pub floor: String,
    pub position: String,
    pub name: String,
    pub move_in_date: String,
}

/// A single meter as reported in the portal's per-room table.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Device {
    pub device_id: String,
    /// Meter number as printed on the device; `None` when the portal left it out.
    pub device_number: Option<String>,
    pub room: String,
    pub consumption_type: ConsumptionType,
    pub current_reading: f64,
    pub initial_reading: f64,
    pub evaluation_factor: f64,
    pub evaluated_consumption: f64,
    /// Consumption as the portal computed it, kept for reference only.
    pub reported_consumption: Option<f64>,
    pub raw_unit: String,
}

impl Device {
    /// `(current - initial) * factor`, never below zero.
    ///
    /// Meter swaps and reading corrections can make `current < initial`;
    /// those show up as zero consumption instead of a negative value.
    pub fn evaluate(current: f64, initial: f64, factor: f64) -> f64 {
        let value = (current - initial) * factor;
        // `<=` also folds -0.0 into a plain zero
        if value.is_nan() || value <= 0.0 {
            0.0
        } else {
            value
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MonthlyValue {
    pub period: String,
    pub value: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConsumptionTotal {
    pub consumption_type: ConsumptionType,
    /// `None` when the type could not be fetched. Distinct from a confirmed zero.
    pub value: Option<f64>,
    pub unit: &'static str,
    /// Exactly 12 entries, oldest first, or empty.
    pub timeline: Vec<MonthlyValue>,
    pub din_comparison: Option<f64>,
}

impl ConsumptionTotal {
    pub const TIMELINE_MONTHS: usize = 12;

    pub fn absent(consumption_type: ConsumptionType) -> Self {
        Self {
            consumption_type,
            value: None,
            unit: consumption_type.unit(),
            timeline: Vec::new(),
            din_comparison: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Snapshot {
    pub account: Option<CustomerAccount>,
    pub devices: BTreeMap<String, Device>,
    pub totals: BTreeMap<ConsumptionType, ConsumptionTotal>,
    pub fetched_at: OffsetDateTime,
}

impl Snapshot {
    pub fn total(&self, consumption_type: ConsumptionType) -> Option<&ConsumptionTotal> {
        self.totals.get(&consumption_type)
    }

    pub fn devices_of(&self, consumption_type: ConsumptionType) -> impl Iterator<Item = &Device> {
        self.devices
            .values()
            .filter(move |d| d.consumption_type == consumption_type)
    }
}
