use crate::data_fetcher::{RawChartEntry, RawConsumption, RawMeterRecord};
use crate::errors::SyncError;
use crate::model::{
    alphanumeric, ConsumptionTotal, ConsumptionType, CustomerAccount, Device, MonthlyValue, Snapshot,
};
use crate::portal_session::RawAccount;
use std::collections::BTreeMap;
use time::OffsetDateTime;

/// Everything one cycle pulled from the portal, before normalization.
///
/// A type missing from `consumption` is treated the same as a failed fetch.
#[derive(Debug, Clone, Default)]
pub struct RawPortalData {
    pub account: Option<RawAccount>,
    pub consumption: BTreeMap<ConsumptionType, Result<RawConsumption, SyncError>>,
}

/// Reference averages for the DIN comparison, keyed by consumption type.
///
/// Types without an entry fall back to the DIN_AVG series the portal ships
/// with each readData response.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReferenceTable {
    values: BTreeMap<ConsumptionType, f64>,
}

impl ReferenceTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, consumption_type: ConsumptionType, reference: f64) -> Self {
        self.values.insert(consumption_type, reference);
        self
    }

    pub fn get(&self, consumption_type: ConsumptionType) -> Option<f64> {
        self.values.get(&consumption_type).copied()
    }
}

/// Builds the snapshot for one cycle. Pure: no clock, no I/O.
pub fn normalize(raw: &RawPortalData, references: &ReferenceTable, fetched_at: OffsetDateTime) -> Snapshot {
    let mut devices = BTreeMap::new();
    let mut totals = BTreeMap::new();

    for consumption_type in ConsumptionType::ALL {
        let total = match raw.consumption.get(&consumption_type) {
            Some(Ok(records)) => {
                let mut sum = 0.0;
                for record in &records.table {
                    let device = normalize_device(consumption_type, record);
                    if devices.contains_key(&device.device_id) {
                        continue;
                    }
                    sum += device.evaluated_consumption;
                    devices.insert(device.device_id.clone(), device);
                }
                let reference = references
                    .get(consumption_type)
                    .or_else(|| portal_reference(&records.chart));
                ConsumptionTotal {
                    consumption_type,
                    value: Some(sum),
                    unit: consumption_type.unit(),
                    timeline: normalize_timeline(&records.chart),
                    din_comparison: reference.and_then(|r| din_comparison(sum, r)),
                }
            }
            Some(Err(_)) | None => ConsumptionTotal::absent(consumption_type),
        };
        totals.insert(consumption_type, total);
    }

    Snapshot {
        account: raw.account.as_ref().map(normalize_account),
        devices,
        totals,
        fetched_at,
    }
}

fn text(value: &Option<String>) -> String {
    value.as_deref().unwrap_or_default().trim().to_string()
}

pub fn normalize_account(raw: &RawAccount) -> CustomerAccount {
    let address = [
        &raw.addr_street,
        &raw.addr_house_num,
        &raw.addr_postal_code,
        &raw.addr_city,
    ]
    .into_iter()
    .map(text)
    .filter(|part| !part.is_empty())
    .collect::<Vec<_>>()
    .join(" ");

    CustomerAccount {
        customer_number: text(&raw.user_number),
        email: text(&raw.email),
        tenant_number: text(&raw.nenr),
        property_number: text(&raw.lgnr),
        address,
        floor: text(&raw.geschoss_text),
        position: text(&raw.lage_text),
        name: text(&raw.name),
        move_in_date: text(&raw.einzug_mieter),
    }
}

fn normalize_device(consumption_type: ConsumptionType, record: &RawMeterRecord) -> Device {
    let room = record
        .raum
        .as_deref()
        .map(str::trim)
        .filter(|r| !r.is_empty())
        .unwrap_or("Unknown")
        .to_string();
    let device_number = record
        .ger_nr
        .as_deref()
        .map(str::trim)
        .filter(|n| !n.is_empty())
        .map(str::to_string);
    let device_id = device_number
        .clone()
        .unwrap_or_else(|| format!("{}_{}", consumption_type.key(), alphanumeric(&room).to_lowercase()));

    let current_reading = record.ablesung.unwrap_or(0.0);
    let initial_reading = record.anfangsstand.unwrap_or(0.0);
    let evaluation_factor = record.bewertung.unwrap_or(1.0);

    Device {
        device_id,
        device_number,
        room,
        consumption_type,
        current_reading,
        initial_reading,
        evaluation_factor,
        evaluated_consumption: Device::evaluate(current_reading, initial_reading, evaluation_factor),
        reported_consumption: record.consumption,
        raw_unit: record.unit.clone().unwrap_or_default(),
    }
}

/// The 12 newest non-reference months, oldest first. Anything shorter is dropped.
fn normalize_timeline(chart: &[RawChartEntry]) -> Vec<MonthlyValue> {
    let mut months: Vec<&RawChartEntry> = chart.iter().filter(|e| !e.is_reference()).collect();
    if months.len() < ConsumptionTotal::TIMELINE_MONTHS {
        return Vec::new();
    }
    months.sort_by_key(|e| e.category_int);

    months[months.len() - ConsumptionTotal::TIMELINE_MONTHS..]
        .iter()
        .map(|e| MonthlyValue {
            period: e
                .category
                .clone()
                .or_else(|| e.label.clone())
                .or_else(|| e.category_int.map(|c| c.to_string()))
                .unwrap_or_default(),
            value: e.value.unwrap_or(0.0),
        })
        .collect()
}

fn portal_reference(chart: &[RawChartEntry]) -> Option<f64> {
    let total: f64 = chart
        .iter()
        .filter(|e| e.is_reference())
        .filter_map(|e| e.value)
        .sum();
    (total > 0.0).then_some(total)
}

/// Signed deviation from the reference in percent, one decimal.
pub fn din_comparison(aggregate: f64, reference: f64) -> Option<f64> {
    if !(reference > 0.0) || !aggregate.is_finite() {
        return None;
    }
    let percent = (aggregate - reference) / reference * 100.0;
    Some((percent * 10.0).round() / 10.0)
}
