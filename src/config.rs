//! Runtime configuration.
//!
//! Read from the add-on options file when it exists (Home Assistant writes it
//! to `/data/options.json`), otherwise from environment variables.

use crate::model::ConsumptionType;
use crate::mqtt_transport::MqttSettings;
use crate::normalizer::ReferenceTable;
use crate::portal_session::{Credentials, DEFAULT_BASE_URL};
use crate::sync_coordinator::SyncSettings;
use anyhow::{anyhow, bail, Context, Result};
use serde_derive::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

pub const DEFAULT_OPTIONS_PATH: &str = "/data/options.json";

/// Parse an optional numeric variable, falling back to a default.
macro_rules! parse_var {
    ($lookup:expr, $name:expr, $ty:ty) => {
        $lookup($name)
            .map(|v| v.trim().parse::<$ty>())
            .transpose()
            .map_err(|e| anyhow!("Invalid {}: {}", $name, e))?
    };
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    pub minol_email: String,
    pub minol_password: String,
    pub base_url: Option<String>,
    pub mqtt_host: String,
    pub mqtt_port: u16,
    pub mqtt_user: Option<String>,
    pub mqtt_password: Option<String>,
    pub scan_interval_hours: u64,
    pub cache_freshness_minutes: u64,
    pub auth_retry_minutes: Option<u64>,
    pub log_level: String,
    pub discovery_prefix: String,
    pub state_prefix: String,
    pub din_reference_heating: Option<f64>,
    pub din_reference_hot_water: Option<f64>,
    pub din_reference_cold_water: Option<f64>,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            minol_email: String::new(),
            minol_password: String::new(),
            base_url: None,
            mqtt_host: "localhost".to_string(),
            mqtt_port: 1883,
            mqtt_user: None,
            mqtt_password: None,
            scan_interval_hours: 12,
            cache_freshness_minutes: 60,
            auth_retry_minutes: None,
            log_level: "info".to_string(),
            discovery_prefix: "homeassistant".to_string(),
            state_prefix: "minol".to_string(),
            din_reference_heating: None,
            din_reference_hot_water: None,
            din_reference_cold_water: None,
        }
    }
}

impl BridgeConfig {
    /// Options file if present, environment otherwise.
    pub fn load() -> Result<Self> {
        let path = std::env::var("MINOL_OPTIONS_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(DEFAULT_OPTIONS_PATH));

        let config = if path.exists() {
            Self::from_file(&path)?
        } else {
            Self::from_lookup(|name| std::env::var(name).ok())?
        };
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        Self::from_json(&text).with_context(|| format!("parsing {}", path.display()))
    }

    /// Parses add-on options. Blank optional fields count as unset.
    pub fn from_json(text: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(text)?;
        Ok(Self {
            base_url: non_blank(config.base_url),
            mqtt_user: non_blank(config.mqtt_user),
            mqtt_password: non_blank(config.mqtt_password),
            ..config
        })
    }

    /// Builds the config from named variables; `lookup` is usually `std::env::var`.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let defaults = Self::default();
        Ok(Self {
            minol_email: lookup("MINOL_EMAIL").unwrap_or_default(),
            minol_password: lookup("MINOL_PASSWORD").unwrap_or_default(),
            base_url: non_blank(lookup("BASE_URL")),
            mqtt_host: lookup("MQTT_HOST").unwrap_or(defaults.mqtt_host),
            mqtt_port: parse_var!(lookup, "MQTT_PORT", u16).unwrap_or(defaults.mqtt_port),
            mqtt_user: non_blank(lookup("MQTT_USER")),
            mqtt_password: non_blank(lookup("MQTT_PASSWORD")),
            scan_interval_hours: parse_var!(lookup, "SCAN_INTERVAL_HOURS", u64)
                .unwrap_or(defaults.scan_interval_hours),
            auth_retry_minutes: parse_var!(lookup, "AUTH_RETRY_MINUTES", u64),
            log_level: lookup("LOG_LEVEL").unwrap_or(defaults.log_level),
            ..defaults
        })
    }

    pub fn validate(&self) -> Result<()> {
        if self.minol_email.trim().is_empty() || self.minol_password.is_empty() {
            bail!("MINOL_EMAIL and MINOL_PASSWORD must be set in options.json or environment");
        }
        if self.scan_interval_hours == 0 {
            bail!("scan_interval_hours must be at least 1");
        }
        if self.auth_retry_minutes == Some(0) {
            bail!("auth_retry_minutes must be at least 1 when set");
        }
        Ok(())
    }

    pub fn base_url(&self) -> &str {
        self.base_url
            .as_deref()
            .map(str::trim)
            .filter(|url| !url.is_empty())
            .unwrap_or(DEFAULT_BASE_URL)
    }

    pub fn credentials(&self) -> Credentials {
        Credentials {
            email: self.minol_email.clone(),
            password: self.minol_password.clone(),
        }
    }

    pub fn mqtt_settings(&self) -> MqttSettings {
        let mut settings = MqttSettings::new(&self.mqtt_host, self.mqtt_port);
        // Credentials only count as a pair.
        if let (Some(user), Some(password)) = (&self.mqtt_user, &self.mqtt_password) {
            settings.username = Some(user.clone());
            settings.password = Some(password.clone());
        }
        settings
    }

    pub fn sync_settings(&self) -> SyncSettings {
        SyncSettings {
            interval: Duration::from_secs(self.scan_interval_hours * 60 * 60),
            freshness: Duration::from_secs(self.cache_freshness_minutes * 60),
            auth_retry: self.auth_retry_minutes.map(|m| Duration::from_secs(m * 60)),
        }
    }

    pub fn references(&self) -> ReferenceTable {
        [
            (ConsumptionType::Heating, self.din_reference_heating),
            (ConsumptionType::HotWater, self.din_reference_hot_water),
            (ConsumptionType::ColdWater, self.din_reference_cold_water),
        ]
        .into_iter()
        .fold(ReferenceTable::new(), |table, (consumption_type, value)| match value {
            Some(reference) => table.with(consumption_type, reference),
            None => table,
        })
    }

    /// Logs the effective configuration with secrets masked.
    pub fn log_config(&self) {
        let mask = |value: &Option<String>| match value {
            Some(_) => "****",
            None => "<unset>",
        };
        info!("Configuration loaded:");
        info!("  MINOL_EMAIL         : {}", self.minol_email);
        info!("  MINOL_PASSWORD      : ****");
        info!("  BASE_URL            : {}", self.base_url());
        info!("  MQTT_HOST           : {}:{}", self.mqtt_host, self.mqtt_port);
        info!("  MQTT_USER           : {}", self.mqtt_user.as_deref().unwrap_or("<unset>"));
        info!("  MQTT_PASSWORD       : {}", mask(&self.mqtt_password));
        info!("  SCAN_INTERVAL_HOURS : {}", self.scan_interval_hours);
        info!("  CACHE_FRESHNESS_MIN : {}", self.cache_freshness_minutes);
        info!("  AUTH_RETRY_MINUTES  : {:?}", self.auth_retry_minutes);
        info!("  LOG_LEVEL           : {}", self.log_level);
    }
}

fn non_blank(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}
