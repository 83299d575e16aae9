use crate::errors::SyncError;
use crate::model::ConsumptionType;
use crate::portal_session::{lenient_string, read_user_tenants, RawAccount, Session};
use async_trait::async_trait;
use reqwest::header::CONTENT_TYPE;
use serde_derive::Deserialize;
use serde_json::json;
use time::macros::format_description;
use time::{Duration, OffsetDateTime};
use tracing::debug;

const READ_DATA_PATH: &str = "/minol.com~kundenportal~em~web/rest/EMData/readData";

/// The portal is queried for roughly one year back from the current month.
const TIMELINE_LOOKBACK: Duration = Duration::days(30 * 12);

/// One row of the per-room table in a readData response.
#[derive(Default, Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RawMeterRecord {
    pub raum: Option<String>,
    pub raum_key: Option<String>,
    #[serde(deserialize_with = "lenient_string")]
    pub ger_nr: Option<String>,
    pub consumption: Option<f64>,
    pub unit: Option<String>,
    pub consumption_bew: Option<f64>,
    pub bewertung: Option<f64>,
    pub ablesung: Option<f64>,
    pub anfangsstand: Option<f64>,
}

/// One point of the chart series. `key_figure == "REF"` marks the DIN reference.
#[derive(Default, Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RawChartEntry {
    pub category: Option<String>,
    pub category_int: Option<i64>,
    pub value: Option<f64>,
    pub label: Option<String>,
    pub key_figure: Option<String>,
    pub anz_values: Option<i64>,
}

impl RawChartEntry {
    pub fn is_reference(&self) -> bool {
        self.key_figure.as_deref() == Some("REF")
    }
}

#[derive(Default, Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct RawConsumption {
    pub table: Vec<RawMeterRecord>,
    pub chart: Vec<RawChartEntry>,
}

/// Read side of the portal, one call per record kind.
#[async_trait]
pub trait ConsumptionSource: Send + Sync {
    async fn fetch_account(&self, session: &Session) -> Result<RawAccount, SyncError>;

    async fn fetch_consumption(
        &self,
        session: &Session,
        consumption_type: ConsumptionType,
    ) -> Result<RawConsumption, SyncError>;
}

/// `(timelineStart, timelineEnd)` as `YYYYMM` strings.
pub fn timeline_window(now: OffsetDateTime) -> (String, String) {
    let format = format_description!("[year][month]");
    let start = (now - TIMELINE_LOOKBACK).format(&format).unwrap_or_default();
    let end = now.format(&format).unwrap_or_default();
    (start, end)
}

/// `YYYYMM` to the portal's `MM.YYYY` display form
fn period_text(period: &str) -> String {
    if period.len() == 6 {
        format!("{}.{}", &period[4..], &period[..4])
    } else {
        period.to_string()
    }
}

pub struct PortalDataFetcher {
    base_url: String,
}

impl PortalDataFetcher {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    fn read_data_body(user_number: &str, consumption_type: ConsumptionType, now: OffsetDateTime) -> serde_json::Value {
        let (start, end) = timeline_window(now);
        json!({
            "userNum": user_number,
            "layer": "NE",
            "scale": "CALMONTH",
            "chartRefUnit": "ABS",
            "refObject": "DIN_AVG",
            "consType": consumption_type.portal_code(),
            "dashBoardKey": "PE",
            "timelineStart": start,
            "timelineStartTxt": period_text(&start),
            "timelineEnd": end,
            "timelineEndTxt": period_text(&end),
            "valuesInKWH": true,
            "dlgKey": consumption_type.dialog_key(),
        })
    }
}

#[async_trait]
impl ConsumptionSource for PortalDataFetcher {
    async fn fetch_account(&self, session: &Session) -> Result<RawAccount, SyncError> {
        session.ensure_valid()?;
        read_user_tenants(session.http(), &self.base_url)
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| SyncError::MalformedData("tenant list is empty".to_string()))
    }

    async fn fetch_consumption(
        &self,
        session: &Session,
        consumption_type: ConsumptionType,
    ) -> Result<RawConsumption, SyncError> {
        session.ensure_valid()?;
        let body = Self::read_data_body(session.user_number(), consumption_type, OffsetDateTime::now_utc());
        debug!(%consumption_type, payload = %body, "Requesting consumption data");

        let response = session
            .http()
            .post(format!("{}{READ_DATA_PATH}", self.base_url))
            .header("Accept", "application/json, text/javascript, */*; q=0.01")
            .header("X-Requested-With", "XMLHttpRequest")
            .json(&body)
            .send()
            .await?
            .error_for_status()?;

        let is_json = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| v.contains("json"));
        let text = response.text().await?;
        if !is_json {
            return Err(SyncError::MalformedData(format!(
                "{consumption_type}: expected JSON, got {} bytes of something else",
                text.len()
            )));
        }

        serde_json::from_str(&text)
            .map_err(|e| SyncError::MalformedData(format!("{consumption_type}: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    fn session() -> Session {
        Session::new(reqwest::Client::new(), "4711")
    }

    #[test]
    fn test_timeline_window() {
        let (start, end) = timeline_window(datetime!(2025-10-15 12:00 UTC));
        assert_eq!(start, "202410");
        assert_eq!(end, "202510");
        assert_eq!(period_text(&start), "10.2024");
    }

    #[test]
    fn test_read_data_body() {
        let body = PortalDataFetcher::read_data_body(
            "4711",
            ConsumptionType::HotWater,
            datetime!(2025-10-15 12:00 UTC),
        );
        assert_eq!(body["userNum"], "4711");
        assert_eq!(body["consType"], "WARMWASSER");
        assert_eq!(body["dlgKey"], "100WW");
        assert_eq!(body["refObject"], "DIN_AVG");
        assert_eq!(body["timelineEndTxt"], "10.2025");
        assert_eq!(body["valuesInKWH"], true);
    }

    #[tokio::test]
    async fn test_fetch_consumption() {
        let mut server = mockito::Server::new_async().await;

        let mock = server
            .mock("POST", READ_DATA_PATH)
            .match_body(mockito::Matcher::PartialJson(json!({
                "userNum": "4711",
                "consType": "HEIZUNG",
                "dlgKey": "100EH"
            })))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(
                r#"
                {
                    "table": [
                        {
                            "raum": "Wohnzimmer",
                            "raumKey": "WZ",
                            "gerNr": 12345678,
                            "consumption": 812.5,
                            "unit": "KWH",
                            "consumptionBew": 812.5,
                            "bewertung": 1.0,
                            "ablesung": 1500.0,
                            "anfangsstand": 687.5
                        }
                    ],
                    "chart": [
                        {"category": "10.2024", "categoryInt": 202410, "value": 40.0, "label": "Okt"},
                        {"category": "10.2024", "categoryInt": 202410, "value": 55.0, "keyFigure": "REF"}
                    ]
                }
            "#,
            )
            .create_async()
            .await;

        let fetcher = PortalDataFetcher::new(server.url());
        let raw = fetcher
            .fetch_consumption(&session(), ConsumptionType::Heating)
            .await
            .unwrap();

        assert_eq!(raw.table.len(), 1);
        assert_eq!(raw.table[0].ger_nr.as_deref(), Some("12345678"));
        assert_eq!(raw.table[0].ablesung, Some(1500.0));
        assert_eq!(raw.chart.len(), 2);
        assert!(raw.chart[1].is_reference());
        assert!(!raw.chart[0].is_reference());

        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_fetch_consumption_html_is_malformed() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", READ_DATA_PATH)
            .with_status(200)
            .with_header("content-type", "text/html")
            .with_body("<html>session expired</html>")
            .create_async()
            .await;

        let fetcher = PortalDataFetcher::new(server.url());
        let result = fetcher
            .fetch_consumption(&session(), ConsumptionType::ColdWater)
            .await;

        assert!(matches!(result, Err(SyncError::MalformedData(_))));
    }

    #[tokio::test]
    async fn test_fetch_consumption_server_error_is_fetch_error() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", READ_DATA_PATH)
            .with_status(500)
            .create_async()
            .await;

        let fetcher = PortalDataFetcher::new(server.url());
        let result = fetcher
            .fetch_consumption(&session(), ConsumptionType::Heating)
            .await;

        assert!(matches!(result, Err(SyncError::Fetch(_))));
    }

    #[tokio::test]
    async fn test_fetch_account() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", crate::portal_session::USER_TENANTS_PATH)
            .with_status(200)
            .with_header("content-type", "application/json; charset=utf-8")
            .with_body(
                r#"[{
                    "userNumber": 4711,
                    "email": "tenant@example.com",
                    "nenr": " 0042 ",
                    "lgnr": "77001 ",
                    "addrStreet": "Hauptstr.",
                    "addrHouseNum": "5",
                    "addrPostalCode": "70173",
                    "addrCity": "Stuttgart",
                    "geschossText": "2. OG",
                    "name": "Erika Mustermann"
                }]"#,
            )
            .create_async()
            .await;

        let fetcher = PortalDataFetcher::new(server.url());
        let account = fetcher.fetch_account(&session()).await.unwrap();

        assert_eq!(account.user_number.as_deref(), Some("4711"));
        assert_eq!(account.addr_city.as_deref(), Some("Stuttgart"));
        assert_eq!(account.lage_text, None);
    }

    #[tokio::test]
    async fn test_expired_session_is_rejected_before_request() {
        let fetcher = PortalDataFetcher::new("http://127.0.0.1:9");
        let mut expired = session();
        expired.invalidate();

        let result = fetcher
            .fetch_consumption(&expired, ConsumptionType::Heating)
            .await;

        assert!(matches!(result, Err(SyncError::Authentication(_))));
    }
}
