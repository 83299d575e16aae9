use crate::errors::SyncError;
use async_trait::async_trait;
use reqwest::header::CONTENT_TYPE;
use serde_derive::Deserialize;
use time::{Duration, OffsetDateTime};
use tracing::{debug, info};

pub const DEFAULT_BASE_URL: &str = "https://webservices.minol.com";

pub(crate) const MONITORING_INDEX_PATH: &str =
    "/minol.com~kundenportal~em~web/resources/monitoring/index.html?isMieter=true";
pub(crate) const USER_TENANTS_PATH: &str =
    "/minol.com~kundenportal~em~web/rest/EMData/getUserTenants";
const LOGIN_PATH: &str = "/j_security_check";

/// Lifetime of the portal's SSO ticket. Used as an expiry hint only.
const SSO_TICKET_LIFETIME: Duration = Duration::hours(8);

const USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/108.0.0.0 Safari/537.36";

#[derive(Clone)]
pub struct Credentials {
    pub email: String,
    pub password: String,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("email", &self.email)
            .field("password", &"****")
            .finish()
    }
}

/// Authenticated portal context for one sync cycle.
///
/// Holds the cookie jar (inside the HTTP client) and the portal user number.
/// Never persisted; dropped at the end of the cycle.
#[derive(Debug, Clone)]
pub struct Session {
    http: reqwest::Client,
    user_number: String,
    created_at: OffsetDateTime,
    expires_at: Option<OffsetDateTime>,
    valid: bool,
}

impl Session {
    pub fn new(http: reqwest::Client, user_number: impl Into<String>) -> Self {
        let created_at = OffsetDateTime::now_utc();
        Self {
            http,
            user_number: user_number.into(),
            created_at,
            expires_at: Some(created_at + SSO_TICKET_LIFETIME),
            valid: true,
        }
    }

    pub fn with_expiry(mut self, expires_at: Option<OffsetDateTime>) -> Self {
        self.expires_at = expires_at;
        self
    }

    pub fn http(&self) -> &reqwest::Client {
        &self.http
    }

    pub fn user_number(&self) -> &str {
        &self.user_number
    }

    pub fn created_at(&self) -> OffsetDateTime {
        self.created_at
    }

    pub fn expires_at(&self) -> Option<OffsetDateTime> {
        self.expires_at
    }

    pub fn invalidate(&mut self) {
        self.valid = false;
    }

    pub fn is_valid_at(&self, now: OffsetDateTime) -> bool {
        self.valid && self.expires_at.map_or(true, |expiry| now < expiry)
    }

    /// Rejects sessions that were invalidated or have outlived their hint.
    pub fn ensure_valid(&self) -> Result<(), SyncError> {
        if self.is_valid_at(OffsetDateTime::now_utc()) {
            Ok(())
        } else {
            Err(SyncError::Authentication("session expired".to_string()))
        }
    }
}

/// Produces a fresh [`Session`] per call. Implementations must not retry.
#[async_trait]
pub trait SessionProvider: Send + Sync {
    async fn acquire(&self, credentials: &Credentials) -> Result<Session, SyncError>;
}

/// Raw tenant record as returned by `getUserTenants`.
#[derive(Default, Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RawAccount {
    #[serde(deserialize_with = "lenient_string")]
    pub user_number: Option<String>,
    pub email: Option<String>,
    pub nenr: Option<String>,
    pub lgnr: Option<String>,
    pub geschoss_text: Option<String>,
    pub lage_text: Option<String>,
    pub addr_street: Option<String>,
    pub addr_house_num: Option<String>,
    pub addr_postal_code: Option<String>,
    pub addr_city: Option<String>,
    pub name: Option<String>,
    pub einzug_mieter: Option<String>,
}

/// Accepts identifiers the portal sometimes sends as JSON numbers.
pub(crate) fn lenient_string<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    use serde::Deserialize;
    Ok(match Option::<serde_json::Value>::deserialize(deserializer)? {
        Some(serde_json::Value::String(s)) => Some(s),
        Some(serde_json::Value::Number(n)) => Some(n.to_string()),
        _ => None,
    })
}

/// Loads the tenant list with an established cookie jar.
///
/// An HTML answer means the portal redirected to its login page.
pub(crate) async fn read_user_tenants(
    http: &reqwest::Client,
    base_url: &str,
) -> Result<Vec<RawAccount>, SyncError> {
    let response = http
        .get(format!("{base_url}{USER_TENANTS_PATH}"))
        .header("Accept", "application/json, text/javascript, */*; q=0.01")
        .header("X-Requested-With", "XMLHttpRequest")
        .send()
        .await?
        .error_for_status()?;

    let content_type = response
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string();
    if !content_type.contains("application/json") {
        return Err(SyncError::MalformedData(format!(
            "expected JSON tenant list, got content type `{content_type}`"
        )));
    }

    Ok(response.json().await?)
}

/// Form-based login against the portal.
pub struct HttpSessionProvider {
    base_url: String,
}

impl HttpSessionProvider {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    fn build_client() -> Result<reqwest::Client, SyncError> {
        reqwest::Client::builder()
            .cookie_store(true)
            .user_agent(USER_AGENT)
            .build()
            .map_err(|e| SyncError::Authentication(format!("http client setup: {e}")))
    }

    async fn login(&self, http: &reqwest::Client, credentials: &Credentials) -> Result<(), SyncError> {
        debug!("Opening monitoring index for initial cookies");
        http.get(format!("{}{MONITORING_INDEX_PATH}", self.base_url))
            .send()
            .await?
            .error_for_status()?;

        debug!("Submitting login form");
        http.post(format!("{}{LOGIN_PATH}", self.base_url))
            .form(&[
                ("j_username", credentials.email.as_str()),
                ("j_password", credentials.password.as_str()),
            ])
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }
}

#[async_trait]
impl SessionProvider for HttpSessionProvider {
    async fn acquire(&self, credentials: &Credentials) -> Result<Session, SyncError> {
        let http = Self::build_client()?;

        self.login(&http, credentials)
            .await
            .map_err(|e| SyncError::Authentication(e.to_string()))?;

        let tenants = read_user_tenants(&http, &self.base_url)
            .await
            .map_err(|e| SyncError::Authentication(e.to_string()))?;

        let user_number = tenants
            .first()
            .and_then(|t| t.user_number.clone())
            .filter(|n| !n.trim().is_empty())
            .ok_or_else(|| SyncError::Authentication("user tenants not found or empty".to_string()))?;

        info!(user_number = %user_number, "Portal session established");
        Ok(Session::new(http, user_number))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::{assert_err, assert_ok};

    fn index_path() -> mockito::Matcher {
        mockito::Matcher::Regex(r"^/minol\.com~kundenportal~em~web/resources/monitoring/index\.html".into())
    }

    fn credentials() -> Credentials {
        Credentials {
            email: "tenant@example.com".to_string(),
            password: "secret".to_string(),
        }
    }

    #[tokio::test]
    async fn test_acquire_session() {
        let mut server = mockito::Server::new_async().await;

        let index = server
            .mock("GET", index_path())
            .with_status(200)
            .with_header("set-cookie", "JSESSIONID=abc; Path=/")
            .with_body("<html></html>")
            .create_async()
            .await;
        let login = server
            .mock("POST", "/j_security_check")
            .match_body(mockito::Matcher::AllOf(vec![
                mockito::Matcher::UrlEncoded("j_username".into(), "tenant@example.com".into()),
                mockito::Matcher::UrlEncoded("j_password".into(), "secret".into()),
            ]))
            .with_status(200)
            .with_header("set-cookie", "MYSAPSSO2=ticket; Path=/")
            .create_async()
            .await;
        let tenants = server
            .mock("GET", USER_TENANTS_PATH)
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"[{"userNumber": "4711", "email": "tenant@example.com"}]"#)
            .create_async()
            .await;

        let provider = HttpSessionProvider::new(server.url());
        let session = provider.acquire(&credentials()).await.unwrap();

        assert_eq!(session.user_number(), "4711");
        assert_ok!(session.ensure_valid());
        index.assert_async().await;
        login.assert_async().await;
        tenants.assert_async().await;
    }

    #[tokio::test]
    async fn test_login_page_instead_of_json_is_authentication_error() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", index_path())
            .with_status(200)
            .create_async()
            .await;
        server
            .mock("POST", "/j_security_check")
            .with_status(200)
            .create_async()
            .await;
        server
            .mock("GET", USER_TENANTS_PATH)
            .with_status(200)
            .with_header("content-type", "text/html")
            .with_body("<html>login</html>")
            .create_async()
            .await;

        let provider = HttpSessionProvider::new(server.url());
        let result = provider.acquire(&credentials()).await;

        assert!(matches!(result, Err(SyncError::Authentication(_))));
    }

    #[tokio::test]
    async fn test_rejected_login_is_authentication_error() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", index_path())
            .with_status(200)
            .create_async()
            .await;
        server
            .mock("POST", "/j_security_check")
            .with_status(401)
            .create_async()
            .await;

        let provider = HttpSessionProvider::new(server.url());
        let result = provider.acquire(&credentials()).await;

        let err = assert_err!(result);
        assert!(matches!(err, SyncError::Authentication(_)));
    }

    #[test]
    fn test_session_validity() {
        let mut session = Session::new(reqwest::Client::new(), "1");
        let now = OffsetDateTime::now_utc();
        assert!(session.is_valid_at(now));
        assert!(!session.is_valid_at(now + Duration::hours(9)));

        let unbounded = session.clone().with_expiry(None);
        assert!(unbounded.is_valid_at(now + Duration::days(30)));

        session.invalidate();
        assert!(!session.is_valid_at(now));
        assert!(session.ensure_valid().is_err());
    }

    #[test]
    fn test_credentials_debug_masks_password() {
        let rendered = format!("{:?}", credentials());
        assert!(rendered.contains("tenant@example.com"));
        assert!(!rendered.contains("secret"));
    }
}
