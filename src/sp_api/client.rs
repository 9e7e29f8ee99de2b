use crate::config::Settings;
use crate::http::Session;
use crate::models::ErrorKind;
use crate::resilience::{BreakerOpen, CallExecutor, CircuitBreaker, RetryPolicy, Retryable};
use crate::sp_api::auth::AccessTokens;
use reqwest::{Method, StatusCode};
use serde_json::Value;
use std::{collections::HashMap, fmt, str::FromStr, sync::Arc};
use thiserror::Error;
use tracing::{error, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EndpointCategory {
    Reports,
    Inventory,
    Listings,
    Auth,
}

impl EndpointCategory {
    pub const ALL: [EndpointCategory; 4] = [
        EndpointCategory::Reports,
        EndpointCategory::Inventory,
        EndpointCategory::Listings,
        EndpointCategory::Auth,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EndpointCategory::Reports => "reports",
            EndpointCategory::Inventory => "inventory",
            EndpointCategory::Listings => "listings",
            EndpointCategory::Auth => "auth",
        }
    }

    pub fn from_path(path: &str) -> Self {
        if path.contains("/reports/") {
            EndpointCategory::Reports
        } else if path.contains("/fba/inventory/") {
            EndpointCategory::Inventory
        } else if path.contains("/listings/") {
            EndpointCategory::Listings
        } else {
            EndpointCategory::Auth
        }
    }
}

impl fmt::Display for EndpointCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EndpointCategory {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_lowercase().as_str() {
            "reports" => Ok(EndpointCategory::Reports),
            "inventory" | "fba_inventory" => Ok(EndpointCategory::Inventory),
            "listings" => Ok(EndpointCategory::Listings),
            "auth" => Ok(EndpointCategory::Auth),
            other => Err(format!("unknown endpoint category `{other}`")),
        }
    }
}

#[derive(Debug, Clone, Error)]
pub enum ApiError {
    #[error("transport error: {0}")]
    Transport(String),
    #[error("HTTP {status}: {body}")]
    Status { status: u16, body: String },
    #[error(transparent)]
    CircuitOpen(#[from] BreakerOpen),
    #[error("authentication failed: {0}")]
    Auth(String),
    #[error("invalid response: {0}")]
    Decode(String),
    #[error("report failed: {0}")]
    Report(String),
}

impl ApiError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ApiError::Transport(_) => ErrorKind::Network,
            ApiError::Status { status, .. } => match *status {
                429 => ErrorKind::RateLimit,
                401 | 403 => ErrorKind::AuthError,
                404 => ErrorKind::NotFound,
                s if s >= 500 => ErrorKind::ServerError,
                _ => ErrorKind::Unknown,
            },
            ApiError::CircuitOpen(_) => ErrorKind::CircuitOpen,
            ApiError::Auth(_) => ErrorKind::AuthError,
            ApiError::Decode(_) | ApiError::Report(_) => ErrorKind::Unknown,
        }
    }
}

impl Retryable for ApiError {
    fn is_retryable(&self) -> bool {
        matches!(self, ApiError::Transport(_) | ApiError::Status { .. })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ApiResponse {
    Json(Value),
    /// A status the caller declared as expected; never counted as a failure.
    Expected { status: StatusCode, body: String },
}

#[derive(Debug, Clone)]
pub struct ApiCall {
    pub method: Method,
    pub path: String,
    pub query: Vec<(String, String)>,
    pub body: Option<Value>,
    pub expected: Vec<StatusCode>,
}

impl ApiCall {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            query: Vec::new(),
            body: None,
            expected: Vec::new(),
        }
    }

    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::GET, path)
    }

    pub fn post(path: impl Into<String>, body: Value) -> Self {
        Self {
            body: Some(body),
            ..Self::new(Method::POST, path)
        }
    }

    pub fn delete(path: impl Into<String>) -> Self {
        Self::new(Method::DELETE, path)
    }

    pub fn query(mut self, key: &str, value: impl Into<String>) -> Self {
        self.query.push((key.to_string(), value.into()));
        self
    }

    pub fn expect(mut self, statuses: &[StatusCode]) -> Self {
        self.expected.extend_from_slice(statuses);
        self
    }
}

/// Makes authenticated SP-API calls through retry and, per endpoint
/// category, a circuit breaker.
#[derive(Clone)]
pub struct ResilientClient {
    session: Session,
    base_url: Arc<str>,
    seller_id: Arc<str>,
    marketplace_id: Arc<str>,
    retry: RetryPolicy,
    breakers: Arc<HashMap<EndpointCategory, CircuitBreaker>>,
    tokens: Arc<AccessTokens>,
}

impl ResilientClient {
    pub fn new(settings: &Settings, session: Session) -> Self {
        let creds = &settings.credentials;
        let resilience = &settings.resilience;
        let breakers = EndpointCategory::ALL
            .iter()
            .filter(|category| !resilience.circuit_breaker_exempt.contains(*category))
            .map(|category| {
                let name = format!("{category}_api");
                (*category, CircuitBreaker::new(name, resilience.breaker_config()))
            })
            .collect();
        let base_url = creds
            .endpoint
            .clone()
            .unwrap_or_else(|| super::base_url_for_marketplace(&creds.marketplace_id).to_string());
        let retry = resilience.retry_policy();
        let tokens = AccessTokens::new(creds, session.clone(), retry.clone());
        Self {
            session,
            base_url: Arc::from(base_url),
            seller_id: Arc::from(creds.seller_id.as_str()),
            marketplace_id: Arc::from(creds.marketplace_id.as_str()),
            retry,
            breakers: Arc::new(breakers),
            tokens: Arc::new(tokens),
        }
    }

    pub fn seller_id(&self) -> &str {
        &self.seller_id
    }

    pub fn marketplace_id(&self) -> &str {
        &self.marketplace_id
    }

    pub fn breaker(&self, category: EndpointCategory) -> Option<&CircuitBreaker> {
        self.breakers.get(&category)
    }

    pub fn executor(&self, category: EndpointCategory) -> CallExecutor {
        CallExecutor::new(self.retry.clone(), self.breaker(category).cloned())
    }

    pub async fn call(&self, call: ApiCall) -> Result<ApiResponse, ApiError> {
        let token = self.tokens.access_token().await?;
        let category = EndpointCategory::from_path(&call.path);
        let url = format!("{}{}", self.base_url, call.path);
        let operation = format!("{} {}", call.method, call.path);

        let result = self
            .executor(category)
            .execute(&operation, || self.send_once(&call, &url, &token))
            .await;

        if let Err(err) = &result {
            match err {
                ApiError::CircuitOpen(open) => warn!(
                    target: "cleanup.sp_api",
                    breaker = %open.name,
                    operation = %operation,
                    "request blocked by open circuit breaker",
                ),
                _ => error!(
                    target: "cleanup.sp_api",
                    category = %category,
                    operation = %operation,
                    kind = %err.kind(),
                    error = %err,
                    "request failed after resilience patterns",
                ),
            }
        }
        result
    }

    /// Fetches a pre-signed document URL (no SP-API token) under the
    /// reports category policy.
    pub async fn fetch_document(&self, url: &str) -> Result<String, ApiError> {
        self.executor(EndpointCategory::Reports)
            .execute("GET report document", move || async move {
                let request = self.session.client().get(url);
                let (status, body) = self
                    .session
                    .send(request)
                    .await
                    .map_err(|err| ApiError::Transport(err.to_string()))?;
                if !status.is_success() {
                    return Err(ApiError::Status {
                        status: status.as_u16(),
                        body,
                    });
                }
                Ok(body)
            })
            .await
    }

    async fn send_once(
        &self,
        call: &ApiCall,
        url: &str,
        token: &str,
    ) -> Result<ApiResponse, ApiError> {
        let mut request = self
            .session
            .client()
            .request(call.method.clone(), url)
            .header("x-amz-access-token", token);
        if !call.query.is_empty() {
            request = request.query(&call.query);
        }
        if let Some(body) = &call.body {
            request = request.json(body);
        }

        let (status, text) = self
            .session
            .send(request)
            .await
            .map_err(|err| ApiError::Transport(err.to_string()))?;

        if call.expected.contains(&status) {
            return Ok(ApiResponse::Expected { status, body: text });
        }
        if !status.is_success() {
            return Err(ApiError::Status {
                status: status.as_u16(),
                body: text,
            });
        }

        if text.trim().is_empty() {
            return Ok(ApiResponse::Json(Value::Null));
        }
        serde_json::from_str(&text)
            .map(ApiResponse::Json)
            .map_err(|err| ApiError::Decode(err.to_string()))
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use crate::config::Settings;
    use crate::http::Session;
    use crate::sp_api::ResilientClient;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    pub fn settings_for(server: &MockServer, extra: &[(&str, &str)]) -> Settings {
        let endpoint = server.uri();
        let token_url = format!("{}/auth/o2/token", server.uri());
        let mut pairs: Vec<(String, String)> = vec![
            ("LWA_CLIENT_ID".into(), "client".into()),
            ("LWA_CLIENT_SECRET".into(), "secret".into()),
            ("LWA_REFRESH_TOKEN".into(), "refresh".into()),
            ("AMAZON_SELLER_ID".into(), "SELLER1".into()),
            ("MARKETPLACE_ID".into(), "A1F83G8C2ARO7P".into()),
            ("SP_API_ENDPOINT".into(), endpoint),
            ("LWA_TOKEN_URL".into(), token_url),
            ("BASE_DELAY".into(), "0.001".into()),
            ("MAX_DELAY".into(), "0.005".into()),
            ("JITTER".into(), "false".into()),
            ("CONNECTION_TIMEOUT".into(), "2".into()),
            ("READ_TIMEOUT".into(), "5".into()),
        ];
        for (k, v) in extra {
            pairs.push((k.to_string(), v.to_string()));
        }
        Settings::from_lookup(move |key: &str| {
            pairs
                .iter()
                .rev()
                .find(|(k, _)| k == key)
                .map(|(_, v)| v.clone())
        })
        .expect("test settings")
    }

    pub async fn mount_token(server: &MockServer) {
        Mock::given(method("POST"))
            .and(path("/auth/o2/token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "access_token": "Atza|test-token",
                "expires_in": 3600,
            })))
            .mount(server)
            .await;
    }

    pub fn client_for(settings: &Settings) -> ResilientClient {
        ResilientClient::new(settings, Session::new(&settings.resilience))
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::{client_for, mount_token, settings_for};
    use super::*;
    use crate::resilience::CircuitState;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn categories_from_paths() {
        assert_eq!(
            EndpointCategory::from_path("/reports/2021-06-30/reports"),
            EndpointCategory::Reports
        );
        assert_eq!(
            EndpointCategory::from_path("/fba/inventory/v1/summaries"),
            EndpointCategory::Inventory
        );
        assert_eq!(
            EndpointCategory::from_path("/listings/2021-08-01/items/S/K"),
            EndpointCategory::Listings
        );
        assert_eq!(EndpointCategory::from_path("/sellers/v1"), EndpointCategory::Auth);
    }

    #[test]
    fn error_kinds() {
        let status = |s: u16| ApiError::Status {
            status: s,
            body: String::new(),
        };
        assert_eq!(status(429).kind(), ErrorKind::RateLimit);
        assert_eq!(status(503).kind(), ErrorKind::ServerError);
        assert_eq!(status(403).kind(), ErrorKind::AuthError);
        assert_eq!(status(404).kind(), ErrorKind::NotFound);
        assert_eq!(status(422).kind(), ErrorKind::Unknown);
        assert_eq!(ApiError::Transport("reset".into()).kind(), ErrorKind::Network);
        let open = ApiError::from(BreakerOpen {
            name: "reports_api".into(),
        });
        assert_eq!(open.kind(), ErrorKind::CircuitOpen);
        assert!(!open.is_retryable());
    }

    #[tokio::test]
    async fn inventory_category_is_exempt_by_default() {
        let server = MockServer::start().await;
        let client = client_for(&settings_for(&server, &[]));
        assert!(client.breaker(EndpointCategory::Inventory).is_none());
        assert!(client.breaker(EndpointCategory::Reports).is_some());
        assert!(client.breaker(EndpointCategory::Listings).is_some());
        assert!(client.breaker(EndpointCategory::Auth).is_some());
    }

    #[tokio::test]
    async fn sends_token_and_parses_json() {
        let server = MockServer::start().await;
        mount_token(&server).await;
        Mock::given(method("GET"))
            .and(path("/reports/2021-06-30/reports/R1"))
            .and(header("x-amz-access-token", "Atza|test-token"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({"processingStatus": "DONE"})),
            )
            .expect(1)
            .mount(&server)
            .await;

        let client = client_for(&settings_for(&server, &[]));
        let response = client
            .call(ApiCall::get("/reports/2021-06-30/reports/R1"))
            .await
            .expect("call");
        assert_eq!(
            response,
            ApiResponse::Json(serde_json::json!({"processingStatus": "DONE"}))
        );
    }

    #[tokio::test]
    async fn expected_status_short_circuits_without_retry_or_breaker_error() {
        let server = MockServer::start().await;
        mount_token(&server).await;
        Mock::given(method("GET"))
            .and(path("/listings/2021-08-01/items/SELLER1/GONE"))
            .respond_with(ResponseTemplate::new(404).set_body_string("missing"))
            .expect(1)
            .mount(&server)
            .await;

        let client = client_for(&settings_for(&server, &[]));
        let response = client
            .call(
                ApiCall::get("/listings/2021-08-01/items/SELLER1/GONE")
                    .expect(&[StatusCode::NOT_FOUND]),
            )
            .await
            .expect("expected status is not an error");
        assert!(matches!(
            response,
            ApiResponse::Expected { status, .. } if status == StatusCode::NOT_FOUND
        ));
        let breaker = client.breaker(EndpointCategory::Listings).expect("breaker");
        assert_eq!(breaker.snapshot().error_count, 0);
    }

    #[tokio::test]
    async fn server_errors_are_retried_then_tracked_once() {
        let server = MockServer::start().await;
        mount_token(&server).await;
        Mock::given(method("GET"))
            .and(path("/reports/2021-06-30/reports/R2"))
            .respond_with(ResponseTemplate::new(503))
            .expect(3)
            .mount(&server)
            .await;

        let settings = settings_for(
            &server,
            &[("MAX_RETRIES", "2"), ("CIRCUIT_BREAKER_FAILURE_THRESHOLD", "1")],
        );
        let client = client_for(&settings);
        let err = client
            .call(ApiCall::get("/reports/2021-06-30/reports/R2"))
            .await
            .expect_err("should fail");
        assert_eq!(err.kind(), ErrorKind::ServerError);

        let breaker = client.breaker(EndpointCategory::Reports).expect("breaker");
        assert_eq!(breaker.snapshot().error_count, 1);
        assert_eq!(breaker.state(), CircuitState::Open);

        let blocked = client
            .call(ApiCall::get("/reports/2021-06-30/reports/R2"))
            .await
            .expect_err("blocked");
        assert_eq!(blocked.kind(), ErrorKind::CircuitOpen);

        // Other categories are unaffected.
        let listings = client.breaker(EndpointCategory::Listings).expect("breaker");
        assert_eq!(listings.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn exempt_category_never_blocks() {
        let server = MockServer::start().await;
        mount_token(&server).await;
        Mock::given(method("GET"))
            .and(path("/fba/inventory/v1/summaries"))
            .respond_with(ResponseTemplate::new(429))
            .expect(6)
            .mount(&server)
            .await;

        let settings = settings_for(
            &server,
            &[("MAX_RETRIES", "1"), ("CIRCUIT_BREAKER_FAILURE_THRESHOLD", "1")],
        );
        let client = client_for(&settings);
        for _ in 0..3 {
            let err = client
                .call(ApiCall::get("/fba/inventory/v1/summaries"))
                .await
                .expect_err("rate limited");
            assert_eq!(err.kind(), ErrorKind::RateLimit);
        }
    }

    #[tokio::test]
    async fn slow_response_times_out_as_network_error_and_is_retried() {
        let server = MockServer::start().await;
        mount_token(&server).await;
        Mock::given(method("GET"))
            .and(path("/reports/2021-06-30/reports/SLOW"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({"processingStatus": "DONE"}))
                    .set_delay(std::time::Duration::from_secs(2)),
            )
            .expect(2)
            .mount(&server)
            .await;

        let settings = settings_for(
            &server,
            &[
                ("CONNECTION_TIMEOUT", "0.1"),
                ("READ_TIMEOUT", "0.2"),
                ("MAX_RETRIES", "1"),
                ("CIRCUIT_BREAKER_FAILURE_THRESHOLD", "1"),
            ],
        );
        let client = client_for(&settings);
        let started = std::time::Instant::now();
        let err = client
            .call(ApiCall::get("/reports/2021-06-30/reports/SLOW"))
            .await
            .expect_err("read timeout");
        assert!(started.elapsed() < std::time::Duration::from_secs(2));
        assert!(matches!(err, ApiError::Transport(_)));
        assert_eq!(err.kind(), ErrorKind::Network);

        let breaker = client.breaker(EndpointCategory::Reports).expect("breaker");
        let snapshot = breaker.snapshot();
        assert_eq!(snapshot.call_count, 1);
        assert_eq!(snapshot.error_count, 1);
        assert_eq!(breaker.state(), CircuitState::Open);
    }
}
