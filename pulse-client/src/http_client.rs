use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Error;
use http::header::HeaderValue;
use http::{Request, StatusCode, Uri};
use hyper::client::{Client, HttpConnector};
use hyper::Body;
use openssl::ssl::{SslConnector, SslMethod, SslVerifyMode};
use percent_encoding::{percent_encode, AsciiSet, CONTROLS};
use serde_json::{json, Value};
use tokio::sync::{Mutex, Semaphore};
use tokio::time::Instant;

use proxmox_http::client::HttpsConnector;
use proxmox_http::uri::{build_authority, json_object_to_query};

use pulse_api_types::NodeKind;

use crate::error::ApiError;

/// TCP keepalive for upstream connections.
const TCP_KEEPALIVE_TIME: u32 = 120;

/// Tickets live two hours upstream; renew at a quarter of that.
const TICKET_RENEW_AGE: i64 = 15 * 60;

/// Documented upstream rate limits: general requests and the auth endpoint.
const REQUEST_LIMIT_PER_MINUTE: usize = 500;
const LOGIN_LIMIT_PER_MINUTE: usize = 10;

/// Characters escaped in cookie values.
const COOKIE_ENCODE_SET: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'"')
    .add(b'%')
    .add(b',')
    .add(b';')
    .add(b'\\');

/// How a configured node authenticates.
#[derive(Clone)]
pub enum Auth {
    /// API token, sent as an `Authorization` header on every request.
    Token {
        userid: String,
        token_name: String,
        secret: String,
    },
    /// Username/password, exchanged for a ticket plus CSRF token.
    Ticket { userid: String, password: String },
}

#[derive(Clone)]
pub struct ClientOptions {
    pub verify_tls: bool,
    /// Per-call deadline.
    pub timeout: Duration,
    /// Concurrent in-flight requests against this endpoint.
    pub max_concurrency: usize,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            verify_tls: true,
            timeout: Duration::from_secs(10),
            max_concurrency: 8,
        }
    }
}

struct TicketState {
    ticket: String,
    csrf: String,
    acquired: i64,
}

/// Per-minute admission window for the documented upstream limits.
struct RateWindow {
    limit: usize,
    admitted: VecDeque<Instant>,
}

impl RateWindow {
    fn new(limit: usize) -> Self {
        Self {
            limit,
            admitted: VecDeque::new(),
        }
    }

    /// Returns how long to wait before the next slot frees, or `None` when
    /// a slot was taken.
    fn admit(&mut self, now: Instant) -> Option<Duration> {
        let minute = Duration::from_secs(60);
        while let Some(front) = self.admitted.front() {
            if now.duration_since(*front) >= minute {
                self.admitted.pop_front();
            } else {
                break;
            }
        }
        if self.admitted.len() < self.limit {
            self.admitted.push_back(now);
            None
        } else {
            Some(minute - now.duration_since(*self.admitted.front().unwrap()))
        }
    }
}

/// HTTPS API client for one `(node, endpoint)` pair.
///
/// Read-only and idempotent upstream; every call carries a deadline and is
/// retried with capped jittered backoff while the failure stays transient.
pub struct HttpClient {
    kind: NodeKind,
    server: String,
    port: u16,
    client: Client<HttpsConnector>,
    auth: Auth,
    ticket: Mutex<Option<TicketState>>,
    limit: Arc<Semaphore>,
    requests: Mutex<RateWindow>,
    logins: Mutex<RateWindow>,
    timeout: Duration,
}

impl HttpClient {
    pub fn new(
        kind: NodeKind,
        server: &str,
        port: u16,
        auth: Auth,
        options: ClientOptions,
    ) -> Result<Self, Error> {
        let mut ssl_connector_builder = SslConnector::builder(SslMethod::tls())?;
        if !options.verify_tls {
            ssl_connector_builder.set_verify(SslVerifyMode::NONE);
        }

        let mut httpc = HttpConnector::new();
        httpc.set_nodelay(true);
        httpc.enforce_http(false); // we want https...
        httpc.set_connect_timeout(Some(options.timeout));

        let https = HttpsConnector::with_connector(
            httpc,
            ssl_connector_builder.build(),
            TCP_KEEPALIVE_TIME,
        );
        let client = Client::builder().build::<_, Body>(https);

        Ok(Self {
            kind,
            server: server.to_string(),
            port,
            client,
            auth,
            ticket: Mutex::new(None),
            limit: Arc::new(Semaphore::new(options.max_concurrency.max(1))),
            requests: Mutex::new(RateWindow::new(REQUEST_LIMIT_PER_MINUTE)),
            logins: Mutex::new(RateWindow::new(LOGIN_LIMIT_PER_MINUTE)),
            timeout: options.timeout,
        })
    }

    pub fn server(&self) -> &str {
        &self.server
    }

    pub fn kind(&self) -> NodeKind {
        self.kind
    }

    /// GET an api2 path and unwrap the `data` envelope.
    pub async fn get(&self, path: &str, param: Option<Value>) -> Result<Value, ApiError> {
        let mut attempt = 0;
        loop {
            let result = self.request_once("GET", path, param.clone()).await;
            match result {
                Err(ref err) if err.is_transient() && attempt < 2 => {
                    let delay = retry_delay(attempt);
                    log::debug!(
                        "GET {}:{}{} failed ({}), retrying in {:?}",
                        self.server,
                        self.port,
                        path,
                        err,
                        delay
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                other => return other,
            }
        }
    }

    async fn request_once(
        &self,
        method: &str,
        path: &str,
        param: Option<Value>,
    ) -> Result<Value, ApiError> {
        let _permit = self
            .limit
            .acquire()
            .await
            .map_err(|_| ApiError::Transient("client is shutting down".into()))?;
        self.admit(&self.requests).await;

        let mut request = self.request_builder(method, path, param)?;
        self.set_auth_headers(&mut request).await?;

        let response = tokio::time::timeout(self.timeout, self.client.request(request))
            .await
            .map_err(|_| ApiError::Transient(format!("request timed out after {:?}", self.timeout)))?
            .map_err(ApiError::from)?;

        Self::api_response(response).await
    }

    async fn admit(&self, window: &Mutex<RateWindow>) {
        loop {
            let wait = window.lock().await.admit(Instant::now());
            match wait {
                None => return,
                Some(delay) => tokio::time::sleep(delay).await,
            }
        }
    }

    async fn set_auth_headers(&self, request: &mut Request<Body>) -> Result<(), ApiError> {
        match &self.auth {
            Auth::Token {
                userid,
                token_name,
                secret,
            } => {
                let header = match self.kind {
                    NodeKind::Pve => {
                        format!("PVEAPIToken={}!{}={}", userid, token_name, secret)
                    }
                    NodeKind::Pbs => {
                        format!("PBSAPIToken {}!{}:{}", userid, token_name, secret)
                    }
                };
                request.headers_mut().insert(
                    "Authorization",
                    HeaderValue::from_str(&header)
                        .map_err(|err| ApiError::Permanent(err.to_string()))?,
                );
            }
            Auth::Ticket { .. } => {
                let (ticket, csrf) = self.login().await?;
                let cookie_name = match self.kind {
                    NodeKind::Pve => "PVEAuthCookie",
                    NodeKind::Pbs => "PBSAuthCookie",
                };
                let cookie = format!(
                    "{}={}",
                    cookie_name,
                    percent_encode(ticket.as_bytes(), COOKIE_ENCODE_SET)
                );
                request.headers_mut().insert(
                    "Cookie",
                    HeaderValue::from_str(&cookie)
                        .map_err(|err| ApiError::Permanent(err.to_string()))?,
                );
                request.headers_mut().insert(
                    "CSRFPreventionToken",
                    HeaderValue::from_str(&csrf)
                        .map_err(|err| ApiError::Permanent(err.to_string()))?,
                );
            }
        }
        Ok(())
    }

    /// Fetch or refresh the login ticket. Tickets are reused until
    /// [`TICKET_RENEW_AGE`] and the auth endpoint is kept under its
    /// documented rate limit.
    async fn login(&self) -> Result<(String, String), ApiError> {
        let (userid, password) = match &self.auth {
            Auth::Ticket { userid, password } => (userid.clone(), password.clone()),
            Auth::Token { .. } => {
                return Err(ApiError::Permanent("token auth has no ticket".into()))
            }
        };

        let mut guard = self.ticket.lock().await;
        let now = proxmox_time::epoch_i64();
        if let Some(state) = guard.as_ref() {
            if now - state.acquired < TICKET_RENEW_AGE {
                return Ok((state.ticket.clone(), state.csrf.clone()));
            }
        }

        self.admit(&self.logins).await;

        let data = json!({ "username": userid, "password": password });
        let request = self.request_builder("POST", "access/ticket", Some(data))?;
        let response = tokio::time::timeout(self.timeout, self.client.request(request))
            .await
            .map_err(|_| ApiError::Transient("login request timed out".into()))?
            .map_err(ApiError::from)?;
        let value = Self::api_response(response).await?;

        let ticket = value
            .get("ticket")
            .and_then(Value::as_str)
            .ok_or_else(|| ApiError::Parse("ticket missing from login response".into()))?
            .to_string();
        let csrf = value
            .get("CSRFPreventionToken")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();

        *guard = Some(TicketState {
            ticket: ticket.clone(),
            csrf: csrf.clone(),
            acquired: now,
        });
        Ok((ticket, csrf))
    }

    fn request_builder(
        &self,
        method: &str,
        path: &str,
        param: Option<Value>,
    ) -> Result<Request<Body>, ApiError> {
        let path = format!("api2/json/{}", path.trim_matches('/'));

        let request = if method == "POST" {
            let body = param.unwrap_or_else(|| json!({}));
            Request::builder()
                .method(method)
                .uri(self.build_uri(&path, None)?)
                .header("User-Agent", "pulse/1.0")
                .header(hyper::header::CONTENT_TYPE, "application/json")
                .body(Body::from(body.to_string()))?
        } else {
            let query = match param {
                Some(param) => Some(
                    json_object_to_query(param)
                        .map_err(|err| ApiError::Permanent(err.to_string()))?,
                ),
                None => None,
            };
            Request::builder()
                .method(method)
                .uri(self.build_uri(&path, query)?)
                .header("User-Agent", "pulse/1.0")
                .body(Body::empty())?
        };

        Ok(request)
    }

    fn build_uri(&self, path: &str, query: Option<String>) -> Result<Uri, ApiError> {
        let authority = build_authority(&self.server, self.port)
            .map_err(|err| ApiError::Permanent(err.to_string()))?;
        Uri::builder()
            .scheme("https")
            .authority(authority)
            .path_and_query(match query {
                Some(query) => format!("/{}?{}", path, query),
                None => format!("/{}", path),
            })
            .build()
            .map_err(|err| ApiError::Permanent(format!("error building uri - {}", err)))
    }

    async fn api_response(response: http::Response<Body>) -> Result<Value, ApiError> {
        let status = response.status();
        let bytes = hyper::body::to_bytes(response.into_body())
            .await
            .map_err(ApiError::from)?;
        let text = String::from_utf8_lossy(&bytes);

        if status.is_success() {
            if text.is_empty() {
                return Ok(Value::Null);
            }
            let mut value: Value = serde_json::from_str(&text)
                .map_err(|err| ApiError::Parse(format!("invalid json body - {}", err)))?;
            match value.get_mut("data") {
                Some(data) => Ok(data.take()),
                None => Ok(value),
            }
        } else {
            Err(ApiError::from_status(status, &text))
        }
    }
}

/// Full-jitter exponential backoff: base 500 ms, doubling, capped at 10 s.
fn retry_delay(attempt: u32) -> Duration {
    let cap = Duration::from_secs(10);
    let exp = Duration::from_millis(500).saturating_mul(1 << attempt.min(8));
    let ceiling = exp.min(cap);
    let mut raw = [0u8; 8];
    if openssl::rand::rand_bytes(&mut raw).is_err() {
        return ceiling;
    }
    let fraction = (u64::from_le_bytes(raw) >> 11) as f64 / (1u64 << 53) as f64;
    ceiling.mul_f64(fraction)
}

/// Unauthenticated probe used by the discovery scanner. Returns the
/// version when the endpoint answers, `None` when it is present but wants
/// credentials first.
pub async fn probe_version(
    host: &str,
    port: u16,
    timeout: Duration,
) -> Result<Option<String>, ApiError> {
    let kind = if port == 8007 {
        NodeKind::Pbs
    } else {
        NodeKind::Pve
    };
    let client = HttpClient::new(
        kind,
        host,
        port,
        Auth::Token {
            userid: String::new(),
            token_name: String::new(),
            secret: String::new(),
        },
        ClientOptions {
            verify_tls: false,
            timeout,
            max_concurrency: 1,
        },
    )
    .map_err(|err| ApiError::Permanent(err.to_string()))?;

    let request = client.request_builder("GET", "version", None)?;
    let response = tokio::time::timeout(timeout, client.client.request(request))
        .await
        .map_err(|_| ApiError::Transient("version probe timed out".into()))?
        .map_err(ApiError::from)?;

    match response.status() {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Ok(None),
        status if status.is_success() => {
            let value = HttpClient::api_response(response).await?;
            Ok(pulse_api_types::lenient::field_string(&value, "version"))
        }
        status => Err(ApiError::from_status(status, "")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_window_admits_up_to_limit() {
        let mut window = RateWindow::new(2);
        let t0 = Instant::now();
        assert!(window.admit(t0).is_none());
        assert!(window.admit(t0).is_none());
        let wait = window.admit(t0).expect("third request must wait");
        assert!(wait <= Duration::from_secs(60));
        // a minute later the window has drained
        assert!(window.admit(t0 + Duration::from_secs(61)).is_none());
    }

    #[test]
    fn retry_delay_is_capped() {
        for attempt in 0..12 {
            assert!(retry_delay(attempt) <= Duration::from_secs(10));
        }
    }

    #[test]
    fn token_header_formats() {
        // PVE uses '=' separators, PBS a space and ':'
        let pve = format!("PVEAPIToken={}!{}={}", "monitor@pam", "pulse", "s");
        assert_eq!(pve, "PVEAPIToken=monitor@pam!pulse=s");
        let pbs = format!("PBSAPIToken {}!{}:{}", "monitor@pbs", "pulse", "s");
        assert_eq!(pbs, "PBSAPIToken monitor@pbs!pulse:s");
    }
}
