//! Device authorization (RFC 8628 device-code flow)
//!
//! The node asks the authorization service for a device/user code pair, the
//! operator approves the user code in a browser, and the node polls the token
//! endpoint until the grant resolves.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Client identifier sent to the authorization service
pub const CLIENT_ID: &str = "citadel-cli";

/// Grant type for token polling
pub const DEVICE_CODE_GRANT: &str = "urn:ietf:params:oauth:grant-type:device_code";

/// Overall polling limit, matching the server-side code lifetime
pub const POLL_TIMEOUT: Duration = Duration::from_secs(600);

/// Polling interval used when the server does not name one
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Interval increase requested by `slow_down`
pub const SLOW_DOWN_STEP: Duration = Duration::from_secs(5);

/// Device authorization failures
#[derive(Debug, Error)]
pub enum DeviceAuthError {
    /// The service answered 503 to the start request
    #[error("authentication service is temporarily unavailable")]
    Unavailable,

    /// The service answered 429 to the start request
    #[error("rate limit exceeded, try again in a few minutes")]
    RateLimited,

    /// The device code expired before approval
    #[error("device code expired, start the login again")]
    Expired,

    /// The operator denied the request
    #[error("authorization denied by user")]
    Denied,

    /// Any other error code from the token endpoint
    #[error("authentication error ({code}): {description}")]
    Server {
        /// RFC 8628 error code
        code: String,
        /// Server-provided description
        description: String,
    },

    /// No structured answer: network failure, 5xx, or an unreadable body
    #[error("token request failed: {0}")]
    Transport(String),

    /// Still pending when the overall polling limit ran out
    #[error("authorization timed out after {0:?}")]
    TimedOut(Duration),

    /// Unexpected status from the start endpoint
    #[error("authentication service returned status {0}")]
    UnexpectedStatus(u16),
}

impl From<reqwest::Error> for DeviceAuthError {
    fn from(e: reqwest::Error) -> Self {
        Self::Transport(e.to_string())
    }
}

/// Result type for device authorization
pub type AuthResult<T> = std::result::Result<T, DeviceAuthError>;

/// Where a flow is in its lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowState {
    Idle,
    /// A code pair was issued; waiting for the operator
    AwaitingCode,
    /// A token poll loop is running
    Polling,
    Approved,
    Denied,
    Expired,
    Failed,
}

impl FlowState {
    /// Whether the flow has resolved
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Approved | Self::Denied | Self::Expired | Self::Failed
        )
    }
}

/// Code pair issued by the start endpoint
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct DeviceAuthSession {
    pub device_code: String,
    pub user_code: String,
    #[serde(default)]
    pub verification_uri: String,
    #[serde(default)]
    pub verification_uri_complete: String,
    /// Code lifetime in seconds
    #[serde(default)]
    pub expires_in: u64,
    /// Server-requested polling interval in seconds
    #[serde(default)]
    pub interval: u64,
}

impl DeviceAuthSession {
    /// Polling interval requested by the server
    #[must_use]
    pub const fn poll_interval(&self) -> Duration {
        if self.interval == 0 {
            DEFAULT_POLL_INTERVAL
        } else {
            Duration::from_secs(self.interval)
        }
    }
}

/// Credentials granted on approval
#[derive(Clone, Default, Deserialize)]
pub struct DeviceToken {
    /// Mesh-network auth key
    #[serde(default)]
    pub authkey: String,
    #[serde(default)]
    pub expires_in: u64,
    #[serde(default)]
    pub nexus_url: Option<String>,
    #[serde(default)]
    pub org_id: Option<String>,
    /// Direct broker URL (older control planes)
    #[serde(default)]
    pub redis_url: Option<String>,
    /// Bearer token for the broker API proxy
    #[serde(default)]
    pub device_api_token: Option<String>,
    #[serde(default)]
    pub api_base_url: Option<String>,
}

impl std::fmt::Debug for DeviceToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceToken")
            .field("authkey", &"[REDACTED]")
            .field("expires_in", &self.expires_in)
            .field("nexus_url", &self.nexus_url)
            .field("org_id", &self.org_id)
            .field("redis_url", &self.redis_url.as_ref().map(|_| "[REDACTED]"))
            .field(
                "device_api_token",
                &self.device_api_token.as_ref().map(|_| "[REDACTED]"),
            )
            .field("api_base_url", &self.api_base_url)
            .finish()
    }
}

#[derive(Debug, Serialize)]
struct StartRequest<'a> {
    client_id: &'a str,
    client_version: &'a str,
    #[serde(skip_serializing_if = "str::is_empty")]
    hostname: &'a str,
    #[serde(skip_serializing_if = "str::is_empty")]
    machine_id: &'a str,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    force_new: bool,
}

#[derive(Debug, Serialize)]
struct TokenRequest<'a> {
    device_code: &'a str,
    grant_type: &'a str,
}

#[derive(Debug, Deserialize)]
struct TokenErrorBody {
    error: String,
    #[serde(default)]
    error_description: Option<String>,
}

/// Outcome of one token poll that does not end the flow
enum Poll {
    Granted(Box<DeviceToken>),
    Pending,
    SlowDown,
}

/// Map a token-endpoint error code to a poll outcome or terminal error
fn classify(body: TokenErrorBody) -> AuthResult<Poll> {
    match body.error.as_str() {
        "authorization_pending" => Ok(Poll::Pending),
        "slow_down" => Ok(Poll::SlowDown),
        "expired_token" => Err(DeviceAuthError::Expired),
        "access_denied" => Err(DeviceAuthError::Denied),
        _ => Err(DeviceAuthError::Server {
            description: body.error_description.unwrap_or_default(),
            code: body.error,
        }),
    }
}

/// Stable fingerprint of this machine
///
/// SHA-256 over the OS machine id (when readable) and the hostname.
#[must_use]
pub fn machine_id() -> String {
    let os_id = std::fs::read_to_string("/etc/machine-id")
        .map(|s| s.trim().to_string())
        .unwrap_or_default();
    fingerprint(&os_id, &local_hostname())
}

fn fingerprint(os_id: &str, hostname: &str) -> String {
    let digest = Sha256::digest(format!("{os_id}:{hostname}").as_bytes());
    hex::encode(digest)
}

fn local_hostname() -> String {
    hostname::get()
        .map(|h| h.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// Device-code authorization client
#[derive(Debug)]
pub struct DeviceAuthFlow {
    base_url: String,
    client: reqwest::Client,
    state: FlowState,
    poll_timeout: Duration,
    slow_down_step: Duration,
}

impl DeviceAuthFlow {
    /// Create a flow against the authorization service at `base_url`
    ///
    /// # Errors
    ///
    /// Returns `DeviceAuthError::Transport` if the HTTP client cannot be built
    pub fn new(base_url: &str) -> AuthResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(15))
            .user_agent(concat!("citadel/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
            state: FlowState::Idle,
            poll_timeout: POLL_TIMEOUT,
            slow_down_step: SLOW_DOWN_STEP,
        })
    }

    /// Override the overall polling limit and the `slow_down` step
    #[must_use]
    pub const fn with_poll_timing(mut self, timeout: Duration, slow_down_step: Duration) -> Self {
        self.poll_timeout = timeout;
        self.slow_down_step = slow_down_step;
        self
    }

    /// Current lifecycle state
    #[must_use]
    pub const fn state(&self) -> FlowState {
        self.state
    }

    /// Request a fresh device/user code pair
    ///
    /// The returned verification URIs point at this service's `/device`
    /// page whatever the server reported.
    ///
    /// # Errors
    ///
    /// `Unavailable` on 503, `RateLimited` on 429, `UnexpectedStatus` on any
    /// other non-200, `Transport` on network or decode failure
    pub async fn start_flow(&mut self, force_new: bool) -> AuthResult<DeviceAuthSession> {
        let result = self.request_code(force_new).await;
        self.state = match &result {
            Ok(_) => FlowState::AwaitingCode,
            Err(_) => FlowState::Failed,
        };
        result
    }

    async fn request_code(&self, force_new: bool) -> AuthResult<DeviceAuthSession> {
        let hostname = local_hostname();
        let machine_id = machine_id();
        let body = StartRequest {
            client_id: CLIENT_ID,
            client_version: env!("CARGO_PKG_VERSION"),
            hostname: &hostname,
            machine_id: &machine_id,
            force_new,
        };

        let url = format!("{}/api/fabric/device-auth/start", self.base_url);
        tracing::debug!(%url, force_new, "requesting device code");
        let response = self.client.post(&url).json(&body).send().await?;

        match response.status().as_u16() {
            200 => {}
            503 => return Err(DeviceAuthError::Unavailable),
            429 => return Err(DeviceAuthError::RateLimited),
            status => return Err(DeviceAuthError::UnexpectedStatus(status)),
        }

        let mut session: DeviceAuthSession = response
            .json()
            .await
            .map_err(|e| DeviceAuthError::Transport(format!("failed to parse response: {e}")))?;
        session.verification_uri = format!("{}/device", self.base_url);
        session.verification_uri_complete =
            format!("{}/device?code={}", self.base_url, session.user_code);

        tracing::info!(user_code = %session.user_code, expires_in = session.expires_in, "device code issued");
        Ok(session)
    }

    /// Poll until the grant resolves or the polling limit runs out
    ///
    /// Sleeps `interval` between polls; `slow_down` lengthens it.
    ///
    /// # Errors
    ///
    /// `Expired`, `Denied`, `Server` for terminal token-endpoint codes,
    /// `Transport` when no structured answer came back, `TimedOut` when the
    /// limit ran out while still pending
    pub async fn poll_for_token(
        &mut self,
        device_code: &str,
        interval: Duration,
    ) -> AuthResult<DeviceToken> {
        self.state = FlowState::Polling;
        let result = self.poll_loop(device_code, interval).await;
        self.state = match &result {
            Ok(_) => FlowState::Approved,
            Err(DeviceAuthError::Denied) => FlowState::Denied,
            Err(DeviceAuthError::Expired | DeviceAuthError::TimedOut(_)) => FlowState::Expired,
            Err(_) => FlowState::Failed,
        };
        result
    }

    async fn poll_loop(&self, device_code: &str, interval: Duration) -> AuthResult<DeviceToken> {
        let started = tokio::time::Instant::now();
        let mut interval = interval;
        let mut polls = 0u32;

        while started.elapsed() < self.poll_timeout {
            polls += 1;
            match self.check_token(device_code).await? {
                Poll::Granted(token) => {
                    tracing::info!(polls, org_id = ?token.org_id, "device authorized");
                    return Ok(*token);
                }
                Poll::Pending => {
                    tracing::debug!(polls, "authorization pending");
                }
                Poll::SlowDown => {
                    interval += self.slow_down_step;
                    tracing::debug!(polls, interval = ?interval, "server asked to slow down");
                }
            }
            tokio::time::sleep(interval).await;
        }

        Err(DeviceAuthError::TimedOut(self.poll_timeout))
    }

    async fn check_token(&self, device_code: &str) -> AuthResult<Poll> {
        let url = format!("{}/api/fabric/device-auth/token", self.base_url);
        let body = TokenRequest {
            device_code,
            grant_type: DEVICE_CODE_GRANT,
        };
        let response = self.client.post(&url).json(&body).send().await?;

        match response.status().as_u16() {
            200 => {
                let token: DeviceToken = response.json().await.map_err(|e| {
                    DeviceAuthError::Transport(format!("failed to parse token response: {e}"))
                })?;
                if token.authkey.is_empty() {
                    Ok(Poll::Pending)
                } else {
                    Ok(Poll::Granted(Box::new(token)))
                }
            }
            400 => {
                let error: TokenErrorBody = response.json().await.map_err(|e| {
                    DeviceAuthError::Transport(format!("failed to parse error response: {e}"))
                })?;
                classify(error)
            }
            503 => Err(DeviceAuthError::Transport(
                "authentication service unavailable".to_string(),
            )),
            status => Err(DeviceAuthError::Transport(format!(
                "unexpected status code {status}"
            ))),
        }
    }
}
