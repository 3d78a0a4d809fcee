//! Cached "is the stream live" signal.
//!
//! The UI polls liveness far more often than the upstream API should be hit,
//! so [`StatusCache`] serves a snapshot for `ttl`, lets only one refresh run
//! at a time, and falls back to the last good snapshot while it is younger
//! than `ttl * staleness_factor`. Past that it reports offline.

use parking_lot::Mutex;
use serde::Deserialize;
use std::{
    sync::Arc,
    time::{Duration, SystemTime},
};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::{
    config::{LivenessConfig, TwitchConfig},
    prelude::LivenessUpstream,
    state::{time_in_millis, LiveStatus, LivenessSnapshot},
    KudosError, KudosResult,
};

const TWITCH_AUTH_URL: &str = "https://id.twitch.tv/oauth2/token";
const TWITCH_API_URL: &str = "https://api.twitch.tv/helix";
/// App tokens are renewed this long before Twitch says they expire.
const TOKEN_EXPIRY_MARGIN: Duration = Duration::from_secs(60);
const UPSTREAM_TIMEOUT: Duration = Duration::from_secs(10);

struct Cached {
    snapshot: LivenessSnapshot,
    fetched: Instant,
}

struct Refresh {
    completed: Instant,
    served: LivenessSnapshot,
}

#[derive(Default)]
struct CacheState {
    last_good: Option<Cached>,
    last_refresh: Option<Refresh>,
    last_stamp: u64,
}

impl CacheState {
    /// Unix millis, strictly greater than anything handed out before.
    fn next_stamp(&mut self) -> u64 {
        let stamp = time_in_millis(SystemTime::now()).max(self.last_stamp + 1);
        self.last_stamp = stamp;
        stamp
    }
}

pub struct StatusCache<U: ?Sized> {
    upstream: Arc<U>,
    ttl: Duration,
    ceiling: Duration,
    state: Mutex<CacheState>,
    refresh: tokio::sync::Mutex<()>,
}

impl<U: LivenessUpstream + ?Sized> StatusCache<U> {
    pub fn new(upstream: Arc<U>, ttl: Duration, staleness_factor: u32) -> Self {
        Self {
            upstream,
            ttl,
            ceiling: ttl.saturating_mul(staleness_factor.max(1)),
            state: Mutex::new(CacheState::default()),
            refresh: tokio::sync::Mutex::new(()),
        }
    }

    pub fn from_config(upstream: Arc<U>, config: &LivenessConfig) -> Self {
        Self::new(upstream, config.ttl(), config.staleness_factor)
    }

    /// Never fails. Callers that arrive while a refresh is running get that
    /// refresh's result instead of starting another one.
    pub async fn get_liveness(&self) -> LivenessSnapshot {
        let requested = Instant::now();
        if let Some(snapshot) = self.fresh(requested) {
            return snapshot;
        }

        let _refreshing = self.refresh.lock().await;
        let shared = self
            .state
            .lock()
            .last_refresh
            .as_ref()
            .filter(|refresh| refresh.completed >= requested)
            .map(|refresh| refresh.served.clone());
        if let Some(snapshot) = shared {
            return snapshot;
        }

        debug!("Refreshing liveness");
        let fetched = self.upstream.fetch().await;
        let now = Instant::now();
        let mut state = self.state.lock();
        let served = match fetched {
            Ok(status) => {
                let snapshot = LivenessSnapshot::from_status(status, state.next_stamp());
                state.last_good = Some(Cached {
                    snapshot: snapshot.clone(),
                    fetched: now,
                });
                snapshot
            }
            Err(err) => {
                warn!(error = %err, "Liveness upstream failed");
                let stale = state
                    .last_good
                    .as_ref()
                    .filter(|cached| now.duration_since(cached.fetched) < self.ceiling)
                    .map(|cached| cached.snapshot.clone());
                match stale {
                    Some(snapshot) => snapshot,
                    None => LivenessSnapshot::offline(state.next_stamp()),
                }
            }
        };
        state.last_refresh = Some(Refresh {
            completed: now,
            served: served.clone(),
        });
        served
    }

    fn fresh(&self, now: Instant) -> Option<LivenessSnapshot> {
        let state = self.state.lock();
        state
            .last_good
            .as_ref()
            .filter(|cached| now.duration_since(cached.fetched) < self.ttl)
            .map(|cached| cached.snapshot.clone())
    }
}

/// Pick the upstream the config asks for. Twitch wins over a plain status
/// url; with neither the stream is always reported offline.
pub fn upstream_from_config(config: &LivenessConfig) -> KudosResult<Arc<dyn LivenessUpstream>> {
    if let Some(twitch) = &config.twitch {
        info!(user_login = %twitch.user_login, "Liveness from Twitch");
        return Ok(Arc::new(TwitchUpstream::new(twitch.clone())?));
    }
    if let Some(url) = &config.status_url {
        info!(%url, "Liveness from status endpoint");
        return Ok(Arc::new(HttpStatusUpstream::new(url)?));
    }
    info!("No liveness upstream configured");
    Ok(Arc::new(OfflineUpstream))
}

fn http_client() -> KudosResult<reqwest::Client> {
    let client = reqwest::Client::builder()
        .timeout(UPSTREAM_TIMEOUT)
        .build()
        .map_err(upstream_error)?;
    Ok(client)
}

fn upstream_error(err: reqwest::Error) -> anyhow::Error {
    KudosError::upstream_unavailable(err.to_string()).into()
}

pub struct OfflineUpstream;

#[async_trait::async_trait]
impl LivenessUpstream for OfflineUpstream {
    async fn fetch(&self) -> KudosResult<LiveStatus> {
        Ok(LiveStatus::offline())
    }
}

/// Endpoint answering `{"online": bool, "title"?: string, "userName"?: string}`.
pub struct HttpStatusUpstream {
    client: reqwest::Client,
    url: String,
}

impl HttpStatusUpstream {
    pub fn new(url: impl Into<String>) -> KudosResult<Self> {
        Ok(Self {
            client: http_client()?,
            url: url.into(),
        })
    }
}

#[async_trait::async_trait]
impl LivenessUpstream for HttpStatusUpstream {
    async fn fetch(&self) -> KudosResult<LiveStatus> {
        let status = self
            .client
            .get(&self.url)
            .send()
            .await
            .and_then(|response| response.error_for_status())
            .map_err(upstream_error)?
            .json::<LiveStatus>()
            .await
            .map_err(upstream_error)?;
        Ok(status)
    }
}

#[derive(Clone)]
struct AppToken {
    value: String,
    renew_at: Instant,
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    expires_in: u64,
}

#[derive(Deserialize)]
struct StreamsResponse {
    #[serde(default)]
    data: Vec<StreamEntry>,
}

#[derive(Deserialize)]
struct StreamEntry {
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    user_name: Option<String>,
}

impl From<StreamsResponse> for LiveStatus {
    fn from(value: StreamsResponse) -> Self {
        match value.data.into_iter().next() {
            Some(stream) => LiveStatus {
                online: true,
                title: stream.title.filter(|title| !title.is_empty()),
                broadcaster: stream.user_name,
            },
            None => LiveStatus::offline(),
        }
    }
}

/// Asks the Helix API whether `user_login` is streaming, using an app token
/// from the client-credentials flow.
pub struct TwitchUpstream {
    client: reqwest::Client,
    config: TwitchConfig,
    token: Mutex<Option<AppToken>>,
}

impl TwitchUpstream {
    pub fn new(config: TwitchConfig) -> KudosResult<Self> {
        Ok(Self {
            client: http_client()?,
            config,
            token: Mutex::new(None),
        })
    }

    async fn app_token(&self) -> KudosResult<String> {
        let cached = self.token.lock().clone();
        if let Some(token) = cached.filter(|token| Instant::now() < token.renew_at) {
            return Ok(token.value);
        }

        debug!("Requesting Twitch app token");
        let response = self
            .client
            .post(TWITCH_AUTH_URL)
            .query(&[
                ("client_id", self.config.client_id.as_str()),
                ("client_secret", self.config.client_secret.as_str()),
                ("grant_type", "client_credentials"),
            ])
            .send()
            .await
            .and_then(|response| response.error_for_status())
            .map_err(upstream_error)?
            .json::<TokenResponse>()
            .await
            .map_err(upstream_error)?;

        let lifetime = Duration::from_secs(response.expires_in).saturating_sub(TOKEN_EXPIRY_MARGIN);
        let token = AppToken {
            value: response.access_token,
            renew_at: Instant::now() + lifetime,
        };
        *self.token.lock() = Some(token.clone());
        Ok(token.value)
    }
}

#[async_trait::async_trait]
impl LivenessUpstream for TwitchUpstream {
    async fn fetch(&self) -> KudosResult<LiveStatus> {
        let token = self.app_token().await?;
        let response = self
            .client
            .get(format!("{TWITCH_API_URL}/streams"))
            .query(&[("user_login", self.config.user_login.as_str())])
            .header("Client-Id", &self.config.client_id)
            .bearer_auth(token)
            .send()
            .await
            .map_err(upstream_error)?;

        if response.status() == reqwest::StatusCode::UNAUTHORIZED {
            self.token.lock().take();
            return Err(KudosError::upstream_unavailable("twitch rejected the app token").into());
        }
        let streams = response
            .error_for_status()
            .map_err(upstream_error)?
            .json::<StreamsResponse>()
            .await
            .map_err(upstream_error)?;
        Ok(streams.into())
    }
}
