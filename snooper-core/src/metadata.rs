//! Execution client identity: fetching, caching, passive updates.
//!
//! The fetcher polls the upstream with `engine_getClientVersionV1`,
//! retrying with exponential backoff until the first success, then
//! refreshing every 60 seconds. Observed `engine_getClientVersion*`
//! responses in the proxied traffic update the same cache passively, which
//! covers deployments where the proxy has no JWT secret of its own.

use std::sync::RwLock;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::jwt;

/// How often to refresh execution metadata.
const REFRESH_INTERVAL: Duration = Duration::from_secs(60);

/// Timeout for a single metadata fetch.
const FETCH_TIMEOUT: Duration = Duration::from_secs(5);

/// Initial delay between fetch retries.
const INITIAL_RETRY_DELAY: Duration = Duration::from_secs(2);

/// Maximum delay between fetch retries.
const MAX_RETRY_DELAY: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum MetadataError {
    #[error("request failed: {0}")]
    Request(String),
    #[error("unexpected status code: {0}")]
    Status(u16),
    #[error("rpc error {code}: {message}")]
    Rpc { code: i64, message: String },
    #[error("empty result from engine_getClientVersionV1")]
    EmptyResult,
    #[error("fetcher stopped")]
    Stopped,
    #[error("jwt: {0}")]
    Jwt(#[from] jwt::JwtError),
}

/// Response entry from `engine_getClientVersionV1`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ClientVersionV1 {
    /// Two-letter client code, e.g. `GE` for Geth.
    #[serde(default)]
    pub code: String,
    /// Human-readable name, e.g. `Geth`.
    #[serde(default)]
    pub name: String,
    /// Version string, e.g. `v1.14.0`.
    #[serde(default)]
    pub version: String,
    /// Short commit hash.
    #[serde(default)]
    pub commit: String,
}

impl std::fmt::Display for ClientVersionV1 {
    /// `web3_clientVersion`-style rendering: `Name/Version`, with the
    /// commit appended unless the version already contains it.
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let commit_norm = self.commit.strip_prefix("0x").unwrap_or(&self.commit);

        if !commit_norm.is_empty() && !commit_in_version(&self.version, commit_norm) {
            write!(f, "{}/{}-{}", self.name, self.version, self.commit)
        } else {
            write!(f, "{}/{}", self.name, self.version)
        }
    }
}

fn commit_in_version(version: &str, commit: &str) -> bool {
    if version.contains(commit) {
        return true;
    }

    const MIN_PREFIX_LEN: usize = 6;
    commit.len() >= MIN_PREFIX_LEN && version.contains(&commit[..MIN_PREFIX_LEN])
}

/// Cached execution client identity.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ExecutionMetadata {
    pub implementation: String,
    pub version: String,
    pub version_major: String,
    pub version_minor: String,
    pub version_patch: String,
}

impl ExecutionMetadata {
    fn from_client_version(cv: &ClientVersionV1) -> Self {
        let (major, minor, patch) = parse_version(&cv.version);

        Self {
            implementation: cv.name.clone(),
            version: cv.version.clone(),
            version_major: major,
            version_minor: minor,
            version_patch: patch,
        }
    }
}

/// Read access to the cached metadata.
pub trait ExecutionMetadataProvider: Send + Sync {
    fn get(&self) -> Option<ExecutionMetadata>;
}

/// Fetches and caches execution client metadata.
pub struct ExecutionMetadataFetcher {
    target: String,
    jwt_secret: Option<Vec<u8>>,
    client: reqwest::Client,
    metadata: RwLock<Option<ExecutionMetadata>>,
    ready_tx: watch::Sender<bool>,
}

impl ExecutionMetadataFetcher {
    /// `jwt_secret` is a file path or hex string per [`jwt::parse_secret`];
    /// a missing or unparseable secret means unauthenticated fetches.
    pub fn new(target: String, jwt_secret: Option<&str>) -> Self {
        let secret = jwt_secret.and_then(jwt::parse_secret);
        let (ready_tx, _) = watch::channel(false);

        Self {
            target,
            jwt_secret: secret,
            client: reqwest::Client::builder()
                .timeout(FETCH_TIMEOUT)
                .build()
                .unwrap_or_default(),
            metadata: RwLock::new(None),
            ready_tx,
        }
    }

    /// Resolves once initial metadata has been fetched.
    pub fn ready(&self) -> watch::Receiver<bool> {
        self.ready_tx.subscribe()
    }

    /// Update the cache from an observed `engine_getClientVersionV1`
    /// response. Takes the first entry (behind a multiplexer, any entry
    /// identifies the serving client).
    pub fn update(&self, versions: Vec<ClientVersionV1>) {
        let Some(cv) = versions.first() else {
            return;
        };

        let metadata = ExecutionMetadata::from_client_version(cv);

        debug!(
            implementation = %metadata.implementation,
            version = %metadata.version,
            "updated execution metadata from observed response"
        );

        *self.metadata.write().unwrap_or_else(|e| e.into_inner()) = Some(metadata);
    }

    /// Fetch initial metadata with retries, signal readiness, then
    /// refresh periodically until `shutdown` fires.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<(), MetadataError> {
        self.fetch_with_retries(&shutdown).await?;

        let _ = self.ready_tx.send(true);

        let mut ticker = tokio::time::interval(REFRESH_INTERVAL);
        ticker.reset();

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => return Ok(()),
                _ = ticker.tick() => {
                    if let Err(err) = self.fetch().await {
                        warn!(error = %err, "failed to refresh execution metadata");
                    }
                }
            }
        }
    }

    /// Retry the fetch with exponential backoff until success, shutdown
    /// or cancellation.
    async fn fetch_with_retries(&self, shutdown: &CancellationToken) -> Result<(), MetadataError> {
        let mut delay = INITIAL_RETRY_DELAY;
        let mut attempt = 0u32;

        loop {
            if shutdown.is_cancelled() {
                return Err(MetadataError::Stopped);
            }

            attempt += 1;

            match self.fetch().await {
                Ok(()) => return Ok(()),
                Err(err) => {
                    warn!(
                        error = %err,
                        attempt,
                        next_retry = ?delay,
                        "failed to fetch execution metadata, retrying"
                    );

                    tokio::select! {
                        _ = shutdown.cancelled() => return Err(MetadataError::Stopped),
                        _ = tokio::time::sleep(delay) => {}
                    }

                    delay = (delay * 2).min(MAX_RETRY_DELAY);
                }
            }
        }
    }

    /// One `engine_getClientVersionV1` round trip.
    async fn fetch(&self) -> Result<(), MetadataError> {
        let body = json!({
            "jsonrpc": "2.0",
            "method": "engine_getClientVersionV1",
            "params": [ClientVersionV1 {
                code: "RS".to_string(),
                name: crate::IMPLEMENTATION.to_string(),
                version: format!("v{}", crate::build_version()),
                commit: "00000000".to_string(),
            }],
            "id": 1,
        });

        let mut request = self.client.post(&self.target).json(&body);

        if let Some(secret) = &self.jwt_secret {
            let token = jwt::create_token(secret)?;
            request = request.bearer_auth(token);
        }

        let response = request
            .send()
            .await
            .map_err(|err| MetadataError::Request(err.to_string()))?;

        if !response.status().is_success() {
            return Err(MetadataError::Status(response.status().as_u16()));
        }

        #[derive(Deserialize)]
        struct RpcEnvelope {
            #[serde(default)]
            result: Option<Vec<ClientVersionV1>>,
            #[serde(default)]
            error: Option<RpcErrorBody>,
        }

        #[derive(Deserialize)]
        struct RpcErrorBody {
            #[serde(default)]
            code: i64,
            #[serde(default)]
            message: String,
        }

        let envelope: RpcEnvelope = response
            .json()
            .await
            .map_err(|err| MetadataError::Request(err.to_string()))?;

        if let Some(err) = envelope.error {
            return Err(MetadataError::Rpc {
                code: err.code,
                message: err.message,
            });
        }

        let versions = envelope.result.unwrap_or_default();
        let Some(cv) = versions.first() else {
            return Err(MetadataError::EmptyResult);
        };

        let metadata = ExecutionMetadata::from_client_version(cv);

        info!(
            implementation = %metadata.implementation,
            version = %metadata.version,
            "fetched execution metadata"
        );

        *self.metadata.write().unwrap_or_else(|e| e.into_inner()) = Some(metadata);

        Ok(())
    }
}

impl ExecutionMetadataProvider for ExecutionMetadataFetcher {
    fn get(&self) -> Option<ExecutionMetadata> {
        self.metadata
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

/// Split a version string into major/minor/patch. Strips a leading `v`,
/// cuts off any `-` or `+` suffix, then splits on `.`.
fn parse_version(version: &str) -> (String, String, String) {
    if version.is_empty() {
        return (String::new(), String::new(), String::new());
    }

    let version = version.strip_prefix('v').unwrap_or(version);
    let core = version
        .split_once(['-', '+'])
        .map(|(core, _)| core)
        .unwrap_or(version);

    let mut parts = core.split('.').filter(|p| !p.is_empty());

    (
        parts.next().unwrap_or_default().to_string(),
        parts.next().unwrap_or_default().to_string(),
        parts.next().unwrap_or_default().to_string(),
    )
}
