// Copyright (C) 2026 StarHuntingGames
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <https://www.gnu.org/licenses/>.

use std::{
    collections::{HashMap, HashSet},
    net::SocketAddr,
    path::PathBuf,
    sync::Arc,
    time::Duration,
};

use anyhow::Context;
use async_trait::async_trait;
use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use chrono::{DateTime, Utc};
use eoogle_core::{
    ChatId, DEFAULT_CACHE_PAGE_SIZE, DEFAULT_INGEST_BATCH_DELAY_SECONDS, ExternalId, ServiceTag,
    cache::{CachePage, UsernameCache},
    expand_env_vars,
    ingest::{IngestError, IngestPipeline, IngestProgress, IngestRange, IngestSummary},
    profile::{
        Badge, FetchError, FollowCounts, ProfileCard, ProfileLookup, ProfileSource, UserProfile,
        decode_response, membership_level,
    },
    registry::{LinkRegistry, LinkedAccount, LinkedUser},
    resolve::{Target, resolve_target},
    retry::RetryPolicy,
    store::{JsonFileStore, Store, StoreError},
    verification::{
        IssuedChallenge, LinkConfirmed, VerificationChallenge, VerificationEngine, VerifyError,
    },
};
use reqwest::header::{ACCEPT, CONTENT_TYPE, HeaderMap, HeaderValue};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use serde_json::Value;
use tokio::sync::{Mutex, oneshot, watch};
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{info, warn};
use uuid::Uuid;

const SERVICE_NAME: &str = "link-bot-service";
const DEFAULT_BIND: &str = "0.0.0.0:8095";
const DEFAULT_DB_PATH: &str = "database.json";
const DEFAULT_SERVICE_A_BASE_URL: &str = "https://ecsr.io";
const DEFAULT_SERVICE_B_BASE_URL: &str = "https://korone.lol";
const BROWSER_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/91.0.4472.124 Safari/537.36";
const HTTP_TIMEOUT: Duration = Duration::from_secs(30);
const MAX_RETAINED_INGEST_JOBS: usize = 10;

#[derive(Debug, Clone)]
struct ServiceConfig {
    bind_addr: SocketAddr,
    db_path: PathBuf,
    service_a_base_url: String,
    service_b_base_url: String,
    admin_ids: HashSet<String>,
    ingest_batch_delay: Duration,
    retry_max_delay: Duration,
}

/// Optional YAML overlay. `${VAR}` references are expanded before parsing.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ServiceConfigFile {
    bind: Option<String>,
    db_path: Option<String>,
    service_a_base_url: Option<String>,
    service_b_base_url: Option<String>,
    admin_ids: Vec<String>,
    ingest_batch_delay_ms: Option<u64>,
    retry_max_delay_ms: Option<u64>,
}

impl ServiceConfig {
    fn from_env() -> anyhow::Result<Self> {
        Self::from_sources(load_config_file(), |name| std::env::var(name).ok())
    }

    /// Environment variables win over the config file, which wins over defaults.
    fn from_sources(
        file: ServiceConfigFile,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> anyhow::Result<Self> {
        let env = |name: &str| normalize_optional_string(lookup(name));

        let bind = env("LINK_BOT_BIND")
            .or_else(|| normalize_optional_string(file.bind))
            .unwrap_or_else(|| DEFAULT_BIND.to_string());
        let bind_addr: SocketAddr = bind
            .parse()
            .with_context(|| format!("invalid LINK_BOT_BIND {bind}"))?;

        let db_path = env("LINK_BOT_DB_PATH")
            .or_else(|| normalize_optional_string(file.db_path))
            .unwrap_or_else(|| DEFAULT_DB_PATH.to_string());
        let service_a_base_url = env("SERVICE_A_BASE_URL")
            .or_else(|| normalize_optional_string(file.service_a_base_url))
            .unwrap_or_else(|| DEFAULT_SERVICE_A_BASE_URL.to_string());
        let service_b_base_url = env("SERVICE_B_BASE_URL")
            .or_else(|| normalize_optional_string(file.service_b_base_url))
            .unwrap_or_else(|| DEFAULT_SERVICE_B_BASE_URL.to_string());

        let admin_ids = match env("LINK_BOT_ADMIN_IDS") {
            Some(raw) => split_list(&raw),
            None => file
                .admin_ids
                .into_iter()
                .filter_map(|id| normalize_optional_string(Some(id)))
                .collect(),
        };

        let ingest_batch_delay = parse_millis(
            env("LINK_BOT_INGEST_BATCH_DELAY_MS"),
            "LINK_BOT_INGEST_BATCH_DELAY_MS",
        )?
        .or(file.ingest_batch_delay_ms)
        .map(Duration::from_millis)
        .unwrap_or(Duration::from_secs(DEFAULT_INGEST_BATCH_DELAY_SECONDS));
        let retry_max_delay = parse_millis(
            env("LINK_BOT_RETRY_MAX_DELAY_MS"),
            "LINK_BOT_RETRY_MAX_DELAY_MS",
        )?
        .or(file.retry_max_delay_ms)
        .map(Duration::from_millis)
        .unwrap_or(RetryPolicy::default().max_delay);

        Ok(Self {
            bind_addr,
            db_path: PathBuf::from(db_path),
            service_a_base_url,
            service_b_base_url,
            admin_ids,
            ingest_batch_delay,
            retry_max_delay,
        })
    }

    fn base_url(&self, service: ServiceTag) -> &str {
        match service {
            ServiceTag::ServiceA => &self.service_a_base_url,
            ServiceTag::ServiceB => &self.service_b_base_url,
        }
    }
}

fn load_config_file() -> ServiceConfigFile {
    let Some(path) = normalize_optional_string(std::env::var("LINK_BOT_CONFIG_PATH").ok()) else {
        return ServiceConfigFile::default();
    };

    let raw = match std::fs::read_to_string(&path) {
        Ok(raw) => raw,
        Err(error) => {
            warn!(path = %path, error = %error, "failed to read link-bot config file");
            return ServiceConfigFile::default();
        }
    };

    if raw.trim().is_empty() {
        warn!(path = %path, "link-bot config file is empty");
        return ServiceConfigFile::default();
    }

    match parse_config_file(&raw) {
        Ok(file) => {
            info!(path = %path, "loaded link-bot config file");
            file
        }
        Err(error) => {
            warn!(path = %path, error = %error, "failed to parse link-bot config yaml");
            ServiceConfigFile::default()
        }
    }
}

fn parse_config_file(raw: &str) -> Result<ServiceConfigFile, serde_yaml::Error> {
    serde_yaml::from_str(&expand_env_vars(raw))
}

fn normalize_optional_string(value: Option<String>) -> Option<String> {
    value
        .map(|entry| entry.trim().to_string())
        .filter(|entry| !entry.is_empty())
}

fn split_list(raw: &str) -> HashSet<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(str::to_string)
        .collect()
}

fn parse_millis(value: Option<String>, var_name: &str) -> anyhow::Result<Option<u64>> {
    value
        .map(|raw| {
            raw.parse::<u64>()
                .with_context(|| format!("invalid {var_name} {raw}"))
        })
        .transpose()
}

/// Public JSON APIs of the external services.
#[derive(Clone)]
struct HttpProfileSource {
    client: reqwest::Client,
    service_a_base_url: String,
    service_b_base_url: String,
}

#[derive(Debug, Default, Deserialize)]
struct HeadshotResponse {
    #[serde(default)]
    data: Vec<HeadshotEntry>,
}

#[derive(Debug, Deserialize)]
struct HeadshotEntry {
    #[serde(default, rename = "imageUrl")]
    image_url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CountResponse {
    #[serde(default)]
    count: u64,
}

#[derive(Debug, Default, Deserialize)]
struct NameHistoryResponse {
    #[serde(default)]
    data: Vec<NameHistoryEntry>,
}

#[derive(Debug, Deserialize)]
struct NameHistoryEntry {
    name: String,
}

impl HttpProfileSource {
    fn new(config: &ServiceConfig) -> anyhow::Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static("application/json"));
        let client = reqwest::Client::builder()
            .timeout(HTTP_TIMEOUT)
            .user_agent(BROWSER_USER_AGENT)
            .default_headers(headers)
            .build()
            .context("failed to build external service HTTP client")?;

        Ok(Self {
            client,
            service_a_base_url: config.service_a_base_url.clone(),
            service_b_base_url: config.service_b_base_url.clone(),
        })
    }

    fn base_url(&self, service: ServiceTag) -> &str {
        match service {
            ServiceTag::ServiceA => &self.service_a_base_url,
            ServiceTag::ServiceB => &self.service_b_base_url,
        }
    }

    fn endpoint(&self, service: ServiceTag, path: &str) -> String {
        format!(
            "{}/{}",
            self.base_url(service).trim_end_matches('/'),
            path.trim_start_matches('/')
        )
    }

    async fn get_json<T: DeserializeOwned>(&self, url: String) -> Result<T, FetchError> {
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|error| FetchError::Network(error.to_string()))?;

        let status = response.status().as_u16();
        let html = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .is_some_and(|value| value.to_ascii_lowercase().contains("text/html"));
        let body = response
            .text()
            .await
            .map_err(|error| FetchError::Network(error.to_string()))?;

        decode_response(status, html, &body)
    }
}

#[async_trait]
impl ProfileSource for HttpProfileSource {
    async fn fetch_profile(&self, service: ServiceTag, id: &str) -> Result<UserProfile, FetchError> {
        self.get_json(self.endpoint(service, &format!("apisite/users/v1/users/{id}")))
            .await
    }

    async fn fetch_membership(&self, service: ServiceTag, id: &str) -> Result<u8, FetchError> {
        let value: Value = self
            .get_json(self.endpoint(
                service,
                &format!("apisite/premiumfeatures/v1/users/{id}/validate-membership"),
            ))
            .await?;
        Ok(membership_level(&value))
    }

    async fn fetch_headshot(
        &self,
        service: ServiceTag,
        id: &str,
    ) -> Result<Option<String>, FetchError> {
        let response: HeadshotResponse = self
            .get_json(self.endpoint(
                service,
                &format!(
                    "apisite/thumbnails/v1/users/avatar-headshot?userIds={id}&size=420x420&format=png"
                ),
            ))
            .await?;
        Ok(response
            .data
            .into_iter()
            .find_map(|entry| entry.image_url)
            .map(|url| absolute_image_url(self.base_url(service), &url)))
    }

    async fn fetch_follow_counts(
        &self,
        service: ServiceTag,
        id: &str,
    ) -> Result<FollowCounts, FetchError> {
        let (followers, followings) = tokio::try_join!(
            self.get_json::<CountResponse>(self.endpoint(
                service,
                &format!("apisite/friends/v1/users/{id}/followers/count")
            )),
            self.get_json::<CountResponse>(self.endpoint(
                service,
                &format!("apisite/friends/v1/users/{id}/followings/count")
            )),
        )?;
        Ok(FollowCounts {
            followers: followers.count,
            followings: followings.count,
        })
    }

    async fn fetch_username_history(
        &self,
        service: ServiceTag,
        id: &str,
    ) -> Result<Vec<String>, FetchError> {
        let response: NameHistoryResponse = self
            .get_json(self.endpoint(
                service,
                &format!("apisite/users/v1/users/{id}/username-history?limit=1000"),
            ))
            .await?;
        Ok(response.data.into_iter().map(|entry| entry.name).collect())
    }
}

/// Thumbnail URLs are sometimes site-relative.
fn absolute_image_url(base_url: &str, url: &str) -> String {
    if url.starts_with("http://") || url.starts_with("https://") {
        url.to_string()
    } else {
        format!(
            "{}/{}",
            base_url.trim_end_matches('/'),
            url.trim_start_matches('/')
        )
    }
}

#[derive(Clone)]
struct AppState {
    config: Arc<ServiceConfig>,
    registry: LinkRegistry,
    cache: UsernameCache,
    lookup: ProfileLookup,
    engine: VerificationEngine,
    ingest: IngestPipeline,
    ingest_jobs: Arc<Mutex<HashMap<Uuid, IngestJob>>>,
}

impl AppState {
    fn new(config: ServiceConfig, store: Store, source: Arc<dyn ProfileSource>) -> Self {
        let cache = UsernameCache::new(store.clone());
        let lookup = ProfileLookup::new(source.clone(), cache.clone());
        let ingest = IngestPipeline::new(source, cache.clone())
            .with_policy(RetryPolicy::default().with_max_delay(config.retry_max_delay))
            .with_batch_delay(config.ingest_batch_delay);

        Self {
            registry: LinkRegistry::new(store.clone()),
            engine: VerificationEngine::new(store, lookup.clone()),
            cache,
            lookup,
            ingest,
            config: Arc::new(config),
            ingest_jobs: Arc::default(),
        }
    }
}

struct IngestJob {
    stop_tx: Option<oneshot::Sender<()>>,
    status: watch::Receiver<JobStatus>,
    join: tokio::task::JoinHandle<()>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
enum JobStatus {
    Running {
        service: ServiceTag,
        range: IngestRange,
        started_at: DateTime<Utc>,
        progress: IngestProgress,
        percent: u8,
    },
    Finished {
        started_at: DateTime<Utc>,
        finished_at: DateTime<Utc>,
        summary: IngestSummary,
    },
    Cancelled {
        started_at: DateTime<Utc>,
        finished_at: DateTime<Utc>,
        summary: IngestSummary,
    },
}

impl JobStatus {
    fn running(
        service: ServiceTag,
        range: IngestRange,
        started_at: DateTime<Utc>,
        progress: IngestProgress,
    ) -> Self {
        Self::Running {
            service,
            range,
            started_at,
            percent: progress.percent(),
            progress,
        }
    }

    fn is_running(&self) -> bool {
        matches!(self, Self::Running { .. })
    }

    fn finished_at(&self) -> Option<DateTime<Utc>> {
        match self {
            Self::Running { .. } => None,
            Self::Finished { finished_at, .. } | Self::Cancelled { finished_at, .. } => {
                Some(*finished_at)
            }
        }
    }
}

#[derive(Debug, Deserialize)]
struct LinkRequest {
    chat_id: String,
    external_id: String,
    #[serde(default)]
    service: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct ServiceQuery {
    service: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct ProfileQuery {
    input: Option<String>,
    author_id: Option<String>,
    service: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct AdminQuery {
    actor_id: Option<String>,
    page: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct StartIngestRequest {
    actor_id: Option<String>,
    start: u64,
    end: u64,
    #[serde(default)]
    service: Option<String>,
}

#[derive(Debug, Serialize)]
struct UnlinkResponse {
    chat_id: String,
    removed: Vec<LinkedAccount>,
}

#[derive(Debug, Serialize)]
struct ProfileResponse {
    profile_url: String,
    badges: Vec<Badge>,
    /// Chat identity the account is linked to, if any.
    linked_chat_id: Option<ChatId>,
    #[serde(flatten)]
    card: ProfileCard,
}

#[derive(Debug, Serialize)]
struct NamesResponse {
    service: ServiceTag,
    external_id: ExternalId,
    previous_names: Vec<String>,
}

#[derive(Debug, Serialize)]
struct LinkedUsersResponse {
    count: usize,
    users: Vec<LinkedUser>,
}

#[derive(Debug, Serialize)]
struct ClearCacheResponse {
    cleared: usize,
}

#[derive(Debug, Serialize)]
struct IngestJobResponse {
    job_id: Uuid,
    #[serde(flatten)]
    status: JobStatus,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(std::env::var("RUST_LOG").unwrap_or_else(|_| {
            "link_bot_service=debug,eoogle_core=info,tower_http=info".to_string()
        }))
        .init();

    let config = ServiceConfig::from_env()?;
    let file_store = JsonFileStore::open(config.db_path.clone())
        .with_context(|| format!("failed to open database {}", config.db_path.display()))?;
    let source = HttpProfileSource::new(&config)?;
    info!(
        db_path = %config.db_path.display(),
        service_a_base_url = %config.service_a_base_url,
        service_b_base_url = %config.service_b_base_url,
        admin_count = config.admin_ids.len(),
        ingest_batch_delay_ms = config.ingest_batch_delay.as_millis() as u64,
        retry_max_delay_ms = config.retry_max_delay.as_millis() as u64,
        "link-bot-service loaded config"
    );

    let bind_addr = config.bind_addr;
    let state = AppState::new(config, Store::new(Arc::new(file_store)), Arc::new(source));
    let app = build_router(state.clone());

    info!(%bind_addr, "link-bot-service listening");
    let listener = tokio::net::TcpListener::bind(bind_addr)
        .await
        .with_context(|| format!("failed to bind {bind_addr}"))?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    stop_ingest_jobs(&state).await;
    info!("link-bot-service stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(error) = tokio::signal::ctrl_c().await {
        warn!(error = %error, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("shutdown signal received");
}

fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/v1/links", post(create_link_handler))
        .route(
            "/v1/links/{chat_id}",
            get(get_link_handler).delete(unlink_handler),
        )
        .route(
            "/v1/links/{chat_id}/verify",
            post(verify_link_handler).get(pending_verification_handler),
        )
        .route("/v1/profiles", get(profile_handler))
        .route("/v1/profiles/names", get(names_handler))
        .route("/v1/admin/links", get(linked_users_handler))
        .route(
            "/v1/admin/cache",
            get(list_cache_handler).delete(clear_cache_handler),
        )
        .route("/v1/admin/cache/ingest", post(start_ingest_handler))
        .route(
            "/v1/admin/cache/ingest/{job_id}",
            get(ingest_status_handler).delete(cancel_ingest_handler),
        )
        .with_state(state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({"ok": true, "service": SERVICE_NAME}))
}

async fn create_link_handler(
    State(state): State<AppState>,
    Json(request): Json<LinkRequest>,
) -> Result<(StatusCode, Json<IssuedChallenge>), ApiError> {
    let chat_id = required("chat_id", &request.chat_id)?;
    let external_id = required("external_id", &request.external_id)?;
    let service = parse_service(request.service.as_deref())?;

    let issued = state.engine.issue(chat_id, external_id, service).await?;
    Ok((StatusCode::CREATED, Json(issued)))
}

async fn verify_link_handler(
    State(state): State<AppState>,
    Path(chat_id): Path<String>,
) -> Result<Json<LinkConfirmed>, ApiError> {
    let confirmed = state.engine.submit(&chat_id).await?;
    Ok(Json(confirmed))
}

async fn pending_verification_handler(
    State(state): State<AppState>,
    Path(chat_id): Path<String>,
) -> Result<Json<VerificationChallenge>, ApiError> {
    state
        .engine
        .pending(&chat_id)
        .map(Json)
        .ok_or_else(|| ApiError::not_found(format!("no active verification for {chat_id}")))
}

async fn get_link_handler(
    State(state): State<AppState>,
    Path(chat_id): Path<String>,
    Query(query): Query<ServiceQuery>,
) -> Result<Json<LinkedUser>, ApiError> {
    let service = parse_optional_service(query.service.as_deref())?;
    let account = state
        .registry
        .linked_account(&chat_id, service)?
        .ok_or_else(|| ApiError::not_found(format!("{chat_id} has no linked account")))?;

    Ok(Json(LinkedUser {
        chat_id,
        service: account.service,
        external_id: account.external_id,
    }))
}

async fn unlink_handler(
    State(state): State<AppState>,
    Path(chat_id): Path<String>,
    Query(query): Query<ServiceQuery>,
) -> Result<Json<UnlinkResponse>, ApiError> {
    let service = parse_optional_service(query.service.as_deref())?;
    let removed = state.registry.remove_link(&chat_id, service)?;
    if removed.is_empty() {
        return Err(ApiError::not_found(format!(
            "{chat_id} has no linked account to unlink"
        )));
    }
    Ok(Json(UnlinkResponse { chat_id, removed }))
}

async fn profile_handler(
    State(state): State<AppState>,
    Query(query): Query<ProfileQuery>,
) -> Result<Json<ProfileResponse>, ApiError> {
    let (service, external_id) = resolve_account(&state, &query)?;
    let card = state
        .lookup
        .card(service, &external_id)
        .await
        .map_err(|error| ApiError::from_fetch(error, service, &external_id))?;

    Ok(Json(ProfileResponse {
        profile_url: format!(
            "{}/users/{external_id}/profile",
            state.config.base_url(service).trim_end_matches('/')
        ),
        badges: card.badges(),
        linked_chat_id: state
            .registry
            .find_chat_id_by_external_id(&external_id, service),
        card,
    }))
}

async fn names_handler(
    State(state): State<AppState>,
    Query(query): Query<ProfileQuery>,
) -> Result<Json<NamesResponse>, ApiError> {
    let (service, external_id) = resolve_account(&state, &query)?;
    let history = state
        .lookup
        .username_history(service, &external_id)
        .await
        .map_err(|error| ApiError::from_fetch(error, service, &external_id))?;

    Ok(Json(NamesResponse {
        service,
        external_id,
        previous_names: history.into_iter().skip(1).collect(),
    }))
}

async fn linked_users_handler(
    State(state): State<AppState>,
    Query(query): Query<AdminQuery>,
) -> Result<Json<LinkedUsersResponse>, ApiError> {
    require_admin(&state, query.actor_id.as_deref())?;
    let users = state.registry.linked_users();
    Ok(Json(LinkedUsersResponse {
        count: users.len(),
        users,
    }))
}

async fn list_cache_handler(
    State(state): State<AppState>,
    Query(query): Query<AdminQuery>,
) -> Result<Json<CachePage>, ApiError> {
    require_admin(&state, query.actor_id.as_deref())?;
    Ok(Json(state.cache.page(
        query.page.unwrap_or(1),
        DEFAULT_CACHE_PAGE_SIZE,
    )))
}

async fn clear_cache_handler(
    State(state): State<AppState>,
    Query(query): Query<AdminQuery>,
) -> Result<Json<ClearCacheResponse>, ApiError> {
    let actor_id = require_admin(&state, query.actor_id.as_deref())?;
    let cleared = state.cache.clear()?;
    info!(actor_id, cleared, "username cache cleared");
    Ok(Json(ClearCacheResponse { cleared }))
}

async fn start_ingest_handler(
    State(state): State<AppState>,
    Json(request): Json<StartIngestRequest>,
) -> Result<(StatusCode, Json<IngestJobResponse>), ApiError> {
    let actor_id = require_admin(&state, request.actor_id.as_deref())?;
    let service = parse_service(request.service.as_deref())?;
    let range = IngestRange::new(request.start, request.end)?;

    let mut jobs = state.ingest_jobs.lock().await;
    if let Some(running) = jobs
        .iter()
        .find_map(|(job_id, job)| job.status.borrow().is_running().then_some(*job_id))
    {
        return Err(ApiError::conflict(format!(
            "ingest job {running} is still running"
        )));
    }

    retain_recent_jobs(&mut jobs, MAX_RETAINED_INGEST_JOBS - 1);
    let job_id = Uuid::new_v4();
    let started_at = Utc::now();
    let initial = JobStatus::running(
        service,
        range,
        started_at,
        IngestProgress {
            processed: 0,
            total: range.len(),
            succeeded: 0,
            failed: 0,
        },
    );
    let (status_tx, status_rx) = watch::channel(initial.clone());
    let (stop_tx, stop_rx) = oneshot::channel::<()>();
    let pipeline = state.ingest.clone();
    let join = tokio::spawn(async move {
        run_ingest_job(
            pipeline, job_id, service, range, started_at, status_tx, stop_rx,
        )
        .await;
    });

    jobs.insert(
        job_id,
        IngestJob {
            stop_tx: Some(stop_tx),
            status: status_rx,
            join,
        },
    );
    info!(
        %job_id,
        actor_id,
        %service,
        start = range.start,
        end = range.end,
        "ingest job started"
    );

    Ok((
        StatusCode::ACCEPTED,
        Json(IngestJobResponse {
            job_id,
            status: initial,
        }),
    ))
}

async fn run_ingest_job(
    pipeline: IngestPipeline,
    job_id: Uuid,
    service: ServiceTag,
    range: IngestRange,
    started_at: DateTime<Utc>,
    status_tx: watch::Sender<JobStatus>,
    stop_rx: oneshot::Receiver<()>,
) {
    let summary = pipeline
        .run(
            service,
            range,
            |progress: &IngestProgress| {
                info!(
                    %job_id,
                    processed = progress.processed,
                    total = progress.total,
                    percent = progress.percent(),
                    succeeded = progress.succeeded,
                    failed = progress.failed,
                    "ingest progress"
                );
                status_tx.send_replace(JobStatus::running(service, range, started_at, *progress));
            },
            stop_rx,
        )
        .await;

    let finished_at = Utc::now();
    let status = if summary.cancelled {
        JobStatus::Cancelled {
            started_at,
            finished_at,
            summary,
        }
    } else {
        JobStatus::Finished {
            started_at,
            finished_at,
            summary,
        }
    };
    status_tx.send_replace(status);
}

async fn ingest_status_handler(
    State(state): State<AppState>,
    Path(job_id): Path<Uuid>,
    Query(query): Query<AdminQuery>,
) -> Result<Json<IngestJobResponse>, ApiError> {
    require_admin(&state, query.actor_id.as_deref())?;
    let jobs = state.ingest_jobs.lock().await;
    let job = jobs
        .get(&job_id)
        .ok_or_else(|| ApiError::not_found(format!("ingest job {job_id} not found")))?;

    Ok(Json(IngestJobResponse {
        job_id,
        status: job.status.borrow().clone(),
    }))
}

async fn cancel_ingest_handler(
    State(state): State<AppState>,
    Path(job_id): Path<Uuid>,
    Query(query): Query<AdminQuery>,
) -> Result<(StatusCode, Json<IngestJobResponse>), ApiError> {
    let actor_id = require_admin(&state, query.actor_id.as_deref())?;
    let mut jobs = state.ingest_jobs.lock().await;
    let job = jobs
        .get_mut(&job_id)
        .ok_or_else(|| ApiError::not_found(format!("ingest job {job_id} not found")))?;

    if let Some(stop_tx) = job.stop_tx.take() {
        let _ = stop_tx.send(());
        info!(%job_id, actor_id, "ingest job stop requested");
    }

    Ok((
        StatusCode::ACCEPTED,
        Json(IngestJobResponse {
            job_id,
            status: job.status.borrow().clone(),
        }),
    ))
}

/// Drop all but the `keep` most recently finished jobs. Running jobs stay.
fn retain_recent_jobs(jobs: &mut HashMap<Uuid, IngestJob>, keep: usize) {
    let mut finished: Vec<(DateTime<Utc>, Uuid)> = jobs
        .iter()
        .filter_map(|(job_id, job)| Some((job.status.borrow().finished_at()?, *job_id)))
        .collect();
    if finished.len() <= keep {
        return;
    }
    finished.sort_unstable_by(|a, b| b.cmp(a));
    for (_, job_id) in finished.split_off(keep) {
        jobs.remove(&job_id);
    }
}

async fn stop_ingest_jobs(state: &AppState) {
    let jobs: Vec<(Uuid, IngestJob)> = state.ingest_jobs.lock().await.drain().collect();
    for (job_id, mut job) in jobs {
        if let Some(stop_tx) = job.stop_tx.take() {
            let _ = stop_tx.send(());
        }
        if let Err(error) = job.join.await {
            warn!(%job_id, error = %error, "ingest job ended abnormally");
        }
    }
}

fn resolve_account(
    state: &AppState,
    query: &ProfileQuery,
) -> Result<(ServiceTag, ExternalId), ApiError> {
    let service = parse_service(query.service.as_deref())?;
    let input = query.input.as_deref().unwrap_or_default();
    let author = query.author_id.as_deref().map(str::trim).unwrap_or_default();
    if input.trim().is_empty() && author.is_empty() {
        return Err(ApiError::bad_request(
            "input is required when author_id is absent",
        ));
    }

    match resolve_target(&state.registry, &state.cache, input, author, service)? {
        Target::Account {
            external_id,
            service,
        } => Ok((service, external_id)),
        Target::Unlinked { chat_id } => Err(ApiError::not_found(format!(
            "{chat_id} has not linked a {service} account"
        ))),
        Target::UnknownName { name } => Err(ApiError::not_found(format!(
            "user \"{name}\" not found in cache; use the account id instead"
        ))),
    }
}

fn require_admin<'a>(state: &AppState, actor_id: Option<&'a str>) -> Result<&'a str, ApiError> {
    match actor_id.map(str::trim) {
        Some(actor_id) if state.config.admin_ids.contains(actor_id) => Ok(actor_id),
        _ => Err(ApiError::forbidden("admin only")),
    }
}

fn required<'a>(field: &str, value: &'a str) -> Result<&'a str, ApiError> {
    let value = value.trim();
    if value.is_empty() {
        return Err(ApiError::bad_request(format!("{field} is required")));
    }
    Ok(value)
}

fn parse_service(raw: Option<&str>) -> Result<ServiceTag, ApiError> {
    Ok(parse_optional_service(raw)?.unwrap_or_default())
}

fn parse_optional_service(raw: Option<&str>) -> Result<Option<ServiceTag>, ApiError> {
    match raw.map(str::trim).filter(|raw| !raw.is_empty()) {
        None => Ok(None),
        Some(raw) => ServiceTag::parse(raw)
            .map(Some)
            .ok_or_else(|| ApiError::bad_request(format!("unknown service {raw}"))),
    }
}

#[derive(Debug)]
struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    fn forbidden(message: impl Into<String>) -> Self {
        Self::new(StatusCode::FORBIDDEN, message)
    }

    fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, message)
    }

    fn conflict(message: impl Into<String>) -> Self {
        Self::new(StatusCode::CONFLICT, message)
    }

    fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, message)
    }

    fn bad_gateway(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_GATEWAY, message)
    }

    fn from_fetch(error: FetchError, service: ServiceTag, external_id: &str) -> Self {
        if error.is_definitive_missing() {
            Self::not_found(format!("{service} account {external_id} not found"))
        } else {
            Self::bad_gateway(format!(
                "failed to fetch {service} account {external_id}: {error}"
            ))
        }
    }
}

impl From<StoreError> for ApiError {
    fn from(error: StoreError) -> Self {
        Self::internal(format!("failed to save database: {error}"))
    }
}

impl From<IngestError> for ApiError {
    fn from(error: IngestError) -> Self {
        Self::bad_request(error.to_string())
    }
}

impl From<VerifyError> for ApiError {
    fn from(error: VerifyError) -> Self {
        let status = match &error {
            VerifyError::AlreadyLinked { .. } | VerifyError::LinkedElsewhere { .. } => {
                StatusCode::CONFLICT
            }
            VerifyError::Banned { .. } => StatusCode::FORBIDDEN,
            VerifyError::UnknownAccount { .. } | VerifyError::NoChallenge => StatusCode::NOT_FOUND,
            VerifyError::Expired { .. } => StatusCode::GONE,
            VerifyError::CodeNotFound => StatusCode::UNPROCESSABLE_ENTITY,
            VerifyError::Unavailable(_) => StatusCode::BAD_GATEWAY,
            VerifyError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self::new(status, error.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        warn!(status = %self.status, message = %self.message, "request failed");
        (
            self.status,
            Json(serde_json::json!({"error": self.message})),
        )
            .into_response()
    }
}
