// Copyright (C) 2026 ValheimDiscord
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

use std::{net::SocketAddr, sync::Arc, time::Duration};

use anyhow::Context;
use async_trait::async_trait;
use axum::{
    Json, Router,
    body::Bytes,
    extract::State,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use chrono::Utc;
use ed25519_dalek::{Signature, Verifier, VerifyingKey};
use lambda_http::run as lambda_run;
use serde::Deserialize;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{info, warn};
use valheim_common::{
    CALLBACK_TYPE_CHANNEL_MESSAGE_WITH_SOURCE, CALLBACK_TYPE_PONG, CommandData, CommandResult,
    FAILED_MESSAGE, INTERACTION_TYPE_APPLICATION_COMMAND, INTERACTION_TYPE_PING, Interaction,
    InstanceSnapshot, InstanceState, MESSAGE_FLAG_EPHEMERAL, PlayerStatus, SERVER_COMMAND,
    UNRECOGNIZED_MESSAGE, WEBHOOK_USERNAME, player_count_phrase, status_line, uptime_phrase,
};

const COMPUTE_API_BASE: &str = "https://compute.googleapis.com/compute/v1";
const METADATA_TOKEN_URL: &str =
    "http://metadata.google.internal/computeMetadata/v1/instance/service-accounts/default/token";

#[derive(Clone)]
struct AppState {
    config: Arc<AppConfig>,
    executor: Arc<CommandExecutor>,
    notifier: Arc<dyn BroadcastNotifier>,
}

#[derive(Debug, Clone)]
struct AppConfig {
    discord_public_key: String,
    webhook_url: String,
    gcp_project: String,
    gcp_zone: String,
    gcp_instance_name: String,
    status_server_port: u16,
}

impl AppConfig {
    fn from_env() -> anyhow::Result<Self> {
        Ok(Self {
            discord_public_key: require_env("DISCORD_PUBKEY")?,
            webhook_url: require_env("DISCORD_WEBHOOK_URL")?,
            gcp_project: require_env("GCP_PROJECT")?,
            gcp_zone: require_env("GCP_ZONE")?,
            gcp_instance_name: require_env("GCP_INSTANCE_NAME")?,
            status_server_port: std::env::var("STATUS_SERVER_PORT")
                .ok()
                .unwrap_or_else(|| "80".to_string())
                .parse()
                .context("invalid STATUS_SERVER_PORT")?,
        })
    }
}

fn require_env(var_name: &str) -> anyhow::Result<String> {
    std::env::var(var_name).with_context(|| format!("{var_name} must be set"))
}

/// Produces a short-lived handle on the compute API. Connecting and the
/// lifetime of the handle are scoped to a single command execution.
#[async_trait]
trait InstanceConnector: Send + Sync {
    async fn connect(&self) -> anyhow::Result<Box<dyn InstanceApi>>;
}

#[async_trait]
trait InstanceApi: Send + Sync {
    async fn get(&self) -> anyhow::Result<InstanceSnapshot>;
    async fn start(&self) -> anyhow::Result<()>;
    async fn stop(&self) -> anyhow::Result<()>;
}

#[async_trait]
trait GameStatusProber: Send + Sync {
    async fn probe(&self, external_ip: &str, port: u16) -> anyhow::Result<PlayerStatus>;
}

#[async_trait]
trait BroadcastNotifier: Send + Sync {
    async fn notify(&self, message: &str) -> anyhow::Result<()>;
}

#[derive(Clone)]
struct ComputeRestConnector {
    client: reqwest::Client,
    api_base: String,
    token_url: String,
    project: String,
    zone: String,
    instance_name: String,
}

impl ComputeRestConnector {
    fn new(config: &AppConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .context("failed to build compute HTTP client")?;
        Ok(Self {
            client,
            api_base: COMPUTE_API_BASE.to_string(),
            token_url: METADATA_TOKEN_URL.to_string(),
            project: config.gcp_project.clone(),
            zone: config.gcp_zone.clone(),
            instance_name: config.gcp_instance_name.clone(),
        })
    }
}

#[derive(Debug, Deserialize)]
struct AccessToken {
    access_token: String,
}

#[async_trait]
impl InstanceConnector for ComputeRestConnector {
    async fn connect(&self) -> anyhow::Result<Box<dyn InstanceApi>> {
        let response = self
            .client
            .get(&self.token_url)
            .header("Metadata-Flavor", "Google")
            .send()
            .await
            .context("failed to reach the metadata server")?;

        if !response.status().is_success() {
            anyhow::bail!("metadata server returned {}", response.status());
        }

        let token: AccessToken = response
            .json()
            .await
            .context("invalid metadata token response")?;

        Ok(Box::new(ComputeRestApi {
            client: self.client.clone(),
            access_token: token.access_token,
            instance_url: format!(
                "{}/projects/{}/zones/{}/instances/{}",
                self.api_base, self.project, self.zone, self.instance_name
            ),
        }))
    }
}

struct ComputeRestApi {
    client: reqwest::Client,
    access_token: String,
    instance_url: String,
}

impl ComputeRestApi {
    async fn post_operation(&self, operation: &str) -> anyhow::Result<()> {
        let url = format!("{}/{}", self.instance_url, operation);
        let response = self
            .client
            .post(url)
            .bearer_auth(&self.access_token)
            .send()
            .await
            .with_context(|| format!("failed to call instance {operation}"))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "<response body unavailable>".to_string());
            anyhow::bail!("compute API returned {status} for {operation}: {body}");
        }

        Ok(())
    }
}

#[async_trait]
impl InstanceApi for ComputeRestApi {
    async fn get(&self) -> anyhow::Result<InstanceSnapshot> {
        let response = self
            .client
            .get(&self.instance_url)
            .bearer_auth(&self.access_token)
            .send()
            .await
            .context("failed to fetch the instance")?;

        if !response.status().is_success() {
            anyhow::bail!("compute API returned {} for get", response.status());
        }

        response
            .json::<InstanceSnapshot>()
            .await
            .context("invalid instance resource")
    }

    async fn start(&self) -> anyhow::Result<()> {
        self.post_operation("start").await
    }

    async fn stop(&self) -> anyhow::Result<()> {
        self.post_operation("stop").await
    }
}

#[derive(Clone)]
struct HttpGameStatusProber {
    client: reqwest::Client,
}

impl HttpGameStatusProber {
    fn new() -> anyhow::Result<Self> {
        // A hung status server must not stall the interaction reply.
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(1))
            .build()
            .context("failed to build status probe client")?;
        Ok(Self { client })
    }
}

#[async_trait]
impl GameStatusProber for HttpGameStatusProber {
    async fn probe(&self, external_ip: &str, port: u16) -> anyhow::Result<PlayerStatus> {
        let url = format!("http://{external_ip}:{port}/status.json");
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .context("status endpoint unreachable")?;

        if !response.status().is_success() {
            anyhow::bail!("status endpoint returned {}", response.status());
        }

        response
            .json::<PlayerStatus>()
            .await
            .context("invalid status.json body")
    }
}

#[derive(Clone)]
struct WebhookNotifier {
    client: reqwest::Client,
    webhook_url: String,
}

impl WebhookNotifier {
    fn new(config: &AppConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            webhook_url: config.webhook_url.clone(),
        }
    }
}

fn webhook_payload(message: &str) -> serde_json::Value {
    serde_json::json!({"username": WEBHOOK_USERNAME, "content": message})
}

#[async_trait]
impl BroadcastNotifier for WebhookNotifier {
    async fn notify(&self, message: &str) -> anyhow::Result<()> {
        let response = self
            .client
            .post(&self.webhook_url)
            .json(&webhook_payload(message))
            .send()
            .await
            .context("failed to call the broadcast webhook")?;

        if !response.status().is_success() {
            anyhow::bail!("broadcast webhook returned {}", response.status());
        }

        Ok(())
    }
}

struct CommandExecutor {
    connector: Arc<dyn InstanceConnector>,
    prober: Arc<dyn GameStatusProber>,
    status_server_port: u16,
}

impl CommandExecutor {
    async fn execute(&self, command: &CommandData) -> CommandResult {
        if command.name != SERVER_COMMAND {
            return CommandResult::private(UNRECOGNIZED_MESSAGE);
        }

        let api = match self.connector.connect().await {
            Ok(api) => api,
            Err(error) => {
                warn!(%error, "failed to connect to the compute API");
                return CommandResult::private(FAILED_MESSAGE);
            }
        };

        let snapshot = match api.get().await {
            Ok(snapshot) => snapshot,
            Err(error) => {
                warn!(%error, "failed to fetch the instance");
                return CommandResult::private(FAILED_MESSAGE);
            }
        };
        let state = snapshot.state();

        match command.sub_option() {
            "status" => CommandResult::private(self.status_message(&snapshot, state).await),
            "start" => {
                if state != InstanceState::Terminated {
                    info!(?state, "refusing to start, instance is not terminated");
                    return CommandResult::private("The server is already started.");
                }
                match api.start().await {
                    Ok(()) => CommandResult::broadcast(
                        "The server has been started! It should be up soon!",
                    ),
                    Err(error) => {
                        warn!(%error, "failed to start the instance");
                        CommandResult::broadcast("Couldn't start the server :(")
                    }
                }
            }
            "stop" => {
                if state != InstanceState::Running {
                    info!(?state, "refusing to stop, instance is not running");
                    return CommandResult::private("The server is already shut down.");
                }

                // A failed probe does not block the stop; it is treated the
                // same as an empty server. See DESIGN.md.
                match self.probe_players(&snapshot).await {
                    Ok(status) if status.player_count > 0 => {
                        return CommandResult::private(format!(
                            "There are {} people online, refusing to shut down.",
                            status.player_count
                        ));
                    }
                    Ok(_) => {}
                    Err(error) => {
                        warn!(%error, "player count probe failed, proceeding with stop");
                    }
                }

                match api.stop().await {
                    Ok(()) => CommandResult::broadcast("The server is shutting down."),
                    Err(error) => {
                        warn!(%error, "failed to stop the instance");
                        CommandResult::broadcast("Couldn't stop the server :(")
                    }
                }
            }
            _ => CommandResult::private(UNRECOGNIZED_MESSAGE),
        }
    }

    /// Status line for the current state, enriched with uptime and player
    /// count when the instance is running. Enrichment failures degrade to
    /// the bare status line.
    async fn status_message(&self, snapshot: &InstanceSnapshot, state: InstanceState) -> String {
        let mut message = status_line(state).to_string();
        if state != InstanceState::Running {
            return message;
        }

        if let Some(last_start) = snapshot.last_start_timestamp.as_deref() {
            match uptime_phrase(last_start, Utc::now()) {
                Ok(phrase) => message = format!("{message} {phrase}"),
                Err(error) => warn!(%error, "couldn't parse the instance start timestamp"),
            }
        }

        match self.probe_players(snapshot).await {
            Ok(status) => {
                message = format!("{message} {}", player_count_phrase(status.player_count));
            }
            Err(error) => warn!(%error, "couldn't get the player count"),
        }

        message
    }

    async fn probe_players(&self, snapshot: &InstanceSnapshot) -> anyhow::Result<PlayerStatus> {
        let external_ip = snapshot
            .external_ip()
            .ok_or_else(|| anyhow::anyhow!("instance has no external ip"))?;
        self.prober
            .probe(external_ip, self.status_server_port)
            .await
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            std::env::var("RUST_LOG")
                .unwrap_or_else(|_| "discord_service=debug,tower_http=info".to_string()),
        )
        .init();

    let config = Arc::new(AppConfig::from_env()?);
    let state = AppState {
        executor: Arc::new(CommandExecutor {
            connector: Arc::new(ComputeRestConnector::new(&config)?),
            prober: Arc::new(HttpGameStatusProber::new()?),
            status_server_port: config.status_server_port,
        }),
        notifier: Arc::new(WebhookNotifier::new(&config)),
        config,
    };

    let app = build_router(state);

    if std::env::var("AWS_LAMBDA_RUNTIME_API").is_ok() {
        info!("AWS Lambda runtime detected; running discord-service in lambda mode");
        lambda_run(app)
            .await
            .map_err(|e| anyhow::Error::msg(format!("lambda runtime error: {e}")))?;
        return Ok(());
    }

    let bind_addr = parse_bind_addr("DISCORD_SERVICE_BIND", "0.0.0.0:8080")?;
    info!(%bind_addr, "discord-service listening");
    let listener = tokio::net::TcpListener::bind(bind_addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/interactions", post(interactions_handler))
        .with_state(state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

fn parse_bind_addr(var_name: &str, default: &str) -> anyhow::Result<SocketAddr> {
    let value = std::env::var(var_name)
        .ok()
        .unwrap_or_else(|| default.to_string());
    value.parse().context(format!("invalid {var_name}"))
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({"ok": true, "service": "discord-service"}))
}

async fn interactions_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<serde_json::Value>, ApiError> {
    let public_key = decode_public_key(&state.config.discord_public_key).map_err(|error| {
        warn!(%error, "invalid DISCORD_PUBKEY configuration");
        ApiError::unauthorized("invalid discord public key")
    })?;

    if !verify_signature(&public_key, &headers, &body) {
        return Err(ApiError::unauthorized("signature mismatch"));
    }

    let interaction: Interaction = serde_json::from_slice(&body).map_err(|error| {
        warn!(%error, "could not decode interaction payload");
        ApiError::bad_request("could not read interaction")
    })?;

    match interaction.kind {
        INTERACTION_TYPE_PING => Ok(Json(serde_json::json!({"type": CALLBACK_TYPE_PONG}))),
        INTERACTION_TYPE_APPLICATION_COMMAND => {
            let Some(command) = interaction.data else {
                warn!("application command carried no command data");
                return Err(ApiError::bad_request("could not read interaction"));
            };

            let result = state.executor.execute(&command).await;
            dispatch_broadcast(&state, &result);
            Ok(Json(callback_payload(&result.message)))
        }
        kind => {
            warn!(kind, "unknown interaction type");
            Err(ApiError::bad_request("unknown interaction type"))
        }
    }
}

fn callback_payload(message: &str) -> serde_json::Value {
    serde_json::json!({
        "type": CALLBACK_TYPE_CHANNEL_MESSAGE_WITH_SOURCE,
        "data": {"content": message, "flags": MESSAGE_FLAG_EPHEMERAL}
    })
}

/// Fire-and-forget webhook delivery. The synchronous reply has already been
/// decided; delivery failure is only logged.
fn dispatch_broadcast(state: &AppState, result: &CommandResult) {
    if !result.broadcast {
        return;
    }

    let notifier = state.notifier.clone();
    let message = result.message.clone();
    tokio::spawn(async move {
        if let Err(error) = notifier.notify(&message).await {
            warn!(%error, "failed to deliver the broadcast webhook");
        }
    });
}

fn decode_public_key(public_key_hex: &str) -> anyhow::Result<VerifyingKey> {
    let bytes = hex::decode(public_key_hex).context("public key is not valid hex")?;
    let bytes: [u8; 32] = bytes
        .try_into()
        .map_err(|_| anyhow::anyhow!("public key must be 32 bytes"))?;
    VerifyingKey::from_bytes(&bytes).context("public key is not a valid ed25519 key")
}

/// Discord signs `timestamp || body` with the application's ed25519 key.
/// Missing or malformed headers count as a mismatch.
fn verify_signature(public_key: &VerifyingKey, headers: &HeaderMap, body: &[u8]) -> bool {
    let Some(signature_hex) = header_str(headers, "x-signature-ed25519") else {
        return false;
    };
    let Some(timestamp) = header_str(headers, "x-signature-timestamp") else {
        return false;
    };
    let Ok(signature_bytes) = hex::decode(signature_hex) else {
        return false;
    };
    let Ok(signature) = Signature::from_slice(&signature_bytes) else {
        return false;
    };

    let mut signed = Vec::with_capacity(timestamp.len() + body.len());
    signed.extend_from_slice(timestamp.as_bytes());
    signed.extend_from_slice(body);
    public_key.verify(&signed, &signature).is_ok()
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|value| value.to_str().ok())
}

#[derive(Debug)]
struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn unauthorized(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::UNAUTHORIZED,
            message: message.into(),
        }
    }

    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
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
