use axum::{
    Json, Router,
    extract::{
        Path, Query, State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use berth_agent::OrchestratorError;
use berth_types::{ContainerInfo, ServerConfig, ServerId, ServerSummary, StatsSnapshot};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::Instrument;

use crate::{error_payload::ApiError, state::AppState};

const DEFAULT_LOG_LINES: usize = 100;

type ApiResult<T> = Result<T, ApiError>;

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/api/servers", get(list_servers).post(create_server))
        .route("/api/servers/:id", get(get_server).delete(delete_server))
        .route("/api/servers/:id/start", post(start_server))
        .route("/api/servers/:id/stop", post(stop_server))
        .route("/api/servers/:id/restart", post(restart_server))
        .route("/api/servers/:id/exec", post(exec_command))
        .route("/api/servers/:id/console", post(console_command))
        .route("/api/servers/:id/logs", get(get_logs).delete(clear_logs))
        .route("/api/servers/:id/stats", get(get_stats))
        .route("/api/servers/:id/ws", get(server_ws))
        .with_state(state)
}

fn parse_id(raw: &str) -> ApiResult<ServerId> {
    ServerId::parse(raw).map_err(|e| ApiError::bad_request("invalid_server_id", e.to_string()))
}

fn registered(state: &AppState, raw: &str) -> ApiResult<ServerId> {
    let id = parse_id(raw)?;
    if state.orchestrator.get(&id).is_none() {
        return Err(OrchestratorError::NotFound(id).into());
    }
    Ok(id)
}

#[derive(serde::Serialize)]
struct Healthz {
    status: &'static str,
    version: &'static str,
    servers: usize,
}

async fn healthz(State(state): State<AppState>) -> Json<Healthz> {
    Json(Healthz {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        servers: state.orchestrator.registry().len(),
    })
}

async fn list_servers(State(state): State<AppState>) -> Json<Vec<ServerSummary>> {
    Json(state.orchestrator.list())
}

#[derive(serde::Deserialize)]
struct CreateServerRequest {
    #[serde(default)]
    server_id: Option<String>,
    #[serde(flatten)]
    config: ServerConfig,
}

async fn create_server(
    State(state): State<AppState>,
    Json(req): Json<CreateServerRequest>,
) -> ApiResult<Response> {
    let id = match req.server_id.as_deref() {
        Some(raw) => parse_id(raw)?,
        None => ServerId::new(),
    };
    let record = state
        .orchestrator
        .create_record(id, req.config, state.create_policy)
        .await?;
    Ok((StatusCode::CREATED, Json(record)).into_response())
}

#[derive(serde::Serialize)]
struct ServerDetail {
    server: ServerSummary,
    container: ContainerInfo,
}

async fn get_server(
    State(state): State<AppState>,
    Path(raw): Path<String>,
) -> ApiResult<Json<ServerDetail>> {
    let id = parse_id(&raw)?;
    let container = state.orchestrator.status(&id).await?;
    let server = state
        .orchestrator
        .get(&id)
        .ok_or(OrchestratorError::NotFound(id))?;
    Ok(Json(ServerDetail { server, container }))
}

async fn delete_server(
    State(state): State<AppState>,
    Path(raw): Path<String>,
) -> ApiResult<StatusCode> {
    let id = parse_id(&raw)?;
    state.orchestrator.delete(&id).await?;
    state.hub.prune();
    Ok(StatusCode::NO_CONTENT)
}

fn summary_of(state: &AppState, id: ServerId) -> ApiResult<Json<ServerSummary>> {
    state
        .orchestrator
        .get(&id)
        .map(Json)
        .ok_or_else(|| OrchestratorError::NotFound(id).into())
}

async fn start_server(
    State(state): State<AppState>,
    Path(raw): Path<String>,
) -> ApiResult<Json<ServerSummary>> {
    let id = parse_id(&raw)?;
    state.orchestrator.start(&id).await?;
    summary_of(&state, id)
}

async fn stop_server(
    State(state): State<AppState>,
    Path(raw): Path<String>,
) -> ApiResult<Json<ServerSummary>> {
    let id = parse_id(&raw)?;
    state.orchestrator.stop(&id).await?;
    summary_of(&state, id)
}

async fn restart_server(
    State(state): State<AppState>,
    Path(raw): Path<String>,
) -> ApiResult<Json<ServerSummary>> {
    let id = parse_id(&raw)?;
    state.orchestrator.restart(&id).await?;
    summary_of(&state, id)
}

#[derive(serde::Deserialize)]
struct CommandRequest {
    command: String,
}

#[derive(serde::Serialize)]
struct CommandResponse {
    output: String,
}

fn command_of(req: &CommandRequest) -> ApiResult<&str> {
    let command = req.command.trim();
    if command.is_empty() {
        return Err(ApiError::bad_request(
            "invalid_command",
            "command must not be empty",
        ));
    }
    Ok(command)
}

async fn exec_command(
    State(state): State<AppState>,
    Path(raw): Path<String>,
    Json(req): Json<CommandRequest>,
) -> ApiResult<Json<CommandResponse>> {
    let id = parse_id(&raw)?;
    let output = state.orchestrator.exec(&id, command_of(&req)?).await?;
    Ok(Json(CommandResponse { output }))
}

async fn console_command(
    State(state): State<AppState>,
    Path(raw): Path<String>,
    Json(req): Json<CommandRequest>,
) -> ApiResult<Json<CommandResponse>> {
    let id = parse_id(&raw)?;
    let output = state.orchestrator.console(&id, command_of(&req)?).await?;
    Ok(Json(CommandResponse { output }))
}

#[derive(serde::Deserialize)]
struct LogsQuery {
    lines: Option<usize>,
}

#[derive(serde::Serialize)]
struct LogsResponse {
    lines: Vec<String>,
}

fn clamp_lines(requested: Option<usize>, capacity: usize) -> usize {
    requested.unwrap_or(DEFAULT_LOG_LINES).clamp(1, capacity.max(1))
}

async fn get_logs(
    State(state): State<AppState>,
    Path(raw): Path<String>,
    Query(q): Query<LogsQuery>,
) -> ApiResult<Json<LogsResponse>> {
    let id = registered(&state, &raw)?;
    let lines = clamp_lines(q.lines, state.orchestrator.config().log_capacity);
    Ok(Json(LogsResponse {
        lines: state.orchestrator.logs().get_logs(&id, lines),
    }))
}

async fn clear_logs(
    State(state): State<AppState>,
    Path(raw): Path<String>,
) -> ApiResult<StatusCode> {
    let id = registered(&state, &raw)?;
    state.orchestrator.logs().clear_logs(&id);
    Ok(StatusCode::NO_CONTENT)
}

async fn get_stats(
    State(state): State<AppState>,
    Path(raw): Path<String>,
) -> ApiResult<Json<StatsSnapshot>> {
    let id = registered(&state, &raw)?;
    state.orchestrator.sample(&id).await.map(Json).ok_or_else(|| {
        ApiError::new(
            StatusCode::BAD_GATEWAY,
            "stats_unavailable",
            "the container runtime returned no stats",
        )
    })
}

async fn server_ws(
    State(state): State<AppState>,
    Path(raw): Path<String>,
    ws: WebSocketUpgrade,
) -> ApiResult<Response> {
    let id = registered(&state, &raw)?;
    let rx = state.hub.subscribe(&id);
    Ok(ws
        .on_upgrade(move |socket| handle_server_socket(socket, id, rx))
        .into_response())
}

async fn handle_server_socket(socket: WebSocket, id: ServerId, mut rx: broadcast::Receiver<String>) {
    let span = tracing::info_span!("server_ws", server_id = %id);
    async move {
        let (mut sender, mut receiver) = socket.split();
        tracing::debug!("subscriber connected");

        let writer = tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(json) => {
                        if sender.send(Message::Text(json)).await.is_err() {
                            break;
                        }
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::debug!(skipped, "subscriber lagging; events dropped");
                    }
                    Err(RecvError::Closed) => {
                        let _ = sender.send(Message::Close(None)).await;
                        break;
                    }
                }
            }
        });

        // Inbound frames are ignored; the loop only watches for the peer going away.
        while let Some(msg) = receiver.next().await {
            match msg {
                Ok(Message::Close(_)) | Err(_) => break,
                Ok(_) => {}
            }
        }

        writer.abort();
        tracing::debug!("subscriber disconnected");
    }
    .instrument(span)
    .await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_lines_default_and_clamp() {
        assert_eq!(clamp_lines(None, 1000), 100);
        assert_eq!(clamp_lines(Some(0), 1000), 1);
        assert_eq!(clamp_lines(Some(5000), 1000), 1000);
    }

    #[test]
    fn create_request_flattens_config() {
        let req: CreateServerRequest = serde_json::from_str(
            r#"{"server_id":"alpha","name":"Alpha","port":8211,"max_players":16}"#,
        )
        .unwrap();
        assert_eq!(req.server_id.as_deref(), Some("alpha"));
        assert_eq!(req.config.max_players(), 16);
    }

    #[test]
    fn empty_command_is_rejected() {
        let req = CommandRequest {
            command: "   ".to_string(),
        };
        let err = command_of(&req).unwrap_err();
        assert_eq!(err.status, StatusCode::BAD_REQUEST);
    }

    #[test]
    fn invalid_ids_are_bad_requests() {
        let err = parse_id("../etc").unwrap_err();
        assert_eq!(err.payload.code, "invalid_server_id");
    }
}
