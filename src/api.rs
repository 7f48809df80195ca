use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use axum::extract::ws::{Message as Frame, WebSocket, WebSocketUpgrade};
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post, put},
    Json, Router,
};
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use time::UtcOffset;
use utoipa::{OpenApi, ToSchema};
use utoipa_swagger_ui::SwaggerUi;
use uuid::Uuid;

use crate::channels::dm_channel_id;
use crate::config::Config;
use crate::gateway::{ChannelFeed, ChannelGateway};
use crate::group::{group_messages, DaySection, MessageGroup};
use crate::model::{Draft, Message, Reaction, ServerTimestamp, Timestamp};
use crate::store::MemoryStore;

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<MemoryStore>,
    pub gateway: Arc<ChannelGateway>,
    pub config: Config,
}

impl AppState {
    pub fn new(config: Config) -> Self {
        let store = Arc::new(MemoryStore::new());
        let gateway = Arc::new(ChannelGateway::new(store.clone(), config.account_id.clone()));
        Self {
            store,
            gateway,
            config,
        }
    }
}

/// Build the HTTP application router.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/api/health", get(health))
        .route(
            "/api/channels/:channel_id/messages",
            get(list_messages).post(send_message),
        )
        .route(
            "/api/channels/:channel_id/messages/:message_id",
            put(edit_message).delete(delete_message),
        )
        .route(
            "/api/channels/:channel_id/messages/:message_id/reactions",
            post(toggle_reaction),
        )
        .route("/api/dm", get(resolve_dm))
        .route("/ws", get(ws_handler))
        .merge(SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", ApiDoc::openapi()))
        .with_state(state)
}

#[derive(OpenApi)]
#[openapi(
    paths(
        health,
        list_messages,
        send_message,
        edit_message,
        delete_message,
        toggle_reaction,
        resolve_dm
    ),
    components(schemas(
        Message,
        Reaction,
        Timestamp,
        ServerTimestamp,
        Draft,
        EditReq,
        ReactReq,
        ReactResp,
        DmResp,
        ChannelView,
        DaySection,
        MessageGroup,
        ErrorResp
    ))
)]
struct ApiDoc;

#[derive(Serialize, ToSchema)]
struct ErrorResp {
    error: String,
}

fn err(status: StatusCode, msg: &str) -> (StatusCode, Json<ErrorResp>) {
    (status, Json(ErrorResp { error: msg.into() }))
}

fn gateway_err(e: anyhow::Error) -> (StatusCode, Json<ErrorResp>) {
    match e.to_string().as_str() {
        "empty_message" => err(StatusCode::BAD_REQUEST, "empty_message"),
        "not_found" => err(StatusCode::NOT_FOUND, "not_found"),
        _ => {
            tracing::error!(error = %e, "store operation failed");
            err(StatusCode::INTERNAL_SERVER_ERROR, "store_failure")
        }
    }
}

fn viewer_offset(tz_offset_minutes: Option<i32>) -> UtcOffset {
    tz_offset_minutes
        .and_then(|m| UtcOffset::from_whole_seconds(m * 60).ok())
        .unwrap_or(UtcOffset::UTC)
}

#[utoipa::path(get, path = "/api/health", responses((status = 200, description = "Liveness")))]
async fn health() -> &'static str {
    "ok"
}

/// Grouped view of one channel, date sections oldest first.
#[derive(Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
struct ChannelView {
    channel_id: String,
    days: Vec<DaySection>,
}

#[derive(Deserialize)]
struct ViewQuery {
    /// Viewer's UTC offset in minutes, for date bucketing.
    tz_offset: Option<i32>,
}

#[utoipa::path(
    get,
    path = "/api/channels/{channel_id}/messages",
    params(
        ("channel_id" = String, Path, description = "Channel identifier"),
        ("tz_offset" = Option<i32>, Query, description = "Viewer UTC offset in minutes")
    ),
    responses((status = 200, description = "Grouped channel view", body = ChannelView))
)]
async fn list_messages(
    State(state): State<AppState>,
    Path(channel_id): Path<String>,
    Query(query): Query<ViewQuery>,
) -> Result<impl IntoResponse, (StatusCode, Json<ErrorResp>)> {
    let messages = state
        .gateway
        .messages(&channel_id)
        .await
        .map_err(gateway_err)?;
    let days = group_messages(&messages, viewer_offset(query.tz_offset));
    Ok(Json(ChannelView { channel_id, days }))
}

#[utoipa::path(
    post,
    path = "/api/channels/{channel_id}/messages",
    params(("channel_id" = String, Path, description = "Channel identifier")),
    request_body = Draft,
    responses(
        (status = 201, description = "Stored message", body = Message),
        (status = 400, description = "Empty content", body = ErrorResp)
    )
)]
async fn send_message(
    State(state): State<AppState>,
    Path(channel_id): Path<String>,
    Json(draft): Json<Draft>,
) -> Result<impl IntoResponse, (StatusCode, Json<ErrorResp>)> {
    let message = state
        .gateway
        .send(&channel_id, draft)
        .await
        .map_err(gateway_err)?;
    Ok((StatusCode::CREATED, Json(message)))
}

#[derive(Deserialize, ToSchema)]
struct EditReq {
    content: String,
}

#[utoipa::path(
    put,
    path = "/api/channels/{channel_id}/messages/{message_id}",
    params(
        ("channel_id" = String, Path, description = "Channel identifier"),
        ("message_id" = String, Path, description = "Message identifier")
    ),
    request_body = EditReq,
    responses(
        (status = 200, description = "Edited message", body = Message),
        (status = 404, description = "Unknown message", body = ErrorResp)
    )
)]
async fn edit_message(
    State(state): State<AppState>,
    Path((channel_id, message_id)): Path<(String, String)>,
    Json(req): Json<EditReq>,
) -> Result<impl IntoResponse, (StatusCode, Json<ErrorResp>)> {
    let message = state
        .gateway
        .edit(&channel_id, &message_id, &req.content)
        .await
        .map_err(gateway_err)?;
    Ok(Json(message))
}

#[utoipa::path(
    delete,
    path = "/api/channels/{channel_id}/messages/{message_id}",
    params(
        ("channel_id" = String, Path, description = "Channel identifier"),
        ("message_id" = String, Path, description = "Message identifier")
    ),
    responses((status = 204, description = "Message tombstoned"))
)]
async fn delete_message(
    State(state): State<AppState>,
    Path((channel_id, message_id)): Path<(String, String)>,
) -> Result<impl IntoResponse, (StatusCode, Json<ErrorResp>)> {
    state
        .gateway
        .delete(&channel_id, &message_id)
        .await
        .map_err(gateway_err)?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
struct ReactReq {
    emoji: String,
    user_id: String,
}

#[derive(Serialize, ToSchema)]
struct ReactResp {
    added: bool,
}

#[utoipa::path(
    post,
    path = "/api/channels/{channel_id}/messages/{message_id}/reactions",
    params(
        ("channel_id" = String, Path, description = "Channel identifier"),
        ("message_id" = String, Path, description = "Message identifier")
    ),
    request_body = ReactReq,
    responses(
        (status = 200, description = "Reaction toggled", body = ReactResp),
        (status = 404, description = "Unknown message", body = ErrorResp)
    )
)]
async fn toggle_reaction(
    State(state): State<AppState>,
    Path((channel_id, message_id)): Path<(String, String)>,
    Json(req): Json<ReactReq>,
) -> Result<impl IntoResponse, (StatusCode, Json<ErrorResp>)> {
    let added = state
        .gateway
        .toggle_reaction(&channel_id, &message_id, &req.emoji, &req.user_id)
        .await
        .map_err(gateway_err)?;
    Ok(Json(ReactResp { added }))
}

#[derive(Deserialize)]
struct DmQuery {
    user_a: String,
    user_b: String,
}

#[derive(Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
struct DmResp {
    channel_id: String,
}

#[utoipa::path(
    get,
    path = "/api/dm",
    params(
        ("user_a" = String, Query, description = "One participant"),
        ("user_b" = String, Query, description = "The other participant")
    ),
    responses((status = 200, description = "Canonical DM channel id", body = DmResp))
)]
async fn resolve_dm(Query(query): Query<DmQuery>) -> Json<DmResp> {
    Json(DmResp {
        channel_id: dm_channel_id(&query.user_a, &query.user_b),
    })
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

#[derive(Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
enum ClientFrame {
    Join {
        channel_id: String,
        #[serde(default)]
        tz_offset: Option<i32>,
    },
    Leave,
}

struct FeedSession {
    channel_id: String,
    offset: UtcOffset,
    feed: ChannelFeed,
}

async fn poll_feed(session: &mut Option<FeedSession>) -> Option<Vec<Message>> {
    match session {
        Some(s) => s.feed.next().await,
        None => std::future::pending().await,
    }
}

async fn handle_socket(stream: WebSocket, state: AppState) {
    let conn = Uuid::new_v4();
    tracing::debug!(%conn, "websocket connected");
    let (mut sender, mut receiver) = stream.split();
    if sender.send(Frame::Text("hello".into())).await.is_err() {
        return;
    }
    let mut session: Option<FeedSession> = None;
    loop {
        tokio::select! {
            view = poll_feed(&mut session) => {
                match (view, session.as_ref()) {
                    (Some(messages), Some(s)) => {
                        let days = group_messages(&messages, s.offset);
                        let frame = serde_json::json!({
                            "t": "snapshot",
                            "channelId": s.channel_id,
                            "days": days,
                        });
                        if sender.send(Frame::Text(frame.to_string())).await.is_err() {
                            break;
                        }
                    }
                    _ => {
                        session = None;
                    }
                }
            }
            incoming = receiver.next() => {
                match incoming {
                    Some(Ok(Frame::Text(text))) => {
                        match serde_json::from_str::<ClientFrame>(&text) {
                            Ok(ClientFrame::Join { channel_id, tz_offset }) => {
                                // detach before attach: a superseded feed must
                                // never deliver into the new channel's view
                                if let Some(mut old) = session.take() {
                                    old.feed.close();
                                }
                                match state.gateway.subscribe(&channel_id).await {
                                    Ok(feed) => {
                                        tracing::debug!(%conn, channel = %channel_id, "joined channel");
                                        session = Some(FeedSession {
                                            channel_id,
                                            offset: viewer_offset(tz_offset),
                                            feed,
                                        });
                                    }
                                    Err(e) => {
                                        let frame = serde_json::json!({"t": "error", "error": e.to_string()});
                                        if sender.send(Frame::Text(frame.to_string())).await.is_err() {
                                            break;
                                        }
                                    }
                                }
                            }
                            Ok(ClientFrame::Leave) => {
                                if let Some(mut old) = session.take() {
                                    old.feed.close();
                                }
                            }
                            Err(_) => {
                                let frame = serde_json::json!({"t": "error", "error": "bad_frame"});
                                if sender.send(Frame::Text(frame.to_string())).await.is_err() {
                                    break;
                                }
                            }
                        }
                    }
                    Some(Ok(Frame::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(_)) => break,
                }
            }
        }
    }
    if let Some(mut s) = session.take() {
        s.feed.close();
    }
    tracing::debug!(%conn, "websocket disconnected");
}

/// Run the HTTP server bound to the configured address.
pub async fn serve(config: Config) -> Result<()> {
    let addr: SocketAddr = config.bind.parse()?;
    let state = AppState::new(config);
    tracing::info!(%addr, account = %state.config.account_id, "team_chat listening");
    axum::Server::bind(&addr)
        .serve(build_router(state).into_make_service())
        .await?;
    Ok(())
}
