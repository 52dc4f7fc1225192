//! TextSync Server - real-time collaborative plain-text editing
//!
//! Clients create a document over HTTP, then join its room over a WebSocket.
//! Edits travel as text patches: each accepted patch is applied to the
//! server's authoritative copy and relayed to every other room member.
//!
//! - Axum for HTTP and WebSocket
//! - Sled embedded database for document persistence
//! - Binary (bincode) or JSON message frames

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, State,
    },
    http::{Method, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Form, Json, Router,
};
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, warn};

mod config;
mod room;
mod storage;
mod sync;

use config::AppConfig;
use storage::{DocumentMetadata, DocumentStore};
use sync::{
    protocol::{ServerMessage, SyncProtocol, PROTOCOL_VERSION},
    ConnectionGateway, ServerStats, SyncError,
};

// ============================================================================
// APPLICATION STATE
// ============================================================================

/// Shared application state
pub struct AppState {
    gateway: Arc<ConnectionGateway>,
}

// ============================================================================
// API TYPES
// ============================================================================

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: String,
    version: String,
    protocol_version: u8,
    uptime_seconds: u64,
    connected_clients: usize,
    stats: ServerStats,
}

#[derive(Debug, Deserialize)]
struct CreateDocumentRequest {
    content: Option<String>,
}

/// The plain upload form
#[derive(Debug, Deserialize)]
struct UploadForm {
    file_contents: Option<String>,
}

#[derive(Debug, Serialize)]
struct CreateDocumentResponse {
    document_id: String,
    version: u64,
    ws_url: String,
}

#[derive(Debug, Serialize)]
struct DocumentListResponse {
    documents: Vec<DocumentMetadata>,
    total: usize,
}

#[derive(Debug, Serialize)]
struct DocumentDetailResponse {
    document_id: String,
    content: String,
    version: u64,
    member_count: usize,
}

#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: String,
}

type ApiError = (StatusCode, Json<ErrorResponse>);

fn api_error(err: SyncError) -> ApiError {
    let status = match &err {
        SyncError::NotFound(_) => StatusCode::NOT_FOUND,
        SyncError::AlreadyExists(_) | SyncError::PatchConflict { .. } => StatusCode::CONFLICT,
        SyncError::InvalidInput(_) => StatusCode::BAD_REQUEST,
        SyncError::Storage(_) | SyncError::Connection(_) => {
            error!("Request failed: {}", err);
            StatusCode::INTERNAL_SERVER_ERROR
        }
    };
    (
        status,
        Json(ErrorResponse {
            error: err.to_string(),
        }),
    )
}

// ============================================================================
// HTTP HANDLERS
// ============================================================================

/// Health check endpoint
async fn health_check(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let stats = state.gateway.coordinator().stats();

    Json(HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        protocol_version: PROTOCOL_VERSION,
        uptime_seconds: stats.uptime_seconds,
        connected_clients: state.gateway.connected_clients(),
        stats,
    })
}

fn create_with_content(
    state: &AppState,
    content: Option<String>,
) -> Result<(StatusCode, Json<CreateDocumentResponse>), ApiError> {
    let content = content
        .ok_or_else(|| api_error(SyncError::InvalidInput("missing document content".into())))?;

    let created = state
        .gateway
        .coordinator()
        .create_document(&content)
        .map_err(api_error)?;

    info!("Created document {}", created.document_id);
    Ok((
        StatusCode::CREATED,
        Json(CreateDocumentResponse {
            ws_url: "/ws".to_string(),
            document_id: created.document_id,
            version: created.version,
        }),
    ))
}

/// Create a document from a JSON body
async fn create_document(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<CreateDocumentRequest>,
) -> Result<(StatusCode, Json<CreateDocumentResponse>), ApiError> {
    create_with_content(&state, payload.content)
}

/// Create a document from the upload form
async fn create_from_form(
    State(state): State<Arc<AppState>>,
    Form(form): Form<UploadForm>,
) -> Result<(StatusCode, Json<CreateDocumentResponse>), ApiError> {
    create_with_content(&state, form.file_contents)
}

/// List all documents
async fn list_documents(
    State(state): State<Arc<AppState>>,
) -> Result<Json<DocumentListResponse>, ApiError> {
    let documents = state
        .gateway
        .coordinator()
        .store()
        .list()
        .map_err(|e| api_error(e.into()))?;

    let total = documents.len();
    Ok(Json(DocumentListResponse { documents, total }))
}

/// Get one document's current content
async fn get_document(
    State(state): State<Arc<AppState>>,
    Path(document_id): Path<String>,
) -> Result<Json<DocumentDetailResponse>, ApiError> {
    let coordinator = state.gateway.coordinator();
    let snapshot = coordinator.snapshot(&document_id).map_err(api_error)?;

    Ok(Json(DocumentDetailResponse {
        member_count: coordinator.registry().member_count(&document_id),
        document_id: snapshot.document_id,
        content: snapshot.content,
        version: snapshot.version,
    }))
}

// ============================================================================
// WEBSOCKET HANDLER
// ============================================================================

/// WebSocket upgrade handler
async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_websocket(socket, state))
}

/// Handle WebSocket connection
async fn handle_websocket(socket: WebSocket, state: Arc<AppState>) {
    let (mut ws_sender, mut ws_receiver) = socket.split();

    // Create channel for sending messages to this client
    let (tx, mut rx) = mpsc::unbounded_channel::<ServerMessage>();
    let client_id = state.gateway.connect(tx);
    info!("New WebSocket connection: client={}", client_id);

    // Answer in JSON once the client speaks JSON
    let text_mode = Arc::new(AtomicBool::new(false));

    let client_id_send = client_id.clone();
    let text_mode_send = text_mode.clone();

    // Task to forward messages from channel to WebSocket
    let mut send_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            let frame = if text_mode_send.load(Ordering::Relaxed) {
                SyncProtocol::encode_server_json(&msg).map(Message::Text)
            } else {
                SyncProtocol::encode_server(&msg).map(|bytes| Message::Binary(bytes.to_vec()))
            };
            match frame {
                Ok(frame) => {
                    if ws_sender.send(frame).await.is_err() {
                        break;
                    }
                }
                Err(e) => {
                    warn!("Failed to encode message: {}", e);
                }
            }
        }
        debug!("Send task ended for client {}", client_id_send);
    });

    let client_id_recv = client_id.clone();
    let state_recv = state.clone();

    // Task to handle incoming WebSocket messages
    let mut recv_task = tokio::spawn(async move {
        let gateway = &state_recv.gateway;
        while let Some(Ok(msg)) = ws_receiver.next().await {
            let decoded = match msg {
                Message::Binary(data) => SyncProtocol::decode_client(&data),
                Message::Text(text) => {
                    text_mode.store(true, Ordering::Relaxed);
                    SyncProtocol::decode_client_json(&text)
                }
                Message::Close(_) => {
                    info!("WebSocket closed by client: {}", client_id_recv);
                    break;
                }
                // Pong is handled automatically
                _ => continue,
            };

            match decoded {
                Ok(client_msg) => gateway.handle(&client_id_recv, client_msg).await,
                Err(e) => gateway.reject_frame(&client_id_recv, e.to_string()),
            }
        }
        debug!("Receive task ended for client {}", client_id_recv);
    });

    // Wait for either task to complete, then stop the other
    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }

    // Cleanup
    state.gateway.disconnect(&client_id);
}

// ============================================================================
// MAIN ENTRY POINT
// ============================================================================

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "textsync_server=info,tower_http=info".into()),
        )
        .init();

    let config = AppConfig::from_env()?;

    let store = Arc::new(DocumentStore::open(&config.storage)?);
    info!("Storage initialized successfully");

    let gateway = Arc::new(ConnectionGateway::new(store, config.sync.clone()));
    let background_handles = gateway.clone().start_background_tasks();

    let state = Arc::new(AppState {
        gateway: gateway.clone(),
    });

    // Set up CORS
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers(Any);

    // Build router
    let app = Router::new()
        // Health check
        .route("/health", get(health_check))
        // Document management
        .route("/api/documents", get(list_documents).post(create_document))
        .route("/api/documents/:document_id", get(get_document))
        .route("/create", post(create_from_form))
        // WebSocket endpoint
        .route("/ws", get(ws_handler))
        // Add state and middleware
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(cors);

    info!("TextSync server v{} starting", env!("CARGO_PKG_VERSION"));
    info!("   Protocol version: {}", PROTOCOL_VERSION);
    info!("   Listening on: http://{}", config.bind_addr);
    info!("   WebSocket: ws://{}/ws", config.bind_addr);

    let listener = tokio::net::TcpListener::bind(config.bind_addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // Final save happens in the save task
    gateway.coordinator().shutdown();
    background_handles.wait(Duration::from_secs(10)).await;
    info!("Server stopped");

    Ok(())
}
