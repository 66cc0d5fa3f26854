//! HTTP and WebSocket transport using Axum.

use crate::connection::{Connection, Transport};
use crate::error::{Result, ServerError};
use crate::registry::ApplicationContext;
use crate::resources::{RequestMeta, Resources};
use crate::server::{ServerCore, ServerState};
use crate::state::SessionKey;
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    http::HeaderMap,
    response::Response,
    routing::get,
    Json, Router,
};
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

#[derive(Deserialize)]
struct SessionParams {
    #[serde(rename = "session-id")]
    session_id: Option<String>,
}

#[derive(Serialize)]
struct DocumentInfo {
    app_path: String,
    session_id: String,
    websocket_url: String,
    resources: Resources,
}

/// Outbound side of an upgraded socket. Frames are queued to a writer task.
struct WsTransport {
    tx: mpsc::UnboundedSender<Message>,
}

impl Transport for WsTransport {
    fn send_ping(&self) -> Result<()> {
        self.tx
            .send(Message::Ping(Vec::new()))
            .map_err(|e| ServerError::Transport(e.to_string()))
    }

    fn send_text(&self, payload: String) -> Result<()> {
        self.tx
            .send(Message::Text(payload))
            .map_err(|e| ServerError::Transport(e.to_string()))
    }
}

/// Build the router: per-application document and WebSocket routes plus
/// `/health`.
pub fn router(core: Arc<ServerCore>) -> Router {
    let mut app = Router::new().route("/health", get(health));

    for context in core.registry().contexts() {
        for route in context.routes() {
            let ctx = Arc::clone(context);
            if route == context.websocket_path() {
                app = app.route(
                    route,
                    get(
                        move |State(core): State<Arc<ServerCore>>,
                              headers: HeaderMap,
                              Query(params): Query<SessionParams>,
                              ws: WebSocketUpgrade| {
                            websocket(core, ctx, headers, params, ws)
                        },
                    ),
                );
                continue;
            }

            let handler = move |State(core): State<Arc<ServerCore>>,
                                headers: HeaderMap,
                                Query(params): Query<SessionParams>| {
                document(core, Arc::clone(&ctx), headers, params)
            };
            app = app.route(route, get(handler.clone()));
            // Serve "/app/" as "/app" too.
            if route.len() > 1 && route.ends_with('/') {
                app = app.route(route.trim_end_matches('/'), get(handler));
            }
        }
    }

    app.layer(TraceLayer::new_for_http()).with_state(core)
}

/// Bind on `port`, install signal handlers and serve until stopped.
pub async fn run_server(core: Arc<ServerCore>, port: u16) -> Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr).await?;
    core.install_signal_handlers()?;
    serve(core, listener).await
}

/// Start `core` and serve on `listener` until the core reaches `Stopped`.
pub async fn serve(core: Arc<ServerCore>, listener: TcpListener) -> Result<()> {
    info!("Starting HTTP server on {}", listener.local_addr()?);
    core.start();

    let app = router(Arc::clone(&core));
    axum::serve(listener, app)
        .with_graceful_shutdown(core.stopped())
        .await?;

    core.stop().await;
    Ok(())
}

async fn health() -> &'static str {
    "OK"
}

fn new_session_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

async fn document(
    core: Arc<ServerCore>,
    context: Arc<ApplicationContext>,
    headers: HeaderMap,
    params: SessionParams,
) -> Result<Json<DocumentInfo>> {
    let meta = RequestMeta::from_headers(&headers);
    let websocket_url = core.websocket_url_for_request(&meta, context.websocket_path())?;
    let resources = core.resources(&meta).await?;

    let session_id = params.session_id.unwrap_or_else(new_session_id);
    let session = core.get_session(context.path(), &session_id).await?;

    Ok(Json(DocumentInfo {
        app_path: context.path().to_string(),
        session_id: session.id.clone(),
        websocket_url,
        resources: resources.as_ref().clone(),
    }))
}

async fn websocket(
    core: Arc<ServerCore>,
    context: Arc<ApplicationContext>,
    headers: HeaderMap,
    params: SessionParams,
    ws: WebSocketUpgrade,
) -> Result<Response> {
    let meta = RequestMeta::from_headers(&headers);
    core.check_host(&meta)?;
    if core.state() != ServerState::Running {
        return Err(ServerError::NotAccepting);
    }

    let session_id = params.session_id.unwrap_or_else(new_session_id);
    // Create the session before upgrading so the client sees errors as HTTP
    // statuses rather than a dropped socket.
    core.get_session(context.path(), &session_id).await?;
    let key = SessionKey {
        app_path: context.path().to_string(),
        session_id,
    };

    Ok(ws.on_upgrade(move |socket| serve_socket(socket, core, context, key)))
}

async fn serve_socket(
    socket: WebSocket,
    core: Arc<ServerCore>,
    context: Arc<ApplicationContext>,
    key: SessionKey,
) {
    let (mut sink, mut stream) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();

    let writer = tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            let closing = matches!(message, Message::Close(_));
            if sink.send(message).await.is_err() || closing {
                break;
            }
        }
    });

    let transport: Arc<dyn Transport> = Arc::new(WsTransport { tx: tx.clone() });
    let connection = match attach(&core, &context, &key, transport).await {
        Ok(connection) => connection,
        Err(e) => {
            warn!(session_id = %key.session_id, "Rejecting connection: {}", e);
            let _ = tx.send(Message::Close(None));
            let _ = writer.await;
            return;
        }
    };

    let stopped = core.stopped();
    tokio::pin!(stopped);

    loop {
        tokio::select! {
            message = stream.next() => match message {
                Some(Ok(Message::Pong(_))) => {
                    context.sessions().touch(&key.session_id).await;
                }
                Some(Ok(Message::Text(text))) => {
                    debug!(connection = connection.id(), len = text.len(), "Received message");
                    context.sessions().touch(&key.session_id).await;
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Err(e)) => {
                    debug!(connection = connection.id(), "Socket error: {}", e);
                    break;
                }
                Some(Ok(_)) => {}
            },
            _ = &mut stopped => break,
        }
    }

    core.client_lost(&connection).await;
    let _ = tx.send(Message::Close(None));
    let _ = writer.await;
}

/// Attach a new connection to the session for `key` and send it the session
/// document. Retries once if cleanup discarded the session in between.
async fn attach(
    core: &ServerCore,
    context: &ApplicationContext,
    key: &SessionKey,
    transport: Arc<dyn Transport>,
) -> Result<Arc<Connection>> {
    let mut retried = false;
    loop {
        let session = context.get_session(&key.session_id).await;
        match core
            .new_connection(Arc::clone(&transport), context, &session)
            .await
        {
            Ok(connection) => {
                let document = session.document().await.to_string();
                if let Err(e) = connection.send_text(document) {
                    warn!(connection = connection.id(), "Failed to send document: {}", e);
                }
                return Ok(connection);
            }
            Err(ServerError::SessionExpired { .. }) if !retried => retried = true,
            Err(e) => return Err(e),
        }
    }
}
