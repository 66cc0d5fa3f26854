//! End-to-end tests running the real HTTP/WebSocket server on a local port.

use docserve::{http_server, Application, ServerConfig, ServerCore, ServerState, StaticApplication};
use futures_util::{SinkExt, StreamExt};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;

struct TestServer {
    core: Arc<ServerCore>,
    addr: SocketAddr,
    handle: JoinHandle<docserve::Result<()>>,
}

async fn spawn_server(keep_alive_ms: i64) -> TestServer {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let config = ServerConfig {
        hosts: vec![addr.to_string()],
        keep_alive_ms,
        ..ServerConfig::default()
    };
    let app: Arc<dyn Application> = Arc::new(StaticApplication::new("Test"));
    let core = ServerCore::new(config, vec![("/app".to_string(), app)]).unwrap();
    let handle = tokio::spawn(http_server::serve(Arc::clone(&core), listener));

    let running = Arc::clone(&core);
    eventually(move || {
        let core = Arc::clone(&running);
        async move { core.state() == ServerState::Running }
    })
    .await;

    TestServer { core, addr, handle }
}

async fn eventually<F, Fut>(mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..300 {
        if check().await {
            return;
        }
        sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not met in time");
}

async fn connection_count_is(core: &Arc<ServerCore>, expected: usize) {
    let core = Arc::clone(core);
    eventually(move || {
        let core = Arc::clone(&core);
        async move { core.connections().len().await == expected }
    })
    .await;
}

#[tokio::test]
async fn health_endpoint_responds() {
    let server = spawn_server(0).await;
    let body = reqwest::get(format!("http://{}/health", server.addr))
        .await
        .unwrap()
        .text()
        .await
        .unwrap();
    assert_eq!(body, "OK");
    server.core.stop().await;
}

#[tokio::test]
async fn connect_then_disconnect_tracks_connection_and_session() {
    let server = spawn_server(0).await;
    let url = format!("ws://{}/app/ws?session-id=abc", server.addr);

    let (mut ws, _) = tokio_tungstenite::connect_async(url).await.unwrap();

    match timeout(Duration::from_secs(2), ws.next()).await {
        Ok(Some(Ok(Message::Text(doc)))) => {
            let doc: serde_json::Value = serde_json::from_str(&doc).unwrap();
            assert_eq!(doc["session_id"], "abc");
            assert_eq!(doc["title"], "Test");
        }
        other => panic!("expected document frame, got {:?}", other),
    }

    connection_count_is(&server.core, 1).await;
    let session = server.core.get_session("/app", "abc").await.unwrap();
    assert_eq!(session.connection_count(), 1);

    ws.close(None).await.unwrap();
    connection_count_is(&server.core, 0).await;
    assert_eq!(session.connection_count(), 0);

    server.core.stop().await;
}

#[tokio::test]
async fn reconnecting_with_same_id_reuses_session() {
    let server = spawn_server(0).await;
    let url = format!("ws://{}/app/ws?session-id=again", server.addr);

    let (mut first, _) = tokio_tungstenite::connect_async(url.as_str()).await.unwrap();
    connection_count_is(&server.core, 1).await;
    let before = server.core.get_session("/app", "again").await.unwrap();
    first.close(None).await.unwrap();
    connection_count_is(&server.core, 0).await;

    let (_second, _) = tokio_tungstenite::connect_async(url.as_str()).await.unwrap();
    connection_count_is(&server.core, 1).await;
    let after = server.core.get_session("/app", "again").await.unwrap();
    assert!(Arc::ptr_eq(&before, &after));

    server.core.stop().await;
}

#[tokio::test]
async fn keep_alive_pings_reach_the_client() {
    let server = spawn_server(100).await;
    let url = format!("ws://{}/app/ws", server.addr);
    let (mut ws, _) = tokio_tungstenite::connect_async(url).await.unwrap();

    let got_ping = timeout(Duration::from_secs(3), async {
        while let Some(Ok(message)) = ws.next().await {
            if let Message::Ping(_) = message {
                return true;
            }
        }
        false
    })
    .await
    .unwrap_or(false);
    assert!(got_ping);

    server.core.stop().await;
}

#[tokio::test]
async fn forbidden_host_creates_nothing() {
    let server = spawn_server(0).await;

    let response = reqwest::Client::new()
        .get(format!("http://{}/app?session-id=x", server.addr))
        .header("Host", "evil.example")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::FORBIDDEN);

    let mut request = format!("ws://{}/app/ws?session-id=x", server.addr)
        .into_client_request()
        .unwrap();
    request
        .headers_mut()
        .insert("Host", HeaderValue::from_static("evil.example"));
    assert!(tokio_tungstenite::connect_async(request).await.is_err());

    let context = server.core.application("/app").unwrap();
    assert!(context.sessions().is_empty().await);
    assert!(server.core.connections().is_empty().await);
    assert!(server.core.resource_cache().is_empty().await);

    server.core.stop().await;
}

#[tokio::test]
async fn document_endpoint_describes_session() {
    let server = spawn_server(0).await;

    let response = reqwest::get(format!("http://{}/app?session-id=doc1", server.addr))
        .await
        .unwrap();
    assert!(response.status().is_success());
    let info: serde_json::Value = response.json().await.unwrap();

    assert_eq!(info["session_id"], "doc1");
    assert_eq!(
        info["websocket_url"],
        format!("ws://{}/app/ws", server.addr)
    );
    assert_eq!(
        info["resources"]["root_url"],
        format!("http://{}/", server.addr)
    );
    assert!(server.core.get_session("/app", "doc1").await.is_ok());
    assert_eq!(server.core.resource_cache().len().await, 1);

    server.core.stop().await;
}

#[tokio::test]
async fn unknown_application_is_not_found() {
    let server = spawn_server(0).await;
    let response = reqwest::get(format!("http://{}/nope", server.addr))
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::NOT_FOUND);
    server.core.stop().await;
}

#[tokio::test]
async fn stop_closes_sockets_and_ends_serving() {
    let server = spawn_server(0).await;
    let url = format!("ws://{}/app/ws", server.addr);
    let (mut ws, _) = tokio_tungstenite::connect_async(url).await.unwrap();
    connection_count_is(&server.core, 1).await;

    assert!(server.core.stop().await);
    assert!(!server.core.stop().await);

    let closed = timeout(Duration::from_secs(3), async {
        loop {
            match ws.next().await {
                Some(Ok(Message::Close(_))) | None | Some(Err(_)) => break,
                Some(Ok(_)) => {}
            }
        }
    })
    .await;
    assert!(closed.is_ok());

    let served = timeout(Duration::from_secs(3), server.handle).await;
    assert!(matches!(served, Ok(Ok(Ok(())))));
    assert_eq!(server.core.state(), ServerState::Stopped);

    let _ = ws.send(Message::Close(None)).await;
}
