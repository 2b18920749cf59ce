#![allow(dead_code)]

use futures::StreamExt;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::{
    connect_async,
    tungstenite::{protocol::CloseFrame, Message},
    MaybeTlsStream, WebSocketStream,
};
use wbconsole::api::{self, AppState};
use wbconsole::config::ConsoleConfig;

pub type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// A console server on an ephemeral port. Dropping it shuts the server down
/// and kills every session.
pub struct TestServer {
    pub addr: SocketAddr,
    pub state: AppState,
    handle: tokio::task::JoinHandle<()>,
    reaper: tokio::task::JoinHandle<()>,
}

impl TestServer {
    pub fn ws_url(&self, query: &str) -> String {
        format!("ws://{}{}{}", self.addr, api::CONSOLE_WS_PATH, query)
    }

    pub fn http_url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    pub async fn connect(&self, query: &str) -> WsStream {
        let (ws, _) = connect_async(self.ws_url(query))
            .await
            .expect("websocket handshake failed");
        ws
    }

    /// Wait until the registry holds exactly `n` sessions.
    pub async fn wait_for_sessions(&self, n: usize) {
        let registry = self.state.registry.clone();
        let reached = wait_for(Duration::from_secs(5), || registry.len() == n).await;
        assert!(reached, "expected {n} sessions, have {}", registry.len());
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.state.shutdown.cancel();
        self.state.registry.drain();
        self.handle.abort();
        self.reaper.abort();
    }
}

/// Defaults suited to tests: `/bin/sh` for shell mode, no idle reaping.
pub fn test_config() -> ConsoleConfig {
    ConsoleConfig {
        bind: SocketAddr::from(([127, 0, 0, 1], 0)),
        shell: "/bin/sh".into(),
        shell_args: Vec::new(),
        idle_timeout: Duration::ZERO,
        ..ConsoleConfig::default()
    }
}

pub async fn start_server(config: ConsoleConfig) -> TestServer {
    let reap_interval = config.reap_interval;
    let state = AppState::new(config);
    let reaper = state
        .registry
        .spawn_reaper(reap_interval, state.shutdown.clone());

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let app = api::router(state.clone());
    let shutdown = state.shutdown.clone();
    let handle = tokio::spawn(async move {
        axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await
            .unwrap();
    });

    TestServer {
        addr,
        state,
        handle,
        reaper,
    }
}

/// Poll `cond` every 10ms until it holds or `timeout` passes.
pub async fn wait_for(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if cond() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Collect terminal output until it contains `needle`.
pub async fn read_until(ws: &mut WsStream, needle: &str, timeout: Duration) -> String {
    let mut output = String::new();
    let result = tokio::time::timeout(timeout, async {
        while let Some(msg) = ws.next().await {
            match msg {
                Ok(Message::Binary(data)) => {
                    output.push_str(&String::from_utf8_lossy(&data));
                    if output.contains(needle) {
                        return true;
                    }
                }
                Ok(Message::Text(text)) => output.push_str(text.as_str()),
                Ok(Message::Close(_)) | Err(_) => return false,
                Ok(_) => {}
            }
        }
        false
    })
    .await;
    assert!(
        matches!(result, Ok(true)),
        "did not see {needle:?} in output: {output:?}"
    );
    output
}

/// What a connection saw before the server closed it.
#[derive(Debug, Default)]
pub struct Closed {
    pub texts: Vec<String>,
    pub frame: Option<CloseFrame>,
}

/// Read until the server closes the socket. Panics on timeout.
pub async fn expect_closed(ws: &mut WsStream, timeout: Duration) -> Closed {
    let mut closed = Closed::default();
    let result = tokio::time::timeout(timeout, async {
        while let Some(msg) = ws.next().await {
            match msg {
                Ok(Message::Text(text)) => closed.texts.push(text.as_str().to_string()),
                Ok(Message::Close(frame)) => {
                    closed.frame = frame;
                    return;
                }
                Ok(_) => {}
                Err(_) => return,
            }
        }
    })
    .await;
    assert!(result.is_ok(), "socket was not closed within {timeout:?}");
    closed
}
