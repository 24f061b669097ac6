#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use agent_broker::api::{router, AppState};
use agent_broker::backend::{ExecutionEvent, ScriptStep, ScriptedEngine};
use agent_broker::bridge::BridgeConfig;
use agent_broker::config::{Config, EngineKind};
use bytes::Bytes;
use futures::{Stream, StreamExt};
use serde_json::{json, Value};
use std::pin::Pin;

pub struct TestServer {
    pub base_url: String,
    pub state: Arc<AppState>,
    pub engine: ScriptedEngine,
    pub client: reqwest::Client,
    _root: tempfile::TempDir,
    handle: tokio::task::JoinHandle<()>,
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

pub fn text(content: &str) -> ExecutionEvent {
    ExecutionEvent::TextDelta {
        content: content.to_string(),
    }
}

/// `A` right away, `B` only after `gap`.
pub fn two_step_script(gap: Duration) -> Vec<ScriptStep> {
    vec![
        ScriptStep::new(text("A")),
        ScriptStep::after(gap, text("B")),
    ]
}

pub async fn spawn_server(engine: ScriptedEngine) -> TestServer {
    spawn_server_with(engine, |_| {}).await
}

pub async fn spawn_server_with(engine: ScriptedEngine, tweak: impl FnOnce(&mut Config)) -> TestServer {
    let root = tempfile::tempdir().unwrap();
    let mut config = Config {
        workspaces_root: root.path().to_path_buf(),
        engine: EngineKind::Scripted,
        introspection: true,
        bridge: BridgeConfig {
            stop_timeout: Duration::from_millis(500),
            cancel_wait: Duration::from_secs(2),
            ..BridgeConfig::default()
        },
        ..Config::default()
    };
    tweak(&mut config);

    let state = AppState::new(config, Arc::new(engine.clone()));
    let app = router(Arc::clone(&state));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let handle = tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });

    TestServer {
        base_url: format!("http://{}", addr),
        state,
        engine,
        client: reqwest::Client::new(),
        _root: root,
        handle,
    }
}

pub fn chat_body(tab: &str) -> Value {
    json!({
        "userId": "user-1",
        "tabGroupId": "group-1",
        "tabId": tab,
        "workspace": "project",
        "prompt": "hello"
    })
}

impl TestServer {
    pub async fn chat(&self, body: &Value) -> reqwest::Response {
        self.client
            .post(format!("{}/api/chat", self.base_url))
            .json(body)
            .send()
            .await
            .unwrap()
    }

    pub async fn cancel(&self, body: &Value) -> reqwest::Response {
        self.client
            .post(format!("{}/api/chat/cancel", self.base_url))
            .json(body)
            .send()
            .await
            .unwrap()
    }

    pub async fn debug_state(&self) -> Value {
        self.client
            .get(format!("{}/api/debug/state", self.base_url))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap()
    }

    /// Poll the debug endpoint until no conversation is locked.
    pub async fn wait_unlocked(&self, within: Duration) -> Value {
        let deadline = tokio::time::Instant::now() + within;
        loop {
            let state = self.debug_state().await;
            if state["locks"]["count"] == 0 {
                return state;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "conversation still locked: {}",
                state
            );
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }
}

/// Reads one JSON value per line from a streamed response body.
pub struct NdjsonReader {
    body: Pin<Box<dyn Stream<Item = reqwest::Result<Bytes>> + Send>>,
    buf: Vec<u8>,
}

impl NdjsonReader {
    pub fn new(response: reqwest::Response) -> Self {
        Self {
            body: Box::pin(response.bytes_stream()),
            buf: Vec::new(),
        }
    }

    pub async fn next(&mut self) -> Option<Value> {
        loop {
            if let Some(pos) = self.buf.iter().position(|b| *b == b'\n') {
                let line: Vec<u8> = self.buf.drain(..=pos).collect();
                return Some(serde_json::from_slice(&line[..line.len() - 1]).unwrap());
            }
            match self.body.next().await {
                Some(Ok(chunk)) => self.buf.extend_from_slice(&chunk),
                _ => return None,
            }
        }
    }

    pub async fn collect(mut self) -> Vec<Value> {
        let mut records = Vec::new();
        while let Some(record) = self.next().await {
            records.push(record);
        }
        records
    }
}
