use anyhow::{Context, Result};
use axum::{
    Router,
    extract::{
        State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    response::IntoResponse,
    routing::get,
};
use databot_core::{AgentLoop, TurnResult};
use futures::{SinkExt, StreamExt, stream::SplitStream};
use serde::Serialize;
use std::collections::VecDeque;
use std::future::Future;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[derive(Clone)]
pub struct AppState {
    agent: Arc<AgentLoop>,
}

/// One frame per turn: `{"answer": "..."}` or `{"error": "..."}`.
#[derive(Serialize)]
#[serde(rename_all = "snake_case")]
enum Reply<'a> {
    Answer(&'a str),
    Error(&'a str),
}

pub fn router(agent: Arc<AgentLoop>) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .with_state(AppState { agent })
}

/// Binds `addr` and serves until Ctrl-C, then shuts the tool servers down.
pub async fn run(agent: Arc<AgentLoop>, addr: &str) -> Result<()> {
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    info!("Listening on ws://{}/ws", listener.local_addr()?);

    let registry = agent.tool_registry().clone();
    let served = serve(listener, agent, shutdown_signal()).await;

    registry.shutdown().await;
    info!("Server stopped");
    served
}

pub async fn serve<F>(listener: TcpListener, agent: Arc<AgentLoop>, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    axum::serve(listener, router(agent))
        .with_graceful_shutdown(shutdown)
        .await
        .context("WebSocket server failed")
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for Ctrl-C: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutdown requested");
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

/// One connection: questions are answered in arrival order, one turn at a
/// time. The socket keeps being read while a turn runs so a disconnect can
/// cancel it.
async fn handle_socket(socket: WebSocket, state: AppState) {
    let (mut sender, mut receiver) = socket.split();
    let cancel = CancellationToken::new();
    let mut pending: VecDeque<String> = VecDeque::new();
    let mut closed = false;

    info!("WebSocket client connected");

    loop {
        let query = match pending.pop_front() {
            Some(query) => query,
            None => match next_query(&mut receiver).await {
                Some(query) => query,
                None => break,
            },
        };
        debug!("Received query: {}", query);

        let result = {
            let turn = state.agent.process_with_cancel(&query, &cancel);
            tokio::pin!(turn);

            loop {
                tokio::select! {
                    result = &mut turn => break result,
                    next = receiver.next(), if !closed => match next {
                        Some(Ok(Message::Text(text))) => pending.push_back(text),
                        Some(Ok(Message::Close(_))) | None => {
                            closed = true;
                            cancel.cancel();
                        }
                        Some(Err(e)) => {
                            warn!("WebSocket receive error: {}", e);
                            closed = true;
                            cancel.cancel();
                        }
                        Some(Ok(_)) => {}
                    },
                }
            }
        };

        if closed {
            break;
        }
        if sender.send(Message::Text(reply_text(result))).await.is_err() {
            info!("WebSocket client disconnected");
            return;
        }
    }

    cancel.cancel();
    info!("WebSocket client disconnected");
}

async fn next_query(receiver: &mut SplitStream<WebSocket>) -> Option<String> {
    while let Some(next) = receiver.next().await {
        match next {
            Ok(Message::Text(text)) => return Some(text),
            Ok(Message::Close(_)) => return None,
            Ok(Message::Binary(_)) => debug!("Ignoring binary message from client"),
            Ok(_) => {}
            Err(e) => {
                warn!("WebSocket receive error: {}", e);
                return None;
            }
        }
    }
    None
}

fn reply_text(result: TurnResult<String>) -> String {
    let failure;
    let reply = match &result {
        Ok(answer) => Reply::Answer(answer),
        Err(e) => {
            error!("Turn failed: {}", e);
            failure = e.to_string();
            Reply::Error(&failure)
        }
    };
    serde_json::to_string(&reply).unwrap_or_else(|_| r#"{"error":"internal error"}"#.to_string())
}
