//! Minimal web dashboard: submit tasks, watch the event stream live.

use std::convert::Infallible;
use std::sync::{Arc, RwLock};

use anyhow::{Context, Result};
use axum::Json;
use axum::Router;
use axum::extract::State;
use axum::response::Html;
use axum::response::sse::{Event, Sse};
use axum::routing::{get, post};
use serde::Deserialize;
use tokio::sync::{broadcast, mpsc};
use tokio_stream::StreamExt;
use tokio_stream::wrappers::BroadcastStream;

use crate::monitor::{ExecutionEvent, ExecutionStatus};

/// Latest finished-run projection, shared with the `/status` route.
pub type SharedStatus = Arc<RwLock<Option<ExecutionStatus>>>;

#[derive(Clone)]
struct AppState {
    cmd_tx: mpsc::Sender<String>,
    event_tx: broadcast::Sender<ExecutionEvent>,
    status: SharedStatus,
}

#[derive(Deserialize)]
struct CommandPayload {
    command: String,
}

/// Observer that forwards every published event into the dashboard's
/// broadcast channel.
pub fn broadcast_observer(
    tx: broadcast::Sender<ExecutionEvent>,
) -> impl FnMut(&ExecutionEvent) + Send + 'static {
    move |event: &ExecutionEvent| {
        let _ = tx.send(event.clone());
    }
}

/// Bind the dashboard on the first free port in 4400-4409 and serve it in
/// the background. Returns the task queue, the event channel, and the
/// shared status slot.
pub async fn start_server() -> Result<(
    mpsc::Receiver<String>,
    broadcast::Sender<ExecutionEvent>,
    SharedStatus,
)> {
    let (cmd_tx, cmd_rx) = mpsc::channel::<String>(1);
    let (event_tx, _) = broadcast::channel::<ExecutionEvent>(256);
    let status: SharedStatus = Arc::new(RwLock::new(None));

    let state = Arc::new(AppState {
        cmd_tx,
        event_tx: event_tx.clone(),
        status: Arc::clone(&status),
    });

    let app = Router::new()
        .route("/", get(index_handler))
        .route("/command", post(command_handler))
        .route("/events", get(sse_handler))
        .route("/status", get(status_handler))
        .with_state(state);

    let mut bound = None;
    for port in 4400..4410 {
        if let Ok(listener) = tokio::net::TcpListener::bind(("127.0.0.1", port)).await {
            bound = Some((listener, port));
            break;
        }
    }
    let (listener, port) = bound.context("no free port in 4400-4409")?;
    tracing::info!("dashboard listening on http://127.0.0.1:{port}");

    tokio::spawn(async move {
        if let Err(err) = axum::serve(listener, app).await {
            tracing::error!("dashboard server stopped: {err}");
        }
    });

    Ok((cmd_rx, event_tx, status))
}

async fn index_handler() -> Html<&'static str> {
    Html(INDEX_HTML)
}

async fn command_handler(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<CommandPayload>,
) -> &'static str {
    let _ = state.cmd_tx.send(payload.command).await;
    "ok"
}

async fn status_handler(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    let snapshot = state.status.read().ok().and_then(|s| s.clone());
    match snapshot {
        Some(status) => Json(serde_json::json!(status)),
        None => Json(serde_json::json!({"state": "idle"})),
    }
}

async fn sse_handler(
    State(state): State<Arc<AppState>>,
) -> Sse<impl tokio_stream::Stream<Item = Result<Event, Infallible>>> {
    let rx = state.event_tx.subscribe();
    let stream = BroadcastStream::new(rx).filter_map(|received| match received {
        Ok(event) => serde_json::to_string(&event)
            .ok()
            .map(|data| Ok::<_, Infallible>(Event::default().data(data))),
        Err(_) => None,
    });
    Sse::new(stream)
}

const INDEX_HTML: &str = r##"<!DOCTYPE html>
<html lang="en">
<head>
<meta charset="UTF-8">
<title>webpilot</title>
<style>
  body { margin: 0; background: #f6f7f9; color: #1f2430; font-family: system-ui, sans-serif; }
  .wrap { max-width: 760px; margin: 0 auto; padding: 28px 20px; }
  h1 { font-size: 18px; margin: 0 0 4px; }
  .sub { color: #6b7280; font-size: 13px; margin-bottom: 18px; }
  form { display: flex; gap: 8px; margin-bottom: 18px; }
  input { flex: 1; padding: 10px 12px; border: 1px solid #d1d5db; border-radius: 6px; font-size: 15px; }
  button { padding: 10px 18px; border: none; border-radius: 6px; background: #2563eb; color: #fff; font-size: 14px; cursor: pointer; }
  button:disabled { background: #9ca3af; }
  #summary { font-size: 13px; color: #374151; margin-bottom: 10px; min-height: 18px; }
  .ev { background: #fff; border: 1px solid #e5e7eb; border-radius: 6px; padding: 8px 12px; margin-bottom: 6px; font-size: 13px; font-family: ui-monospace, monospace; }
  .ev.success { border-left: 3px solid #16a34a; }
  .ev.failed { border-left: 3px solid #dc2626; }
  .ev.started { border-left: 3px solid #d1d5db; color: #6b7280; }
  .ev .err { color: #b91c1c; display: block; margin-top: 2px; }
</style>
</head>
<body>
<div class="wrap">
  <h1>webpilot</h1>
  <div class="sub">Describe a browser task; steps appear below as they run.</div>
  <form id="f">
    <input id="task" placeholder="e.g. open example.com and take a screenshot" autofocus>
    <button id="go">Run</button>
  </form>
  <div id="summary"></div>
  <div id="events"></div>
</div>
<script>
  const form = document.getElementById('f');
  const task = document.getElementById('task');
  const go = document.getElementById('go');
  const events = document.getElementById('events');
  const summary = document.getElementById('summary');

  form.addEventListener('submit', async (e) => {
    e.preventDefault();
    const command = task.value.trim();
    if (!command) return;
    events.innerHTML = '';
    summary.textContent = 'running: ' + command;
    go.disabled = true;
    await fetch('/command', {
      method: 'POST',
      headers: {'Content-Type': 'application/json'},
      body: JSON.stringify({command}),
    });
    task.value = '';
  });

  const source = new EventSource('/events');
  source.onmessage = (msg) => {
    const ev = JSON.parse(msg.data);
    const div = document.createElement('div');
    div.className = 'ev ' + ev.status;
    let text = 'step ' + ev.step_index + ' · ' + ev.action + ' · ' + ev.status;
    if (ev.selector) text += ' (' + ev.selector + ')';
    else if (ev.url) text += ' (' + ev.url + ')';
    div.textContent = text;
    if (ev.error) {
      const err = document.createElement('span');
      err.className = 'err';
      err.textContent = ev.error;
      div.appendChild(err);
    }
    events.appendChild(div);
    if (ev.status !== 'started') refreshSummary();
  };

  async function refreshSummary() {
    const res = await fetch('/status');
    const s = await res.json();
    if (s.state === 'idle') return;
    summary.textContent = s.state + ' · ' + s.completed + '/' + s.total_steps +
      ' steps ok' + (s.failed ? ' · ' + s.failed + ' failed' : '');
    if (s.state === 'completed' || s.state === 'failed') go.disabled = false;
  }
</script>
</body>
</html>
"##;
