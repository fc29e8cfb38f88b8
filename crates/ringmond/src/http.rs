//! Dashboard-facing HTTP reader.
//!
//! `GET /amon?start=S&end=E&name=a,b[&aggr=...]` turns into one read task.
//! The handler only carries the raw query string; interpreting it happens
//! on the storage worker via the task's parse callback, and the finished
//! task comes back through a oneshot channel. The respond callback fires
//! for failed requests too, which the handler maps to 404 with an empty
//! body.

use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use axum::Router;
use axum::extract::{RawQuery, State};
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use tokio::sync::oneshot;
use tracing::{info, warn};

use ringmon_core::calendar::Aggr;
use ringmon_core::task::{ReadTask, Task, TaskQueue};

/// Serves until `running` goes false.
pub async fn serve(
    listen: &str,
    queue: Arc<TaskQueue>,
    running: Arc<AtomicBool>,
) -> io::Result<()> {
    let app = Router::new()
        .route("/amon", get(handle_query))
        .route("/health", get(|| async { "ok" }))
        .with_state(queue);
    let listener = tokio::net::TcpListener::bind(listen).await?;
    info!(addr = listen, "reader listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let mut tick = tokio::time::interval(Duration::from_millis(100));
            loop {
                tick.tick().await;
                if !running.load(Ordering::SeqCst) {
                    break;
                }
            }
        })
        .await
}

async fn handle_query(
    State(queue): State<Arc<TaskQueue>>,
    RawQuery(query): RawQuery,
) -> Response {
    let (tx, rx) = oneshot::channel();
    let task = ReadTask::new(
        query.unwrap_or_default(),
        Box::new(parse_request),
        Box::new(move |task| {
            let _ = tx.send(task);
        }),
    );
    queue.put(Task::Read(Box::new(task)));
    match rx.await {
        Ok(task) if !task.failed => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "application/json; charset=utf-8")],
            render_values(&task),
        )
            .into_response(),
        Ok(_) => StatusCode::NOT_FOUND.into_response(),
        Err(_) => {
            warn!("storage worker dropped the read task");
            StatusCode::NOT_FOUND.into_response()
        }
    }
}

/// Runs on the worker: decodes the query string into the task fields.
fn parse_request(task: &mut ReadTask) -> io::Result<()> {
    task.start = 0;
    task.end = 0;
    task.names.clear();
    task.aggr = None;
    let request = std::mem::take(&mut task.request);
    for param in request.split('&') {
        if let Some(v) = param.strip_prefix("start=") {
            task.start = v.parse().unwrap_or(0);
        } else if let Some(v) = param.strip_prefix("end=") {
            task.end = v.parse().unwrap_or(0);
        } else if let Some(v) = param.strip_prefix("name=") {
            task.names = url_unescape(v)
                .split(',')
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect();
        } else if let Some(v) = param.strip_prefix("aggr=") {
            task.aggr = Some(
                Aggr::parse(v).ok_or_else(|| io::Error::other(format!("invalid aggr type {v}")))?,
            );
        }
    }
    if task.start == 0 || task.end == 0 || task.names.is_empty() {
        return Err(io::Error::other("incomplete request"));
    }
    info!(
        names = %task.names.join(","),
        start = task.start,
        end = task.end,
        "query"
    );
    Ok(())
}

fn url_unescape(s: &str) -> String {
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%'
            && i + 2 < bytes.len()
            && let (Some(hi), Some(lo)) =
                ((bytes[i + 1] as char).to_digit(16), (bytes[i + 2] as char).to_digit(16))
        {
            out.push((hi * 16 + lo) as u8);
            i += 3;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}

/// `{"values":[{"time":T,"val0":…,"val1":…},…]}` with NaN entries omitted.
fn render_values(task: &ReadTask) -> String {
    let points = task.times.len();
    let mut rows = Vec::with_capacity(points);
    for (i, time) in task.times.iter().enumerate() {
        let mut row = serde_json::Map::new();
        row.insert("time".to_string(), (*time).into());
        for j in 0..task.names.len() {
            let v = task.values[j * points + i];
            if !v.is_nan() {
                row.insert(format!("val{j}"), serde_json::json!(v));
            }
        }
        rows.push(serde_json::Value::Object(row));
    }
    serde_json::json!({ "values": rows }).to_string()
}
