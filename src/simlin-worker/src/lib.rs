// Copyright 2026 The Simlin Authors. All rights reserved.
// Use of this source code is governed by the Apache License,
// Version 2.0, that can be found in the LICENSE file.

//! An isolated execution host for a simulation.  The compiled model
//! lives on a dedicated thread and is only reachable through the
//! command protocol, so requests are processed strictly one at a time
//! in arrival order.

use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::{self, JoinHandle};

use anyhow::{Context, Result, anyhow, bail};
use serde_json::{Value, json};
use tokio::sync::{mpsc, oneshot};
use tracing_subscriber::EnvFilter;

use simlin_runtime::{Engine, compile_json};

// requests queued ahead of the one being processed
const QUEUE_DEPTH: usize = 64;

struct Request {
    message: Value,
    reply: oneshot::Sender<Value>,
}

/// Initializes logging to stderr, keeping stdout free for responses.
///
/// `RUST_LOG` overrides the default `warn` filter.
pub fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

/// the response for a request line that isn't a JSON array
pub fn parse_error(details: &str) -> Value {
    json!([null, [null, details]])
}

pub struct WorkerHandle {
    tx: Option<mpsc::Sender<Request>>,
    handle: Option<JoinHandle<()>>,
    next_id: AtomicU64,
}

impl WorkerHandle {
    /// Compiles `project_json` on a fresh worker thread, returning once
    /// the simulation is ready to accept commands.
    pub async fn start(project_json: String) -> Result<Self> {
        let (tx, mut rx) = mpsc::channel::<Request>(QUEUE_DEPTH);
        let (ready_tx, ready_rx) = oneshot::channel::<simlin_runtime::Result<()>>();

        let handle = thread::Builder::new()
            .name("simlin-worker".to_string())
            .spawn(move || {
                let mut engine = match compile_json(&project_json) {
                    Ok(sim) => Engine::new(sim),
                    Err(err) => {
                        let _ = ready_tx.send(Err(err));
                        return;
                    }
                };
                tracing::debug!(
                    n_vars = engine.simulation().n_vars(),
                    "worker ready"
                );
                let _ = ready_tx.send(Ok(()));

                while let Some(request) = rx.blocking_recv() {
                    let response = engine.handle(&request.message);
                    let _ = request.reply.send(response);
                }

                tracing::debug!("worker shutting down");
            })
            .context("failed to spawn worker thread")?;

        let worker = WorkerHandle {
            tx: Some(tx),
            handle: Some(handle),
            next_id: AtomicU64::new(1),
        };

        match ready_rx.await {
            Ok(Ok(())) => Ok(worker),
            Ok(Err(err)) => bail!("failed to compile project: {}", err),
            Err(_) => bail!("worker thread exited before compiling the project"),
        }
    }

    /// Forwards a raw `[id, command, ...args]` request, returning the
    /// `[id, [result, error]]` response.
    pub async fn send(&self, message: Value) -> Result<Value> {
        let tx = self.tx.as_ref().context("worker is shut down")?;
        let (reply_tx, reply_rx) = oneshot::channel();
        tx.send(Request {
            message,
            reply: reply_tx,
        })
        .await
        .map_err(|_| anyhow!("worker thread is gone"))?;

        reply_rx.await.context("worker dropped the request")
    }

    /// Issues `cmd` with a fresh request id, returning its result or
    /// failing with the error the engine reported.
    pub async fn request(&self, cmd: &str, args: Vec<Value>) -> Result<Value> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut message = vec![json!(id), json!(cmd)];
        message.extend(args);

        let response = self.send(Value::Array(message)).await?;
        if response[0] != json!(id) {
            bail!("response {} doesn't match request {}", response[0], id);
        }
        let outcome = &response[1];
        match outcome[1].as_str() {
            Some(err) => bail!("{}", err),
            None if !outcome[1].is_null() => bail!("{}", outcome[1]),
            None => Ok(outcome[0].clone()),
        }
    }

    /// Handles one line of the JSON-lines protocol.  Blank lines are
    /// skipped, and lines that aren't a JSON array get an error response
    /// rather than ending the session.
    pub async fn handle_line(&self, line: &str) -> Result<Option<String>> {
        let line = line.trim();
        if line.is_empty() {
            return Ok(None);
        }

        let response = match serde_json::from_str::<Value>(line) {
            Ok(message @ Value::Array(_)) => self.send(message).await?,
            Ok(_) => {
                tracing::warn!(line, "request isn't a JSON array");
                parse_error("request must be a JSON array")
            }
            Err(err) => {
                tracing::warn!(line, error = %err, "malformed request");
                parse_error(&err.to_string())
            }
        };

        Ok(Some(response.to_string()))
    }
}

impl Drop for WorkerHandle {
    fn drop(&mut self) {
        // closing the queue ends the worker's receive loop
        self.tx.take();

        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                tracing::error!("worker thread panicked");
            }
        }
    }
}
