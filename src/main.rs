//! `coursed`: course platform sidecar.
//!
//! Reads one JSON request per line on stdin and answers with one JSON line on
//! stdout. Logs go to stderr so they never interleave with responses.

mod catalog;
mod content;
mod db;
mod error;
mod ipc;
mod progress;
mod rating;

use std::io::{self, BufRead, Write};
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use serde_json::json;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser, Debug)]
#[command(name = "coursed")]
#[command(about = "Course ratings, progress and content sidecar")]
#[command(version)]
struct Args {
    /// Workspace directory to open at startup
    #[arg(short, long, env = "COURSED_WORKSPACE")]
    workspace: Option<PathBuf>,

    /// Log filter directive; falls back to RUST_LOG, then "info"
    #[arg(long, env = "COURSED_LOG")]
    log_filter: Option<String>,
}

fn init_tracing(directive: Option<&str>) -> Result<()> {
    let filter = match directive {
        Some(d) => EnvFilter::try_new(d).with_context(|| format!("invalid log filter: {d}"))?,
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    };
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(io::stderr))
        .init();
    Ok(())
}

fn write_line(stdout: &mut io::Stdout, resp: &serde_json::Value) {
    let line = serde_json::to_string(resp).unwrap_or_else(|_| "{\"ok\":false}".to_string());
    if let Err(e) = writeln!(stdout, "{line}").and_then(|_| stdout.flush()) {
        tracing::warn!(error = %e, "failed to write response");
    }
}

fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(args.log_filter.as_deref())?;

    let mut state = ipc::AppState::default();
    if let Some(path) = args.workspace {
        let conn = db::open_db(&path)
            .with_context(|| format!("failed to open workspace {}", path.display()))?;
        tracing::info!(workspace = %path.display(), "workspace opened");
        state.workspace = Some(path);
        state.db = Some(conn);
    }
    tracing::info!(version = env!("CARGO_PKG_VERSION"), "coursed ready");

    let stdin = io::stdin();
    let mut stdout = io::stdout();

    for line in stdin.lock().lines() {
        let line = match line {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!(error = %e, "stdin closed");
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }

        let req: ipc::Request = match serde_json::from_str(&line) {
            Ok(v) => v,
            Err(e) => {
                // No id to echo back.
                write_line(
                    &mut stdout,
                    &json!({
                        "ok": false,
                        "error": { "code": "bad_json", "message": e.to_string() }
                    }),
                );
                continue;
            }
        };

        let resp = ipc::handle_request(&mut state, req);
        write_line(&mut stdout, &resp);
    }
    Ok(())
}
