mod auth;
mod backup;
mod config;
mod db;
mod http;
mod ipc;
mod relay;

use anyhow::Context;
use clap::Parser;
use std::io::{self, BufRead, Write};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// School administration daemon: JSON-lines on stdio, or HTTP with `--listen`.
#[derive(Debug, Parser)]
#[command(name = "schoold", version, about)]
struct Args {
    /// Directory holding `school.sqlite3`; created if missing.
    #[arg(long)]
    workspace: Option<PathBuf>,

    /// Serve the REST API and relay on this address instead of stdio.
    #[arg(long)]
    listen: Option<SocketAddr>,

    /// Log filter directive, e.g. `info` or `schoold=debug`.
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Token lifetime such as `24h` or `90m`; overrides SCHOOLD_TOKEN_TTL.
    #[arg(long)]
    token_ttl: Option<String>,
}

fn init_tracing(level: &str) {
    let filter = EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(io::stderr))
        .init();
}

fn run_stdio(mut state: ipc::AppState) {
    let stdin = io::stdin();
    let mut stdout = io::stdout();

    for line in stdin.lock().lines() {
        let line = match line {
            Ok(v) => v,
            Err(_) => break,
        };
        if line.trim().is_empty() {
            continue;
        }

        let resp = match serde_json::from_str::<ipc::Request>(&line) {
            Ok(req) => ipc::handle_request(&mut state, req),
            Err(e) => {
                warn!(error = %e, "unparseable request line");
                serde_json::json!({
                    "ok": false,
                    "error": { "code": "bad_json", "message": e.to_string() }
                })
            }
        };
        let _ = writeln!(
            stdout,
            "{}",
            serde_json::to_string(&resp).unwrap_or_else(|_| "{\"ok\":false}".to_string())
        );
        let _ = stdout.flush();
    }
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(&args.log_level);

    let cfg = config::Config::load(args.token_ttl.as_deref())?;
    let ttl_secs = i64::try_from(cfg.token_ttl.as_secs()).context("token ttl is too large")?;
    let mut state = ipc::AppState::new(
        Arc::new(auth::TokenIssuer::new(&cfg.jwt_secret, ttl_secs)),
        Arc::new(relay::Relay::new()),
    );

    if let Some(ws) = &args.workspace {
        state.db = Some(db::open_db(ws)?);
        state.workspace = Some(ws.clone());
        info!(workspace = %ws.display(), "workspace opened");
    }

    match args.listen {
        Some(addr) => {
            if state.db.is_none() {
                anyhow::bail!("--listen requires --workspace");
            }
            let rt = tokio::runtime::Builder::new_multi_thread()
                .enable_all()
                .build()
                .context("failed to start async runtime")?;
            rt.block_on(http::serve(state, addr))
        }
        None => {
            info!("reading requests from stdin");
            run_stdio(state);
            Ok(())
        }
    }
}
