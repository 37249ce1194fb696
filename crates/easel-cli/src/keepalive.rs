use std::net::SocketAddr;
use std::thread;

use anyhow::{Context, Result};
use axum::{routing::get, Router};
use tokio::net::TcpListener;

/// Liveness surface for hosting platforms: `/` and `/health` answer as
/// long as the process is up. Runs on its own thread with its own
/// runtime, so a long poll loop never blocks a health check.
pub fn spawn(port: u16) -> Result<u16> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_io()
        .build()
        .context("keep-alive runtime build failed")?;
    // Bind before detaching so an occupied port surfaces to the caller.
    let listener = runtime
        .block_on(TcpListener::bind(addr))
        .with_context(|| format!("keep-alive bind failed on {addr}"))?;
    let bound = listener.local_addr()?.port();

    thread::spawn(move || {
        let app = Router::new()
            .route("/", get(|| async { "easel bot alive" }))
            .route("/health", get(|| async { "ok" }));
        if let Err(err) = runtime.block_on(async { axum::serve(listener, app).await }) {
            eprintln!("easel: keep-alive listener stopped: {err:#}");
        }
    });
    Ok(bound)
}

/// Flag wins, then the hosting platform's `PORT`, then 8080.
pub fn resolve_port(flag: Option<u16>) -> u16 {
    flag.or_else(|| {
        std::env::var("PORT")
            .ok()
            .and_then(|value| value.trim().parse().ok())
    })
    .unwrap_or(8080)
}
