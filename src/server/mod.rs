use axum::{
    body::Body,
    extract::{Form, FromRequest, Path as RoutePath, Request, State},
    http::{header, HeaderValue, Method, StatusCode},
    response::{Html, IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tokio_util::io::ReaderStream;

use crate::jobs::*;
use crate::tooling::*;

mod artifact;
mod commands;
mod error;

pub(crate) use artifact::*;
pub(crate) use commands::*;
pub(crate) use error::*;

#[derive(Clone)]
pub(crate) struct AppState {
    pub(crate) jobs: JobService,
}

pub(crate) fn build_router(jobs: JobService) -> Router {
    Router::new()
        .route("/", get(index_page))
        .route("/download", post(submit_download))
        .route("/check_status/{id}", get(check_status))
        .route("/cancel/{id}", post(cancel_download))
        .route("/get_file/{filename}", get(get_file))
        .route("/tools", get(tools_report))
        .fallback(fallback)
        .with_state(AppState { jobs })
}

async fn shutdown_signal() {
    if let Err(error) = tokio::signal::ctrl_c().await {
        log::error!("Failed to install Ctrl+C handler: {error}");
    }
    log::info!("Shutdown requested");
}

fn log_tool(status: &ToolStatus) {
    if status.available {
        log::info!(
            "{}: {} ({}, {})",
            status.name,
            status.path.as_deref().unwrap_or("-"),
            status.source,
            status.version.as_deref().unwrap_or("unknown version")
        );
    } else {
        log::warn!(
            "{}: unavailable: {}",
            status.name,
            status.message.as_deref().unwrap_or("not found")
        );
    }
}

pub async fn serve(settings: ServiceSettings) -> Result<(), String> {
    let addr = settings.listen_socket_addr()?;
    let jobs = JobService::start(settings)?;

    let probe = jobs.clone();
    match tokio::task::spawn_blocking(move || probe.tools_status()).await {
        Ok(report) => {
            log_tool(&report.ytdlp);
            log_tool(&report.ffmpeg);
        }
        Err(error) => log::warn!("Tool pre-flight did not finish: {error}"),
    }

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|error| format!("Failed to bind {addr}: {error}"))?;
    log::info!("Listening on http://{addr}");

    axum::serve(listener, build_router(jobs))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(|error| format!("Server error: {error}"))?;
    log::info!("Server stopped");
    Ok(())
}
