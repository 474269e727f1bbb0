//! kvm-mcp entry point: MCP server and one-shot CLI commands.

mod args;
mod capture;
mod config;
mod dispatch;
mod mcp;
mod ocr;
mod params;
mod service;
#[cfg(test)]
mod testing;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use kvm_mcp_core::error::ApiError;
use rmcp::{transport::stdio, ServiceExt};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use crate::args::{Cli, Commands, KeyArgs};
use crate::capture::{CaptureLog, ScreenReader};
use crate::config::Config;
use crate::dispatch::{Dispatcher, ToolOutput};
use crate::mcp::KvmMcpServer;
use crate::params::{
    ExecuteAndReadParams, KeyStepParams, SendKeyParams, SendKeySequenceParams, TypeTextParams,
};
use crate::service::ServiceClient;

fn main() {
    // Logs go to stderr; stdout carries MCP traffic
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(log_filter(std::env::var("RUST_LOG").ok()))
        .init();

    let cli = Cli::parse();

    let config = match Config::from_env() {
        Ok(config) => config.with_overrides(cli.host.clone(), cli.port),
        Err(e) => {
            error!("Invalid configuration: {}", e);
            std::process::exit(1);
        }
    };

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            error!("Failed to create tokio runtime: {}", e);
            std::process::exit(1);
        }
    };

    if let Err(e) = runtime.block_on(run(cli.command, config)) {
        error!("{:#}", e);
        std::process::exit(1);
    }
}

/// `RUST_LOG` directives when set and valid, `info` otherwise.
fn log_filter(directives: Option<String>) -> EnvFilter {
    directives
        .filter(|d| !d.trim().is_empty())
        .and_then(|d| EnvFilter::try_new(d).ok())
        .unwrap_or_else(|| EnvFilter::new("info"))
}

/// Wire the client, recognizer and capture log together.
fn build_dispatcher(config: &Config) -> Dispatcher {
    let client = Arc::new(ServiceClient::new(
        config.service_addr(),
        config.timeouts(),
    ));
    let recognizer = ocr::probe(config.tesseract_cmd.as_deref());
    let capture_log = config.capture_log_dir.clone().map(CaptureLog::new);
    if let Some(log) = &capture_log {
        info!("Capture log directory: {}", log.dir().display());
    }
    let screen = ScreenReader::new(client.clone(), recognizer, capture_log);
    Dispatcher::new(client, screen)
}

async fn run(command: Commands, config: Config) -> anyhow::Result<()> {
    let dispatcher = build_dispatcher(&config);

    let mut save_to: Option<PathBuf> = None;
    let result = match command {
        Commands::Serve => return serve(dispatcher).await,
        Commands::Type(args) => {
            dispatcher
                .type_text(TypeTextParams {
                    text: args.text,
                    char_delay_ms: args.char_delay,
                })
                .await
        }
        Commands::Key(args) => match key_request(&args) {
            KeyRequest::Single(params) => dispatcher.send_key(params).await,
            KeyRequest::Sequence(params) => dispatcher.send_key_sequence(params).await,
        },
        Commands::Read => dispatcher.get_screen_text().await,
        Commands::Exec(args) => {
            dispatcher
                .execute_and_read(ExecuteAndReadParams {
                    text: args.text,
                    wait_ms: Some(args.wait),
                })
                .await
        }
        Commands::Screenshot(args) => {
            save_to = Some(args.path);
            dispatcher.capture_screen().await
        }
        Commands::Info => dispatcher.get_device_info().await,
        Commands::Devices => dispatcher.list_capture_devices().await,
    };

    match result.map_err(|e| anyhow::Error::new(ApiError::from(e)))? {
        ToolOutput::Text(text) => println!("{}", text),
        ToolOutput::Image { bytes, mime_type } => {
            let path = save_to.context("no output path for image")?;
            tokio::fs::write(&path, &bytes)
                .await
                .with_context(|| format!("failed to write {}", path.display()))?;
            println!(
                "Saved {} screenshot ({} bytes) to {}",
                mime_type,
                bytes.len(),
                path.display()
            );
        }
    }
    Ok(())
}

/// Run the MCP server until the client disconnects or a signal arrives.
async fn serve(dispatcher: Dispatcher) -> anyhow::Result<()> {
    info!(
        "Starting MCP server on stdio (KVM service at {})",
        dispatcher.client().addr()
    );
    let server = KvmMcpServer::new(Arc::new(dispatcher));
    let service = server
        .serve(stdio())
        .await
        .context("failed to start MCP server")?;

    tokio::select! {
        result = service.waiting() => {
            result.context("MCP server task failed")?;
            info!("MCP client disconnected");
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received SIGINT, shutting down");
        }
        _ = sigterm() => {
            info!("Received SIGTERM, shutting down");
        }
    }
    Ok(())
}

enum KeyRequest {
    Single(SendKeyParams),
    Sequence(SendKeySequenceParams),
}

/// Map `key` arguments: one combo is a single key press, several
/// space-separated combos are a sequence.
fn key_request(args: &KeyArgs) -> KeyRequest {
    let mut combos: Vec<SendKeyParams> = args.keys.split_whitespace().map(split_combo).collect();
    if combos.len() <= 1 {
        return KeyRequest::Single(combos.pop().unwrap_or_else(|| split_combo("")));
    }
    KeyRequest::Sequence(SendKeySequenceParams {
        steps: combos
            .into_iter()
            .map(|combo| KeyStepParams {
                key: combo.key,
                modifiers: combo.modifiers,
                delay_ms: None,
            })
            .collect(),
        default_delay_ms: Some(args.delay),
    })
}

/// Split `ctrl+alt+delete` into modifiers and key.
fn split_combo(combo: &str) -> SendKeyParams {
    let mut parts: Vec<String> = combo.split('+').map(str::to_string).collect();
    let key = parts.pop().unwrap_or_default();
    SendKeyParams {
        key,
        modifiers: parts,
    }
}

/// Wait for SIGTERM signal (Unix only).
#[cfg(unix)]
async fn sigterm() {
    use tokio::signal::unix::{signal, SignalKind};
    match signal(SignalKind::terminate()) {
        Ok(mut sigterm) => {
            sigterm.recv().await;
        }
        Err(e) => {
            tracing::warn!(
                "Failed to register SIGTERM handler: {}, only SIGINT will stop the server",
                e
            );
            std::future::pending::<()>().await;
        }
    }
}

/// SIGTERM is not available on non-Unix platforms; use a never-completing future.
#[cfg(not(unix))]
async fn sigterm() {
    std::future::pending::<()>().await;
}
