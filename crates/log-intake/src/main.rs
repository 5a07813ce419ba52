// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

mod config;
mod intake;

use std::env;
use std::future::{self, Future};
use std::io;
use std::process;

use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};
use tracing_subscriber::EnvFilter;

use log_sink::LogSink;

use crate::config::IntakeConfig;

#[tokio::main]
pub async fn main() {
    let log_level = env::var("LOG_LEVEL")
        .map(|val| val.to_lowercase())
        .unwrap_or("info".to_string());

    let env_filter = format!("h2=off,hyper=off,rustls=off,reqwest=off,{log_level}");

    #[allow(clippy::expect_used)]
    let subscriber = tracing_subscriber::fmt::Subscriber::builder()
        .with_env_filter(
            EnvFilter::try_new(env_filter).expect("could not parse log level in configuration"),
        )
        .with_level(true)
        .with_thread_names(false)
        .with_thread_ids(false)
        .with_line_number(false)
        .with_file(false)
        .with_target(true)
        .finish();

    #[allow(clippy::expect_used)]
    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");

    debug!("Logging subsystem enabled");

    let config = match IntakeConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!("INTAKE | {e}");
            process::exit(1);
        }
    };

    info!(
        "INTAKE | Starting log intake, shipping to {}",
        config.sink.store_urls.join(", ")
    );

    let sink = match LogSink::connect(config.sink.clone()).await {
        Ok(sink) => sink,
        Err(e) => {
            error!("INTAKE | Unable to start log sink: {e}");
            process::exit(1);
        }
    };

    let addr = config.socket_addr();
    let listener = match TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(e) => {
            error!("INTAKE | Unable to listen on {addr}: {e}");
            if let Err(e) = sink.shutdown().await {
                error!("INTAKE | {e}");
            }
            process::exit(1);
        }
    };
    info!("INTAKE | Listening on {addr}");

    let shutdown = CancellationToken::new();
    tokio::spawn(wait_for_signal(shutdown.clone()));

    if let Err(e) = intake::serve(
        listener,
        sink.handle(),
        config.max_request_bytes,
        shutdown.clone(),
    )
    .await
    {
        error!("INTAKE | Server stopped: {e}");
    }

    match sink.shutdown().await {
        Ok(()) => info!("INTAKE | Stopped"),
        Err(e) => {
            error!("INTAKE | {e}");
            process::exit(1);
        }
    }
}

async fn wait_for_signal(shutdown: CancellationToken) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut terminate) => {
                tokio::select! {
                    _ = signal_or_park("SIGINT", tokio::signal::ctrl_c()) => {}
                    _ = terminate.recv() => {}
                }
            }
            Err(e) => {
                error!("INTAKE | Unable to listen for SIGTERM: {e}");
                signal_or_park("SIGINT", tokio::signal::ctrl_c()).await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        signal_or_park("SIGINT", tokio::signal::ctrl_c()).await;
    }

    info!("INTAKE | Shutdown signal received");
    shutdown.cancel();
}

/// Resolves when the signal arrives. A listener that could not be
/// registered never resolves, so it cannot trigger a shutdown.
async fn signal_or_park<F>(name: &str, signal: F)
where
    F: Future<Output = io::Result<()>>,
{
    if let Err(e) = signal.await {
        error!("INTAKE | Unable to listen for {name}: {e}");
        future::pending::<()>().await;
    }
}
