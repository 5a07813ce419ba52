// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::error::Error;
use std::io;
use std::time::Duration;

use http_body_util::{BodyExt, Full, LengthLimitError, Limited};
use hyper::body::{Body, Bytes, Incoming};
use hyper::header::CONTENT_LENGTH;
use hyper::service::service_fn;
use hyper::{http, HeaderMap, Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use log_sink::error::SubmitError;
use log_sink::{RawSubmission, SinkHandle};
use serde_json::json;
use tokio::net::TcpListener;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

pub const LOG_ENDPOINT_PATH: &str = "/api/log";

/// How long open connections get to finish once the listener stops.
const CONNECTION_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

type BoxError = Box<dyn Error + Send + Sync>;

pub fn log_and_create_http_response(
    message: &str,
    status: StatusCode,
) -> http::Result<Response<Full<Bytes>>> {
    if status.is_success() {
        debug!("INTAKE | {message}");
    } else if status.is_server_error() {
        error!("INTAKE | {message}");
    } else {
        warn!("INTAKE | {message}");
    }
    let body = json!({ "message": message }).to_string();
    Response::builder()
        .status(status)
        .header("Content-Type", "application/json")
        .body(Full::new(Bytes::from(body)))
}

pub async fn handle_request<B>(
    req: Request<B>,
    sink: SinkHandle,
    max_request_bytes: usize,
) -> http::Result<Response<Full<Bytes>>>
where
    B: Body,
    B::Error: Into<BoxError>,
{
    match (req.method(), req.uri().path()) {
        (&Method::POST, LOG_ENDPOINT_PATH) => handle_log(req, &sink, max_request_bytes).await,
        (method, LOG_ENDPOINT_PATH) => log_and_create_http_response(
            &format!("Method {method} not allowed on {LOG_ENDPOINT_PATH}"),
            StatusCode::METHOD_NOT_ALLOWED,
        ),
        (_, path) => log_and_create_http_response(
            &format!("No route for {path}"),
            StatusCode::NOT_FOUND,
        ),
    }
}

async fn handle_log<B>(
    req: Request<B>,
    sink: &SinkHandle,
    max_request_bytes: usize,
) -> http::Result<Response<Full<Bytes>>>
where
    B: Body,
    B::Error: Into<BoxError>,
{
    if let Some(length) = content_length(req.headers()) {
        if length > max_request_bytes {
            return too_large(max_request_bytes);
        }
    }

    let body = match Limited::new(req.into_body(), max_request_bytes).collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) if e.is::<LengthLimitError>() => return too_large(max_request_bytes),
        Err(e) => {
            return log_and_create_http_response(
                &format!("Error reading request body: {e}"),
                StatusCode::BAD_REQUEST,
            )
        }
    };

    let submission: RawSubmission = match serde_json::from_slice(&body) {
        Ok(submission) => submission,
        Err(e) => {
            return log_and_create_http_response(
                &format!("Invalid log payload: {e}"),
                StatusCode::BAD_REQUEST,
            )
        }
    };

    match sink.submit(submission) {
        Ok(()) => log_and_create_http_response("Log accepted", StatusCode::OK),
        Err(e @ SubmitError::Validation(_)) => {
            log_and_create_http_response(&e.to_string(), StatusCode::BAD_REQUEST)
        }
        Err(e @ SubmitError::Rejected(_)) => {
            log_and_create_http_response(&e.to_string(), StatusCode::SERVICE_UNAVAILABLE)
        }
    }
}

fn too_large(max_request_bytes: usize) -> http::Result<Response<Full<Bytes>>> {
    log_and_create_http_response(
        &format!("Request body exceeds {max_request_bytes} bytes"),
        StatusCode::PAYLOAD_TOO_LARGE,
    )
}

fn content_length(headers: &HeaderMap) -> Option<usize> {
    headers
        .get(CONTENT_LENGTH)?
        .to_str()
        .ok()?
        .parse::<usize>()
        .ok()
}

/// Accepts HTTP/1 connections until `shutdown` fires, then gives open
/// connections a short grace period.
pub async fn serve(
    listener: TcpListener,
    sink: SinkHandle,
    max_request_bytes: usize,
    shutdown: CancellationToken,
) -> Result<(), BoxError> {
    let server = hyper::server::conn::http1::Builder::new();
    let service = service_fn(move |req: Request<Incoming>| {
        let sink = sink.clone();
        async move { handle_request(req, sink, max_request_bytes).await }
    });
    let mut joinset = JoinSet::new();

    loop {
        let conn = tokio::select! {
            () = shutdown.cancelled() => break,
            con_res = listener.accept() => match con_res {
                Err(e)
                    if matches!(
                        e.kind(),
                        io::ErrorKind::ConnectionAborted
                            | io::ErrorKind::ConnectionReset
                            | io::ErrorKind::ConnectionRefused
                    ) =>
                {
                    continue;
                }
                Err(e) => {
                    error!("INTAKE | Server error: {e}");
                    return Err(e.into());
                }
                Ok((conn, _)) => conn,
            },
            finished = async {
                match joinset.join_next().await {
                    Some(finished) => finished,
                    None => std::future::pending().await,
                }
            } => match finished {
                Err(e) if e.is_panic() => {
                    error!("INTAKE | Connection handler panicked: {e:?}");
                    continue;
                }
                Ok(()) | Err(_) => continue,
            },
        };
        let conn = TokioIo::new(conn);
        let server = server.clone();
        let service = service.clone();
        joinset.spawn(async move {
            if let Err(e) = server.serve_connection(conn, service).await {
                debug!("INTAKE | Connection error: {e}");
            }
        });
    }

    debug!(
        "INTAKE | Listener stopped, waiting for {} open connections",
        joinset.len()
    );
    let drained = tokio::time::timeout(CONNECTION_DRAIN_TIMEOUT, async {
        while joinset.join_next().await.is_some() {}
    })
    .await;
    if drained.is_err() {
        debug!("INTAKE | Closing idle connections");
        joinset.shutdown().await;
    }
    Ok(())
}
