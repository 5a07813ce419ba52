// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::error::Error;
use std::time::Duration;

use tracing::{debug, error};

/// Builds the shared HTTP client used for every store request.
///
/// Falls back to a client without proxy when the proxy URL cannot be used,
/// and to reqwest's defaults as a last resort.
#[must_use]
pub fn get_client(proxy_url: Option<&str>, timeout: Duration) -> reqwest::Client {
    build_client(proxy_url, timeout).unwrap_or_else(|e| {
        error!(
            "HTTP | Unable to create client with proxy {:?}: {e}. Retrying without proxy",
            proxy_url
        );
        build_client(None, timeout).unwrap_or_else(|e| {
            error!("HTTP | Unable to create client: {e}. Using default client");
            reqwest::Client::new()
        })
    })
}

pub fn build_client(
    proxy_url: Option<&str>,
    timeout: Duration,
) -> Result<reqwest::Client, Box<dyn Error>> {
    let mut builder = reqwest::Client::builder()
        .timeout(timeout)
        // Keep idle connections open between batches
        .pool_idle_timeout(Some(Duration::from_secs(270)))
        .tcp_keepalive(Some(Duration::from_secs(120)));

    if let Some(proxy) = proxy_url {
        debug!("HTTP | Using HTTPS proxy {proxy}");
        builder = builder.proxy(reqwest::Proxy::https(proxy)?);
    }

    Ok(builder.build()?)
}
