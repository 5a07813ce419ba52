// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::env;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use log_sink::{SinkConfig, SinkError};

const DEFAULT_INTAKE_PORT: u16 = 8080;
const DEFAULT_INTAKE_HOST: IpAddr = IpAddr::V4(Ipv4Addr::UNSPECIFIED);
const DEFAULT_MAX_REQUEST_BYTES: usize = 1024 * 1024;

#[derive(Debug, Clone)]
pub struct IntakeConfig {
    pub host: IpAddr,
    pub port: u16,
    /// Largest accepted request body
    pub max_request_bytes: usize,
    pub sink: SinkConfig,
}

impl IntakeConfig {
    pub fn from_env() -> Result<Self, SinkError> {
        let host = match env::var("LOG_INTAKE_HOST") {
            Ok(host) => host.trim().parse::<IpAddr>().map_err(|e| {
                SinkError::InvalidConfig(format!("LOG_INTAKE_HOST '{host}' is not an IP address: {e}"))
            })?,
            Err(_) => DEFAULT_INTAKE_HOST,
        };
        let port = env::var("LOG_INTAKE_PORT")
            .ok()
            .and_then(|port| port.trim().parse::<u16>().ok())
            .unwrap_or(DEFAULT_INTAKE_PORT);
        let max_request_bytes = env::var("LOG_INTAKE_MAX_REQUEST_BYTES")
            .ok()
            .and_then(|size| size.trim().parse::<usize>().ok())
            .filter(|size| *size > 0)
            .unwrap_or(DEFAULT_MAX_REQUEST_BYTES);

        Ok(IntakeConfig {
            host,
            port,
            max_request_bytes,
            sink: SinkConfig::from_env()?,
        })
    }

    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.port)
    }
}
