//! Delivery of a finished build document to a log-collector intake.
//!
//! The intake speaks newline-framed JSON over TLS. Mutual TLS is optional;
//! when a client certificate is configured its key must be configured too.

use std::fs;
use std::io::Write;
use std::net::TcpStream;
use std::path::PathBuf;
use std::time::Duration;

use native_tls::{Certificate, Identity, TlsConnector};
use tracing::info;

use crate::error::{FlakrsError, Result};
use crate::model::BuildResults;

#[derive(Debug, Clone)]
pub struct CollectorConfig {
    pub host: String,
    pub port: u16,
    /// Socket timeout for connect and write, in seconds.
    pub timeout_secs: u64,
    /// Extra root CA to trust, PEM.
    pub ca_file: Option<PathBuf>,
    /// Client certificate chain for mutual TLS, PEM. Requires `client_key`.
    pub client_cert: Option<PathBuf>,
    pub client_key: Option<PathBuf>,
}

impl CollectorConfig {
    pub fn new(host: &str, port: u16) -> Self {
        Self {
            host: host.to_string(),
            port,
            timeout_secs: 10,
            ca_file: None,
            client_cert: None,
            client_key: None,
        }
    }
}

fn build_connector(config: &CollectorConfig) -> Result<TlsConnector> {
    let mut builder = TlsConnector::builder();

    if let Some(ca_file) = &config.ca_file {
        let pem = fs::read(ca_file)?;
        let cert = Certificate::from_pem(&pem).map_err(|e| FlakrsError::Tls(e.to_string()))?;
        builder.add_root_certificate(cert);
    }

    match (&config.client_cert, &config.client_key) {
        (Some(cert_file), Some(key_file)) => {
            let cert_pem = fs::read(cert_file)?;
            let key_pem = fs::read(key_file)?;
            let identity = Identity::from_pkcs8(&cert_pem, &key_pem)
                .map_err(|e| FlakrsError::Tls(e.to_string()))?;
            builder.identity(identity);
        }
        (None, None) => {}
        _ => {
            return Err(FlakrsError::Tls(
                "client certificate and key must both be set or both be unset".to_string(),
            ))
        }
    }

    builder
        .build()
        .map_err(|e| FlakrsError::Tls(e.to_string()))
}

/// Serialize the build document and send it to the collector.
pub fn send_build(config: &CollectorConfig, build: &BuildResults) -> Result<()> {
    let connector = build_connector(config)?;
    let timeout = Duration::from_secs(config.timeout_secs);

    let tcp = TcpStream::connect((config.host.as_str(), config.port))?;
    tcp.set_write_timeout(Some(timeout))?;
    tcp.set_read_timeout(Some(timeout))?;

    let mut stream = connector
        .connect(&config.host, tcp)
        .map_err(|e| FlakrsError::Tls(e.to_string()))?;

    let mut payload = serde_json::to_vec(build)?;
    payload.push(b'\n');
    stream.write_all(&payload)?;
    stream.flush()?;

    info!(
        host = %config.host,
        port = config.port,
        job_name = %build.job_name,
        build_id = %build.build_id,
        bytes = payload.len(),
        "sent build results to collector"
    );
    Ok(())
}
