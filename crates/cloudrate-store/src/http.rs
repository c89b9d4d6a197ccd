//! HTTP plumbing shared by the remote backends.

use std::time::Duration;

use reqwest::{Certificate, Client, Identity, Response};
use serde::de::DeserializeOwned;

use crate::config::TlsOptions;
use crate::error::{Result, StoreError};

/// Build an HTTP client honouring the TLS options.
///
/// # Errors
///
/// Returns `StoreError::Configuration` if a certificate file cannot be read
/// or parsed.
pub(crate) fn build_client(tls: &TlsOptions, timeout_seconds: u64) -> Result<Client> {
    let mut builder = Client::builder()
        .timeout(Duration::from_secs(timeout_seconds))
        .danger_accept_invalid_certs(tls.insecure);

    if let Some(cafile) = &tls.cafile {
        let pem = read_pem(cafile)?;
        let certificate = Certificate::from_pem(&pem)
            .map_err(|e| StoreError::Configuration(format!("invalid CA bundle: {e}")))?;
        builder = builder.add_root_certificate(certificate);
    }

    if let Some(cert) = &tls.client_cert {
        let mut pem = read_pem(cert)?;
        if let Some(key) = &tls.client_key {
            pem.push(b'\n');
            pem.extend(read_pem(key)?);
        }
        let identity = Identity::from_pem(&pem)
            .map_err(|e| StoreError::Configuration(format!("invalid client certificate: {e}")))?;
        builder = builder.identity(identity);
    }

    builder
        .build()
        .map_err(|e| StoreError::Configuration(format!("failed to build HTTP client: {e}")))
}

fn read_pem(path: &std::path::Path) -> Result<Vec<u8>> {
    std::fs::read(path)
        .map_err(|e| StoreError::Configuration(format!("cannot read {}: {e}", path.display())))
}

/// Trim trailing slashes off a configured base URL.
pub(crate) fn base_url(url: &str) -> Result<String> {
    let trimmed = url.trim().trim_end_matches('/');
    if trimmed.is_empty() {
        return Err(StoreError::Configuration("backend URL is empty".into()));
    }
    Ok(trimmed.to_string())
}

/// Pass 2xx responses through, turn anything else into
/// `StoreError::InvalidStatusCode`.
pub(crate) async fn check_status(response: Response, expected: u16, query: &str) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(StoreError::InvalidStatusCode {
        expected,
        actual: status.as_u16(),
        body,
        query: query.to_string(),
    })
}

/// Check the status, then decode the JSON body.
pub(crate) async fn json_body<T: DeserializeOwned>(
    response: Response,
    expected: u16,
    query: &str,
) -> Result<T> {
    let response = check_status(response, expected, query).await?;
    let bytes = response.bytes().await?;
    Ok(serde_json::from_slice(&bytes)?)
}
