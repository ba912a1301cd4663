//! Bounded HTTP fetching.
//!
//! Bodies stream in chunks against the configured size cap, so an
//! adversarially large response costs at most `max_body_bytes` of memory
//! before it is rejected with `Oversize`.

use std::time::Duration;

use crate::error::{Error, Result};

/// One successfully fetched body.
#[derive(Debug, Clone)]
pub struct FetchedBody {
    pub bytes: Vec<u8>,
    pub content_type: Option<String>,
}

/// Build the shared outbound client: identification header, timeout, TLS
/// verification on, redirect cap of 5.
pub fn build_client(user_agent: &str, timeout: Duration) -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .user_agent(user_agent)
        .timeout(timeout)
        .redirect(reqwest::redirect::Policy::limited(5))
        .build()
        .map_err(|e| Error::Internal(format!("http client build failed: {e}")))
}

/// GET with response classification per the crawler failure model:
/// network/TLS/timeout/5xx/408 are transient, 429 carries `Retry-After`,
/// remaining 4xx are fatal for the target.
pub async fn fetch_bounded(
    client: &reqwest::Client,
    url: &str,
    max_body_bytes: usize,
) -> Result<FetchedBody> {
    let response = client.get(url).send().await.map_err(classify_transport)?;

    let status = response.status();
    if let Some(err) = classify_status(status, &response) {
        return Err(err);
    }

    let content_type = response
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    // Reject on the declared length when present, then enforce while
    // streaming regardless.
    if let Some(declared) = response.content_length() {
        if declared as usize > max_body_bytes {
            return Err(Error::Oversize { limit: max_body_bytes });
        }
    }

    let mut body = Vec::new();
    let mut response = response;
    while let Some(chunk) = response.chunk().await.map_err(classify_transport)? {
        if body.len() + chunk.len() > max_body_bytes {
            return Err(Error::Oversize { limit: max_body_bytes });
        }
        body.extend_from_slice(&chunk);
    }

    Ok(FetchedBody {
        bytes: body,
        content_type,
    })
}

fn classify_transport(e: reqwest::Error) -> Error {
    if e.is_timeout() {
        Error::Network(format!("timeout: {e}"))
    } else if e.is_connect() {
        Error::Network(format!("connect: {e}"))
    } else if e.is_redirect() {
        Error::Internal(format!("redirect limit exceeded: {e}"))
    } else {
        Error::Network(e.to_string())
    }
}

fn classify_status(status: reqwest::StatusCode, response: &reqwest::Response) -> Option<Error> {
    if status.is_success() {
        return None;
    }
    if status.as_u16() == 429 {
        let retry_after = response
            .headers()
            .get(reqwest::header::RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok())
            .map(Duration::from_secs);
        return Some(Error::RateLimited { retry_after });
    }
    if status.as_u16() == 408 || status.is_server_error() {
        return Some(Error::Network(format!("status {status}")));
    }
    // Remaining client errors quarantine the target.
    Some(match status.as_u16() {
        401 => Error::Unauthorized(format!("{status} from origin")),
        403 => Error::Forbidden(format!("{status} from origin")),
        404 | 410 => Error::NotFound(format!("{status} from origin")),
        _ => Error::Internal(format!("unexpected status {status}")),
    })
}
