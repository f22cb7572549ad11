//! Resolve-artifacts controller: fetch URLs to local paths before any
//! dependent step runs. Idempotent — already-present files are kept.

use std::collections::BTreeMap;
use std::path::Path;

use tokio::io::AsyncWriteExt;
use tokio::sync::watch;
use tracing::{debug, info};

use flotilla_core::RunSpec;

use crate::error::{DeployError, DeployResult};
use crate::steps::StepContext;

pub async fn run(
    _ctx: StepContext,
    spec: RunSpec,
    urls: BTreeMap<String, String>,
    mut shutdown: watch::Receiver<bool>,
) -> DeployResult<()> {
    let path = spec.id().clone();
    info!(run_spec = %path, count = urls.len(), "resolving artifacts");

    for (url, dest) in urls {
        if Path::new(&dest).exists() {
            debug!(%url, %dest, "artifact already resolved");
            continue;
        }
        tokio::select! {
            _ = shutdown.changed() => {
                return Err(DeployError::Cancelled(format!(
                    "artifact resolution of {path} shut down"
                )));
            }
            result = download(&url, &dest) => result?,
        }
    }
    Ok(())
}

/// Fetch one URL to `dest` over plain HTTP.
async fn download(url: &str, dest: &str) -> DeployResult<()> {
    let (host, port, request_path) = parse_http_url(url).ok_or_else(|| {
        DeployError::ArtifactFailed {
            url: url.to_string(),
            reason: "only http:// urls are supported".to_string(),
        }
    })?;

    let failed = |reason: String| DeployError::ArtifactFailed {
        url: url.to_string(),
        reason,
    };

    let stream = tokio::net::TcpStream::connect((host.as_str(), port))
        .await
        .map_err(|e| failed(e.to_string()))?;
    let io = hyper_util::rt::TokioIo::new(stream);
    let (mut sender, conn) = hyper::client::conn::http1::handshake(io)
        .await
        .map_err(|e| failed(e.to_string()))?;
    tokio::spawn(async move {
        let _ = conn.await;
    });

    let req = http::Request::builder()
        .method("GET")
        .uri(&request_path)
        .header("host", &host)
        .body(http_body_util::Empty::<bytes::Bytes>::new())
        .map_err(|e| failed(e.to_string()))?;

    let resp = sender
        .send_request(req)
        .await
        .map_err(|e| failed(e.to_string()))?;
    if !resp.status().is_success() {
        return Err(failed(format!("status {}", resp.status())));
    }

    use http_body_util::BodyExt;
    let body = resp
        .into_body()
        .collect()
        .await
        .map_err(|e| failed(e.to_string()))?
        .to_bytes();

    if let Some(parent) = Path::new(dest).parent() {
        if !parent.as_os_str().is_empty() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| failed(e.to_string()))?;
        }
    }
    let mut file = tokio::fs::File::create(dest)
        .await
        .map_err(|e| failed(e.to_string()))?;
    file.write_all(&body)
        .await
        .map_err(|e| failed(e.to_string()))?;
    debug!(%url, %dest, bytes = body.len(), "artifact downloaded");
    Ok(())
}

/// Split `http://host[:port]/path` into its parts.
fn parse_http_url(url: &str) -> Option<(String, u16, String)> {
    let rest = url.strip_prefix("http://")?;
    let (authority, request_path) = match rest.find('/') {
        Some(i) => (&rest[..i], rest[i..].to_string()),
        None => (rest, "/".to_string()),
    };
    let (host, port) = match authority.rsplit_once(':') {
        Some((h, p)) => (h.to_string(), p.parse().ok()?),
        None => (authority.to_string(), 80),
    };
    Some((host, port, request_path))
}
