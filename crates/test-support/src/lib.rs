use anyhow::Context as _;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

/// Bind an ephemeral localhost port for an in-process test server.
///
/// Returns the listener together with its bound address so tests can point
/// clients at it before the server task starts accepting.
///
/// # Errors
///
/// Returns an error if binding fails or the local address cannot be read.
pub async fn bind_local() -> anyhow::Result<(tokio::net::TcpListener, SocketAddr)> {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .context("bind ephemeral port")?;
    let addr = listener.local_addr().context("read bound address")?;
    Ok((listener, addr))
}

/// Poll an HTTP URL until it returns a success status (2xx/3xx).
///
/// # Errors
///
/// Returns an error if the timeout elapses before the endpoint answers with
/// a success status.
pub async fn wait_http_ok(url: &str, timeout_dur: Duration) -> anyhow::Result<()> {
    let client = reqwest::Client::new();
    let start = Instant::now();
    loop {
        if start.elapsed() > timeout_dur {
            anyhow::bail!("timed out waiting for {url}");
        }

        match client.get(url).send().await {
            Ok(resp) if resp.status().is_success() => return Ok(()),
            _ => tokio::time::sleep(Duration::from_millis(50)).await,
        }
    }
}
