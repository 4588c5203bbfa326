//! HTTP health probe over hyper.

use std::time::{Duration, Instant};

use http::Uri;
use tracing::debug;

use crate::contract::{BoxFuture, CallResult, CollaboratorError, HealthProbe, HealthSample};

/// Issues a plain `GET` against the deployed container.
///
/// Only `http://` endpoints are probed; containers are reached on their
/// private address, not through TLS termination.
#[derive(Debug, Clone, Default)]
pub struct HttpHealthProbe {
    user_agent: Option<String>,
}

impl HttpHealthProbe {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = Some(user_agent.into());
        self
    }

    async fn probe(&self, url: &str, path: &str) -> CallResult<HealthSample> {
        let target = join_url(url, path);
        let uri: Uri = target
            .parse()
            .map_err(|e| CollaboratorError::fatal(format!("invalid health url {target:?}: {e}")))?;

        match uri.scheme_str() {
            Some("http") => {}
            Some(other) => {
                return Err(CollaboratorError::fatal(format!(
                    "unsupported health check scheme {other:?}"
                )));
            }
            None => {
                return Err(CollaboratorError::fatal(format!(
                    "health url {target:?} has no scheme"
                )));
            }
        }
        let authority = uri
            .authority()
            .ok_or_else(|| CollaboratorError::fatal(format!("health url {target:?} has no host")))?
            .clone();
        let address = match authority.port_u16() {
            Some(_) => authority.as_str().to_string(),
            None => format!("{}:80", authority.host()),
        };

        let started = Instant::now();
        let stream = tokio::net::TcpStream::connect(&address).await.map_err(|e| {
            debug!(error = %e, %target, "health probe connection failed");
            CollaboratorError::retryable(format!("connect {address}: {e}"))
        })?;

        let io = hyper_util::rt::TokioIo::new(stream);
        let (mut sender, conn) = hyper::client::conn::http1::handshake(io)
            .await
            .map_err(|e| CollaboratorError::retryable(format!("handshake with {address}: {e}")))?;

        tokio::spawn(async move {
            let _ = conn.await;
        });

        let path_and_query = uri
            .path_and_query()
            .map(|p| p.as_str().to_string())
            .unwrap_or_else(|| "/".to_string());
        let req = http::Request::builder()
            .method("GET")
            .uri(path_and_query)
            .header("host", authority.as_str())
            .header(
                "user-agent",
                self.user_agent.as_deref().unwrap_or("deployd-health/0.1"),
            )
            .body(http_body_util::Empty::<bytes::Bytes>::new())
            .map_err(|e| CollaboratorError::fatal(format!("build probe request: {e}")))?;

        let resp = sender.send_request(req).await.map_err(|e| {
            debug!(error = %e, %target, "health probe request failed");
            CollaboratorError::retryable(format!("request {target}: {e}"))
        })?;

        Ok(HealthSample {
            status_code: resp.status().as_u16(),
            latency: started.elapsed(),
        })
    }
}

impl HealthProbe for HttpHealthProbe {
    fn check<'a>(
        &'a self,
        url: &'a str,
        path: &'a str,
        timeout: Duration,
    ) -> BoxFuture<'a, CallResult<HealthSample>> {
        Box::pin(async move {
            match tokio::time::timeout(timeout, self.probe(url, path)).await {
                Ok(result) => result,
                Err(_) => Err(CollaboratorError::retryable(format!(
                    "health probe timed out after {timeout:?}"
                ))),
            }
        })
    }
}

fn join_url(url: &str, path: &str) -> String {
    let base = url.trim_end_matches('/');
    if path.starts_with('/') {
        format!("{base}{path}")
    } else {
        format!("{base}/{path}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Serve one canned response per connection, forever.
    async fn serve(status_line: &'static str) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let Ok((mut socket, _)) = listener.accept().await else {
                    return;
                };
                tokio::spawn(async move {
                    let mut buf = [0u8; 1024];
                    let _ = socket.read(&mut buf).await;
                    let response =
                        format!("HTTP/1.1 {status_line}\r\ncontent-length: 0\r\nconnection: close\r\n\r\n");
                    let _ = socket.write_all(response.as_bytes()).await;
                    let _ = socket.shutdown().await;
                });
            }
        });
        format!("http://{addr}")
    }

    #[test]
    fn join_handles_slashes() {
        assert_eq!(join_url("http://h:1/", "/healthz"), "http://h:1/healthz");
        assert_eq!(join_url("http://h:1", "healthz"), "http://h:1/healthz");
    }

    #[tokio::test]
    async fn reports_2xx() {
        let url = serve("200 OK").await;
        let sample = HttpHealthProbe::new()
            .check(&url, "/healthz", Duration::from_secs(2))
            .await
            .unwrap();
        assert_eq!(sample.status_code, 200);
        assert!(sample.is_healthy());
    }

    #[tokio::test]
    async fn reports_5xx_as_sample() {
        let url = serve("500 Internal Server Error").await;
        let sample = HttpHealthProbe::new()
            .check(&url, "/healthz", Duration::from_secs(2))
            .await
            .unwrap();
        assert_eq!(sample.status_code, 500);
        assert!(!sample.is_healthy());
    }

    #[tokio::test]
    async fn closed_port_is_retryable_error() {
        // Bind then drop to get a port nothing listens on.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let err = HttpHealthProbe::new()
            .check(&format!("http://{addr}"), "/healthz", Duration::from_secs(2))
            .await
            .unwrap_err();
        assert!(err.retryable);
    }

    #[tokio::test]
    async fn https_is_rejected() {
        let err = HttpHealthProbe::new()
            .check("https://10.0.0.5:8443", "/healthz", Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(!err.retryable);
        assert!(err.message.contains("https"));
    }
}
