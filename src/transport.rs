//! Delivery of encoded chunks to Wavefront, either directly or through a proxy.

use std::collections::HashMap;
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::time::Duration;

use reqwest::header::{AUTHORIZATION, CONTENT_TYPE};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tracing::debug;

use crate::common::{HISTOGRAM_FORMAT, METRIC_FORMAT, SPAN_LOG_FORMAT, TRACING_SPAN_FORMAT};

/// Status reported by transports that have no HTTP response to relay.
pub const ACCEPTED: u16 = 202;

/// Delivers one chunk of newline-terminated records.
///
/// Returns the HTTP-style status of the delivery, or an I/O error when the payload could not
/// be handed over at all.
pub trait Transport: Send + Sync {
    fn report(
        &self,
        format: &'static str,
        payload: Vec<u8>,
    ) -> impl Future<Output = io::Result<u16>> + Send;

    /// Releases connections held by the transport.
    fn close(&self) -> impl Future<Output = io::Result<()>> + Send {
        async { Ok(()) }
    }

    /// Short identifier used in self-metric names and thread names.
    fn name(&self) -> &'static str;
}

type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Object-safe version of [`Transport`], so the sender can hold any transport.
pub trait TransportBoxed: Send + Sync {
    fn report_boxed(&self, format: &'static str, payload: Vec<u8>) -> BoxFuture<'_, io::Result<u16>>;

    fn close_boxed(&self) -> BoxFuture<'_, io::Result<()>>;

    fn name(&self) -> &'static str;
}

impl<T: Transport> TransportBoxed for T {
    fn report_boxed(&self, format: &'static str, payload: Vec<u8>) -> BoxFuture<'_, io::Result<u16>> {
        Box::pin(self.report(format, payload))
    }

    fn close_boxed(&self) -> BoxFuture<'_, io::Result<()>> {
        Box::pin(self.close())
    }

    fn name(&self) -> &'static str {
        Transport::name(self)
    }
}

/// Builds the report endpoint for `format` from a server URL.
///
/// Trailing slashes and an existing `/report` path suffix are ignored, so
/// `https://domain.wavefront.com/report/` and `https://domain.wavefront.com` both resolve to
/// `https://domain.wavefront.com/report?f=<format>`.
pub fn reporting_url(server: &str, format: &str) -> String {
    let mut base = server.trim_end_matches('/');
    if let Some(stripped) = base.strip_suffix("/report") {
        base = stripped.trim_end_matches('/');
    }
    format!("{}/report?f={}", base, format)
}

/// Sends chunks straight to a Wavefront cluster over HTTP(S).
pub struct HttpTransport {
    client: reqwest::Client,
    server: String,
    token: Option<String>,
}

impl HttpTransport {
    pub fn new(server: impl Into<String>, token: Option<String>) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self {
            client,
            server: server.into(),
            token,
        })
    }
}

impl Transport for HttpTransport {
    async fn report(&self, format: &'static str, payload: Vec<u8>) -> io::Result<u16> {
        let mut request = self
            .client
            .post(reporting_url(&self.server, format))
            .header(CONTENT_TYPE, "application/octet-stream")
            .body(payload);
        if let Some(token) = &self.token {
            request = request.header(AUTHORIZATION, format!("Bearer {}", token));
        }

        let response = request
            .send()
            .await
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
        Ok(response.status().as_u16())
    }

    fn name(&self) -> &'static str {
        "direct"
    }
}

/// Streams chunks to a Wavefront proxy over plain TCP, one connection per port.
///
/// Metrics go to the metrics port, histograms to the distribution port, spans and span logs to
/// the tracing port. Connections are opened on first use and re-opened after a write fails.
pub struct ProxyTransport {
    host: String,
    ports: HashMap<&'static str, u16>,
    connections: Mutex<HashMap<u16, TcpStream>>,
}

impl ProxyTransport {
    pub fn new(
        host: impl Into<String>,
        metrics_port: Option<u16>,
        distribution_port: Option<u16>,
        tracing_port: Option<u16>,
    ) -> Self {
        let mut ports = HashMap::new();
        if let Some(port) = metrics_port {
            ports.insert(METRIC_FORMAT, port);
        }
        if let Some(port) = distribution_port {
            ports.insert(HISTOGRAM_FORMAT, port);
        }
        if let Some(port) = tracing_port {
            ports.insert(TRACING_SPAN_FORMAT, port);
            ports.insert(SPAN_LOG_FORMAT, port);
        }
        Self {
            host: host.into(),
            ports,
            connections: Mutex::new(HashMap::new()),
        }
    }
}

impl Transport for ProxyTransport {
    async fn report(&self, format: &'static str, payload: Vec<u8>) -> io::Result<u16> {
        let port = *self.ports.get(format).ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::Unsupported,
                format!("no proxy port configured for format `{}`", format),
            )
        })?;

        let mut connections = self.connections.lock().await;
        if !connections.contains_key(&port) {
            debug!("connecting to Wavefront proxy at {}:{}", self.host, port);
            let stream = TcpStream::connect((self.host.as_str(), port)).await?;
            connections.insert(port, stream);
        }
        let stream = match connections.get_mut(&port) {
            Some(stream) => stream,
            None => return Err(io::Error::from(io::ErrorKind::NotConnected)),
        };

        let written = match stream.write_all(&payload).await {
            Ok(()) => stream.flush().await,
            Err(e) => Err(e),
        };
        if let Err(e) = written {
            // Force a reconnect on the next report.
            connections.remove(&port);
            return Err(e);
        }
        Ok(ACCEPTED)
    }

    async fn close(&self) -> io::Result<()> {
        let mut connections = self.connections.lock().await;
        for (_, mut stream) in connections.drain() {
            stream.shutdown().await?;
        }
        Ok(())
    }

    fn name(&self) -> &'static str {
        "proxy"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    #[test]
    fn test_reporting_url() {
        let cases = [
            ("http://127.0.0.1:2878", "http://127.0.0.1:2878/report?f=wavefront"),
            ("http://127.0.0.1:2878/", "http://127.0.0.1:2878/report?f=wavefront"),
            ("http://127.0.0.1:2878////", "http://127.0.0.1:2878/report?f=wavefront"),
            ("http://localhost:2878/report", "http://localhost:2878/report?f=wavefront"),
            ("http://localhost:2878/report/", "http://localhost:2878/report?f=wavefront"),
            (
                "http://corp.proxies.acme.com:2878/prod/report/",
                "http://corp.proxies.acme.com:2878/prod/report?f=wavefront",
            ),
            ("https://domain.wavefront.com", "https://domain.wavefront.com/report?f=wavefront"),
            ("https://domain.wavefront.com/", "https://domain.wavefront.com/report?f=wavefront"),
            (
                "https://domain.wavefront.com/report/",
                "https://domain.wavefront.com/report?f=wavefront",
            ),
        ];
        for (server, expected) in cases {
            assert_eq!(reporting_url(server, METRIC_FORMAT), expected, "{}", server);
        }
    }

    #[tokio::test]
    async fn http_transport_posts_chunk_with_token() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/report")
            .match_query(mockito::Matcher::UrlEncoded("f".into(), "histogram".into()))
            .match_header("authorization", "Bearer secret")
            .match_body("!M #1 2.0 \"latency\" source=\"h\"\n")
            .with_status(202)
            .create_async()
            .await;

        let transport = HttpTransport::new(server.url(), Some("secret".to_string())).unwrap();
        let status = transport
            .report(
                HISTOGRAM_FORMAT,
                b"!M #1 2.0 \"latency\" source=\"h\"\n".to_vec(),
            )
            .await
            .unwrap();

        assert_eq!(status, 202);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn http_transport_relays_rejections() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", "/report")
            .match_query(mockito::Matcher::Any)
            .with_status(403)
            .create_async()
            .await;

        let transport = HttpTransport::new(server.url(), None).unwrap();
        let status = transport
            .report(TRACING_SPAN_FORMAT, b"span\n".to_vec())
            .await
            .unwrap();
        assert_eq!(status, 403);
    }

    #[tokio::test]
    async fn proxy_transport_writes_to_format_port() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let transport = ProxyTransport::new("127.0.0.1", None, None, Some(port));

        let status = transport
            .report(SPAN_LOG_FORMAT, b"{\"traceId\":\"x\"}\n".to_vec())
            .await
            .unwrap();
        assert_eq!(status, ACCEPTED);
        transport.close().await.unwrap();

        let (mut socket, _) = listener.accept().await.unwrap();
        let mut received = String::new();
        socket.read_to_string(&mut received).await.unwrap();
        assert_eq!(received, "{\"traceId\":\"x\"}\n");
    }

    #[tokio::test]
    async fn proxy_transport_rejects_unconfigured_format() {
        let transport = ProxyTransport::new("127.0.0.1", Some(1), None, None);
        let err = transport
            .report(HISTOGRAM_FORMAT, b"!M #1 1.0 \"x\" source=\"y\"\n".to_vec())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::Unsupported);
    }
}
