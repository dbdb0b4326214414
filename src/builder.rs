use std::future::Future;
use std::pin::Pin;
use std::thread;
use std::time::Duration;

use reqwest::Url;
use tokio::runtime;
use tracing::{debug, warn};

use crate::common::BuildError;
use crate::hostname;
use crate::recorder::{Inner, WavefrontSender};
use crate::transport::{HttpTransport, ProxyTransport, Transport, TransportBoxed};

/// The periodic flush loop. It completes once the sender is closed.
pub type ExporterFuture = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

const DEFAULT_MAX_QUEUE_SIZE: usize = 50_000;
const DEFAULT_BATCH_SIZE: usize = 10_000;
const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_secs(1);
const INITIAL_FLUSH_DELAY: Duration = Duration::from_secs(1);

enum ExporterConfig {
    DirectIngestion {
        server: String,
        token: Option<String>,
    },
    Proxy {
        host: String,
        metrics_port: Option<u16>,
        distribution_port: Option<u16>,
        tracing_port: Option<u16>,
    },
    Custom(Box<dyn TransportBoxed>),
    Unconfigured,
}

impl ExporterConfig {
    fn as_type_str(&self) -> &'static str {
        match self {
            Self::DirectIngestion { .. } => "direct",
            Self::Proxy { .. } => "proxy",
            Self::Custom(transport) => transport.name(),
            Self::Unconfigured => "unconfigured",
        }
    }

    fn client_id(&self) -> String {
        match self {
            Self::DirectIngestion { server, .. } => server.clone(),
            Self::Proxy { host, .. } => host.clone(),
            Self::Custom(_) | Self::Unconfigured => "custom".to_string(),
        }
    }

    fn into_transport(self) -> Result<Box<dyn TransportBoxed>, BuildError> {
        match self {
            Self::DirectIngestion { server, token } => {
                let transport = HttpTransport::new(server, token)
                    .map_err(|e| BuildError::HttpClient(e.to_string()))?;
                Ok(Box::new(transport))
            }
            Self::Proxy {
                host,
                metrics_port,
                distribution_port,
                tracing_port,
            } => Ok(Box::new(ProxyTransport::new(
                host,
                metrics_port,
                distribution_port,
                tracing_port,
            ))),
            Self::Custom(transport) => Ok(transport),
            Self::Unconfigured => Err(BuildError::MissingExporterConfiguration),
        }
    }
}

/// Builder for creating and installing a Wavefront sender and its flush loop.
pub struct WavefrontBuilder {
    exporter_config: ExporterConfig,
    max_queue_size: usize,
    batch_size: usize,
    message_size_bytes: usize,
    flush_interval: Duration,
    initial_delay: Duration,
    default_source: Option<String>,
}

impl WavefrontBuilder {
    /// Creates a new [`WavefrontBuilder`].
    pub fn new() -> Self {
        Self {
            exporter_config: ExporterConfig::Unconfigured,
            max_queue_size: DEFAULT_MAX_QUEUE_SIZE,
            batch_size: DEFAULT_BATCH_SIZE,
            message_size_bytes: usize::MAX,
            flush_interval: DEFAULT_FLUSH_INTERVAL,
            initial_delay: INITIAL_FLUSH_DELAY,
            default_source: None,
        }
    }

    /// Configures the sender to report straight to a Wavefront cluster over HTTP(S).
    ///
    /// `server` may be given with or without a trailing `/report`. The token, if any, is sent as
    /// a bearer token.
    ///
    /// ## Errors
    ///
    /// If `server` is not an `http://` or `https://` URL, an error variant will be returned.
    pub fn with_direct_ingestion<S>(mut self, server: S, token: Option<String>) -> Result<Self, BuildError>
    where
        S: Into<String>,
    {
        let server = server.into();
        let url = Url::parse(&server).map_err(|_| BuildError::InvalidServerUrl(server.clone()))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(BuildError::InvalidServerUrl(server));
        }

        self.exporter_config = ExporterConfig::DirectIngestion { server, token };
        Ok(self)
    }

    /// Configures the sender to report through a Wavefront proxy.
    ///
    /// Kinds whose port is not set cannot be delivered; flushing them fails at the transport.
    ///
    /// ## Errors
    ///
    /// If none of the ports is set, an error variant will be returned.
    pub fn with_proxy<H>(
        mut self,
        host: H,
        metrics_port: Option<u16>,
        distribution_port: Option<u16>,
        tracing_port: Option<u16>,
    ) -> Result<Self, BuildError>
    where
        H: Into<String>,
    {
        let host = host.into();
        if metrics_port.is_none() && distribution_port.is_none() && tracing_port.is_none() {
            return Err(BuildError::MissingProxyPort(host));
        }

        self.exporter_config = ExporterConfig::Proxy {
            host,
            metrics_port,
            distribution_port,
            tracing_port,
        };
        Ok(self)
    }

    /// Configures the sender to deliver through a caller-provided transport.
    pub fn with_transport<T>(mut self, transport: T) -> Self
    where
        T: Transport + 'static,
    {
        self.exporter_config = ExporterConfig::Custom(Box::new(transport));
        self
    }

    /// Sets the capacity of each per-kind buffer. Entities sent while a buffer is full are dropped.
    ///
    /// Defaults to 50,000.
    pub fn set_max_queue_size(mut self, size: usize) -> Result<Self, BuildError> {
        if size == 0 {
            return Err(BuildError::ZeroLimit("max queue size"));
        }
        self.max_queue_size = size;
        Ok(self)
    }

    /// Sets how many records of one kind a single flush cycle takes off its buffer.
    ///
    /// Defaults to 10,000.
    pub fn set_batch_size(mut self, size: usize) -> Result<Self, BuildError> {
        if size == 0 {
            return Err(BuildError::ZeroLimit("batch size"));
        }
        self.batch_size = size;
        Ok(self)
    }

    /// Caps the size of one delivery in bytes. Records larger than this are dropped.
    ///
    /// Unbounded by default.
    pub fn set_message_size_bytes(mut self, size: usize) -> Result<Self, BuildError> {
        if size == 0 {
            return Err(BuildError::ZeroLimit("message size"));
        }
        self.message_size_bytes = size;
        Ok(self)
    }

    /// Sets the time between flush cycles.
    ///
    /// Defaults to one second.
    pub fn set_flush_interval(mut self, interval: Duration) -> Result<Self, BuildError> {
        if interval.is_zero() {
            return Err(BuildError::ZeroLimit("flush interval"));
        }
        self.flush_interval = interval;
        Ok(self)
    }

    /// Sets the source written for entities sent without one.
    ///
    /// Defaults to the local host name.
    pub fn set_default_source<S>(mut self, source: S) -> Self
    where
        S: Into<String>,
    {
        self.default_source = Some(source.into());
        self
    }

    /// Builds the sender and the flush loop and runs the loop in the background.
    ///
    /// When called from within a Tokio runtime, the exporter future is spawned directly
    /// into the runtime.  Otherwise, a new single-threaded Tokio runtime is created
    /// on a background thread, and the exporter is spawned there.
    ///
    /// ## Errors
    ///
    /// If there is an error while either building the sender, or spawning the exporter, an error
    /// variant will be returned describing the error.
    pub fn install(self) -> Result<WavefrontSender, BuildError> {
        if let Ok(handle) = runtime::Handle::try_current() {
            let (sender, exporter) = self.build()?;
            handle.spawn(exporter);
            Ok(sender)
        } else {
            let thread_name = format!(
                "wavefront-sender-{}",
                self.exporter_config.as_type_str()
            );

            let runtime = runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .map_err(|e| BuildError::FailedToCreateRuntime(e.to_string()))?;

            let (sender, exporter) = self.build()?;

            thread::Builder::new()
                .name(thread_name)
                .spawn(move || runtime.block_on(exporter))
                .map_err(|e| BuildError::FailedToCreateRuntime(e.to_string()))?;

            Ok(sender)
        }
    }

    /// Builds the sender and the exporter future that flushes it periodically.
    ///
    /// In most cases, users should prefer to use [`install`][WavefrontBuilder::install]. This
    /// method is for callers that need to schedule the exporter themselves. The loop waits one
    /// second before the first flush and stops after [`WavefrontSender::close`].
    ///
    /// ## Errors
    ///
    /// If there is an error while building the sender, an error variant will be returned
    /// describing the error.
    pub fn build(self) -> Result<(WavefrontSender, ExporterFuture), BuildError> {
        let interval = self.flush_interval;
        let initial_delay = self.initial_delay;
        let sender = self.build_sender()?;
        let mut shutdown = sender.shutdown_signal();
        let flusher = sender.clone();

        let exporter = async move {
            tokio::select! {
                _ = tokio::time::sleep(initial_delay) => {}
                _ = shutdown.changed() => return,
            }

            loop {
                if *shutdown.borrow() {
                    break;
                }
                if let Err(e) = flusher.scheduled_flush().await {
                    warn!("error flushing buffers to Wavefront: {}", e);
                }

                tokio::select! {
                    _ = tokio::time::sleep(interval) => {}
                    _ = shutdown.changed() => break,
                }
            }
            debug!("wavefront exporter for {} stopped", flusher.client_id());
        };

        Ok((sender, Box::pin(exporter)))
    }

    /// Builds only the sender. Nothing is delivered until [`WavefrontSender::flush`] is called.
    ///
    /// ## Errors
    ///
    /// If no destination was configured, or the HTTP client cannot be created, an error variant
    /// will be returned.
    pub fn build_sender(self) -> Result<WavefrontSender, BuildError> {
        let client_id = self.exporter_config.client_id();
        let transport = self.exporter_config.into_transport()?;
        let default_source = self
            .default_source
            .unwrap_or_else(hostname::default_source);

        let inner = Inner::new(
            transport,
            client_id,
            default_source,
            self.max_queue_size,
            self.batch_size,
            self.message_size_bytes,
        );

        Ok(WavefrontSender::from(inner))
    }
}

impl Default for WavefrontBuilder {
    fn default() -> Self {
        WavefrontBuilder::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::EntityKind;
    use std::io;
    use std::sync::{Arc, Mutex};

    #[derive(Clone, Default)]
    struct RecordingTransport {
        delivered: Arc<Mutex<Vec<String>>>,
    }

    impl Transport for RecordingTransport {
        async fn report(&self, _format: &'static str, payload: Vec<u8>) -> io::Result<u16> {
            self.delivered
                .lock()
                .unwrap()
                .push(String::from_utf8(payload).unwrap());
            Ok(202)
        }

        fn name(&self) -> &'static str {
            "recording"
        }
    }

    #[test]
    fn test_direct_ingestion_validation() {
        assert!(WavefrontBuilder::new()
            .with_direct_ingestion("https://domain.wavefront.com", Some("token".into()))
            .is_ok());
        assert!(WavefrontBuilder::new()
            .with_direct_ingestion("http://localhost:2878/report/", None)
            .is_ok());

        let err = WavefrontBuilder::new()
            .with_direct_ingestion("domain.wavefront.com", None)
            .err()
            .unwrap();
        assert!(matches!(err, BuildError::InvalidServerUrl(_)));

        let err = WavefrontBuilder::new()
            .with_direct_ingestion("ftp://domain.wavefront.com", None)
            .err()
            .unwrap();
        assert!(matches!(err, BuildError::InvalidServerUrl(_)));
    }

    #[test]
    fn test_proxy_requires_a_port() {
        let err = WavefrontBuilder::new()
            .with_proxy("localhost", None, None, None)
            .err()
            .unwrap();
        assert!(matches!(err, BuildError::MissingProxyPort(host) if host == "localhost"));

        let sender = WavefrontBuilder::new()
            .with_proxy("localhost", Some(2878), None, Some(30000))
            .unwrap()
            .build_sender()
            .unwrap();
        assert_eq!(sender.client_id(), "localhost");
    }

    #[test]
    fn test_zero_limits_are_rejected() {
        assert!(matches!(
            WavefrontBuilder::new().set_max_queue_size(0).err(),
            Some(BuildError::ZeroLimit(_))
        ));
        assert!(matches!(
            WavefrontBuilder::new().set_batch_size(0).err(),
            Some(BuildError::ZeroLimit(_))
        ));
        assert!(matches!(
            WavefrontBuilder::new().set_message_size_bytes(0).err(),
            Some(BuildError::ZeroLimit(_))
        ));
        assert!(matches!(
            WavefrontBuilder::new().set_flush_interval(Duration::ZERO).err(),
            Some(BuildError::ZeroLimit(_))
        ));
    }

    #[test]
    fn test_unconfigured_builder_fails() {
        assert!(matches!(
            WavefrontBuilder::new().build_sender().err(),
            Some(BuildError::MissingExporterConfiguration)
        ));
    }

    #[test]
    fn test_build_sender_applies_settings() {
        let sender = WavefrontBuilder::new()
            .with_transport(RecordingTransport::default())
            .set_max_queue_size(2)
            .unwrap()
            .set_default_source("my-host")
            .build_sender()
            .unwrap();

        assert_eq!(sender.client_id(), "custom");
        assert_eq!(sender.default_source(), "my-host");
        assert_eq!(sender.stats(EntityKind::Point).remaining_capacity, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exporter_flushes_periodically_until_closed() {
        let transport = RecordingTransport::default();
        let delivered = Arc::clone(&transport.delivered);
        let (sender, exporter) = WavefrontBuilder::new()
            .with_transport(transport)
            .set_default_source("h")
            .set_flush_interval(Duration::from_secs(5))
            .unwrap()
            .build()
            .unwrap();
        let exporter = tokio::spawn(exporter);

        sender.send_metric("cpu", 1.0, None, None, None).unwrap();
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(delivered.lock().unwrap().is_empty());

        tokio::time::sleep(Duration::from_millis(600)).await;
        assert_eq!(
            delivered.lock().unwrap().as_slice(),
            ["\"cpu\" 1.0 source=\"h\"\n"]
        );

        sender.send_metric("mem", 2.0, None, None, None).unwrap();
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(delivered.lock().unwrap().len(), 2);

        sender.close().await;
        exporter.await.unwrap();
    }

    #[tokio::test]
    async fn test_install_inside_runtime() {
        let sender = WavefrontBuilder::new()
            .with_transport(RecordingTransport::default())
            .set_default_source("h")
            .install()
            .unwrap();

        sender.send_formatted_metric("cpu 1 source=h").unwrap();
        sender.close().await;
        assert_eq!(sender.stats(EntityKind::Point).queue_size, 0);
    }
}
