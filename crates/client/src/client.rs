//! The client facade: a builder, the request executor and streaming uploads.
//!
//! ```no_run
//! use micro_client::{Client, ClientRequest};
//!
//! # async fn run() -> Result<(), micro_client::ClientError> {
//! let client = Client::builder().build()?;
//! let response = client.execute(ClientRequest::get("http://example.com/")?).await?;
//! println!("{} {}", response.status(), response.text()?);
//! # Ok(())
//! # }
//! ```

use crate::connect::{Connect, Resolve, SecureSessionFactory, TcpConnector};
use crate::interceptor::{
    Backoff, ConnectFailures, DecompressInterceptor, ExpectContinueInterceptor, FilterInterceptor, Interceptor, InterceptorChain,
    NoBackoff, RedirectInterceptor, RequestFilter, ResponseFilter, RetryInterceptor, RetryPredicate,
};
use crate::listener::{EventListener, NoopListener};
use crate::pool::{PoolCache, PoolMetrics};
use crate::request::Payload;
use crate::transceiver::Transceiver;
use crate::writer::SegmentChannel;
use crate::{ClientConfig, ClientError, ClientRequest, ClientResponse, Destination, PoolOptions, Resources};
use bytes::Bytes;
use futures::FutureExt;
use futures::future::{self, BoxFuture};
use http::HeaderMap;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info};

pub struct ClientBuilder {
    config: ClientConfig,
    connector: Option<Arc<dyn Connect>>,
    resolver: Option<Arc<dyn Resolve>>,
    secure: Option<Arc<dyn SecureSessionFactory>>,
    interceptors: Vec<Arc<dyn Interceptor>>,
    request_filters: Vec<Arc<dyn RequestFilter>>,
    response_filters: Vec<Arc<dyn ResponseFilter>>,
    retry_predicate: Arc<dyn RetryPredicate>,
    backoff: Arc<dyn Backoff>,
    listener: Arc<dyn EventListener>,
    resources: Option<Resources>,
}

impl ClientBuilder {
    fn new() -> Self {
        Self {
            config: ClientConfig::default(),
            connector: None,
            resolver: None,
            secure: None,
            interceptors: vec![],
            request_filters: vec![],
            response_filters: vec![],
            retry_predicate: Arc::new(ConnectFailures),
            backoff: Arc::new(NoBackoff),
            listener: Arc::new(NoopListener),
            resources: None,
        }
    }

    pub fn config(mut self, config: ClientConfig) -> Self {
        self.config = config;
        self
    }

    /// Replace the TCP connector; the resolver and secure session factory are then ignored.
    pub fn connector(mut self, connector: impl Connect + 'static) -> Self {
        self.connector = Some(Arc::new(connector));
        self
    }

    pub fn resolver(mut self, resolver: impl Resolve + 'static) -> Self {
        self.resolver = Some(Arc::new(resolver));
        self
    }

    pub fn secure_session_factory(mut self, factory: impl SecureSessionFactory + 'static) -> Self {
        self.secure = Some(Arc::new(factory));
        self
    }

    pub fn interceptor(mut self, interceptor: impl Interceptor + 'static) -> Self {
        self.interceptors.push(Arc::new(interceptor));
        self
    }

    pub fn request_filter(mut self, filter: impl RequestFilter + 'static) -> Self {
        self.request_filters.push(Arc::new(filter));
        self
    }

    pub fn response_filter(mut self, filter: impl ResponseFilter + 'static) -> Self {
        self.response_filters.push(Arc::new(filter));
        self
    }

    pub fn retry_predicate(mut self, predicate: impl RetryPredicate + 'static) -> Self {
        self.retry_predicate = Arc::new(predicate);
        self
    }

    pub fn backoff(mut self, backoff: impl Backoff + 'static) -> Self {
        self.backoff = Arc::new(backoff);
        self
    }

    pub fn listener(mut self, listener: impl EventListener + 'static) -> Self {
        self.listener = Arc::new(listener);
        self
    }

    /// Share a timer and callback runtime with other clients.
    pub fn resources(mut self, resources: Resources) -> Self {
        self.resources = Some(resources);
        self
    }

    pub fn build(self) -> Result<Client, ClientError> {
        let config = self.config;
        if config.pool.max_size == 0 {
            return Err(ClientError::config("pool.max_size must be at least 1"));
        }
        if config.cache.max_pools == 0 {
            return Err(ClientError::config("cache.max_pools must be at least 1"));
        }

        let resources = match (self.resources, config.callback_threads) {
            (Some(resources), _) => resources,
            (None, Some(threads)) => Resources::with_callback_threads(threads)?,
            (None, None) => Resources::new(),
        };
        let connector = match self.connector {
            Some(connector) => connector,
            None => {
                let mut connector = TcpConnector::new(&config);
                if let Some(resolver) = self.resolver {
                    connector = connector.with_resolver(resolver);
                }
                if let Some(secure) = self.secure {
                    connector = connector.with_secure_session_factory(secure);
                }
                Arc::new(connector)
            }
        };

        let mut interceptors: Vec<Arc<dyn Interceptor>> = vec![
            Arc::new(ExpectContinueInterceptor),
            Arc::new(RedirectInterceptor),
            Arc::new(RetryInterceptor::new(self.retry_predicate, self.backoff)),
        ];
        if config.decompress {
            interceptors.push(Arc::new(DecompressInterceptor));
        }
        let filters = FilterInterceptor::new(self.request_filters, self.response_filters);
        if !filters.is_empty() {
            interceptors.push(Arc::new(filters));
        }
        interceptors.extend(self.interceptors);
        let chain = InterceptorChain::new(interceptors);

        let cache = Arc::new(PoolCache::new(config.cache.clone()));
        cache.spawn_sweeper();
        let config = Arc::new(config);
        let transceiver = Transceiver::new(Arc::clone(&config), cache, connector, self.listener, resources);
        debug!(interceptors = chain.len(), protocol = ?config.protocol, "client built");

        Ok(Client { inner: Arc::new(ClientInner { config, chain, transceiver }) })
    }
}

impl fmt::Debug for ClientBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientBuilder")
            .field("config", &self.config)
            .field("interceptors", &self.interceptors.len())
            .finish_non_exhaustive()
    }
}

/// An HTTP client. Clones share pools, interceptors and resources.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    config: Arc<ClientConfig>,
    chain: InterceptorChain,
    transceiver: Transceiver,
}

impl Drop for ClientInner {
    fn drop(&mut self) {
        self.transceiver.cache().close_all();
    }
}

impl Client {
    pub fn builder() -> ClientBuilder {
        ClientBuilder::new()
    }

    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    /// Run `request` through the interceptor chain and the network.
    ///
    /// The user's `on_end` or `on_error` fires once with the final outcome,
    /// after retries and redirects have run their course.
    pub async fn execute(&self, request: ClientRequest) -> Result<ClientResponse, ClientError> {
        let context = Arc::clone(request.context());
        context.apply_defaults(&self.inner.config);
        let result = self.inner.chain.execute(request, &self.inner.transceiver).await;
        context.complete(result)
    }

    /// Start `request` and return once its streamed body can be written.
    ///
    /// The request must carry a [`Payload::Segment`]. Writes made before the
    /// connection is ready are queued, so waiting here is only needed to learn
    /// about connect failures early.
    pub async fn execute_streaming(&self, request: ClientRequest) -> Result<StreamingRequest, ClientError> {
        let Payload::Segment(channel) = request.payload() else {
            return Err(ClientError::invalid_request("execute_streaming needs a streaming payload"));
        };
        let channel = channel.clone();
        let client = self.clone();
        let task = tokio::spawn(async move { client.execute(request).await });

        if let Err(e) = channel.ready().await {
            // a final response may have arrived before the body was bound
            return match task.await {
                Ok(Ok(response)) => Ok(StreamingRequest { channel, response: future::ready(Ok(response)).boxed() }),
                Ok(Err(task_error)) => Err(task_error),
                Err(_join) => Err(e),
            };
        }
        let response = async move {
            match task.await {
                Ok(result) => result,
                Err(e) => Err(ClientError::Callback(format!("request task failed: {e}"))),
            }
        }
        .boxed();
        Ok(StreamingRequest { channel, response })
    }

    pub fn pool_metrics(&self) -> Vec<PoolMetrics> {
        self.inner.transceiver.cache().metrics()
    }

    /// Close `destination`'s pool after the eviction grace period; the next request builds a new one.
    pub fn evict(&self, destination: &Destination) -> bool {
        self.inner.transceiver.cache().evict(destination)
    }

    /// Swap `destination`'s pool for one built with `options`.
    pub fn tune_pool(&self, destination: &Destination, options: PoolOptions) -> Result<(), ClientError> {
        if options.max_size == 0 {
            return Err(ClientError::config("pool.max_size must be at least 1"));
        }
        let pool = self.inner.transceiver.pool_with_options(destination.clone(), options);
        self.inner.transceiver.cache().replace(destination, pool)
    }

    /// Close every pool. Later requests fail with [`ClientError::Config`].
    pub fn close(&self) {
        info!("closing client");
        self.inner.transceiver.cache().close_all();
    }
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client")
            .field("chain", &self.inner.chain)
            .field("transceiver", &self.inner.transceiver)
            .finish_non_exhaustive()
    }
}

/// An in-flight request whose body is still being written.
pub struct StreamingRequest {
    channel: SegmentChannel,
    response: BoxFuture<'static, Result<ClientResponse, ClientError>>,
}

impl StreamingRequest {
    pub fn channel(&self) -> &SegmentChannel {
        &self.channel
    }

    pub async fn write(&self, data: impl Into<Bytes>) -> Result<(), ClientError> {
        self.channel.write(data).await
    }

    /// Finish the body, optionally with trailers, and wait for the response.
    pub async fn end(self, trailers: Option<HeaderMap>) -> Result<ClientResponse, ClientError> {
        if let Err(e) = self.channel.end(trailers).await {
            debug!(cause = %e, "streamed body did not end cleanly");
        }
        self.response.await
    }

    /// Wait for the response without ending the body, for peers that answer early.
    pub async fn response(self) -> Result<ClientResponse, ClientError> {
        self.response.await
    }
}

impl fmt::Debug for StreamingRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamingRequest").field("channel", &self.channel).finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handle::ResponseCallbacks;
    use crate::interceptor::fn_request_filter;
    use crate::pool::connection_pool_tests::DuplexConnector;
    use http::uri::Scheme;
    use http::{HeaderValue, StatusCode, header};
    use indoc::indoc;
    use parking_lot::Mutex;
    use std::sync::atomic::Ordering;
    use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

    /// Shares one in-memory connector between the client and the test.
    #[derive(Clone, Default)]
    struct SharedConnector(Arc<DuplexConnector>);

    #[async_trait::async_trait]
    impl Connect for SharedConnector {
        async fn connect(&self, destination: &Destination) -> Result<crate::connect::Connected, ClientError> {
            self.0.connect(destination).await
        }
    }

    async fn server(connector: &DuplexConnector) -> DuplexStream {
        loop {
            if let Some(server) = connector.next_server() {
                return server;
            }
            tokio::task::yield_now().await;
        }
    }

    async fn read_until(server: &mut DuplexStream, needle: &str) -> String {
        let mut received = String::new();
        let mut buf = [0u8; 1024];
        while !received.contains(needle) {
            let n = server.read(&mut buf).await.unwrap();
            assert!(n > 0, "connection closed before {needle:?}");
            received.push_str(std::str::from_utf8(&buf[..n]).unwrap());
        }
        received
    }

    const OK: &str = indoc! {"
        HTTP/1.1 200 OK\r
        content-length: 5\r
        \r
        hello"};

    fn client(connector: &SharedConnector, config: ClientConfig) -> ClientBuilder {
        Client::builder().config(config).connector(connector.clone())
    }

    #[tokio::test]
    async fn execute_fires_on_end_once() {
        let connector = SharedConnector::default();
        let client = client(&connector, ClientConfig::default())
            .request_filter(fn_request_filter(|request: ClientRequest| {
                Ok(request.header(header::USER_AGENT, HeaderValue::from_static("micro-client-test")))
            }))
            .build()
            .unwrap();

        let ended = Arc::new(Mutex::new(Vec::new()));
        let request = ClientRequest::get("http://example.com/greeting").unwrap();
        request.context().set_callbacks(ResponseCallbacks::new().on_end({
            let ended = Arc::clone(&ended);
            move |response| ended.lock().push(response.status())
        }));

        let call = tokio::spawn({
            let client = client.clone();
            async move { client.execute(request).await }
        });
        let mut socket = server(&connector.0).await;
        let received = read_until(&mut socket, "\r\n\r\n").await;
        assert!(received.contains("user-agent: micro-client-test\r\n"));
        assert!(received.contains("host: example.com\r\n"));
        socket.write_all(OK.as_bytes()).await.unwrap();

        let response = call.await.unwrap().unwrap();
        assert_eq!(response.text().unwrap(), "hello");
        assert_eq!(*ended.lock(), [StatusCode::OK]);
        assert_eq!(client.pool_metrics().len(), 1);
    }

    #[tokio::test]
    async fn connect_failures_are_retried_then_reported() {
        let connector = SharedConnector::default();
        connector.0.fail.store(true, Ordering::SeqCst);
        let config = ClientConfig { max_retries: 2, ..ClientConfig::default() };
        let client = client(&connector, config).build().unwrap();

        let errors = Arc::new(Mutex::new(0));
        let request = ClientRequest::get("http://example.com/").unwrap();
        request.context().set_callbacks(ResponseCallbacks::new().on_error({
            let errors = Arc::clone(&errors);
            move |_e| *errors.lock() += 1
        }));

        let result = client.execute(request).await;
        assert!(matches!(result, Err(ClientError::RetryExhausted { max_retries: 2, .. })));
        assert_eq!(connector.0.connects.load(Ordering::SeqCst), 3);
        assert_eq!(*errors.lock(), 1);
    }

    #[tokio::test]
    async fn streaming_upload_round_trip() {
        let connector = SharedConnector::default();
        let client = client(&connector, ClientConfig::default()).build().unwrap();

        let request = ClientRequest::post("http://example.com/upload").unwrap().streaming(SegmentChannel::chunked());
        let upload = client.execute_streaming(request).await.unwrap();
        upload.write("abc").await.unwrap();

        let mut socket = server(&connector.0).await;
        let received = read_until(&mut socket, "abc\r\n").await;
        assert!(received.contains("transfer-encoding: chunked\r\n"));

        let responder = tokio::spawn(async move {
            read_until(&mut socket, "0\r\n\r\n").await;
            socket.write_all(OK.as_bytes()).await.unwrap();
            socket
        });
        let response = upload.end(None).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        responder.await.unwrap();
    }

    #[tokio::test]
    async fn streaming_needs_a_segment_payload() {
        let client = client(&SharedConnector::default(), ClientConfig::default()).build().unwrap();
        let result = client.execute_streaming(ClientRequest::post("http://example.com/").unwrap().body("x")).await;
        assert!(matches!(result, Err(ClientError::InvalidRequest(_))));
    }

    #[tokio::test]
    async fn tune_pool_replaces_the_options() {
        let client = client(&SharedConnector::default(), ClientConfig::default()).build().unwrap();
        let destination = Destination::new(Scheme::HTTP, "example.com", 80);
        let options = PoolOptions { max_size: 2, ..PoolOptions::default() };

        client.tune_pool(&destination, options.clone()).unwrap();
        let metrics = client.pool_metrics();
        assert_eq!(metrics.len(), 1);
        assert_eq!(metrics[0].options, options);
        assert!(client.evict(&destination));
        assert!(client.pool_metrics().is_empty());
    }

    #[tokio::test]
    async fn closed_client_refuses_requests() {
        let client = client(&SharedConnector::default(), ClientConfig::default()).build().unwrap();
        client.close();
        let result = client.execute(ClientRequest::get("http://example.com/").unwrap()).await;
        assert!(matches!(result, Err(ClientError::Config(_))));
    }

    #[test]
    fn empty_pools_are_rejected() {
        let mut config = ClientConfig::default();
        config.pool.max_size = 0;
        assert!(matches!(Client::builder().config(config).build(), Err(ClientError::Config(_))));
    }
}
