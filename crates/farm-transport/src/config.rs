use std::time::Duration;

/// Configuration for a [`BusEndpoint`](crate::BusEndpoint).
///
/// Endpoints are written `tcp://host:port` or plain `host:port`. Each list
/// may hold several upstreams; every reachable one is used.
///
/// ```rust
/// use farm_transport::BusConfig;
///
/// let config = BusConfig::new()
///     .sub_endpoint("tcp://127.0.0.1:7114")
///     .push_endpoint("tcp://127.0.0.1:7116")
///     .max_frame_size(512 * 1024);
/// ```
#[derive(Debug, Clone)]
pub struct BusConfig {
    /// Publisher endpoints we subscribe to.
    pub(crate) sub: Vec<String>,
    /// Pull endpoints we push to.
    pub(crate) push: Vec<String>,
    /// Maximum accepted frame size in bytes.
    pub(crate) max_frame_size: usize,
    /// Outbound queue depth per connection.
    pub(crate) send_buffer: usize,
    /// Inbound queue depth shared by all subscriber connections.
    pub(crate) recv_buffer: usize,
    /// Timeout for each TCP connect attempt.
    pub(crate) connect_timeout: Duration,
    /// Delay between reconnect attempts after a connection drops.
    pub(crate) reconnect_interval: Duration,
    /// Consecutive failed reconnects before a connection is given up.
    /// `None` retries forever.
    pub(crate) max_reconnect_attempts: Option<u32>,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl BusConfig {
    pub fn new() -> Self {
        Self {
            sub: Vec::new(),
            push: Vec::new(),
            max_frame_size: crate::DEFAULT_MAX_FRAME_SIZE,
            send_buffer: 1024,
            recv_buffer: 1024,
            connect_timeout: Duration::from_secs(5),
            reconnect_interval: Duration::from_millis(500),
            max_reconnect_attempts: Some(20),
        }
    }

    /// Add a publisher endpoint to subscribe to.
    pub fn sub_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.sub.push(endpoint.into());
        self
    }

    /// Add several publisher endpoints.
    pub fn sub_endpoints<I, S>(mut self, endpoints: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.sub.extend(endpoints.into_iter().map(Into::into));
        self
    }

    /// Add a pull endpoint to push to.
    pub fn push_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.push.push(endpoint.into());
        self
    }

    /// Add several pull endpoints.
    pub fn push_endpoints<I, S>(mut self, endpoints: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.push.extend(endpoints.into_iter().map(Into::into));
        self
    }

    /// Set maximum frame size (default: 1 MB).
    pub fn max_frame_size(mut self, bytes: usize) -> Self {
        self.max_frame_size = bytes;
        self
    }

    /// Set the outbound queue depth per connection (default: 1024).
    pub fn send_buffer(mut self, capacity: usize) -> Self {
        self.send_buffer = capacity;
        self
    }

    /// Set the inbound queue depth (default: 1024).
    pub fn recv_buffer(mut self, capacity: usize) -> Self {
        self.recv_buffer = capacity;
        self
    }

    /// Set the per-attempt connect timeout (default: 5 s).
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Set the reconnect delay (default: 500 ms).
    pub fn reconnect_interval(mut self, interval: Duration) -> Self {
        self.reconnect_interval = interval;
        self
    }

    /// Set how many consecutive reconnects may fail before a connection is
    /// abandoned (default: 20). Once every subscriber connection is gone,
    /// [`BusEndpoint::recv`](crate::BusEndpoint::recv) returns `None`.
    pub fn max_reconnect_attempts(mut self, attempts: Option<u32>) -> Self {
        self.max_reconnect_attempts = attempts;
        self
    }

    pub fn sub(&self) -> &[String] {
        &self.sub
    }

    pub fn push(&self) -> &[String] {
        &self.push
    }
}
