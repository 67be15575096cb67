use std::collections::hash_map::DefaultHasher;
use std::collections::HashSet;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

use crate::config::BusConfig;
use crate::frame::{read_frame, write_frame, Frame};
use crate::BusError;

/// Normalize `tcp://host:port` / `host:port` into a connectable `host:port`.
pub fn parse_endpoint(endpoint: &str) -> Result<String, BusError> {
    let addr = match endpoint.split_once("://") {
        Some(("tcp", rest)) => rest,
        Some(_) => return Err(BusError::InvalidEndpoint(endpoint.to_string())),
        None => endpoint,
    };

    let Some((host, port)) = addr.rsplit_once(':') else {
        return Err(BusError::InvalidEndpoint(endpoint.to_string()));
    };
    if host.is_empty() || port.parse::<u16>().is_err() {
        return Err(BusError::InvalidEndpoint(endpoint.to_string()));
    }

    Ok(addr.to_string())
}

async fn connect_once(addr: &str, timeout: Duration) -> Result<TcpStream, BusError> {
    let stream = tokio::time::timeout(timeout, TcpStream::connect(addr))
        .await
        .map_err(|_| BusError::Connect {
            endpoint: addr.to_string(),
            source: std::io::ErrorKind::TimedOut.into(),
        })?
        .map_err(|source| BusError::Connect {
            endpoint: addr.to_string(),
            source,
        })?;
    let _ = stream.set_nodelay(true);
    Ok(stream)
}

/// Connect to every candidate. Unreachable candidates are skipped; the call
/// fails only when none of them answers.
async fn connect_all(
    direction: &'static str,
    endpoints: &[String],
    timeout: Duration,
) -> Result<Vec<(String, TcpStream)>, BusError> {
    let mut connected = Vec::new();
    for endpoint in endpoints {
        let addr = parse_endpoint(endpoint)?;
        match connect_once(&addr, timeout).await {
            Ok(stream) => {
                tracing::info!("{direction}: connected to {endpoint}");
                connected.push((addr, stream));
            }
            Err(e) => tracing::warn!("{direction}: {e}"),
        }
    }

    if connected.is_empty() {
        return Err(BusError::NoEndpoint {
            direction,
            candidates: endpoints.to_vec(),
        });
    }
    Ok(connected)
}

#[derive(Clone, Copy)]
struct ConnParams {
    connect_timeout: Duration,
    reconnect_interval: Duration,
    max_reconnect_attempts: Option<u32>,
    max_frame_size: usize,
}

impl From<&BusConfig> for ConnParams {
    fn from(config: &BusConfig) -> Self {
        Self {
            connect_timeout: config.connect_timeout,
            reconnect_interval: config.reconnect_interval,
            max_reconnect_attempts: config.max_reconnect_attempts,
            max_frame_size: config.max_frame_size,
        }
    }
}

/// Reconnect to `addr`, pausing `reconnect_interval` between attempts.
/// `None` once `max_reconnect_attempts` consecutive attempts have failed
/// or `stop` reports that nobody needs the connection any more.
async fn reconnect(
    direction: &str,
    addr: &str,
    params: ConnParams,
    stop: impl Fn() -> bool,
) -> Option<TcpStream> {
    let mut failures = 0u32;
    loop {
        tokio::time::sleep(params.reconnect_interval).await;
        if stop() {
            return None;
        }
        match connect_once(addr, params.connect_timeout).await {
            Ok(s) => {
                tracing::info!("{direction}: reconnected to {addr}");
                return Some(s);
            }
            Err(e) => {
                failures += 1;
                tracing::debug!("{direction}: {e}");
                if params.max_reconnect_attempts.is_some_and(|max| failures >= max) {
                    tracing::error!("{direction}: giving up on {addr} after {failures} attempts");
                    return None;
                }
            }
        }
    }
}

// ── Publisher ─────────────────────────────────────────────────────────

/// Push side of the bus. Cheap to clone.
///
/// Publishing never blocks and never reports failure: a message that
/// cannot be queued on any push connection is dropped.
#[derive(Clone)]
pub struct Publisher {
    queues: Arc<Vec<mpsc::Sender<Frame>>>,
    max_frame_size: usize,
}

impl Publisher {
    /// Connect only the push direction of `config`.
    pub async fn connect(config: &BusConfig) -> Result<Self, BusError> {
        let params = ConnParams::from(config);
        let streams = connect_all("push", &config.push, config.connect_timeout).await?;

        let mut queues = Vec::with_capacity(streams.len());
        for (addr, stream) in streams {
            let (tx, rx) = mpsc::channel(config.send_buffer);
            tokio::spawn(run_push_connection(addr, Some(stream), rx, params));
            queues.push(tx);
        }

        Ok(Self {
            queues: Arc::new(queues),
            max_frame_size: config.max_frame_size,
        })
    }

    /// A publisher with no connections; every publish is dropped.
    pub fn disconnected() -> Self {
        Self {
            queues: Arc::new(Vec::new()),
            max_frame_size: crate::DEFAULT_MAX_FRAME_SIZE,
        }
    }

    /// Queue `data` for `channel`.
    ///
    /// A channel sticks to one push connection while it has room, so
    /// messages on one channel leave in the order they were published.
    /// Payloads over the frame limit are dropped here; the hub would
    /// otherwise reject them and close the connection.
    pub fn publish(&self, channel: &str, data: Vec<u8>) {
        if data.len() > self.max_frame_size {
            tracing::warn!(
                "dropping {} byte message for {channel}: over the {} byte frame limit",
                data.len(),
                self.max_frame_size
            );
            return;
        }
        let n = self.queues.len();
        if n == 0 {
            tracing::debug!("no push connection, dropping message for {channel}");
            return;
        }

        let mut hasher = DefaultHasher::new();
        channel.hash(&mut hasher);
        let start = hasher.finish() as usize % n;

        let mut frame = Frame::Message {
            channel: channel.to_string(),
            data,
        };
        for i in 0..n {
            match self.queues[(start + i) % n].try_send(frame) {
                Ok(()) => return,
                Err(TrySendError::Full(f)) | Err(TrySendError::Closed(f)) => frame = f,
            }
        }
        tracing::debug!("all push queues unavailable, dropping message for {channel}");
    }

    /// Number of push connections.
    pub fn connection_count(&self) -> usize {
        self.queues.len()
    }
}

async fn run_push_connection(
    addr: String,
    mut stream: Option<TcpStream>,
    mut rx: mpsc::Receiver<Frame>,
    params: ConnParams,
) {
    loop {
        let mut conn = match stream.take() {
            Some(s) => s,
            None => match reconnect("push", &addr, params, || rx.is_closed()).await {
                Some(s) => s,
                None => return,
            },
        };

        loop {
            let Some(frame) = rx.recv().await else {
                return;
            };
            match write_frame(&mut conn, &frame, params.max_frame_size).await {
                Ok(()) => {}
                Err(e @ BusError::FrameTooLarge { .. }) => {
                    tracing::warn!("push: dropping message: {e}");
                }
                Err(e) => {
                    tracing::warn!("push: connection to {addr} lost: {e}");
                    break;
                }
            }
        }
    }
}

// ── BusEndpoint ───────────────────────────────────────────────────────

/// Both halves of a participant's bus attachment: a subscriber connection
/// per publisher endpoint and a push connection per pull endpoint.
pub struct BusEndpoint {
    publisher: Publisher,
    control: Vec<mpsc::Sender<Frame>>,
    subscriptions: Arc<Mutex<HashSet<String>>>,
    incoming_rx: mpsc::Receiver<(String, Vec<u8>)>,
}

impl BusEndpoint {
    /// Connect both directions. Fails if either direction has no reachable
    /// endpoint.
    pub async fn connect(config: BusConfig) -> Result<Self, BusError> {
        let params = ConnParams::from(&config);
        let streams = connect_all("sub", &config.sub, config.connect_timeout).await?;
        let publisher = Publisher::connect(&config).await?;

        let subscriptions = Arc::new(Mutex::new(HashSet::new()));
        let (incoming_tx, incoming_rx) = mpsc::channel(config.recv_buffer);

        let mut control = Vec::with_capacity(streams.len());
        for (addr, stream) in streams {
            let (tx, rx) = mpsc::channel(config.send_buffer);
            tokio::spawn(run_sub_connection(
                addr,
                Some(stream),
                rx,
                incoming_tx.clone(),
                subscriptions.clone(),
                params,
            ));
            control.push(tx);
        }

        Ok(Self {
            publisher,
            control,
            subscriptions,
            incoming_rx,
        })
    }

    /// Publish `data` on `channel`. Fire-and-forget.
    pub fn publish(&self, channel: &str, data: Vec<u8>) {
        self.publisher.publish(channel, data);
    }

    /// A cloneable handle to the push side.
    pub fn publisher(&self) -> Publisher {
        self.publisher.clone()
    }

    /// Subscribe to `channel` on every upstream. Returns `false` (and sends
    /// nothing) if already subscribed.
    pub fn subscribe(&self, channel: &str) -> bool {
        if !self.lock_subscriptions().insert(channel.to_string()) {
            tracing::debug!("already subscribed to {channel}");
            return false;
        }
        self.broadcast_control(Frame::Subscribe {
            channel: channel.to_string(),
        });
        true
    }

    /// Unsubscribe from `channel`. Returns `false` if it was not subscribed.
    pub fn unsubscribe(&self, channel: &str) -> bool {
        if !self.lock_subscriptions().remove(channel) {
            tracing::debug!("not subscribed to {channel}");
            return false;
        }
        self.broadcast_control(Frame::Unsubscribe {
            channel: channel.to_string(),
        });
        true
    }

    pub fn is_subscribed(&self, channel: &str) -> bool {
        self.lock_subscriptions().contains(channel)
    }

    /// Currently subscribed channels.
    pub fn subscriptions(&self) -> Vec<String> {
        self.lock_subscriptions().iter().cloned().collect()
    }

    /// Next `(channel, data)` pair from any upstream.
    ///
    /// Dropped connections are re-established in the background. Returns
    /// `None` once every subscriber connection has been given up after
    /// `max_reconnect_attempts` failed reconnects.
    pub async fn recv(&mut self) -> Option<(String, Vec<u8>)> {
        self.incoming_rx.recv().await
    }

    fn broadcast_control(&self, frame: Frame) {
        for tx in &self.control {
            if tx.try_send(frame.clone()).is_err() {
                tracing::warn!("sub: control queue unavailable, dropping {frame:?}");
            }
        }
    }

    fn lock_subscriptions(&self) -> std::sync::MutexGuard<'_, HashSet<String>> {
        self.subscriptions
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

async fn run_sub_connection(
    addr: String,
    mut stream: Option<TcpStream>,
    mut control_rx: mpsc::Receiver<Frame>,
    incoming_tx: mpsc::Sender<(String, Vec<u8>)>,
    subscriptions: Arc<Mutex<HashSet<String>>>,
    params: ConnParams,
) {
    loop {
        let conn = match stream.take() {
            Some(s) => s,
            None => {
                let gone = || control_rx.is_closed() || incoming_tx.is_closed();
                match reconnect("sub", &addr, params, gone).await {
                    Some(s) => s,
                    None => return,
                }
            }
        };
        let (mut reader, mut writer) = conn.into_split();

        // Replay the current subscription set. The publisher keeps a set,
        // so replaying a channel that is also queued on `control_rx` is harmless.
        let current: Vec<String> = subscriptions
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .iter()
            .cloned()
            .collect();
        let mut replay_ok = true;
        for channel in current {
            let frame = Frame::Subscribe { channel };
            if let Err(e) = write_frame(&mut writer, &frame, params.max_frame_size).await {
                tracing::warn!("sub: resubscribe on {addr} failed: {e}");
                replay_ok = false;
                break;
            }
        }
        if !replay_ok {
            continue;
        }

        let tx = incoming_tx.clone();
        let max = params.max_frame_size;
        let reader_addr = addr.clone();
        let mut reader_task = tokio::spawn(async move {
            loop {
                match read_frame(&mut reader, max).await {
                    Ok(Some(Frame::Message { channel, data })) => {
                        if tx.send((channel, data)).await.is_err() {
                            return;
                        }
                    }
                    Ok(Some(other)) => {
                        tracing::debug!("sub: ignoring {other:?} from {reader_addr}");
                    }
                    Ok(None) => {
                        tracing::warn!("sub: {reader_addr} closed the connection");
                        return;
                    }
                    Err(e) => {
                        tracing::warn!("sub: read from {reader_addr} failed: {e}");
                        return;
                    }
                }
            }
        });

        loop {
            tokio::select! {
                frame = control_rx.recv() => {
                    let Some(frame) = frame else {
                        reader_task.abort();
                        return;
                    };
                    if let Err(e) = write_frame(&mut writer, &frame, params.max_frame_size).await {
                        tracing::warn!("sub: write to {addr} failed: {e}");
                        break;
                    }
                }
                _ = &mut reader_task => break,
            }
        }
        reader_task.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_tcp_scheme() {
        assert_eq!(parse_endpoint("tcp://127.0.0.1:7114").unwrap(), "127.0.0.1:7114");
    }

    #[test]
    fn parse_bare_address() {
        assert_eq!(parse_endpoint("devside.local:7116").unwrap(), "devside.local:7116");
    }

    #[test]
    fn parse_rejects_other_schemes() {
        assert!(parse_endpoint("udp://127.0.0.1:7114").is_err());
        assert!(parse_endpoint("ipc:///tmp/sock").is_err());
    }

    #[test]
    fn parse_rejects_missing_port() {
        assert!(parse_endpoint("tcp://127.0.0.1").is_err());
        assert!(parse_endpoint("127.0.0.1:notaport").is_err());
        assert!(parse_endpoint(":7114").is_err());
    }

    #[test]
    fn disconnected_publisher_drops_silently() {
        let publisher = Publisher::disconnected();
        publisher.publish("ALL", b"x".to_vec());
        assert_eq!(publisher.connection_count(), 0);
    }

    #[tokio::test]
    async fn connect_fails_when_nothing_listens() {
        // Bind then drop to get a port with no listener.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let config = BusConfig::new()
            .sub_endpoint(format!("tcp://{addr}"))
            .push_endpoint(format!("tcp://{addr}"))
            .connect_timeout(Duration::from_millis(200));

        let err = BusEndpoint::connect(config).await.err().expect("should fail");
        assert!(matches!(err, BusError::NoEndpoint { direction: "sub", .. }));
    }

    #[tokio::test]
    async fn empty_push_list_is_no_endpoint() {
        let err = Publisher::connect(&BusConfig::new()).await.err().expect("should fail");
        assert!(matches!(err, BusError::NoEndpoint { direction: "push", .. }));
    }
}
