/// Forwarding hub, the other end of every [`BusEndpoint`](crate::BusEndpoint).
///
/// Participants push frames into the pull listener; the hub fans each
/// message out to the pub-listener connections whose subscriptions match.
/// Delivery is at-most-once: a slow subscriber whose queue is full misses
/// the message.
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::{AbortHandle, JoinHandle};

use crate::frame::{matches_prefix, read_frame, write_frame, Frame};
use crate::BusError;

/// Per-subscriber queue depth.
const SUBSCRIBER_BUFFER: usize = 1024;

struct Subscriber {
    prefixes: HashSet<String>,
    tx: mpsc::Sender<Frame>,
}

struct HubState {
    subscribers: Mutex<HashMap<u64, Subscriber>>,
    next_id: AtomicU64,
    max_frame_size: usize,
    connections: Mutex<Vec<AbortHandle>>,
}

impl HubState {
    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<u64, Subscriber>> {
        self.subscribers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn track(&self, task: JoinHandle<()>) {
        let mut connections = self
            .connections
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        connections.retain(|c| !c.is_finished());
        connections.push(task.abort_handle());
    }

    fn close_connections(&self) {
        let connections = std::mem::take(
            &mut *self
                .connections
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner()),
        );
        for connection in connections {
            connection.abort();
        }
        self.lock().clear();
    }

    fn fanout(&self, channel: &str, data: &[u8]) -> usize {
        let subscribers = self.lock();
        let mut delivered = 0;
        for (id, sub) in subscribers.iter() {
            if !sub.prefixes.iter().any(|p| matches_prefix(p, channel)) {
                continue;
            }
            let frame = Frame::Message {
                channel: channel.to_string(),
                data: data.to_vec(),
            };
            match sub.tx.try_send(frame) {
                Ok(()) => delivered += 1,
                Err(_) => tracing::debug!("hub: subscriber {id} queue full, dropping {channel}"),
            }
        }
        delivered
    }
}

/// A running hub. Dropping it stops the listeners.
pub struct BusHub {
    pub_addr: SocketAddr,
    pull_addr: SocketAddr,
    state: Arc<HubState>,
    tasks: Vec<JoinHandle<()>>,
}

impl BusHub {
    /// Bind the pub and pull listeners (use port 0 for ephemeral ports).
    pub async fn bind(pub_addr: &str, pull_addr: &str) -> Result<Self, BusError> {
        Self::bind_with(pub_addr, pull_addr, crate::DEFAULT_MAX_FRAME_SIZE).await
    }

    pub async fn bind_with(
        pub_addr: &str,
        pull_addr: &str,
        max_frame_size: usize,
    ) -> Result<Self, BusError> {
        let pub_listener = bind_listener(pub_addr).await?;
        let pull_listener = bind_listener(pull_addr).await?;
        let pub_addr = pub_listener.local_addr()?;
        let pull_addr = pull_listener.local_addr()?;

        let state = Arc::new(HubState {
            subscribers: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(0),
            max_frame_size,
            connections: Mutex::new(Vec::new()),
        });

        let tasks = vec![
            tokio::spawn(accept_pub(pub_listener, state.clone())),
            tokio::spawn(accept_pull(pull_listener, state.clone())),
        ];

        tracing::info!("hub: pub on {pub_addr}, pull on {pull_addr}");

        Ok(Self {
            pub_addr,
            pull_addr,
            state,
            tasks,
        })
    }

    /// Address subscribers connect to.
    pub fn pub_addr(&self) -> SocketAddr {
        self.pub_addr
    }

    /// Address pushers connect to.
    pub fn pull_addr(&self) -> SocketAddr {
        self.pull_addr
    }

    /// Inject a message as if it had been pushed. Returns how many
    /// subscribers it was queued for.
    pub fn publish(&self, channel: &str, data: &[u8]) -> usize {
        self.state.fanout(channel, data)
    }

    /// Connected subscriber count.
    pub fn subscriber_count(&self) -> usize {
        self.state.lock().len()
    }

    /// Number of subscribers whose subscriptions match `channel`.
    pub fn subscribers_for(&self, channel: &str) -> usize {
        self.state
            .lock()
            .values()
            .filter(|s| s.prefixes.iter().any(|p| matches_prefix(p, channel)))
            .count()
    }

    /// Stop accepting and drop every connection.
    pub fn shutdown(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
        self.state.close_connections();
    }
}

impl Drop for BusHub {
    fn drop(&mut self) {
        self.shutdown();
    }
}

async fn bind_listener(addr: &str) -> Result<TcpListener, BusError> {
    let addr = crate::parse_endpoint(addr)?;
    TcpListener::bind(&addr)
        .await
        .map_err(|source| BusError::Bind { addr, source })
}

async fn accept_pub(listener: TcpListener, state: Arc<HubState>) {
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                let _ = stream.set_nodelay(true);
                state.track(tokio::spawn(serve_subscriber(stream, peer, state.clone())));
            }
            Err(e) => tracing::warn!("hub: pub accept failed: {e}"),
        }
    }
}

async fn serve_subscriber(stream: TcpStream, peer: SocketAddr, state: Arc<HubState>) {
    let id = state.next_id.fetch_add(1, Ordering::Relaxed);
    let (mut reader, mut writer) = stream.into_split();
    let (tx, mut rx) = mpsc::channel::<Frame>(SUBSCRIBER_BUFFER);

    state.lock().insert(
        id,
        Subscriber {
            prefixes: HashSet::new(),
            tx,
        },
    );
    tracing::debug!("hub: subscriber {id} connected from {peer}");

    let max = state.max_frame_size;
    let mut writer_task = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            match write_frame(&mut writer, &frame, max).await {
                Ok(()) => {}
                Err(e @ BusError::FrameTooLarge { .. }) => {
                    tracing::debug!("hub: not forwarding to {peer}: {e}");
                }
                Err(e) => {
                    tracing::debug!("hub: write to subscriber {peer} failed: {e}");
                    return;
                }
            }
        }
    });

    loop {
        tokio::select! {
            frame = read_frame(&mut reader, state.max_frame_size) => {
                match frame {
                    Ok(Some(Frame::Subscribe { channel })) => {
                        if let Some(sub) = state.lock().get_mut(&id) {
                            sub.prefixes.insert(channel);
                        }
                    }
                    Ok(Some(Frame::Unsubscribe { channel })) => {
                        if let Some(sub) = state.lock().get_mut(&id) {
                            sub.prefixes.remove(&channel);
                        }
                    }
                    Ok(Some(Frame::Message { channel, .. })) => {
                        tracing::debug!("hub: subscriber {peer} sent a message on {channel}, ignoring");
                    }
                    Ok(None) => break,
                    Err(e) => {
                        tracing::debug!("hub: subscriber {peer} read failed: {e}");
                        break;
                    }
                }
            }
            _ = &mut writer_task => break,
        }
    }

    writer_task.abort();
    state.lock().remove(&id);
    tracing::debug!("hub: subscriber {id} disconnected");
}

async fn accept_pull(listener: TcpListener, state: Arc<HubState>) {
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                let _ = stream.set_nodelay(true);
                state.track(tokio::spawn(serve_pusher(stream, peer, state.clone())));
            }
            Err(e) => tracing::warn!("hub: pull accept failed: {e}"),
        }
    }
}

async fn serve_pusher(mut stream: TcpStream, peer: SocketAddr, state: Arc<HubState>) {
    loop {
        match read_frame(&mut stream, state.max_frame_size).await {
            Ok(Some(Frame::Message { channel, data })) => {
                state.fanout(&channel, &data);
            }
            Ok(Some(other)) => tracing::debug!("hub: pusher {peer} sent {other:?}, ignoring"),
            Ok(None) => return,
            Err(e) => {
                tracing::debug!("hub: pusher {peer} read failed: {e}");
                return;
            }
        }
    }
}
