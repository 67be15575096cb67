/// Bus abstraction for the session.
///
/// In production: implemented by [`BusEndpoint`].
/// In tests: implemented by `MockBus` (records calls, injects messages).
use async_trait::async_trait;
use farm_transport::BusEndpoint;

#[async_trait]
pub trait Bus: Send {
    /// Fire-and-forget publish.
    fn publish(&self, channel: &str, data: Vec<u8>);

    /// Returns false if already subscribed.
    fn subscribe(&self, channel: &str) -> bool;

    /// Returns false if not subscribed.
    fn unsubscribe(&self, channel: &str) -> bool;

    /// Next inbound `(channel, data)`. `None` once the bus is gone.
    async fn recv(&mut self) -> Option<(String, Vec<u8>)>;
}

// ── Impl for BusEndpoint (production) ────────────────────────────────

#[async_trait]
impl Bus for BusEndpoint {
    fn publish(&self, channel: &str, data: Vec<u8>) {
        BusEndpoint::publish(self, channel, data)
    }

    fn subscribe(&self, channel: &str) -> bool {
        BusEndpoint::subscribe(self, channel)
    }

    fn unsubscribe(&self, channel: &str) -> bool {
        BusEndpoint::unsubscribe(self, channel)
    }

    async fn recv(&mut self) -> Option<(String, Vec<u8>)> {
        BusEndpoint::recv(self).await
    }
}

// ── MockBus (tests) ──────────────────────────────────────────────────
