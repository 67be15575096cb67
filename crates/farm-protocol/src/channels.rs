/// Channel manager: the set of channels a session listens on.
///
/// Pure state machine: every operation takes `now` explicitly, and expiry
/// is only observed through [`ChannelManager::sweep`]. The caller owns the
/// clock and the bus; this type only decides.
use std::collections::HashMap;
use std::time::Duration;

use tokio::time::Instant;

/// Lifetime of a registered channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ttl {
    /// Never expires (global and private channels).
    Permanent,
    /// Expires this long after registration or the last keepalive.
    Expires(Duration),
}

#[derive(Debug, Clone)]
struct Entry {
    ttl: Ttl,
    expires_at: Option<Instant>,
}

impl Entry {
    fn new(ttl: Ttl, now: Instant) -> Self {
        let expires_at = match ttl {
            Ttl::Permanent => None,
            Ttl::Expires(d) => Some(now + d),
        };
        Self { ttl, expires_at }
    }
}

/// What [`ChannelManager::register`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Registration {
    /// Channel was not registered before; caller should subscribe.
    New,
    /// Channel was already registered; expiry refreshed.
    Refreshed,
}

#[derive(Debug, Default)]
pub struct ChannelManager {
    entries: HashMap<String, Entry>,
}

impl ChannelManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register or refresh `channel`. Re-registering replaces the TTL with
    /// the latest one, except that a permanent channel stays permanent.
    pub fn register(&mut self, channel: &str, ttl: Ttl, now: Instant) -> Registration {
        match self.entries.get_mut(channel) {
            Some(entry) if entry.ttl == Ttl::Permanent => {
                tracing::debug!("channel {channel} is permanent, ignoring ttl {ttl:?}");
                Registration::Refreshed
            }
            Some(entry) => {
                *entry = Entry::new(ttl, now);
                Registration::Refreshed
            }
            None => {
                self.entries.insert(channel.to_string(), Entry::new(ttl, now));
                Registration::New
            }
        }
    }

    /// Push back the expiry of `channel` by its TTL. Returns false (and
    /// changes nothing) if the channel is not registered.
    pub fn keepalive(&mut self, channel: &str, now: Instant) -> bool {
        match self.entries.get_mut(channel) {
            Some(entry) => {
                if let Ttl::Expires(d) = entry.ttl {
                    entry.expires_at = Some(now + d);
                }
                true
            }
            None => false,
        }
    }

    /// Remove and return every channel whose expiry is at or before `now`.
    /// Each expired channel is returned exactly once.
    pub fn sweep(&mut self, now: Instant) -> Vec<String> {
        let mut expired: Vec<String> = self
            .entries
            .iter()
            .filter(|(_, e)| e.expires_at.is_some_and(|at| at <= now))
            .map(|(name, _)| name.clone())
            .collect();
        for name in &expired {
            self.entries.remove(name);
        }
        expired.sort();
        expired
    }

    /// Drop `channel` without reporting a timeout.
    pub fn unregister(&mut self, channel: &str) -> bool {
        self.entries.remove(channel).is_some()
    }

    pub fn is_registered(&self, channel: &str) -> bool {
        self.entries.contains_key(channel)
    }

    /// `None` if unregistered, `Some(None)` if permanent.
    pub fn expires_at(&self, channel: &str) -> Option<Option<Instant>> {
        self.entries.get(channel).map(|e| e.expires_at)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const SECOND: Duration = Duration::from_secs(1);

    #[test]
    fn new_then_refreshed() {
        let now = Instant::now();
        let mut mgr = ChannelManager::new();
        assert_eq!(mgr.register("g1", Ttl::Expires(5 * SECOND), now), Registration::New);
        assert_eq!(
            mgr.register("g1", Ttl::Expires(5 * SECOND), now),
            Registration::Refreshed
        );
        assert_eq!(mgr.len(), 1);
    }

    #[test]
    fn expires_after_ttl() {
        let now = Instant::now();
        let mut mgr = ChannelManager::new();
        mgr.register("g1", Ttl::Expires(5 * SECOND), now);

        assert!(mgr.sweep(now + 4 * SECOND).is_empty());
        assert_eq!(mgr.sweep(now + 5 * SECOND), vec!["g1".to_string()]);
        assert!(!mgr.is_registered("g1"));
        assert!(mgr.sweep(now + 6 * SECOND).is_empty());
    }

    #[test]
    fn keepalive_extends() {
        let now = Instant::now();
        let mut mgr = ChannelManager::new();
        mgr.register("g1", Ttl::Expires(5 * SECOND), now);

        assert!(mgr.keepalive("g1", now + 4 * SECOND));
        assert!(mgr.sweep(now + 8 * SECOND).is_empty());
        assert_eq!(mgr.sweep(now + 9 * SECOND), vec!["g1".to_string()]);
    }

    #[test]
    fn keepalive_unknown_is_noop() {
        let now = Instant::now();
        let mut mgr = ChannelManager::new();
        assert!(!mgr.keepalive("nope", now));
        assert!(mgr.is_empty());
    }

    #[test]
    fn permanent_never_expires() {
        let now = Instant::now();
        let mut mgr = ChannelManager::new();
        mgr.register("ALL", Ttl::Permanent, now);
        mgr.register("ALL", Ttl::Expires(SECOND), now);

        assert!(mgr.sweep(now + Duration::from_secs(86_400)).is_empty());
        assert_eq!(mgr.expires_at("ALL"), Some(None));
    }

    #[test]
    fn latest_registration_wins() {
        let now = Instant::now();
        let mut mgr = ChannelManager::new();
        mgr.register("g1", Ttl::Expires(60 * SECOND), now);
        mgr.register("g1", Ttl::Expires(2 * SECOND), now + SECOND);
        assert_eq!(mgr.expires_at("g1"), Some(Some(now + 3 * SECOND)));
    }

    #[test]
    fn unregister_is_silent() {
        let now = Instant::now();
        let mut mgr = ChannelManager::new();
        mgr.register("g1", Ttl::Expires(SECOND), now);
        assert!(mgr.unregister("g1"));
        assert!(mgr.sweep(now + 2 * SECOND).is_empty());
    }

    proptest! {
        /// However registrations, keepalives and sweeps interleave, a
        /// channel's timeout is reported at most once per registration and
        /// never before its expiry.
        #[test]
        fn timeouts_fire_once_and_never_early(
            ops in prop::collection::vec((0u8..3, 0usize..4, 1u64..20), 1..60)
        ) {
            let names = ["a", "b", "c", "d"];
            let start = Instant::now();
            let mut now = start;
            let mut mgr = ChannelManager::new();
            let mut deadline: HashMap<&str, Instant> = HashMap::new();

            for (op, idx, secs) in ops {
                let name = names[idx];
                match op {
                    0 => {
                        mgr.register(name, Ttl::Expires(Duration::from_secs(secs)), now);
                        deadline.insert(name, now + Duration::from_secs(secs));
                    }
                    1 => {
                        now += Duration::from_secs(secs);
                    }
                    _ => {
                        let expired = mgr.sweep(now);
                        for ch in &expired {
                            let due = deadline.remove(ch.as_str());
                            prop_assert!(due.is_some(), "{ch} reported without registration");
                            prop_assert!(due.unwrap() <= now, "{ch} reported early");
                        }
                        for (ch, due) in &deadline {
                            prop_assert!(*due > now, "{ch} overdue but not reported");
                        }
                    }
                }
            }
        }
    }
}
