/// Pure session logic.
///
/// `SessionState` owns the channel set, the identity and the output
/// sequencing of running commands. It never touches the bus: every method
/// returns the effects the loop should carry out.
use std::collections::HashMap;
use std::time::Duration;

use tokio::time::Instant;

use crate::backend::ShellEvent;
use crate::channels::{ChannelManager, Registration, Ttl};
use crate::envelope::{
    DeviceDataMessage, DeviceDoneMessage, DeviceFailMessage, DeviceIdentityMessage,
    DevicePokeMessage, GroupMessage, JoinGroupMessage, LeaveGroupMessage, Message,
    ShellCommandMessage,
};
use crate::error::ProtocolError;
use crate::identity::{matches, Identity};
use crate::router::{Dispatch, Router};
use crate::types::MessageType;

use super::effect::SessionEffect;
use super::SessionConfig;

/// Results of work the loop ran on the session's behalf.
#[derive(Debug)]
pub enum SessionInput {
    Probed {
        channel: String,
        result: Result<HashMap<String, String>, ProtocolError>,
    },
    Shell {
        stream_id: u64,
        event: ShellEvent,
    },
}

/// Where a running command's output goes and the next sequence number.
#[derive(Debug)]
struct OutputStream {
    channel: String,
    next_seq: u64,
}

pub struct SessionState {
    serial: String,
    global_channel: String,
    solo_channel: String,
    identity: Option<Identity>,
    channels: ChannelManager,
    streams: HashMap<u64, OutputStream>,
    next_stream_id: u64,
    /// Time of the message being dispatched.
    now: Instant,
}

impl SessionState {
    pub fn new(config: &SessionConfig, now: Instant) -> Self {
        Self {
            serial: config.serial.clone(),
            global_channel: config.global_channel.clone(),
            solo_channel: config.solo_channel.clone(),
            identity: None,
            channels: ChannelManager::new(),
            streams: HashMap::new(),
            next_stream_id: 0,
            now,
        }
    }

    /// The router every session dispatches through.
    pub fn router() -> Result<Router<SessionState, SessionEffect>, ProtocolError> {
        Router::new()
            .on(MessageType::Group, SessionState::on_group)?
            .on(MessageType::Probe, SessionState::on_probe)?
            .on(MessageType::ShellCommand, SessionState::on_shell_command)
    }

    // ── Accessors ──────────────────────────────────────────────────────

    pub fn serial(&self) -> &str {
        &self.serial
    }

    pub fn solo_channel(&self) -> &str {
        &self.solo_channel
    }

    pub fn global_channel(&self) -> &str {
        &self.global_channel
    }

    pub fn identity(&self) -> Option<&Identity> {
        self.identity.as_ref()
    }

    pub fn channels(&self) -> &ChannelManager {
        &self.channels
    }

    pub fn active_streams(&self) -> usize {
        self.streams.len()
    }

    // ── Lifecycle ──────────────────────────────────────────────────────

    /// Register the permanent channels and announce the session.
    pub fn start(&mut self, now: Instant) -> Vec<SessionEffect> {
        self.now = now;
        let mut effects = Vec::new();
        for channel in [self.global_channel.clone(), self.solo_channel.clone()] {
            if self.channels.register(&channel, Ttl::Permanent, now) == Registration::New {
                effects.push(SessionEffect::Subscribe(channel));
            }
        }
        effects.extend(self.tick_heartbeat());
        effects
    }

    /// Inbound bus message: keep its channel alive, then dispatch.
    pub fn handle_incoming(
        &mut self,
        router: &mut Router<SessionState, SessionEffect>,
        channel: &str,
        data: &[u8],
        now: Instant,
    ) -> Vec<SessionEffect> {
        self.now = now;
        if !self.channels.keepalive(channel, now) {
            tracing::debug!("message on unregistered channel {channel}");
        }
        match router.dispatch(self, channel, data) {
            Dispatch::Handled { effects, .. } => effects,
            Dispatch::Unhandled(msg_type) => {
                tracing::debug!("no handler for {msg_type:?} on {channel}");
                Vec::new()
            }
            Dispatch::Rejected(e) => {
                tracing::warn!("dropping message on {channel}: {e}");
                Vec::new()
            }
        }
    }

    /// Leave every group channel whose TTL ran out.
    pub fn tick_sweep(&mut self, now: Instant) -> Vec<SessionEffect> {
        self.now = now;
        let mut effects = Vec::new();
        for channel in self.channels.sweep(now) {
            tracing::info!("no longer in group {channel}");
            effects.push(SessionEffect::Unsubscribe(channel.clone()));
            effects.push(SessionEffect::Publish {
                channel,
                message: Message::LeaveGroup(LeaveGroupMessage {
                    serial: self.serial.clone(),
                }),
            });
        }
        effects
    }

    /// Liveness ping on the global channel.
    pub fn tick_heartbeat(&self) -> Vec<SessionEffect> {
        vec![SessionEffect::Publish {
            channel: self.global_channel.clone(),
            message: Message::DevicePoke(DevicePokeMessage {
                serial: self.serial.clone(),
                channel: self.solo_channel.clone(),
            }),
        }]
    }

    pub fn handle_input(&mut self, input: SessionInput) -> Vec<SessionEffect> {
        match input {
            SessionInput::Probed { channel, result } => self.handle_probe_result(&channel, result),
            SessionInput::Shell { stream_id, event } => self.handle_shell_event(stream_id, event),
        }
    }

    /// A probe finished. Success replaces the identity and answers on the
    /// requesting channel; failure is logged and leaves the identity as is.
    pub fn handle_probe_result(
        &mut self,
        channel: &str,
        result: Result<HashMap<String, String>, ProtocolError>,
    ) -> Vec<SessionEffect> {
        let properties = match result {
            Ok(p) => p,
            Err(e) => {
                tracing::warn!("probe of {} failed: {e}", self.serial);
                return Vec::new();
            }
        };
        let identity = Identity::from_properties(&self.serial, &properties);
        self.identity = Some(identity.clone());
        vec![
            SessionEffect::Publish {
                channel: channel.to_string(),
                message: Message::DeviceIdentity(DeviceIdentityMessage {
                    serial: self.serial.clone(),
                    identity: identity.clone(),
                }),
            },
            SessionEffect::SaveIdentity(identity),
        ]
    }

    /// One event from a running command. Data chunks are numbered from 0;
    /// the terminal event closes the stream and later events are ignored.
    pub fn handle_shell_event(&mut self, stream_id: u64, event: ShellEvent) -> Vec<SessionEffect> {
        let Some(stream) = self.streams.get_mut(&stream_id) else {
            tracing::debug!("event for finished stream {stream_id}, ignoring");
            return Vec::new();
        };
        let serial = self.serial.clone();
        let (channel, message) = match event {
            ShellEvent::Data(chunk) => {
                let seq = stream.next_seq;
                stream.next_seq += 1;
                (
                    stream.channel.clone(),
                    Message::DeviceData(DeviceDataMessage { serial, seq, chunk }),
                )
            }
            ShellEvent::End => {
                let stream = self.streams.remove(&stream_id);
                (
                    stream.map(|s| s.channel).unwrap_or_default(),
                    Message::DeviceDone(DeviceDoneMessage { serial }),
                )
            }
            ShellEvent::Fail(message) => {
                tracing::warn!("shell command on {serial} failed: {message}");
                let stream = self.streams.remove(&stream_id);
                (
                    stream.map(|s| s.channel).unwrap_or_default(),
                    Message::DeviceFail(DeviceFailMessage { serial, message }),
                )
            }
        };
        vec![SessionEffect::Publish { channel, message }]
    }

    // ── Handlers ───────────────────────────────────────────────────────

    fn on_group(&mut self, _channel: &str, message: Message) -> Vec<SessionEffect> {
        let Message::Group(GroupMessage {
            channel,
            timeout_ms,
            requirements,
        }) = message
        else {
            return Vec::new();
        };

        if !matches(self.identity.as_ref(), &requirements) {
            tracing::debug!("requirements of group {channel} not met");
            return Vec::new();
        }

        let mut effects = Vec::new();
        let ttl = Ttl::Expires(Duration::from_millis(timeout_ms));
        if self.channels.register(&channel, ttl, self.now) == Registration::New {
            tracing::info!("joined group {channel}");
            effects.push(SessionEffect::Subscribe(channel.clone()));
        }
        effects.push(SessionEffect::Publish {
            channel,
            message: Message::JoinGroup(JoinGroupMessage {
                serial: self.serial.clone(),
            }),
        });
        effects
    }

    fn on_probe(&mut self, channel: &str, _message: Message) -> Vec<SessionEffect> {
        vec![SessionEffect::Probe {
            channel: channel.to_string(),
        }]
    }

    fn on_shell_command(&mut self, _channel: &str, message: Message) -> Vec<SessionEffect> {
        let Message::ShellCommand(ShellCommandMessage { channel, command }) = message else {
            return Vec::new();
        };
        let stream_id = self.next_stream_id;
        self.next_stream_id += 1;
        tracing::info!("running shell command {command:?}");
        self.streams.insert(
            stream_id,
            OutputStream {
                channel,
                next_seq: 0,
            },
        );
        vec![SessionEffect::Shell { stream_id, command }]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::{encode, ProbeMessage};
    use crate::identity::Requirement;

    const SECOND: Duration = Duration::from_secs(1);

    fn config() -> SessionConfig {
        SessionConfig::new("emulator-5554").solo_channel("solo")
    }

    fn started() -> (SessionState, Router<SessionState, SessionEffect>, Instant) {
        let now = Instant::now();
        let mut state = SessionState::new(&config(), now);
        state.start(now);
        (state, SessionState::router().unwrap(), now)
    }

    fn group(channel: &str, timeout_ms: u64, requirements: Vec<Requirement>) -> Vec<u8> {
        encode(&Message::Group(GroupMessage {
            channel: channel.into(),
            timeout_ms,
            requirements,
        }))
        .unwrap()
    }

    fn shell(channel: &str) -> Vec<u8> {
        encode(&Message::ShellCommand(ShellCommandMessage {
            channel: channel.into(),
            command: vec!["ls".into()],
        }))
        .unwrap()
    }

    fn published(effects: &[SessionEffect]) -> Vec<(&str, MessageType)> {
        effects
            .iter()
            .filter_map(|e| match e {
                SessionEffect::Publish { channel, message } => {
                    Some((channel.as_str(), message.message_type()))
                }
                _ => None,
            })
            .collect()
    }

    #[test]
    fn start_subscribes_permanent_channels_and_pokes() {
        let now = Instant::now();
        let mut state = SessionState::new(&config(), now);
        let effects = state.start(now);

        assert_eq!(effects[0], SessionEffect::Subscribe("ALL".into()));
        assert_eq!(effects[1], SessionEffect::Subscribe("solo".into()));
        assert_eq!(
            effects[2],
            SessionEffect::Publish {
                channel: "ALL".into(),
                message: Message::DevicePoke(DevicePokeMessage {
                    serial: "emulator-5554".into(),
                    channel: "solo".into(),
                }),
            }
        );
    }

    #[test]
    fn group_joins_once_and_leaves_on_expiry() {
        let (mut state, mut router, now) = started();

        let effects = state.handle_incoming(&mut router, "ALL", &group("g1", 5_000, vec![]), now);
        assert_eq!(effects[0], SessionEffect::Subscribe("g1".into()));
        assert_eq!(published(&effects), vec![("g1", MessageType::JoinGroup)]);

        // Re-sent GROUP refreshes without a second subscribe.
        let effects = state.handle_incoming(&mut router, "ALL", &group("g1", 5_000, vec![]), now);
        assert!(!effects.contains(&SessionEffect::Subscribe("g1".into())));

        assert!(state.tick_sweep(now + 4 * SECOND).is_empty());
        let effects = state.tick_sweep(now + 5 * SECOND);
        assert_eq!(effects[0], SessionEffect::Unsubscribe("g1".into()));
        assert_eq!(published(&effects), vec![("g1", MessageType::LeaveGroup)]);
        assert!(state.tick_sweep(now + 6 * SECOND).is_empty());
    }

    #[test]
    fn traffic_on_group_channel_keeps_it_alive() {
        let (mut state, mut router, now) = started();
        state.handle_incoming(&mut router, "ALL", &group("g1", 5_000, vec![]), now);

        let poke = encode(&Message::DevicePoke(DevicePokeMessage {
            serial: "other".into(),
            channel: "x".into(),
        }))
        .unwrap();
        state.handle_incoming(&mut router, "g1", &poke, now + 4 * SECOND);

        assert!(state.tick_sweep(now + 8 * SECOND).is_empty());
        assert_eq!(state.tick_sweep(now + 9 * SECOND).len(), 2);
    }

    #[test]
    fn unmet_requirements_before_probe() {
        let (mut state, mut router, now) = started();
        let reqs = vec![Requirement::exact("platform", "Android")];
        let effects = state.handle_incoming(&mut router, "ALL", &group("g1", 5_000, reqs), now);
        assert!(effects.is_empty());
        assert!(!state.channels().is_registered("g1"));
    }

    #[test]
    fn empty_requirements_join_without_an_identity() {
        let (mut state, mut router, now) = started();
        assert!(state.identity().is_none());

        let effects = state.handle_incoming(&mut router, "ALL", &group("g1", 5_000, vec![]), now);
        assert_eq!(published(&effects), vec![("g1", MessageType::JoinGroup)]);
        assert!(state.channels().is_registered("g1"));
    }

    #[test]
    fn probe_replies_on_requesting_channel() {
        let (mut state, mut router, now) = started();
        let probe = encode(&Message::Probe(ProbeMessage {})).unwrap();
        let effects = state.handle_incoming(&mut router, "solo", &probe, now);
        assert_eq!(
            effects,
            vec![SessionEffect::Probe {
                channel: "solo".into()
            }]
        );

        let props = HashMap::from([("ro.product.model".to_string(), "Pixel 7".to_string())]);
        let effects = state.handle_probe_result("solo", Ok(props));
        assert_eq!(published(&effects), vec![("solo", MessageType::DeviceIdentity)]);
        assert!(matches!(effects[1], SessionEffect::SaveIdentity(_)));
        assert_eq!(state.identity().unwrap().get("model"), Some("Pixel 7"));

        // Now a requirement on the model can be met.
        let reqs = vec![Requirement::glob("model", "Pixel*")];
        let effects = state.handle_incoming(&mut router, "ALL", &group("g2", 1_000, reqs), now);
        assert_eq!(published(&effects), vec![("g2", MessageType::JoinGroup)]);
    }

    #[test]
    fn failed_probe_keeps_previous_identity() {
        let (mut state, _, _) = started();
        let props = HashMap::from([("ro.product.model".to_string(), "A".to_string())]);
        state.handle_probe_result("solo", Ok(props));

        let effects = state.handle_probe_result("solo", Err(ProtocolError::Backend("offline".into())));
        assert!(effects.is_empty());
        assert_eq!(state.identity().unwrap().get("model"), Some("A"));
    }

    #[test]
    fn shell_output_is_sequenced_then_closed() {
        let (mut state, mut router, now) = started();
        let effects = state.handle_incoming(&mut router, "solo", &shell("out"), now);
        let SessionEffect::Shell { stream_id, .. } = effects[0] else {
            panic!("expected Shell, got {effects:?}");
        };

        let mut seqs = Vec::new();
        for chunk in [b"a".to_vec(), b"b".to_vec(), b"c".to_vec()] {
            for effect in state.handle_shell_event(stream_id, ShellEvent::Data(chunk)) {
                if let SessionEffect::Publish {
                    channel,
                    message: Message::DeviceData(d),
                } = effect
                {
                    assert_eq!(channel, "out");
                    seqs.push(d.seq);
                }
            }
        }
        assert_eq!(seqs, vec![0, 1, 2]);

        let effects = state.handle_shell_event(stream_id, ShellEvent::End);
        assert_eq!(published(&effects), vec![("out", MessageType::DeviceDone)]);
        assert_eq!(state.active_streams(), 0);

        // Nothing after the terminal event.
        assert!(state
            .handle_shell_event(stream_id, ShellEvent::Data(b"late".to_vec()))
            .is_empty());
    }

    #[test]
    fn concurrent_streams_number_independently() {
        let (mut state, mut router, now) = started();
        let first = state.handle_incoming(&mut router, "solo", &shell("a"), now);
        let second = state.handle_incoming(&mut router, "solo", &shell("b"), now);
        let (SessionEffect::Shell { stream_id: a, .. }, SessionEffect::Shell { stream_id: b, .. }) =
            (&first[0], &second[0])
        else {
            panic!("expected two Shell effects");
        };
        assert_ne!(a, b);

        for id in [*a, *b] {
            let effects = state.handle_shell_event(id, ShellEvent::Data(b"x".to_vec()));
            let SessionEffect::Publish {
                message: Message::DeviceData(d),
                ..
            } = &effects[0]
            else {
                panic!("expected DeviceData");
            };
            assert_eq!(d.seq, 0);
        }
    }

    #[test]
    fn failure_reports_fail_and_closes() {
        let (mut state, mut router, now) = started();
        let effects = state.handle_incoming(&mut router, "solo", &shell("out"), now);
        let SessionEffect::Shell { stream_id, .. } = effects[0] else {
            panic!("expected Shell");
        };
        let effects = state.handle_shell_event(stream_id, ShellEvent::Fail("boom".into()));
        assert_eq!(
            effects,
            vec![SessionEffect::Publish {
                channel: "out".into(),
                message: Message::DeviceFail(DeviceFailMessage {
                    serial: "emulator-5554".into(),
                    message: "boom".into(),
                }),
            }]
        );
        assert_eq!(state.active_streams(), 0);
    }

    #[test]
    fn malformed_input_is_dropped() {
        let (mut state, mut router, now) = started();
        assert!(state
            .handle_incoming(&mut router, "ALL", &[0xc1, 0xc1], now)
            .is_empty());
    }
}
