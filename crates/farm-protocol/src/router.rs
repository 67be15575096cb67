/// Message router.
///
/// Pure dispatch: decodes an envelope and hands the message to the one
/// handler registered for its type. Handlers mutate caller-owned state and
/// return effects; the router performs no I/O.
use std::collections::HashMap;

use crate::envelope::{decode, Message};
use crate::error::ProtocolError;
use crate::types::MessageType;

/// Handler signature: `(state, channel the message arrived on, message)`.
pub type Handler<S, E> = Box<dyn FnMut(&mut S, &str, Message) -> Vec<E> + Send>;

/// Result of dispatching one inbound message.
#[derive(Debug)]
pub enum Dispatch<E> {
    /// A handler ran and produced these effects.
    Handled { msg_type: MessageType, effects: Vec<E> },
    /// Known type, no handler registered.
    Unhandled(MessageType),
    /// Could not decode (bad bytes, unknown tag, wrong payload).
    Rejected(ProtocolError),
}

pub struct Router<S, E> {
    handlers: HashMap<MessageType, Handler<S, E>>,
}

impl<S, E> Default for Router<S, E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S, E> Router<S, E> {
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    /// Register the handler for `msg_type`. At most one handler per type.
    pub fn register<F>(&mut self, msg_type: MessageType, handler: F) -> Result<(), ProtocolError>
    where
        F: FnMut(&mut S, &str, Message) -> Vec<E> + Send + 'static,
    {
        if self.handlers.contains_key(&msg_type) {
            return Err(ProtocolError::DuplicateHandler(msg_type));
        }
        self.handlers.insert(msg_type, Box::new(handler));
        Ok(())
    }

    /// Chainable [`register`](Self::register).
    pub fn on<F>(mut self, msg_type: MessageType, handler: F) -> Result<Self, ProtocolError>
    where
        F: FnMut(&mut S, &str, Message) -> Vec<E> + Send + 'static,
    {
        self.register(msg_type, handler)?;
        Ok(self)
    }

    pub fn handles(&self, msg_type: MessageType) -> bool {
        self.handlers.contains_key(&msg_type)
    }

    /// Decode `data` and run the matching handler, if any.
    pub fn dispatch(&mut self, state: &mut S, channel: &str, data: &[u8]) -> Dispatch<E> {
        let message = match decode(data) {
            Ok(m) => m,
            Err(e) => return Dispatch::Rejected(e),
        };
        self.route(state, channel, message)
    }

    /// Run the handler for an already-decoded message.
    pub fn route(&mut self, state: &mut S, channel: &str, message: Message) -> Dispatch<E> {
        let msg_type = message.message_type();
        match self.handlers.get_mut(&msg_type) {
            Some(handler) => Dispatch::Handled {
                msg_type,
                effects: handler(state, channel, message),
            },
            None => Dispatch::Unhandled(msg_type),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::{encode, DeviceDoneMessage, ProbeMessage};

    #[derive(Default)]
    struct Seen {
        channels: Vec<String>,
    }

    fn probe_bytes() -> Vec<u8> {
        encode(&Message::Probe(ProbeMessage {})).unwrap()
    }

    #[test]
    fn dispatches_to_registered_handler() {
        let mut router: Router<Seen, &'static str> = Router::new()
            .on(MessageType::Probe, |seen: &mut Seen, channel, _msg| {
                seen.channels.push(channel.to_string());
                vec!["probed"]
            })
            .unwrap();

        let mut seen = Seen::default();
        match router.dispatch(&mut seen, "solo", &probe_bytes()) {
            Dispatch::Handled { msg_type, effects } => {
                assert_eq!(msg_type, MessageType::Probe);
                assert_eq!(effects, vec!["probed"]);
            }
            other => panic!("expected Handled, got {other:?}"),
        }
        assert_eq!(seen.channels, vec!["solo".to_string()]);
    }

    #[test]
    fn duplicate_registration_rejected() {
        let mut router: Router<Seen, ()> = Router::new();
        router.register(MessageType::Probe, |_, _, _| vec![]).unwrap();
        let err = router
            .register(MessageType::Probe, |_, _, _| vec![])
            .unwrap_err();
        assert!(matches!(err, ProtocolError::DuplicateHandler(MessageType::Probe)));
    }

    #[test]
    fn unhandled_type_is_reported() {
        let mut router: Router<Seen, ()> = Router::new();
        let bytes = encode(&Message::DeviceDone(DeviceDoneMessage {
            serial: "s".into(),
        }))
        .unwrap();
        let outcome = router.dispatch(&mut Seen::default(), "ALL", &bytes);
        assert!(matches!(outcome, Dispatch::Unhandled(MessageType::DeviceDone)));
    }

    #[test]
    fn unknown_tag_is_rejected_not_fatal() {
        let mut router: Router<Seen, ()> = Router::new()
            .on(MessageType::Probe, |_, _, _| vec![()])
            .unwrap();
        // Same wire shape as an envelope, with a tag outside the catalogue.
        let raw = rmp_serde::to_vec(&(77u32, serde_bytes::ByteBuf::new())).unwrap();

        let outcome = router.dispatch(&mut Seen::default(), "ALL", &raw);
        assert!(matches!(outcome, Dispatch::Rejected(ProtocolError::UnknownType(77))));

        // Still usable afterwards.
        assert!(matches!(
            router.dispatch(&mut Seen::default(), "ALL", &probe_bytes()),
            Dispatch::Handled { .. }
        ));
    }
}
