//! Effect executor. The only place in the session that touches I/O.
//!
//! - Subscribe / Unsubscribe / Publish -> bus
//! - Probe / Shell -> device backend, on spawned tasks; results come back
//!   through the input channel
//! - SaveIdentity -> persistence

use std::sync::Arc;

use tokio::sync::mpsc;

use crate::backend::{DeviceBackend, ShellEvent};
use crate::envelope::encode;
use crate::store::DeviceStore;

use super::effect::SessionEffect;
use super::state::SessionInput;
use super::transport::Bus;

/// What the executor needs besides the bus.
pub(super) struct ExecContext {
    pub serial: String,
    pub backend: Arc<dyn DeviceBackend>,
    pub store: Option<Arc<dyn DeviceStore>>,
    pub input_tx: mpsc::UnboundedSender<SessionInput>,
}

/// Execute a list of effects in order.
pub(super) fn execute_effects<B: Bus>(effects: Vec<SessionEffect>, bus: &B, ctx: &ExecContext) {
    for effect in effects {
        match effect {
            SessionEffect::Subscribe(channel) => {
                bus.subscribe(&channel);
            }
            SessionEffect::Unsubscribe(channel) => {
                bus.unsubscribe(&channel);
            }
            SessionEffect::Publish { channel, message } => match encode(&message) {
                Ok(bytes) => bus.publish(&channel, bytes),
                Err(e) => tracing::warn!("cannot encode {:?}: {e}", message.message_type()),
            },
            SessionEffect::Probe { channel } => {
                let backend = ctx.backend.clone();
                let serial = ctx.serial.clone();
                let input_tx = ctx.input_tx.clone();
                tokio::spawn(async move {
                    let result = backend.properties(&serial).await;
                    let _ = input_tx.send(SessionInput::Probed { channel, result });
                });
            }
            SessionEffect::Shell { stream_id, command } => {
                start_shell(stream_id, &command, ctx);
            }
            SessionEffect::SaveIdentity(identity) => {
                if let Some(store) = &ctx.store {
                    store.save_identity(&ctx.serial, &identity);
                }
            }
        }
    }
}

/// Start a command and forward its events. A command that cannot start is
/// reported as a single failure event.
fn start_shell(stream_id: u64, command: &[String], ctx: &ExecContext) {
    let input_tx = ctx.input_tx.clone();
    let mut stream = match ctx.backend.shell(&ctx.serial, command) {
        Ok(s) => s,
        Err(e) => {
            let _ = input_tx.send(SessionInput::Shell {
                stream_id,
                event: ShellEvent::Fail(e.to_string()),
            });
            return;
        }
    };

    tokio::spawn(async move {
        while let Some(event) = stream.next().await {
            let terminal = event.is_terminal();
            if input_tx.send(SessionInput::Shell { stream_id, event }).is_err() || terminal {
                return;
            }
        }
        // Stream closed without a terminal event.
        let _ = input_tx.send(SessionInput::Shell {
            stream_id,
            event: ShellEvent::Fail("output stream closed".into()),
        });
    });
}
