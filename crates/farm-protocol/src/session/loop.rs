/// The session event loop.
///
/// A single task that owns the session state and multiplexes over the bus,
/// backend results, timers and the shutdown signal.
use std::future::Future;

use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};

use crate::error::ProtocolError;
use crate::router::Router;

use super::effect::SessionEffect;
use super::executor::{execute_effects, ExecContext};
use super::state::{SessionInput, SessionState};
use super::transport::Bus;
use super::SessionConfig;

pub(super) async fn session_loop<B, F>(
    mut bus: B,
    config: SessionConfig,
    ctx: ExecContext,
    mut input_rx: mpsc::UnboundedReceiver<SessionInput>,
    shutdown: F,
) -> Result<(), ProtocolError>
where
    B: Bus,
    F: Future<Output = ()>,
{
    let mut router: Router<SessionState, SessionEffect> = SessionState::router()?;
    let mut state = SessionState::new(&config, Instant::now());

    let effects = state.start(Instant::now());
    execute_effects(effects, &bus, &ctx);
    tracing::info!(solo = state.solo_channel(), "session started");

    // ── Timers ──────────────────────────────────────────────────────
    let mut sweep = tokio::time::interval(config.sweep_interval);
    let mut heartbeat = tokio::time::interval(config.heartbeat_interval);
    sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);
    heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

    // Skip the immediate first tick; start() already poked.
    sweep.tick().await;
    heartbeat.tick().await;

    tokio::pin!(shutdown);

    loop {
        let effects = tokio::select! {
            // ── 1. Inbound bus messages ─────────────────────────
            incoming = bus.recv() => match incoming {
                Some((channel, data)) => {
                    state.handle_incoming(&mut router, &channel, &data, Instant::now())
                }
                None => {
                    tracing::error!("bus closed");
                    return Err(ProtocolError::BusClosed);
                }
            },

            // ── 2. Probe and shell results ──────────────────────
            Some(input) = input_rx.recv() => state.handle_input(input),

            // ── 3. Timers ───────────────────────────────────────
            _ = sweep.tick() => state.tick_sweep(Instant::now()),
            _ = heartbeat.tick() => state.tick_heartbeat(),

            // ── 4. Shutdown ─────────────────────────────────────
            _ = &mut shutdown => {
                tracing::info!("session shutting down");
                return Ok(());
            }
        };
        execute_effects(effects, &bus, &ctx);
    }
}
