//! Core event types and channel policy for the folio engine.
//!
//! The engine loop consumes a bounded mpsc channel sized by
//! [`EVENT_CHANNEL_CAP`]. There is a single consumer (the orchestrator) and
//! few producers (the file watcher thread, a Ctrl-C handler); producers on
//! foreign threads use `blocking_send`, which parks rather than drops, so
//! change notifications are never lost under backpressure. Telemetry
//! counters are plain relaxed atomics, inspected by tests and periodic logs.

use std::sync::atomic::AtomicU64;

use tokio::sync::mpsc::{Receiver, Sender, channel};

/// Bounded capacity for the engine event channel. Watch events are
/// debounced before they reach the channel, so a small bound suffices.
pub const EVENT_CHANNEL_CAP: usize = 64;

// Telemetry counters (relaxed; single consumer reads them for logging).
pub static WATCH_EVENTS_RAW: AtomicU64 = AtomicU64::new(0);
pub static WATCH_EVENTS_DEBOUNCED: AtomicU64 = AtomicU64::new(0);
pub static CHANNEL_SEND_FAILURES: AtomicU64 = AtomicU64::new(0);
pub static PASSES_COALESCED: AtomicU64 = AtomicU64::new(0);

/// Top-level event enum consumed by the engine loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineEvent {
    /// The watched file changed on disk (already debounced). The engine
    /// reads the newest content itself; the event carries no payload.
    FileChanged,
    /// Explicit user request to reset the environment and re-run from
    /// scratch.
    ResetRequested,
    Shutdown,
}

/// Create the engine event channel with the standard capacity.
pub fn engine_channel() -> (Sender<EngineEvent>, Receiver<EngineEvent>) {
    channel(EVENT_CHANNEL_CAP)
}

/// Hooks observing events at the loop boundary. No-op by default; the
/// binary installs one for styled summaries and tests use them to record
/// loop traffic. Implementations must not block.
pub trait EventHooks: Send + 'static {
    fn pre_handle(&mut self, _event: &EngineEvent) {}
    fn post_handle(&mut self, _event: &EngineEvent) {}
}

/// Default no-op hooks implementation.
pub struct NoopEventHooks;

impl EventHooks for NoopEventHooks {}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn channel_delivers_in_fifo_order() {
        let (tx, mut rx) = engine_channel();
        tx.send(EngineEvent::FileChanged).await.unwrap();
        tx.send(EngineEvent::Shutdown).await.unwrap();
        assert_eq!(rx.recv().await, Some(EngineEvent::FileChanged));
        assert_eq!(rx.recv().await, Some(EngineEvent::Shutdown));
    }

    #[tokio::test]
    async fn blocking_send_from_foreign_thread_delivers() {
        let (tx, mut rx) = engine_channel();
        let producer = std::thread::spawn(move || {
            tx.blocking_send(EngineEvent::FileChanged).unwrap();
        });
        assert_eq!(rx.recv().await, Some(EngineEvent::FileChanged));
        producer.join().unwrap();
    }

    #[test]
    fn hooks_default_to_noop() {
        let mut hooks = NoopEventHooks;
        hooks.pre_handle(&EngineEvent::Shutdown);
        hooks.post_handle(&EngineEvent::Shutdown);
    }
}
