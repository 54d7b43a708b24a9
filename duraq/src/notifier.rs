//! Lifecycle event delivery.
//!
//! The engine emits events from its command loop, so a notifier observes
//! them in emission order. Delivery is fire-and-forget: the engine never
//! looks at a result and never blocks on an observer.

use tokio::sync::mpsc;

use crate::Job;

/// A lifecycle event emitted by the queue engine.
#[derive(Clone, Debug)]
pub enum QueueEvent {
    Started,
    Stopped,
    JobSucceeded(Job),
    /// Carries the job as it was claimed, i.e. `attempts` counts the
    /// failures before this one.
    JobFailed(Job),
    Drained,
}

/// Sink for [`QueueEvent`]s. Implementations must not block.
pub trait Notifier: Send + Sync {
    fn notify(&self, event: QueueEvent);
}

/// Discards every event. The default sink.
#[derive(Clone, Copy, Debug, Default)]
pub struct NullNotifier;

impl Notifier for NullNotifier {
    fn notify(&self, _event: QueueEvent) {}
}

/// Forwards events over an unbounded channel. Events emitted after the
/// receiver is dropped are discarded.
#[derive(Clone, Debug)]
pub struct ChannelNotifier {
    sender: mpsc::UnboundedSender<QueueEvent>,
}

impl ChannelNotifier {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<QueueEvent>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }
}

impl Notifier for ChannelNotifier {
    fn notify(&self, event: QueueEvent) {
        let _ = self.sender.send(event);
    }
}
