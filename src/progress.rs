//! Typed progress streaming over bounded channels.
//!
//! Long-running operations emit progress records instead of invoking
//! callbacks; the receiving end decides whether to forward them (e.g. over
//! SSE) or drop them. Channels are bounded and sends are non-blocking: when
//! a consumer falls behind, records are dropped rather than stalling the
//! pipeline.

use flume::{Receiver, Sender, TrySendError};
use tracing::trace;

/// Sending half for progress records of type `T`.
///
/// Cloneable and cheap; a disconnected receiver turns every send into a
/// no-op so pipelines never fail because nobody is listening.
#[derive(Clone)]
pub struct ProgressSender<T> {
    tx: Option<Sender<T>>,
}

impl<T> ProgressSender<T> {
    /// A sender that discards everything, for callers without a consumer.
    pub fn disabled() -> Self {
        Self { tx: None }
    }

    /// Emits one record; lossy under backpressure.
    pub fn emit(&self, record: T) {
        if let Some(tx) = &self.tx {
            match tx.try_send(record) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => trace!("progress channel full, record dropped"),
                Err(TrySendError::Disconnected(_)) => {}
            }
        }
    }
}

/// Creates a bounded progress channel.
pub fn channel<T>(capacity: usize) -> (ProgressSender<T>, Receiver<T>) {
    let (tx, rx) = flume::bounded(capacity);
    (ProgressSender { tx: Some(tx) }, rx)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn emits_are_received_in_order() {
        let (tx, rx) = channel(8);
        tx.emit(1);
        tx.emit(2);
        assert_eq!(rx.drain().collect::<Vec<_>>(), vec![1, 2]);
    }

    #[test]
    fn full_channel_drops_instead_of_blocking() {
        let (tx, rx) = channel(1);
        tx.emit(1);
        tx.emit(2);
        assert_eq!(rx.drain().collect::<Vec<_>>(), vec![1]);
    }

    #[test]
    fn disabled_sender_is_a_no_op() {
        let tx: ProgressSender<u32> = ProgressSender::disabled();
        tx.emit(42);
    }

    #[test]
    fn disconnected_receiver_is_tolerated() {
        let (tx, rx) = channel(2);
        drop(rx);
        tx.emit(7);
    }
}
