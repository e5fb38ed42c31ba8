//! Jobs: one in-flight message plus its acknowledgment and retry bookkeeping.

use super::record::{InboundMessage, Record};
use crate::error::RecordError;
use std::fmt;
use std::sync::Arc;

/// Source-owned token used to signal that a message has been persisted.
///
/// Called from worker tasks on the flush path, so it must not block.
pub trait AckHandle: Send + Sync {
    /// Mark the message as safe to commit.
    fn acknowledge(&self, message: &InboundMessage);

    /// The pool gave up on the message after exhausting its retries.
    ///
    /// The message was not persisted. Sources that track commit positions
    /// stop waiting for it so later messages can still be committed.
    fn release(&self, _message: &InboundMessage) {}
}

/// Acknowledgment handle that does nothing, for sources without commits.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopAck;

impl AckHandle for NoopAck {
    fn acknowledge(&self, _message: &InboundMessage) {}
}

/// A message travelling through the pool.
///
/// Not `Clone`: a job lives in exactly one place (the queue, one worker
/// buffer, or one pending retry) and acknowledging it consumes it.
pub struct Job {
    message: InboundMessage,
    ack: Arc<dyn AckHandle>,
    attempts: u32,
}

impl Job {
    /// Wrap a message with the handle that acknowledges it.
    pub fn new(message: InboundMessage, ack: Arc<dyn AckHandle>) -> Self {
        Self {
            message,
            ack,
            attempts: 0,
        }
    }

    /// The wrapped message.
    pub fn message(&self) -> &InboundMessage {
        &self.message
    }

    /// Number of retries already scheduled for this job.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub(crate) fn increment_attempts(&mut self) -> u32 {
        self.attempts += 1;
        self.attempts
    }

    /// Build the record for this job's message.
    pub fn to_record(&self) -> Result<Record, RecordError> {
        Record::try_from_message(&self.message)
    }

    /// Acknowledge the job back to its source.
    pub fn acknowledge(self) {
        self.ack.acknowledge(&self.message);
    }

    /// Hand a dropped job back to its source unacknowledged.
    pub fn release(self) {
        self.ack.release(&self.message);
    }
}

impl fmt::Debug for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Job")
            .field("topic", &self.message.topic)
            .field("partition", &self.message.partition)
            .field("offset", &self.message.offset)
            .field("attempts", &self.attempts)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct RecordingAck {
        acked: Mutex<Vec<i64>>,
        released: Mutex<Vec<i64>>,
    }

    impl AckHandle for RecordingAck {
        fn acknowledge(&self, message: &InboundMessage) {
            self.acked.lock().push(message.offset);
        }

        fn release(&self, message: &InboundMessage) {
            self.released.lock().push(message.offset);
        }
    }

    #[test]
    fn test_acknowledge_calls_handle_with_message() {
        let ack = Arc::new(RecordingAck::default());
        let job = Job::new(InboundMessage::new("t", 0, 12), ack.clone());
        job.acknowledge();
        assert_eq!(*ack.acked.lock(), vec![12]);
    }

    #[test]
    fn test_release_does_not_acknowledge() {
        let ack = Arc::new(RecordingAck::default());
        let job = Job::new(InboundMessage::new("t", 0, 3), ack.clone());
        job.release();
        assert!(ack.acked.lock().is_empty());
        assert_eq!(*ack.released.lock(), vec![3]);
    }

    #[test]
    fn test_attempts_start_at_zero() {
        let mut job = Job::new(InboundMessage::new("t", 0, 1), Arc::new(NoopAck));
        assert_eq!(job.attempts(), 0);
        assert_eq!(job.increment_attempts(), 1);
        assert_eq!(job.increment_attempts(), 2);
    }

    #[test]
    fn test_debug_omits_payload() {
        let job = Job::new(
            InboundMessage::new("t", 4, 8).with_value("secret"),
            Arc::new(NoopAck),
        );
        let text = format!("{:?}", job);
        assert!(text.contains("offset: 8"));
        assert!(!text.contains("secret"));
    }
}
