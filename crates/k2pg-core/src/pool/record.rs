//! Inbound message and the flattened record handed to sinks.

use crate::error::RecordError;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::collections::HashMap;

/// A message as delivered by the source, before any flattening.
#[derive(Debug, Clone, PartialEq)]
pub struct InboundMessage {
    /// Topic name
    pub topic: String,

    /// Partition number
    pub partition: i32,

    /// Offset within the partition
    pub offset: i64,

    /// Message key (optional)
    pub key: Option<Bytes>,

    /// Message value (optional)
    pub value: Option<Bytes>,

    /// Headers in delivery order; keys are raw bytes and may repeat
    pub headers: Vec<(Bytes, Bytes)>,

    /// Broker timestamp
    pub timestamp: DateTime<Utc>,
}

impl InboundMessage {
    /// Create a message with no key, value or headers.
    pub fn new(topic: impl Into<String>, partition: i32, offset: i64) -> Self {
        Self {
            topic: topic.into(),
            partition,
            offset,
            key: None,
            value: None,
            headers: Vec::new(),
            timestamp: Utc::now(),
        }
    }

    /// Set the key.
    pub fn with_key(mut self, key: impl Into<Bytes>) -> Self {
        self.key = Some(key.into());
        self
    }

    /// Set the value.
    pub fn with_value(mut self, value: impl Into<Bytes>) -> Self {
        self.value = Some(value.into());
        self
    }

    /// Append a header.
    pub fn with_header(mut self, key: impl Into<Bytes>, value: impl Into<Bytes>) -> Self {
        self.headers.push((key.into(), value.into()));
        self
    }

    /// Set the timestamp.
    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// Estimated size in bytes.
    pub fn size_bytes(&self) -> usize {
        self.key.as_ref().map(|k| k.len()).unwrap_or(0)
            + self.value.as_ref().map(|v| v.len()).unwrap_or(0)
            + self.topic.len()
            + self
                .headers
                .iter()
                .map(|(k, v)| k.len() + v.len())
                .sum::<usize>()
            + 24 // partition, offset, timestamp
    }
}

/// Sink-ready projection of one message. Never mutated after construction.
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub key: Option<Bytes>,
    pub value: Option<Bytes>,
    pub headers: HashMap<String, Bytes>,
    pub timestamp: DateTime<Utc>,
}

impl Record {
    /// Flatten a message into a record.
    ///
    /// Duplicate header keys collapse to the last value seen. A header key
    /// that is not UTF-8 fails the conversion.
    pub fn try_from_message(msg: &InboundMessage) -> Result<Self, RecordError> {
        let mut headers = HashMap::with_capacity(msg.headers.len());
        for (index, (key, value)) in msg.headers.iter().enumerate() {
            let key = std::str::from_utf8(key).map_err(|_| RecordError::InvalidHeaderKey {
                topic: msg.topic.clone(),
                partition: msg.partition,
                offset: msg.offset,
                index,
            })?;
            headers.insert(key.to_owned(), value.clone());
        }

        Ok(Self {
            topic: msg.topic.clone(),
            partition: msg.partition,
            offset: msg.offset,
            key: msg.key.clone(),
            value: msg.value.clone(),
            headers,
            timestamp: msg.timestamp,
        })
    }

    /// Header value as UTF-8, if present and valid.
    pub fn header_str(&self, key: &str) -> Option<&str> {
        self.headers
            .get(key)
            .and_then(|v| std::str::from_utf8(v).ok())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_copies_message_fields() {
        let ts = Utc::now();
        let msg = InboundMessage::new("events", 2, 77)
            .with_key("user-1")
            .with_value("{\"a\":1}")
            .with_timestamp(ts);

        let record = Record::try_from_message(&msg).unwrap();
        assert_eq!(record.topic, "events");
        assert_eq!(record.partition, 2);
        assert_eq!(record.offset, 77);
        assert_eq!(record.key.as_deref(), Some(&b"user-1"[..]));
        assert_eq!(record.value.as_deref(), Some(&b"{\"a\":1}"[..]));
        assert_eq!(record.timestamp, ts);
        assert!(record.headers.is_empty());
    }

    #[test]
    fn test_duplicate_header_last_write_wins() {
        let msg = InboundMessage::new("events", 0, 1)
            .with_header("trace", "first")
            .with_header("source", "svc")
            .with_header("trace", "second");

        let record = Record::try_from_message(&msg).unwrap();
        assert_eq!(record.headers.len(), 2);
        assert_eq!(record.header_str("trace"), Some("second"));
        assert_eq!(record.header_str("source"), Some("svc"));
    }

    #[test]
    fn test_non_utf8_header_key_fails() {
        let msg = InboundMessage::new("events", 1, 9)
            .with_header("ok", "v")
            .with_header(Bytes::from_static(&[0xff, 0xfe]), "v");

        let err = Record::try_from_message(&msg).unwrap_err();
        assert_eq!(
            err,
            RecordError::InvalidHeaderKey {
                topic: "events".into(),
                partition: 1,
                offset: 9,
                index: 1,
            }
        );
    }

    #[test]
    fn test_message_size() {
        let msg = InboundMessage::new("test", 0, 100)
            .with_key("key")
            .with_value("value");
        assert_eq!(msg.size_bytes(), 3 + 5 + 4 + 24);
    }
}
