//! Outbound queue: messages accepted while the session is not ready.

use std::collections::VecDeque;

use thiserror::Error;

use crate::address::ChatId;

/// A message waiting for a ready session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
    pub recipient: ChatId,
    pub payload: String,
    /// Monotonic enqueue sequence; FIFO key.
    pub enqueued_at: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("outbound queue is full ({capacity} messages)")]
pub struct QueueFull {
    pub capacity: usize,
}

/// FIFO buffer, unbounded unless a capacity is given.
#[derive(Debug, Default)]
pub struct OutboundQueue {
    items: VecDeque<OutboundMessage>,
    capacity: Option<usize>,
    next_seq: u64,
}

impl OutboundQueue {
    pub fn new(capacity: Option<usize>) -> Self {
        Self {
            items: VecDeque::new(),
            capacity,
            next_seq: 0,
        }
    }

    /// Append a message; returns its sequence number.
    pub fn push(&mut self, recipient: ChatId, payload: String) -> Result<u64, QueueFull> {
        if let Some(capacity) = self.capacity
            && self.items.len() >= capacity
        {
            return Err(QueueFull { capacity });
        }
        let seq = self.next_seq;
        self.next_seq += 1;
        self.items.push_back(OutboundMessage {
            recipient,
            payload,
            enqueued_at: seq,
        });
        Ok(seq)
    }

    /// Take everything, oldest first, leaving the queue empty.
    pub fn drain(&mut self) -> Vec<OutboundMessage> {
        self.items.drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}
