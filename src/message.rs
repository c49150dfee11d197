//! Client messages.
//!
//! The collector communicates asynchronous events — collection start and
//! end, finalization — through a per-arena message queue. Message kinds are
//! disabled by default; the client enables the kinds it wants delivered and
//! polls the queue.

use std::collections::VecDeque;

use enum_map::{Enum, EnumMap};

use crate::util::address::{Address, ByteSize};

#[derive(Copy, Clone, Debug, PartialEq, Eq, Enum)]
pub enum MessageKind {
    GcBegin,
    GcEnd,
    Finalization,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Message {
    /// A collection began.
    GcBegin { why: &'static str },
    /// A collection finished.
    GcEnd {
        live: ByteSize,
        condemned: ByteSize,
        not_condemned: ByteSize,
    },
    /// A finalizable object became unreachable.
    Finalization { object: Address },
}

impl Message {
    pub fn kind(&self) -> MessageKind {
        match self {
            Message::GcBegin { .. } => MessageKind::GcBegin,
            Message::GcEnd { .. } => MessageKind::GcEnd,
            Message::Finalization { .. } => MessageKind::Finalization,
        }
    }
}

#[derive(Default)]
pub struct MessageQueue {
    enabled: EnumMap<MessageKind, bool>,
    queue: VecDeque<Message>,
}

impl MessageQueue {
    pub fn new() -> MessageQueue {
        MessageQueue::default()
    }

    pub fn enable(&mut self, kind: MessageKind) {
        self.enabled[kind] = true;
    }

    /// Disable a kind and drop queued messages of that kind.
    pub fn disable(&mut self, kind: MessageKind) {
        self.enabled[kind] = false;
        self.queue.retain(|m| m.kind() != kind);
    }

    pub fn is_enabled(&self, kind: MessageKind) -> bool {
        self.enabled[kind]
    }

    /// Post a message; dropped silently if its kind is disabled.
    pub fn post(&mut self, message: Message) {
        if self.enabled[message.kind()] {
            self.queue.push_back(message);
        }
    }

    /// Is a message waiting?
    pub fn poll(&self) -> bool {
        !self.queue.is_empty()
    }

    /// The kind of the frontmost message.
    pub fn queue_kind(&self) -> Option<MessageKind> {
        self.queue.front().map(Message::kind)
    }

    /// Take the frontmost message of `kind`.
    pub fn get(&mut self, kind: MessageKind) -> Option<Message> {
        let pos = self.queue.iter().position(|m| m.kind() == kind)?;
        self.queue.remove(pos)
    }

    /// Discard the frontmost message.
    pub fn discard(&mut self) {
        self.queue.pop_front();
    }
}
