//! The message-passing substrate underneath every communicator.
//!
//! A [`Transport`] moves opaque payloads between the processes of one
//! universe with reliable, FIFO delivery per sender and destination. It knows
//! nothing about communicators, groups or collectives: matching by source and
//! tag, context isolation and completion tracking are layered on top of the
//! small capability set below.
//!
//! The crate ships one backend, [`local::LocalUniverse`], which runs every
//! rank inside the current process. Other backends (sockets, an MPI library)
//! implement the same trait.

pub mod local;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;

use crate::error::Result;
use crate::{ANY_SOURCE, ANY_TAG};

/// Identifier isolating one communicator's traffic from every other's.
pub type ContextId = u32;

/// Traffic class within a context.
///
/// Collective algorithms run on their own lane so that their internal
/// messages can never be matched by user receives, whatever the tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Lane {
    /// User point-to-point traffic.
    PointToPoint,
    /// Traffic generated by collective operations.
    Collective,
}

/// Where a message is delivered inside a destination's mailbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Address {
    /// Communicator context.
    pub context: ContextId,
    /// Lane within the context.
    pub lane: Lane,
}

impl Address {
    /// Point-to-point lane of `context`.
    pub fn p2p(context: ContextId) -> Self {
        Address {
            context,
            lane: Lane::PointToPoint,
        }
    }

    /// Collective lane of `context`.
    pub fn collective(context: ContextId) -> Self {
        Address {
            context,
            lane: Lane::Collective,
        }
    }
}

/// Matching metadata carried by every message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Envelope {
    /// Communicator context and lane.
    pub address: Address,
    /// Sender's rank within the communicator.
    pub source: i32,
    /// User or internal tag.
    pub tag: i32,
}

/// A message in flight.
#[derive(Debug, Clone)]
pub struct Message {
    /// Matching metadata.
    pub envelope: Envelope,
    /// Opaque payload.
    pub payload: Bytes,
}

/// Receive-side selector. `source` and `tag` accept the wildcards
/// [`ANY_SOURCE`] and [`ANY_TAG`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MatchSpec {
    /// Context and lane to match.
    pub address: Address,
    /// Sender rank or [`ANY_SOURCE`].
    pub source: i32,
    /// Tag or [`ANY_TAG`].
    pub tag: i32,
}

impl MatchSpec {
    /// Whether `envelope` satisfies this selector.
    pub fn matches(&self, envelope: &Envelope) -> bool {
        envelope.address == self.address
            && (self.source == ANY_SOURCE || self.source == envelope.source)
            && (self.tag == ANY_TAG || self.tag == envelope.tag)
    }
}

/// Result of a non-consuming match.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pending {
    /// Envelope of the first matching message.
    pub envelope: Envelope,
    /// Payload size in bytes.
    pub len: usize,
}

/// Delivery mode of a send.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SendMode {
    /// Complete as soon as the payload has been handed to the transport.
    #[default]
    Standard,
    /// Complete only once the receiver has matched the message.
    Synchronous,
}

/// Tracks whether a synchronous send has been matched by its receiver.
#[derive(Debug, Clone)]
pub struct Receipt {
    id: u64,
    dest: i32,
    matched: Arc<AtomicBool>,
}

impl Receipt {
    /// Create an unmatched receipt for a message sent to world rank `dest`.
    pub fn new(id: u64, dest: i32) -> Self {
        Receipt {
            id,
            dest,
            matched: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Transport-unique identifier of the tracked message.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// World rank the tracked message was sent to.
    pub fn dest(&self) -> i32 {
        self.dest
    }

    /// Whether the receiver has matched the message.
    pub fn is_matched(&self) -> bool {
        self.matched.load(Ordering::Acquire)
    }

    /// Record that the receiver matched the message.
    pub fn mark_matched(&self) {
        self.matched.store(true, Ordering::Release);
    }
}

/// Capability set a communicator needs from the underlying transport.
///
/// Ranks passed to and returned by a transport are **world** ranks; sources
/// inside an [`Envelope`] are communicator ranks and are never interpreted by
/// the transport. None of the methods block except
/// [`wait_activity`](Self::wait_activity).
pub trait Transport: Send + Sync {
    /// Start the transport for this process, consuming any arguments meant for it.
    fn start(&self, args: &mut Vec<String>) -> Result<()>;

    /// Whether [`start`](Self::start) has completed and no shutdown happened since.
    fn is_started(&self) -> bool;

    /// Stop the transport for this process. Peers sending here afterwards fail.
    fn shutdown(&self) -> Result<()>;

    /// Rank of this process in the universe.
    fn world_rank(&self) -> i32;

    /// Number of processes in the universe.
    fn world_size(&self) -> i32;

    /// Name of the node this process runs on.
    fn processor_name(&self) -> String;

    /// Context shared by every process for the universe-wide communicator.
    fn world_context(&self) -> ContextId {
        0
    }

    /// Reserve `count` consecutive fresh contexts and return the first one.
    ///
    /// Contexts are never reused while the universe lives.
    fn allocate_contexts(&self, count: u32) -> Result<ContextId>;

    /// Enqueue `message` for world rank `dest`.
    ///
    /// In [`SendMode::Synchronous`] a [`Receipt`] is returned that becomes
    /// matched once the destination consumes the message.
    fn post(&self, dest: i32, message: Message, mode: SendMode) -> Result<Option<Receipt>>;

    /// Remove and return the oldest message in the local mailbox matching `spec`.
    fn take(&self, spec: &MatchSpec) -> Result<Option<Message>>;

    /// Describe the oldest message matching `spec` without consuming it.
    fn peek(&self, spec: &MatchSpec) -> Result<Option<Pending>>;

    /// Withdraw a synchronous send that has not been matched yet.
    fn withdraw(&self, receipt: &Receipt) -> bool;

    /// Post a receive for `spec` and return its ticket.
    ///
    /// Posted receives bind messages in posting order: the oldest queued
    /// message matching `spec` is bound at once, otherwise the first arrival
    /// that no earlier posted receive matches. A bound message is no longer
    /// visible to [`take`](Self::take) or [`peek`](Self::peek).
    fn post_receive(&self, spec: &MatchSpec) -> Result<u64>;

    /// Collect the message bound to `ticket`, retiring the ticket.
    ///
    /// Returns `None` while nothing has been bound.
    fn claim(&self, ticket: u64) -> Result<Option<Message>>;

    /// Retire a posted receive that has not been bound yet.
    fn withdraw_receive(&self, ticket: u64) -> bool;

    /// Progress epoch of this process.
    ///
    /// It moves whenever a message arrives here or a receipt this process
    /// holds becomes matched.
    fn activity(&self) -> u64;

    /// Block until the progress epoch differs from `seen`.
    ///
    /// Fails with [`Error::Aborted`](crate::Error::Aborted) once the universe is aborted.
    fn wait_activity(&self, seen: u64) -> Result<()>;

    /// Abort the whole universe, waking every blocked process.
    fn abort(&self, reason: &str);

    /// Whether the universe has been aborted.
    fn is_aborted(&self) -> bool;
}
