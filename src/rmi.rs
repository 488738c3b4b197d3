//! Remote method invocations.
//!
//! An [`RmiDispatcher`] owns a private communicator and carries small tagged
//! control frames between ranks. A frame names a handler tag; the receiving
//! rank runs every callback registered for that tag, in registration order,
//! from inside [`RmiDispatcher::process`] or [`RmiDispatcher::poll`]. No
//! threads are involved: handlers run on whichever thread drives the loop.
//!
//! # Frame layout
//!
//! ```text
//! +---------+------------+-------+-----------------+
//! | tag i32 | source i32 | flags | payload (rest)  |
//! +---------+------------+-------+-----------------+
//! ```
//!
//! Integers are little-endian. `source` is the rank that originally
//! triggered the invocation, which survives forwarding. Bit 0 of `flags`
//! requests propagation down the invocation tree.
//!
//! # Invocation tree
//!
//! Propagated invocations fan out over a binary tree in heap order rooted at
//! rank 0: the children of rank `r` are `2r + 1` and `2r + 2` when they exist.
//! A rank forwards a propagated invocation to its children right after its
//! own callbacks ran.

use std::collections::{BTreeMap, VecDeque};
use std::fmt;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tracing::{debug, trace, warn};

use crate::comm::Communicator;
use crate::config::RmiDelivery;
use crate::error::{Error, Result};
use crate::transport::{Lane, SendMode};
use crate::ANY_SOURCE;

/// Transport tag carrying every RMI frame on the dispatcher's communicator.
pub const RMI_TAG: i32 = 1;

/// Handler tag reserved for the frame that ends [`ProcessMode::UntilBreak`].
pub const BREAK_RMI_TAG: i32 = 239_954;

const FLAG_PROPAGATE: u8 = 0x01;
const HEADER_LEN: usize = 9;

/// One received invocation, as seen by a callback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    /// Handler tag.
    pub tag: i32,
    /// Rank that triggered the invocation.
    pub source: i32,
    /// Opaque payload.
    pub payload: Bytes,
    /// Whether the invocation is being propagated down the tree.
    pub propagate: bool,
}

impl Invocation {
    fn encode(&self) -> Bytes {
        let mut frame = BytesMut::with_capacity(HEADER_LEN + self.payload.len());
        frame.put_i32_le(self.tag);
        frame.put_i32_le(self.source);
        frame.put_u8(if self.propagate { FLAG_PROPAGATE } else { 0 });
        frame.put_slice(&self.payload);
        frame.freeze()
    }

    fn decode(mut frame: Bytes) -> Result<Self> {
        if frame.len() < HEADER_LEN {
            return Err(Error::MalformedFrame(format!(
                "{} bytes is shorter than the {HEADER_LEN}-byte header",
                frame.len()
            )));
        }
        let tag = frame.get_i32_le();
        let source = frame.get_i32_le();
        let flags = frame.get_u8();
        if flags & !FLAG_PROPAGATE != 0 {
            return Err(Error::MalformedFrame(format!("unknown flags {flags:#04x}")));
        }
        Ok(Invocation {
            tag,
            source,
            payload: frame,
            propagate: flags & FLAG_PROPAGATE != 0,
        })
    }
}

/// Identifies one registered callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RmiHandlerId(u64);

/// Where the dispatcher is in handling incoming frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DispatchState {
    /// Nothing received and not yet handled.
    Idle,
    /// Invocations were received and are waiting for a callback.
    AwaitingDispatch,
    /// Callbacks are running.
    Dispatched,
}

/// How long [`RmiDispatcher::process`] keeps receiving.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ProcessMode {
    /// Until a break frame arrives.
    #[default]
    UntilBreak,
    /// Until one frame has been handled.
    Once,
}

/// Why [`RmiDispatcher::process`] returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RmiOutcome {
    /// A break frame was received.
    Break,
    /// [`ProcessMode::Once`] handled one frame, running this many invocations.
    ///
    /// Zero means the frame was queued for a tag without callbacks.
    Dispatched(usize),
}

/// Children of `rank` in the invocation tree of a `size`-rank communicator.
pub fn children_of(rank: i32, size: i32) -> impl Iterator<Item = i32> {
    let first = rank.saturating_mul(2).saturating_add(1);
    (first..first.saturating_add(2)).filter(move |&c| rank >= 0 && c < size)
}

type Callback = Box<dyn FnMut(&Invocation)>;

/// Receives and runs remote method invocations for one controller.
pub struct RmiDispatcher {
    comm: Communicator,
    delivery: RmiDelivery,
    callbacks: BTreeMap<i32, Vec<(RmiHandlerId, Callback)>>,
    next_id: u64,
    backlog: BTreeMap<i32, VecDeque<Invocation>>,
    registration_closed: bool,
    break_pending: bool,
    state: DispatchState,
}

impl fmt::Debug for RmiDispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RmiDispatcher")
            .field("comm", &self.comm)
            .field("delivery", &self.delivery)
            .field("tags", &self.callbacks.keys().collect::<Vec<_>>())
            .field("queued", &self.queued())
            .field("state", &self.state)
            .finish()
    }
}

impl RmiDispatcher {
    /// Build a dispatcher that owns `comm`.
    ///
    /// `comm` must not carry any other traffic.
    pub fn new(comm: Communicator, delivery: RmiDelivery) -> Self {
        RmiDispatcher {
            comm,
            delivery,
            callbacks: BTreeMap::new(),
            next_id: 0,
            backlog: BTreeMap::new(),
            registration_closed: false,
            break_pending: false,
            state: DispatchState::Idle,
        }
    }

    /// Rank of this dispatcher.
    pub fn rank(&self) -> i32 {
        self.comm.rank()
    }

    /// Number of ranks invocations can be sent to.
    pub fn size(&self) -> i32 {
        self.comm.size()
    }

    /// Current dispatch state.
    pub fn state(&self) -> DispatchState {
        self.state
    }

    /// Delivery mode used by triggers.
    pub fn delivery(&self) -> RmiDelivery {
        self.delivery
    }

    /// Number of received invocations waiting for a callback.
    pub fn queued(&self) -> usize {
        self.backlog.values().map(VecDeque::len).sum()
    }

    // ========================================================================
    // Registry
    // ========================================================================

    /// Register `callback` for `tag`.
    ///
    /// Invocations of `tag` that arrived before any callback existed are
    /// delivered, oldest first, on the next [`process`](Self::process) or
    /// [`poll`](Self::poll).
    pub fn add_callback<F>(&mut self, tag: i32, callback: F) -> Result<RmiHandlerId>
    where
        F: FnMut(&Invocation) + 'static,
    {
        if tag == BREAK_RMI_TAG {
            return Err(Error::ReservedTag(tag));
        }
        if self.registration_closed {
            return Err(Error::RegistrationClosed);
        }
        let id = RmiHandlerId(self.next_id);
        self.next_id += 1;
        self.callbacks
            .entry(tag)
            .or_default()
            .push((id, Box::new(callback)));
        debug!(rank = self.rank(), tag, id = id.0, "registered RMI callback");
        Ok(id)
    }

    /// Remove the callback registered as `id`.
    pub fn remove_callback(&mut self, id: RmiHandlerId) -> bool {
        let found = self.callbacks.iter_mut().find_map(|(&tag, list)| {
            let position = list.iter().position(|(entry, _)| *entry == id)?;
            list.remove(position);
            Some(tag)
        });
        match found {
            Some(tag) => {
                self.prune(tag);
                true
            }
            None => false,
        }
    }

    /// Remove the oldest callback registered for `tag`.
    pub fn remove_first_callback(&mut self, tag: i32) -> bool {
        let removed = match self.callbacks.get_mut(&tag) {
            Some(list) if !list.is_empty() => {
                list.remove(0);
                true
            }
            _ => false,
        };
        self.prune(tag);
        removed
    }

    /// Remove every callback registered for `tag`.
    pub fn remove_all_callbacks(&mut self, tag: i32) -> bool {
        self.callbacks
            .remove(&tag)
            .is_some_and(|list| !list.is_empty())
    }

    /// Whether at least one callback is registered for `tag`.
    pub fn has_callback(&self, tag: i32) -> bool {
        self.callbacks.get(&tag).is_some_and(|list| !list.is_empty())
    }

    fn prune(&mut self, tag: i32) {
        if self.callbacks.get(&tag).is_some_and(Vec::is_empty) {
            self.callbacks.remove(&tag);
        }
    }

    /// Declare that no further callbacks will be registered.
    ///
    /// From now on an invocation for a tag without callbacks is an error
    /// instead of being queued.
    ///
    /// # Errors
    ///
    /// [`Error::UnhandledInvocation`] for the oldest queued invocation if any
    /// were waiting; all of them are discarded.
    pub fn close_registration(&mut self) -> Result<()> {
        self.registration_closed = true;
        let stranded = std::mem::take(&mut self.backlog);
        self.settle();
        let mut first = None;
        for invocation in stranded.into_values().flatten() {
            warn!(
                rank = self.rank(),
                tag = invocation.tag,
                source = invocation.source,
                "discarding RMI with no callback"
            );
            first.get_or_insert(invocation);
        }
        match first {
            Some(invocation) => Err(Error::UnhandledInvocation {
                tag: invocation.tag,
                source_rank: invocation.source,
            }),
            None => Ok(()),
        }
    }

    /// Whether [`close_registration`](Self::close_registration) was called.
    pub fn is_registration_closed(&self) -> bool {
        self.registration_closed
    }

    // ========================================================================
    // Triggering
    // ========================================================================

    /// Invoke the callbacks for `tag` on rank `target`.
    ///
    /// With `propagate`, `target` forwards the invocation to its subtree of
    /// the invocation tree after running its own callbacks.
    pub fn trigger(&self, target: i32, tag: i32, payload: &[u8], propagate: bool) -> Result<()> {
        if tag == BREAK_RMI_TAG {
            return Err(Error::ReservedTag(tag));
        }
        let invocation = Invocation {
            tag,
            source: self.rank(),
            payload: Bytes::copy_from_slice(payload),
            propagate,
        };
        self.send_frame(target, &invocation)
    }

    /// Invoke the callbacks for `tag` on every rank below this one in the tree.
    pub fn trigger_on_all_children(&self, tag: i32, payload: &[u8]) -> Result<()> {
        if tag == BREAK_RMI_TAG {
            return Err(Error::ReservedTag(tag));
        }
        let invocation = Invocation {
            tag,
            source: self.rank(),
            payload: Bytes::copy_from_slice(payload),
            propagate: true,
        };
        self.forward(&invocation)
    }

    /// Make [`process`](Self::process) return on every other rank.
    pub fn trigger_break(&self) -> Result<()> {
        let invocation = Invocation {
            tag: BREAK_RMI_TAG,
            source: self.rank(),
            payload: Bytes::new(),
            propagate: false,
        };
        for target in (0..self.size()).filter(|&r| r != self.rank()) {
            self.send_frame(target, &invocation)?;
        }
        Ok(())
    }

    fn forward(&self, invocation: &Invocation) -> Result<()> {
        for child in children_of(self.rank(), self.size()) {
            self.send_frame(child, invocation)?;
        }
        Ok(())
    }

    fn send_frame(&self, target: i32, invocation: &Invocation) -> Result<()> {
        // A synchronous frame to ourselves could never be matched while we wait.
        let mode = match self.delivery {
            RmiDelivery::Synchronous if target != self.rank() => SendMode::Synchronous,
            _ => SendMode::Standard,
        };
        trace!(
            rank = self.rank(),
            target,
            tag = invocation.tag,
            len = invocation.payload.len(),
            propagate = invocation.propagate,
            "trigger RMI"
        );
        let receipt =
            self.comm
                .post_bytes(Lane::PointToPoint, target, RMI_TAG, invocation.encode(), mode)?;
        match receipt {
            Some(receipt) => self.comm.wait_receipt(&receipt),
            None => Ok(()),
        }
    }

    // ========================================================================
    // Dispatch
    // ========================================================================

    /// Receive and run invocations.
    ///
    /// Blocks until a break frame arrives ([`ProcessMode::UntilBreak`]) or a
    /// single frame has been handled ([`ProcessMode::Once`]). In `Once` mode,
    /// queued invocations that became dispatchable count as that frame.
    pub fn process(&mut self, mode: ProcessMode) -> Result<RmiOutcome> {
        let mut dispatched = self.flush_backlog()?;
        if std::mem::take(&mut self.break_pending) {
            return Ok(RmiOutcome::Break);
        }
        if mode == ProcessMode::Once && dispatched > 0 {
            return Ok(RmiOutcome::Dispatched(dispatched));
        }
        loop {
            let message = self
                .comm
                .take_blocking(Lane::PointToPoint, ANY_SOURCE, RMI_TAG)?;
            match self.handle(message.payload)? {
                None => {
                    debug!(rank = self.rank(), dispatched, "RMI loop broken");
                    return Ok(RmiOutcome::Break);
                }
                Some(count) => {
                    dispatched += count;
                    if mode == ProcessMode::Once {
                        return Ok(RmiOutcome::Dispatched(count));
                    }
                }
            }
        }
    }

    /// Run every invocation already received, without blocking.
    ///
    /// Returns the number of invocations dispatched. A break frame met here
    /// stops the drain and makes the next [`process`](Self::process) return
    /// [`RmiOutcome::Break`] at once.
    pub fn poll(&mut self) -> Result<usize> {
        let mut dispatched = self.flush_backlog()?;
        while !self.break_pending {
            let Some(message) = self
                .comm
                .try_take(Lane::PointToPoint, ANY_SOURCE, RMI_TAG)?
            else {
                break;
            };
            match self.handle(message.payload)? {
                None => self.break_pending = true,
                Some(count) => dispatched += count,
            }
        }
        Ok(dispatched)
    }

    /// Handle one frame: `None` for a break, otherwise invocations run.
    fn handle(&mut self, frame: Bytes) -> Result<Option<usize>> {
        let invocation = Invocation::decode(frame)?;
        if invocation.tag == BREAK_RMI_TAG {
            return Ok(None);
        }
        if !self.has_callback(invocation.tag) {
            if self.registration_closed {
                return Err(Error::UnhandledInvocation {
                    tag: invocation.tag,
                    source_rank: invocation.source,
                });
            }
            debug!(
                rank = self.rank(),
                tag = invocation.tag,
                source = invocation.source,
                "queueing RMI until a callback is registered"
            );
            self.backlog
                .entry(invocation.tag)
                .or_default()
                .push_back(invocation);
            self.state = DispatchState::AwaitingDispatch;
            return Ok(Some(0));
        }
        self.dispatch(&invocation)?;
        self.settle();
        Ok(Some(1))
    }

    /// Deliver queued invocations whose tag has gained a callback.
    fn flush_backlog(&mut self) -> Result<usize> {
        let ready: Vec<i32> = self
            .backlog
            .keys()
            .copied()
            .filter(|&tag| self.has_callback(tag))
            .collect();
        let mut dispatched = 0;
        for tag in ready {
            while let Some(invocation) = self.backlog.get_mut(&tag).and_then(VecDeque::pop_front) {
                self.dispatch(&invocation)?;
                dispatched += 1;
            }
            self.backlog.remove(&tag);
        }
        self.settle();
        Ok(dispatched)
    }

    fn dispatch(&mut self, invocation: &Invocation) -> Result<()> {
        self.state = DispatchState::Dispatched;
        trace!(
            rank = self.rank(),
            tag = invocation.tag,
            source = invocation.source,
            "dispatch RMI"
        );
        if let Some(list) = self.callbacks.get_mut(&invocation.tag) {
            for (_, callback) in list.iter_mut() {
                callback(invocation);
            }
        }
        if invocation.propagate {
            self.forward(invocation)?;
        }
        Ok(())
    }

    fn settle(&mut self) {
        self.state = if self.backlog.is_empty() {
            DispatchState::Idle
        } else {
            DispatchState::AwaitingDispatch
        };
    }
}
