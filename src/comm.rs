//! Communicators: point-to-point traffic and group derivation.

use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

use bytes::Bytes;
use tracing::{debug, trace};

use crate::datatype::{self, Datatype};
use crate::error::{Error, Result};
use crate::group::{partition_members, ProcessGroup};
use crate::request::{Request, Sink};
use crate::status::Status;
use crate::transport::{
    Address, ContextId, Envelope, Lane, MatchSpec, Message, Receipt, SendMode, Transport,
};
use crate::{ANY_SOURCE, ANY_TAG};

/// Tags used on the collective lane. User tags never reach that lane.
pub(crate) mod tags {
    pub const BARRIER: i32 = 1;
    pub const BROADCAST: i32 = 2;
    pub const GATHER: i32 = 3;
    pub const SCATTER: i32 = 4;
    pub const REDUCE: i32 = 5;
    pub const CONTEXT: i32 = 6;
    pub const GROUP: i32 = 7;
}

/// A communicator: an ordered group of ranks plus a private context.
///
/// Messages sent on one communicator can only be received on the same
/// communicator, whatever their tags. Derived communicators
/// ([`duplicate`](Self::duplicate), [`create_group`](Self::create_group),
/// [`split`](Self::split)) always receive a fresh context.
///
/// All point-to-point operations are generic over [`Datatype`] and keep FIFO
/// order per (source, destination, tag). There is no ordering between
/// different tags or different senders.
///
/// # Example
///
/// ```
/// use ferroctl::{transport::local, Communicator};
///
/// local::launch(4, |transport| {
///     let world = Communicator::world(transport).unwrap();
///     println!("I am rank {} of {}", world.rank(), world.size());
/// })
/// .unwrap();
/// ```
pub struct Communicator {
    transport: Arc<dyn Transport>,
    /// World rank of each member, indexed by communicator rank.
    members: Vec<i32>,
    rank: i32,
    context: ContextId,
    /// Marker to prevent Send/Sync (a context is owned by one process)
    _marker: PhantomData<*mut ()>,
}

impl fmt::Debug for Communicator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Communicator")
            .field("rank", &self.rank)
            .field("size", &self.members.len())
            .field("context", &self.context)
            .finish()
    }
}

impl Communicator {
    /// Get the communicator spanning every process of the universe.
    ///
    /// # Errors
    ///
    /// [`Error::NotInitialized`] if the transport has not been started.
    pub fn world(transport: Arc<dyn Transport>) -> Result<Self> {
        if !transport.is_started() {
            return Err(Error::NotInitialized);
        }
        let members = (0..transport.world_size()).collect();
        let context = transport.world_context();
        Self::from_parts(transport, members, context)
    }

    fn from_parts(
        transport: Arc<dyn Transport>,
        members: Vec<i32>,
        context: ContextId,
    ) -> Result<Self> {
        let me = transport.world_rank();
        let rank = members
            .iter()
            .position(|&world| world == me)
            .ok_or(Error::NotAMember(me))? as i32;
        Ok(Communicator {
            transport,
            members,
            rank,
            context,
            _marker: PhantomData,
        })
    }

    /// Get the rank of the calling process in this communicator.
    pub fn rank(&self) -> i32 {
        self.rank
    }

    /// Get the number of processes in this communicator.
    pub fn size(&self) -> i32 {
        self.members.len() as i32
    }

    /// Context isolating this communicator's traffic.
    pub fn context(&self) -> ContextId {
        self.context
    }

    /// Every rank of this communicator, `0..size`.
    pub fn group(&self) -> ProcessGroup {
        ProcessGroup::with_size(self.size())
    }

    /// Universe rank of communicator rank `rank`.
    pub fn world_rank_of(&self, rank: i32) -> Option<i32> {
        usize::try_from(rank)
            .ok()
            .and_then(|r| self.members.get(r).copied())
    }

    /// Get the name of the node this process runs on.
    pub fn processor_name(&self) -> String {
        self.transport.processor_name()
    }

    /// Abort every process of the universe.
    pub fn abort(&self, reason: &str) {
        self.transport.abort(reason);
    }

    pub(crate) fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    // ========================================================================
    // Validation
    // ========================================================================

    fn world_dest(&self, dest: i32) -> Result<i32> {
        self.world_rank_of(dest).ok_or(Error::InvalidRank(dest))
    }

    fn check_source(&self, source: i32) -> Result<()> {
        if source == ANY_SOURCE || (0..self.size()).contains(&source) {
            Ok(())
        } else {
            Err(Error::InvalidRank(source))
        }
    }

    fn check_send_tag(tag: i32) -> Result<()> {
        if tag >= 0 {
            Ok(())
        } else {
            Err(Error::InvalidTag(tag))
        }
    }

    fn check_recv_tag(tag: i32) -> Result<()> {
        if tag >= 0 || tag == ANY_TAG {
            Ok(())
        } else {
            Err(Error::InvalidTag(tag))
        }
    }

    fn spec(&self, lane: Lane, source: i32, tag: i32) -> MatchSpec {
        MatchSpec {
            address: Address {
                context: self.context,
                lane,
            },
            source,
            tag,
        }
    }

    // ========================================================================
    // Transport plumbing shared with collectives
    // ========================================================================

    pub(crate) fn post_bytes(
        &self,
        lane: Lane,
        dest: i32,
        tag: i32,
        payload: Bytes,
        mode: SendMode,
    ) -> Result<Option<Receipt>> {
        let world = self.world_dest(dest)?;
        trace!(
            context = self.context,
            from = self.rank,
            dest,
            tag,
            len = payload.len(),
            ?lane,
            "send"
        );
        let message = Message {
            envelope: Envelope {
                address: Address {
                    context: self.context,
                    lane,
                },
                source: self.rank,
                tag,
            },
            payload,
        };
        self.transport.post(world, message, mode)
    }

    pub(crate) fn wait_receipt(&self, receipt: &Receipt) -> Result<()> {
        loop {
            let seen = self.transport.activity();
            if receipt.is_matched() {
                return Ok(());
            }
            self.transport.wait_activity(seen)?;
        }
    }

    pub(crate) fn take_blocking(&self, lane: Lane, source: i32, tag: i32) -> Result<Message> {
        let spec = self.spec(lane, source, tag);
        loop {
            let seen = self.transport.activity();
            if let Some(message) = self.transport.take(&spec)? {
                return Ok(message);
            }
            self.transport.wait_activity(seen)?;
        }
    }

    pub(crate) fn try_take(&self, lane: Lane, source: i32, tag: i32) -> Result<Option<Message>> {
        self.transport.take(&self.spec(lane, source, tag))
    }

    // ========================================================================
    // Point-to-Point Communication
    // ========================================================================

    /// Send a slice to another process.
    ///
    /// Blocks until `data` may be reused. The payload is copied into the
    /// transport, so this does not wait for the matching receive.
    pub fn send<T: Datatype>(&self, data: &[T], dest: i32, tag: i32) -> Result<()> {
        Self::check_send_tag(tag)?;
        self.post_bytes(
            Lane::PointToPoint,
            dest,
            tag,
            datatype::to_bytes(data),
            SendMode::Standard,
        )?;
        Ok(())
    }

    /// Send a slice and block until the receiver has matched it.
    pub fn send_synchronous<T: Datatype>(&self, data: &[T], dest: i32, tag: i32) -> Result<()> {
        Self::check_send_tag(tag)?;
        let receipt = self.post_bytes(
            Lane::PointToPoint,
            dest,
            tag,
            datatype::to_bytes(data),
            SendMode::Synchronous,
        )?;
        match receipt {
            Some(receipt) => self.wait_receipt(&receipt),
            None => Ok(()),
        }
    }

    /// Receive a message into `buf`.
    ///
    /// Use [`ANY_SOURCE`] and [`ANY_TAG`] as wildcards. The returned
    /// [`Status`] names the actual sender, tag and element count.
    ///
    /// # Errors
    ///
    /// [`Error::Truncated`] if the message is larger than `buf`; the message
    /// is consumed and the contents of `buf` are unspecified.
    pub fn recv<T: Datatype>(&self, buf: &mut [T], source: i32, tag: i32) -> Result<Status> {
        self.check_source(source)?;
        Self::check_recv_tag(tag)?;
        let message = self.take_blocking(Lane::PointToPoint, source, tag)?;
        trace!(
            context = self.context,
            rank = self.rank,
            source = message.envelope.source,
            tag = message.envelope.tag,
            len = message.payload.len(),
            "recv"
        );
        deliver(&message, buf)
    }

    /// Send to `dest` and receive from `source` in one call.
    pub fn sendrecv<T: Datatype, U: Datatype>(
        &self,
        send: &[T],
        dest: i32,
        send_tag: i32,
        recv: &mut [U],
        source: i32,
        recv_tag: i32,
    ) -> Result<Status> {
        self.send(send, dest, send_tag)?;
        self.recv(recv, source, recv_tag)
    }

    // ========================================================================
    // Nonblocking Point-to-Point
    // ========================================================================

    /// Start a nonblocking send.
    ///
    /// `data` stays borrowed until the returned request is dropped.
    /// Argument errors are returned immediately; transport faults are
    /// reported when the request is tested or waited.
    pub fn isend<'a, T: Datatype>(&self, data: &'a [T], dest: i32, tag: i32) -> Result<Request<'a>> {
        self.start_send(data, dest, tag, SendMode::Standard)
    }

    /// Start a nonblocking synchronous send: completes once the receiver matched it.
    pub fn issend<'a, T: Datatype>(
        &self,
        data: &'a [T],
        dest: i32,
        tag: i32,
    ) -> Result<Request<'a>> {
        self.start_send(data, dest, tag, SendMode::Synchronous)
    }

    fn start_send<'a, T: Datatype>(
        &self,
        data: &'a [T],
        dest: i32,
        tag: i32,
        mode: SendMode,
    ) -> Result<Request<'a>> {
        Self::check_send_tag(tag)?;
        self.world_dest(dest)?;
        let transport = Arc::clone(&self.transport);
        match self.post_bytes(Lane::PointToPoint, dest, tag, datatype::to_bytes(data), mode) {
            Ok(receipt) => Ok(Request::send(transport, receipt)),
            Err(e) => Ok(Request::failed(transport, e)),
        }
    }

    /// Start a nonblocking receive into `buf`.
    ///
    /// The receive is posted right away, so it binds the matching message
    /// ahead of any receive posted later, blocking or not. `buf` stays
    /// borrowed until the returned request is dropped; its contents are only
    /// meaningful once the request completed.
    pub fn irecv<'a, T: Datatype>(
        &self,
        buf: &'a mut [T],
        source: i32,
        tag: i32,
    ) -> Result<Request<'a>> {
        self.check_source(source)?;
        Self::check_recv_tag(tag)?;
        let sink: Sink<'a> = Box::new(move |message: &Message| deliver(message, &mut *buf));
        Ok(Request::recv(
            Arc::clone(&self.transport),
            self.spec(Lane::PointToPoint, source, tag),
            sink,
        ))
    }

    // ========================================================================
    // Probing
    // ========================================================================

    /// Block until a matching message is available, without receiving it.
    ///
    /// The returned status reports the actual source (useful with
    /// [`ANY_SOURCE`]) and the message size in elements of `T`.
    pub fn probe<T: Datatype>(&self, source: i32, tag: i32) -> Result<Status> {
        self.check_source(source)?;
        Self::check_recv_tag(tag)?;
        let spec = self.spec(Lane::PointToPoint, source, tag);
        loop {
            let seen = self.transport.activity();
            if let Some(pending) = self.transport.peek(&spec)? {
                return Ok(status_of::<T>(&pending.envelope, pending.len));
            }
            self.transport.wait_activity(seen)?;
        }
    }

    /// Check for a matching message without blocking or receiving it.
    pub fn iprobe<T: Datatype>(&self, source: i32, tag: i32) -> Result<Option<Status>> {
        self.check_source(source)?;
        Self::check_recv_tag(tag)?;
        let spec = self.spec(Lane::PointToPoint, source, tag);
        Ok(self
            .transport
            .peek(&spec)?
            .map(|pending| status_of::<T>(&pending.envelope, pending.len)))
    }

    // ========================================================================
    // Communicator derivation
    // ========================================================================

    /// Run a group-forming step; any failure aborts the universe.
    fn formation<R>(&self, operation: &'static str, step: impl FnOnce() -> Result<R>) -> Result<R> {
        step().map_err(|e| {
            self.transport
                .abort(&format!("{operation} failed on rank {}: {e}", self.rank));
            Error::group_formation(operation, e)
        })
    }

    /// Rank 0 reserves `count` contexts and tells everyone the first one.
    fn agree_on_contexts(&self, count: u32) -> Result<ContextId> {
        let mut base = [0u32];
        if self.rank == 0 {
            base[0] = self.transport.allocate_contexts(count)?;
        }
        self.broadcast_tagged(&mut base, 0, tags::CONTEXT)?;
        Ok(base[0])
    }

    /// Duplicate this communicator.
    ///
    /// Collective over every rank. The duplicate has the same membership and
    /// ordering but a fresh context, so traffic on it never matches traffic
    /// on `self`.
    ///
    /// # Errors
    ///
    /// Any failure is fatal: the universe is aborted and
    /// [`Error::GroupFormation`] returned.
    pub fn duplicate(&self) -> Result<Self> {
        self.formation("duplicate", || {
            let context = self.agree_on_contexts(1)?;
            debug!(parent = self.context, context, size = self.size(), "duplicated communicator");
            Self::from_parts(Arc::clone(&self.transport), self.members.clone(), context)
        })
    }

    /// Build a communicator over `group`, a subset of this communicator's ranks.
    ///
    /// Collective over the members of `group` only: every rank named in it,
    /// and no other, must call this concurrently with an identical group.
    /// Calling it from a rank outside the group, or with groups that differ
    /// between callers, is a precondition violation and is not detected.
    /// The new ranks follow the group's order.
    ///
    /// Returns `None` on a caller outside the group without communicating.
    pub fn create_group(&self, group: &ProcessGroup) -> Result<Option<Self>> {
        if let Some(bad) = group.iter().find(|&r| r >= self.size()) {
            return Err(Error::InvalidRank(bad));
        }
        if !group.contains(self.rank) {
            return Ok(None);
        }
        self.formation("create_group", || {
            let leader = group
                .rank_at(0)
                .ok_or_else(|| Error::Internal("empty group".into()))?;
            let context = if self.rank == leader {
                let context = self.transport.allocate_contexts(1)?;
                let payload = datatype::to_bytes(&[context]);
                for member in group.iter().filter(|&r| r != leader) {
                    self.post_bytes(
                        Lane::Collective,
                        member,
                        tags::GROUP,
                        payload.clone(),
                        SendMode::Standard,
                    )?;
                }
                context
            } else {
                let message = self.take_blocking(Lane::Collective, leader, tags::GROUP)?;
                let mut context = [0u32];
                decode_exact(&message.payload, &mut context)?;
                context[0]
            };
            let members = group
                .iter()
                .map(|r| self.world_dest(r))
                .collect::<Result<Vec<_>>>()?;
            debug!(parent = self.context, context, size = members.len(), "created group communicator");
            Self::from_parts(Arc::clone(&self.transport), members, context).map(Some)
        })
    }

    /// Split this communicator by colour.
    ///
    /// Collective over every rank. Ranks passing the same non-negative
    /// `color` end up in the same new communicator, ordered by ascending
    /// `key` with ties broken by their rank here. A negative colour (see
    /// [`UNDEFINED`](crate::UNDEFINED)) opts out and yields `None`.
    pub fn split(&self, color: i32, key: i32) -> Result<Option<Self>> {
        self.formation("split", || {
            let mut entries = vec![0i32; 2 * self.members.len()];
            self.allgather(&[color, key], &mut entries)?;
            let pairs: Vec<(i32, i32)> = entries.chunks_exact(2).map(|c| (c[0], c[1])).collect();
            let layout = partition_members(&pairs);

            let count = u32::try_from(layout.len().max(1))
                .map_err(|_| Error::Internal("too many colours".into()))?;
            let base = self.agree_on_contexts(count)?;

            if color < 0 {
                return Ok(None);
            }
            let (index, members) = layout
                .iter()
                .enumerate()
                .find_map(|(i, (&c, members))| (c == color).then_some((i, members)))
                .ok_or_else(|| Error::Internal(format!("colour {color} missing from layout")))?;
            let members = members
                .iter()
                .map(|&r| self.world_dest(r))
                .collect::<Result<Vec<_>>>()?;
            let context = base + index as u32;
            debug!(
                parent = self.context,
                context,
                color,
                key,
                size = members.len(),
                "split communicator"
            );
            Self::from_parts(Arc::clone(&self.transport), members, context).map(Some)
        })
    }

    /// Split into one communicator per node (processes sharing a processor name).
    ///
    /// Collective over every rank; `key` orders ranks inside each node.
    pub fn split_by_node(&self, key: i32) -> Result<Self> {
        let names = self
            .formation("split_by_node", || {
                self.allgather_payloads(Bytes::from(self.processor_name().into_bytes()))
            })?;
        let mine = &names[self.rank as usize];
        let color = names
            .iter()
            .position(|name| name == mine)
            .map_or(self.rank, |p| p as i32);
        self.split(color, key)?
            .ok_or_else(|| Error::Internal("node split produced no communicator".into()))
    }
}

/// Status describing `len` bytes from `envelope` in elements of `T`.
fn status_of<T: Datatype>(envelope: &Envelope, len: usize) -> Status {
    Status {
        source: envelope.source,
        tag: envelope.tag,
        count: datatype::element_count::<T>(len),
        bytes: len as u64,
    }
}

/// Copy a matched message into a user buffer.
pub(crate) fn deliver<T: Datatype>(message: &Message, buf: &mut [T]) -> Result<Status> {
    let len = message.payload.len();
    let capacity = buf.len() * T::SIZE;
    if len > capacity {
        return Err(Error::Truncated {
            incoming: len,
            capacity,
        });
    }
    if len % T::SIZE != 0 {
        return Err(Error::InvalidBuffer(format!(
            "{len}-byte message is not a whole number of {:?} elements",
            T::TAG
        )));
    }
    T::decode(&message.payload, buf);
    Ok(status_of::<T>(&message.envelope, len))
}

/// Decode a payload that must fill `out` exactly.
pub(crate) fn decode_exact<T: Datatype>(payload: &[u8], out: &mut [T]) -> Result<()> {
    if payload.len() != out.len() * T::SIZE {
        return Err(Error::InvalidBuffer(format!(
            "expected {} bytes, got {}",
            out.len() * T::SIZE,
            payload.len()
        )));
    }
    T::decode(payload, out);
    Ok(())
}
