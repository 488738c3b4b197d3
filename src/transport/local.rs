//! In-process universe: every rank lives in the current process.
//!
//! Each rank owns a mailbox guarded by a `parking_lot` mutex and condition
//! variable. A rank is normally driven by its own thread, just as it would be
//! its own process under a real launcher; [`launch`] plays the role of
//! `mpiexec -n N`.
//!
//! # Example
//!
//! ```
//! use ferroctl::transport::local;
//! use ferroctl::Communicator;
//!
//! let ranks = local::launch(4, |transport| {
//!     let world = Communicator::world(transport).unwrap();
//!     world.rank()
//! })
//! .unwrap();
//! assert_eq!(ranks, vec![0, 1, 2, 3]);
//! ```

use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};
use tracing::{debug, error};

use super::{ContextId, MatchSpec, Message, Pending, Receipt, SendMode, Transport};
use crate::error::{Error, Result};

/// Prefix of command-line arguments consumed by [`LocalEndpoint::start`].
pub const ARG_PREFIX: &str = "--ferroctl-";

struct Parcel {
    message: Message,
    receipt: Option<Receipt>,
    sender: i32,
}

/// A receive posted ahead of its message.
struct PostedReceive {
    ticket: u64,
    spec: MatchSpec,
    bound: Option<Message>,
}

struct MailboxState {
    parcels: VecDeque<Parcel>,
    posted: VecDeque<PostedReceive>,
    epoch: u64,
    open: bool,
}

struct Mailbox {
    state: Mutex<MailboxState>,
    activity: Condvar,
}

impl Mailbox {
    fn new() -> Self {
        Mailbox {
            state: Mutex::new(MailboxState {
                parcels: VecDeque::new(),
                posted: VecDeque::new(),
                epoch: 0,
                open: true,
            }),
            activity: Condvar::new(),
        }
    }

    fn bump(&self) {
        let mut state = self.state.lock();
        state.epoch = state.epoch.wrapping_add(1);
        self.activity.notify_all();
    }
}

struct Shared {
    size: i32,
    node_names: Vec<String>,
    mailboxes: Vec<Mailbox>,
    next_context: AtomicU32,
    next_receipt: AtomicU64,
    next_ticket: AtomicU64,
    aborted: AtomicBool,
    abort_reason: Mutex<Option<String>>,
}

impl Shared {
    fn abort(&self, reason: &str) {
        {
            let mut slot = self.abort_reason.lock();
            if slot.is_none() {
                *slot = Some(reason.to_string());
            }
        }
        if !self.aborted.swap(true, Ordering::SeqCst) {
            error!(reason, "aborting local universe");
        }
        for mailbox in &self.mailboxes {
            mailbox.bump();
        }
    }

    fn aborted_error(&self) -> Error {
        let reason = self
            .abort_reason
            .lock()
            .clone()
            .unwrap_or_else(|| "unknown reason".to_string());
        Error::Aborted(reason)
    }

    fn check_aborted(&self) -> Result<()> {
        if self.aborted.load(Ordering::SeqCst) {
            Err(self.aborted_error())
        } else {
            Ok(())
        }
    }
}

/// A universe of ranks sharing the current process.
#[derive(Clone)]
pub struct LocalUniverse {
    shared: Arc<Shared>,
}

impl LocalUniverse {
    /// Create a universe of `size` ranks, all on the same node.
    pub fn new(size: usize) -> Result<Self> {
        let host = std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string());
        Self::with_node_names(vec![host; size])
    }

    /// Create a universe with one rank per entry of `node_names`.
    ///
    /// Rank `i` reports `node_names[i]` as its processor name, which lets a
    /// single process emulate a multi-node layout.
    pub fn with_node_names(node_names: Vec<String>) -> Result<Self> {
        if node_names.is_empty() {
            return Err(Error::TransportUnavailable(
                "a universe needs at least one process".into(),
            ));
        }
        let size = i32::try_from(node_names.len())
            .map_err(|_| Error::TransportUnavailable("universe too large".into()))?;
        let mailboxes = (0..size).map(|_| Mailbox::new()).collect();
        Ok(LocalUniverse {
            shared: Arc::new(Shared {
                size,
                node_names,
                mailboxes,
                next_context: AtomicU32::new(1),
                next_receipt: AtomicU64::new(1),
                next_ticket: AtomicU64::new(1),
                aborted: AtomicBool::new(false),
                abort_reason: Mutex::new(None),
            }),
        })
    }

    /// Number of ranks in the universe.
    pub fn size(&self) -> i32 {
        self.shared.size
    }

    /// Get the (unstarted) endpoint of `rank`.
    pub fn endpoint(&self, rank: i32) -> Result<Arc<LocalEndpoint>> {
        if rank < 0 || rank >= self.shared.size {
            return Err(Error::InvalidRank(rank));
        }
        Ok(Arc::new(LocalEndpoint {
            shared: Arc::clone(&self.shared),
            rank,
            started: AtomicBool::new(false),
            shut_down: AtomicBool::new(false),
        }))
    }

    /// Whether any rank aborted the universe.
    pub fn is_aborted(&self) -> bool {
        self.shared.aborted.load(Ordering::SeqCst)
    }

    /// Run `f` once per rank on its own thread, with the transport already started.
    ///
    /// This is the situation of a process whose transport was brought up by
    /// a launcher or another library: controllers attach with
    /// [`initialize_attached`](crate::ProcessController::initialize_attached).
    pub fn launch<F, R>(&self, f: F) -> Result<Vec<R>>
    where
        F: Fn(Arc<dyn Transport>) -> R + Sync,
        R: Send,
    {
        self.run(f, true)
    }

    /// Run `f` once per rank on its own thread, leaving start-up to the callee.
    pub fn launch_unstarted<F, R>(&self, f: F) -> Result<Vec<R>>
    where
        F: Fn(Arc<dyn Transport>) -> R + Sync,
        R: Send,
    {
        self.run(f, false)
    }

    fn run<F, R>(&self, f: F, start: bool) -> Result<Vec<R>>
    where
        F: Fn(Arc<dyn Transport>) -> R + Sync,
        R: Send,
    {
        let mut endpoints = Vec::with_capacity(self.shared.size as usize);
        for rank in 0..self.shared.size {
            let endpoint = self.endpoint(rank)?;
            if start {
                endpoint.start(&mut Vec::new())?;
            }
            endpoints.push(endpoint);
        }

        let outcomes = std::thread::scope(|scope| {
            let mut handles = Vec::with_capacity(endpoints.len());
            for endpoint in endpoints {
                let f = &f;
                let shared = Arc::clone(&self.shared);
                let rank = endpoint.rank;
                let spawned = std::thread::Builder::new()
                    .name(format!("rank-{rank}"))
                    .spawn_scoped(scope, move || {
                        let outcome =
                            panic::catch_unwind(AssertUnwindSafe(|| f(endpoint as Arc<dyn Transport>)));
                        if outcome.is_err() {
                            shared.abort(&format!("rank {rank} panicked"));
                        }
                        outcome
                    });
                match spawned {
                    Ok(handle) => handles.push(handle),
                    Err(e) => {
                        // Ranks already running would wait forever for this one.
                        self.shared.abort(&format!("could not spawn rank {rank}: {e}"));
                        break;
                    }
                }
            }
            handles
                .into_iter()
                .map(|handle| match handle.join() {
                    Ok(outcome) => outcome,
                    Err(payload) => Err(payload),
                })
                .collect::<Vec<_>>()
        });

        let mut results = Vec::with_capacity(outcomes.len());
        let mut first_panic = None;
        for outcome in outcomes {
            match outcome {
                Ok(value) => results.push(value),
                Err(payload) => {
                    if first_panic.is_none() {
                        first_panic = Some(payload);
                    }
                }
            }
        }
        if let Some(payload) = first_panic {
            panic::resume_unwind(payload);
        }
        if results.len() != self.shared.size as usize {
            return Err(self.shared.aborted_error());
        }
        Ok(results)
    }
}

/// Run `f` on `size` ranks of a fresh [`LocalUniverse`] and collect the
/// results in rank order.
///
/// If any rank panics the universe is aborted (so peers blocked on it return
/// [`Error::Aborted`]) and the panic is re-raised on the calling thread.
pub fn launch<F, R>(size: usize, f: F) -> Result<Vec<R>>
where
    F: Fn(Arc<dyn Transport>) -> R + Sync,
    R: Send,
{
    LocalUniverse::new(size)?.launch(f)
}

/// Like [`launch`], but each rank must start its own transport.
pub fn launch_unstarted<F, R>(size: usize, f: F) -> Result<Vec<R>>
where
    F: Fn(Arc<dyn Transport>) -> R + Sync,
    R: Send,
{
    LocalUniverse::new(size)?.launch_unstarted(f)
}

/// One rank's attachment to a [`LocalUniverse`].
pub struct LocalEndpoint {
    shared: Arc<Shared>,
    rank: i32,
    started: AtomicBool,
    shut_down: AtomicBool,
}

impl LocalEndpoint {
    fn mailbox(&self) -> &Mailbox {
        &self.shared.mailboxes[self.rank as usize]
    }

    fn notify_sender(&self, receipt: Receipt, sender: i32) {
        receipt.mark_matched();
        if let Some(mailbox) = self.shared.mailboxes.get(sender as usize) {
            mailbox.bump();
        }
    }
}

impl Transport for LocalEndpoint {
    fn start(&self, args: &mut Vec<String>) -> Result<()> {
        if self.shut_down.load(Ordering::SeqCst) {
            return Err(Error::TransportUnavailable(format!(
                "rank {} was shut down and cannot restart",
                self.rank
            )));
        }
        self.shared.check_aborted().map_err(|e| Error::TransportUnavailable(e.to_string()))?;
        args.retain(|arg| !arg.starts_with(ARG_PREFIX));
        if !self.started.swap(true, Ordering::SeqCst) {
            debug!(rank = self.rank, size = self.shared.size, "local transport started");
        }
        Ok(())
    }

    fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    fn shutdown(&self) -> Result<()> {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.started.store(false, Ordering::SeqCst);
        let mailbox = self.mailbox();
        let mut state = mailbox.state.lock();
        state.open = false;
        state.epoch = state.epoch.wrapping_add(1);
        let stranded = state.parcels.len();
        mailbox.activity.notify_all();
        drop(state);
        debug!(rank = self.rank, stranded, "local transport shut down");
        Ok(())
    }

    fn world_rank(&self) -> i32 {
        self.rank
    }

    fn world_size(&self) -> i32 {
        self.shared.size
    }

    fn processor_name(&self) -> String {
        self.shared.node_names[self.rank as usize].clone()
    }

    fn allocate_contexts(&self, count: u32) -> Result<ContextId> {
        self.shared
            .next_context
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |next| {
                next.checked_add(count)
            })
            .map_err(|_| Error::Transport("context space exhausted".into()))
    }

    fn post(&self, dest: i32, message: Message, mode: SendMode) -> Result<Option<Receipt>> {
        self.shared.check_aborted()?;
        if !self.is_started() {
            return Err(Error::NotInitialized);
        }
        let mailbox = self
            .shared
            .mailboxes
            .get(usize::try_from(dest).map_err(|_| Error::InvalidRank(dest))?)
            .ok_or(Error::InvalidRank(dest))?;

        let receipt = match mode {
            SendMode::Standard => None,
            SendMode::Synchronous => Some(Receipt::new(
                self.shared.next_receipt.fetch_add(1, Ordering::Relaxed),
                dest,
            )),
        };

        let mut state = mailbox.state.lock();
        if !state.open {
            return Err(Error::Transport(format!("rank {dest} has shut down")));
        }
        #[cfg(feature = "debug")]
        tracing::trace!(
            from = self.rank,
            to = dest,
            context = message.envelope.address.context,
            tag = message.envelope.tag,
            len = message.payload.len(),
            "post"
        );
        let envelope = message.envelope;
        let waiting = state
            .posted
            .iter_mut()
            .find(|posted| posted.bound.is_none() && posted.spec.matches(&envelope));
        match waiting {
            Some(posted) => {
                posted.bound = Some(message);
                // The sender is this thread, so there is nobody to wake.
                if let Some(receipt) = &receipt {
                    receipt.mark_matched();
                }
            }
            None => state.parcels.push_back(Parcel {
                message,
                receipt: receipt.clone(),
                sender: self.rank,
            }),
        }
        state.epoch = state.epoch.wrapping_add(1);
        mailbox.activity.notify_all();
        Ok(receipt)
    }

    fn take(&self, spec: &MatchSpec) -> Result<Option<Message>> {
        self.shared.check_aborted()?;
        let parcel = {
            let mut state = self.mailbox().state.lock();
            let position = state
                .parcels
                .iter()
                .position(|parcel| spec.matches(&parcel.message.envelope));
            match position {
                Some(index) => state.parcels.remove(index),
                None => None,
            }
        };
        Ok(parcel.map(|parcel| {
            if let Some(receipt) = parcel.receipt {
                self.notify_sender(receipt, parcel.sender);
            }
            parcel.message
        }))
    }

    fn peek(&self, spec: &MatchSpec) -> Result<Option<Pending>> {
        self.shared.check_aborted()?;
        let state = self.mailbox().state.lock();
        Ok(state
            .parcels
            .iter()
            .find(|parcel| spec.matches(&parcel.message.envelope))
            .map(|parcel| Pending {
                envelope: parcel.message.envelope,
                len: parcel.message.payload.len(),
            }))
    }

    fn withdraw(&self, receipt: &Receipt) -> bool {
        let Some(mailbox) = self.shared.mailboxes.get(receipt.dest() as usize) else {
            return false;
        };
        let mut state = mailbox.state.lock();
        let position = state.parcels.iter().position(|parcel| {
            parcel
                .receipt
                .as_ref()
                .is_some_and(|held| held.id() == receipt.id())
        });
        match position {
            Some(index) => {
                state.parcels.remove(index);
                true
            }
            None => false,
        }
    }

    fn post_receive(&self, spec: &MatchSpec) -> Result<u64> {
        self.shared.check_aborted()?;
        let ticket = self.shared.next_ticket.fetch_add(1, Ordering::Relaxed);
        let matched = {
            let mut state = self.mailbox().state.lock();
            let position = state
                .parcels
                .iter()
                .position(|parcel| spec.matches(&parcel.message.envelope));
            let parcel = position.and_then(|index| state.parcels.remove(index));
            let (bound, notify) = match parcel {
                Some(parcel) => (Some(parcel.message), parcel.receipt.map(|r| (r, parcel.sender))),
                None => (None, None),
            };
            state.posted.push_back(PostedReceive {
                ticket,
                spec: *spec,
                bound,
            });
            notify
        };
        if let Some((receipt, sender)) = matched {
            self.notify_sender(receipt, sender);
        }
        Ok(ticket)
    }

    fn claim(&self, ticket: u64) -> Result<Option<Message>> {
        self.shared.check_aborted()?;
        let mut state = self.mailbox().state.lock();
        let position = state
            .posted
            .iter()
            .position(|posted| posted.ticket == ticket);
        let Some(index) = position else {
            return Err(Error::Internal(format!("unknown receive ticket {ticket}")));
        };
        if state.posted[index].bound.is_none() {
            return Ok(None);
        }
        Ok(state.posted.remove(index).and_then(|posted| posted.bound))
    }

    fn withdraw_receive(&self, ticket: u64) -> bool {
        let mut state = self.mailbox().state.lock();
        let position = state
            .posted
            .iter()
            .position(|posted| posted.ticket == ticket && posted.bound.is_none());
        match position {
            Some(index) => {
                state.posted.remove(index);
                true
            }
            None => false,
        }
    }

    fn activity(&self) -> u64 {
        self.mailbox().state.lock().epoch
    }

    fn wait_activity(&self, seen: u64) -> Result<()> {
        let mailbox = self.mailbox();
        let mut state = mailbox.state.lock();
        loop {
            if self.shared.aborted.load(Ordering::SeqCst) {
                drop(state);
                return Err(self.shared.aborted_error());
            }
            if state.epoch != seen {
                return Ok(());
            }
            mailbox.activity.wait(&mut state);
        }
    }

    fn abort(&self, reason: &str) {
        self.shared.abort(&format!("rank {}: {reason}", self.rank));
    }

    fn is_aborted(&self) -> bool {
        self.shared.aborted.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{Address, Envelope};
    use bytes::Bytes;

    fn message(context: ContextId, source: i32, tag: i32, payload: &'static [u8]) -> Message {
        Message {
            envelope: Envelope {
                address: Address::p2p(context),
                source,
                tag,
            },
            payload: Bytes::from_static(payload),
        }
    }

    fn started_pair() -> (Arc<LocalEndpoint>, Arc<LocalEndpoint>) {
        let universe = LocalUniverse::new(2).unwrap();
        let a = universe.endpoint(0).unwrap();
        let b = universe.endpoint(1).unwrap();
        a.start(&mut Vec::new()).unwrap();
        b.start(&mut Vec::new()).unwrap();
        (a, b)
    }

    #[test]
    fn start_strips_transport_arguments() {
        let universe = LocalUniverse::new(1).unwrap();
        let endpoint = universe.endpoint(0).unwrap();
        let mut args = vec![
            "prog".to_string(),
            "--ferroctl-verbose".to_string(),
            "input.dat".to_string(),
        ];
        endpoint.start(&mut args).unwrap();
        assert_eq!(args, vec!["prog".to_string(), "input.dat".to_string()]);
        assert!(endpoint.is_started());
    }

    #[test]
    fn post_requires_start_and_valid_rank() {
        let universe = LocalUniverse::new(2).unwrap();
        let endpoint = universe.endpoint(0).unwrap();
        let err = endpoint
            .post(1, message(0, 0, 1, b"x"), SendMode::Standard)
            .unwrap_err();
        assert!(matches!(err, Error::NotInitialized));

        endpoint.start(&mut Vec::new()).unwrap();
        let err = endpoint
            .post(5, message(0, 0, 1, b"x"), SendMode::Standard)
            .unwrap_err();
        assert!(matches!(err, Error::InvalidRank(5)));
    }

    #[test]
    fn take_matches_oldest_first() {
        let (a, b) = started_pair();
        a.post(1, message(0, 0, 7, b"first"), SendMode::Standard).unwrap();
        a.post(1, message(0, 0, 8, b"other"), SendMode::Standard).unwrap();
        a.post(1, message(0, 0, 7, b"second"), SendMode::Standard).unwrap();

        let spec = MatchSpec {
            address: Address::p2p(0),
            source: 0,
            tag: 7,
        };
        assert_eq!(b.peek(&spec).unwrap().unwrap().len, 5);
        assert_eq!(&b.take(&spec).unwrap().unwrap().payload[..], b"first");
        assert_eq!(&b.take(&spec).unwrap().unwrap().payload[..], b"second");
        assert!(b.take(&spec).unwrap().is_none());
    }

    #[test]
    fn synchronous_receipt_and_withdraw() {
        let (a, b) = started_pair();
        let spec = MatchSpec {
            address: Address::p2p(0),
            source: 0,
            tag: 1,
        };

        let receipt = a
            .post(1, message(0, 0, 1, b"sync"), SendMode::Synchronous)
            .unwrap()
            .unwrap();
        assert!(!receipt.is_matched());
        let before = a.activity();
        b.take(&spec).unwrap().unwrap();
        assert!(receipt.is_matched());
        assert_ne!(a.activity(), before);

        let receipt = a
            .post(1, message(0, 0, 1, b"late"), SendMode::Synchronous)
            .unwrap()
            .unwrap();
        assert!(a.withdraw(&receipt));
        assert!(b.take(&spec).unwrap().is_none());
        assert!(!a.withdraw(&receipt));
    }

    #[test]
    fn posted_receives_bind_in_posting_order() {
        let (a, b) = started_pair();
        let spec = MatchSpec {
            address: Address::p2p(0),
            source: 0,
            tag: 7,
        };
        a.post(1, message(0, 0, 7, b"early"), SendMode::Standard).unwrap();
        let first = b.post_receive(&spec).unwrap();
        let second = b.post_receive(&spec).unwrap();
        let third = b.post_receive(&spec).unwrap();
        a.post(1, message(0, 0, 7, b"late"), SendMode::Standard).unwrap();
        a.post(1, message(0, 0, 7, b"spare"), SendMode::Standard).unwrap();

        assert!(b.peek(&spec).unwrap().is_none());
        assert_eq!(&b.claim(second).unwrap().unwrap().payload[..], b"late");
        assert_eq!(&b.claim(first).unwrap().unwrap().payload[..], b"early");
        assert!(!b.withdraw_receive(third));
        assert_eq!(&b.claim(third).unwrap().unwrap().payload[..], b"spare");
        assert!(b.claim(third).is_err());
    }

    #[test]
    fn withdrawn_receive_leaves_message_queued() {
        let (a, b) = started_pair();
        let spec = MatchSpec {
            address: Address::p2p(0),
            source: 0,
            tag: 2,
        };
        let ticket = b.post_receive(&spec).unwrap();
        assert!(b.claim(ticket).unwrap().is_none());
        assert!(b.withdraw_receive(ticket));
        let receipt = a
            .post(1, message(0, 0, 2, b"kept"), SendMode::Synchronous)
            .unwrap()
            .unwrap();
        assert!(!receipt.is_matched());
        assert_eq!(&b.take(&spec).unwrap().unwrap().payload[..], b"kept");
        assert!(receipt.is_matched());
    }

    #[test]
    fn contexts_are_never_reused() {
        let (a, b) = started_pair();
        let first = a.allocate_contexts(3).unwrap();
        let second = b.allocate_contexts(1).unwrap();
        assert!(first >= 1);
        assert_eq!(second, first + 3);
    }

    #[test]
    fn shutdown_closes_mailbox() {
        let (a, b) = started_pair();
        b.shutdown().unwrap();
        let err = a
            .post(1, message(0, 0, 1, b"x"), SendMode::Standard)
            .unwrap_err();
        assert!(matches!(err, Error::Transport(_)));
        assert!(b.start(&mut Vec::new()).is_err());
    }

    #[test]
    fn abort_wakes_waiters() {
        let (a, b) = started_pair();
        let seen = b.activity();
        std::thread::scope(|scope| {
            let waiter = scope.spawn(|| b.wait_activity(seen));
            a.abort("test abort");
            let outcome = waiter.join().unwrap();
            assert!(matches!(outcome, Err(Error::Aborted(_))));
        });
        assert!(a.is_aborted());
    }

    #[test]
    fn launch_collects_results_in_rank_order() {
        let names = vec!["node-a".to_string(), "node-a".to_string(), "node-b".to_string()];
        let universe = LocalUniverse::with_node_names(names).unwrap();
        let result = universe
            .launch(|transport| (transport.world_rank(), transport.processor_name()))
            .unwrap();
        assert_eq!(
            result,
            vec![
                (0, "node-a".to_string()),
                (1, "node-a".to_string()),
                (2, "node-b".to_string()),
            ]
        );
    }

    #[test]
    fn empty_universe_is_rejected() {
        assert!(LocalUniverse::new(0).is_err());
    }
}
