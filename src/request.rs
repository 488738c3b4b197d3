//! Request handles for nonblocking operations.
//!
//! A [`Request`] tracks one in-flight send or receive. It borrows the user
//! buffer for as long as it lives, so the buffer cannot be reused while the
//! operation is pending. Receives are posted when the request is created and
//! bind messages in posting order, so two receives on the same source and
//! tag always get the messages in the order they were sent, whichever is
//! waited on first. Progress is only made inside [`Request::test`],
//! [`Request::wait`] and the joint completion functions of this module;
//! nothing else ever completes a request.
//!
//! # Example
//!
//! ```
//! use ferroctl::{request, transport::local, Communicator};
//!
//! local::launch(2, |transport| {
//!     let world = Communicator::world(transport).unwrap();
//!     let peer = 1 - world.rank();
//!
//!     let send = vec![world.rank(); 8];
//!     let mut recv = vec![0i32; 8];
//!     {
//!         let mut requests = vec![
//!             world.irecv(&mut recv, peer, 0).unwrap(),
//!             world.isend(&send, peer, 0).unwrap(),
//!         ];
//!         request::wait_all(&mut requests).unwrap();
//!     }
//!     assert_eq!(recv, vec![peer; 8]);
//! })
//! .unwrap();
//! ```

use std::sync::Arc;

use tracing::warn;

use crate::error::{Error, Result};
use crate::status::Status;
use crate::transport::{MatchSpec, Message, Receipt, Transport};

/// Completion state of a [`Request`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestState {
    /// The operation has not been observed to complete yet.
    Pending,
    /// The operation completed (successfully or with an error already reported).
    Complete,
    /// The operation was cancelled before it matched.
    Cancelled,
}

/// Writes a matched message into the receive buffer the request borrows.
pub(crate) type Sink<'a> = Box<dyn FnMut(&Message) -> Result<Status> + 'a>;

enum Operation<'a> {
    Send {
        receipt: Option<Receipt>,
    },
    Recv {
        ticket: u64,
        sink: Sink<'a>,
    },
    /// Posting failed; the fault is reported on first completion.
    Failed {
        error: Option<Error>,
    },
}

/// A handle to a nonblocking operation.
///
/// The lifetime `'a` is the borrow of the buffer involved in the operation.
/// You must call [`wait`](Self::wait) or [`test`](Self::test) (or one of the
/// joint functions of this module) to complete it.
///
/// A failed completion (transport fault, truncated receive) is returned as
/// the `Err` of the call that completes the request; the request is then
/// [`RequestState::Complete`] and later tests return `Ok(true)`.
///
/// Dropping a pending request cancels it.
pub struct Request<'a> {
    transport: Arc<dyn Transport>,
    operation: Operation<'a>,
    state: RequestState,
    status: Option<Status>,
}

impl<'a> Request<'a> {
    pub(crate) fn send(transport: Arc<dyn Transport>, receipt: Option<Receipt>) -> Self {
        Request {
            transport,
            operation: Operation::Send { receipt },
            state: RequestState::Pending,
            status: None,
        }
    }

    /// Post a receive for `spec`; its message is written through `sink`.
    pub(crate) fn recv(transport: Arc<dyn Transport>, spec: MatchSpec, sink: Sink<'a>) -> Self {
        match transport.post_receive(&spec) {
            Ok(ticket) => Request {
                transport,
                operation: Operation::Recv { ticket, sink },
                state: RequestState::Pending,
                status: None,
            },
            Err(e) => Self::failed(transport, e),
        }
    }

    pub(crate) fn failed(transport: Arc<dyn Transport>, error: Error) -> Self {
        Request {
            transport,
            operation: Operation::Failed { error: Some(error) },
            state: RequestState::Pending,
            status: None,
        }
    }

    /// Current state.
    pub fn state(&self) -> RequestState {
        self.state
    }

    /// Whether the operation is still pending.
    pub fn is_pending(&self) -> bool {
        self.state == RequestState::Pending
    }

    /// Check if this request has been completed.
    pub fn is_completed(&self) -> bool {
        self.state == RequestState::Complete
    }

    /// Whether this request was cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.state == RequestState::Cancelled
    }

    /// Status of the completed operation, if it completed successfully.
    ///
    /// For receives this describes the matched message; for sends it is empty.
    pub fn status(&self) -> Option<Status> {
        self.status
    }

    /// Test if this operation has completed without blocking.
    ///
    /// Returns `true` once the request is no longer pending. Calling it again
    /// after that keeps returning `true`.
    pub fn test(&mut self) -> Result<bool> {
        if self.state != RequestState::Pending {
            return Ok(true);
        }
        match &mut self.operation {
            Operation::Send { receipt } => {
                if receipt.as_ref().map_or(true, Receipt::is_matched) {
                    self.state = RequestState::Complete;
                    self.status = Some(Status::empty());
                }
            }
            Operation::Recv { ticket, sink } => {
                let taken = match self.transport.claim(*ticket) {
                    Ok(taken) => taken,
                    Err(e) => {
                        self.state = RequestState::Complete;
                        return Err(e);
                    }
                };
                if let Some(message) = taken {
                    self.state = RequestState::Complete;
                    self.status = Some(sink(&message)?);
                }
            }
            Operation::Failed { error } => {
                self.state = RequestState::Complete;
                if let Some(e) = error.take() {
                    return Err(e);
                }
            }
        }
        Ok(self.state != RequestState::Pending)
    }

    /// Wait for this operation to complete.
    ///
    /// Blocks until the operation is finished. After this returns, the
    /// associated buffer holds the received data (for receives) and the
    /// request can be dropped.
    pub fn wait(&mut self) -> Result<Status> {
        loop {
            let seen = self.transport.activity();
            if self.test()? {
                return Ok(self.status.unwrap_or_else(Status::empty));
            }
            self.transport.wait_activity(seen)?;
        }
    }

    /// Attempt to cancel a pending operation.
    ///
    /// Receives that have not been bound to a message can always be cancelled. Synchronous
    /// sends can be cancelled while the receiver has not matched them.
    /// Standard sends have already been handed to the transport and cannot.
    /// Returns whether the request is now cancelled.
    pub fn cancel(&mut self) -> Result<bool> {
        if self.state != RequestState::Pending {
            return Ok(self.state == RequestState::Cancelled);
        }
        let cancelled = match &self.operation {
            Operation::Recv { ticket, .. } => self.transport.withdraw_receive(*ticket),
            Operation::Send {
                receipt: Some(receipt),
            } => self.transport.withdraw(receipt),
            Operation::Send { receipt: None } | Operation::Failed { .. } => false,
        };
        if cancelled {
            self.state = RequestState::Cancelled;
        }
        Ok(cancelled)
    }
}

impl Drop for Request<'_> {
    fn drop(&mut self) {
        if self.state != RequestState::Pending {
            return;
        }
        match self.cancel() {
            Ok(true) => warn!("pending request dropped; operation cancelled"),
            _ => {
                if let Operation::Recv { ticket, .. } = &self.operation {
                    if let Ok(Some(message)) = self.transport.claim(*ticket) {
                        warn!(
                            source = message.envelope.source,
                            tag = message.envelope.tag,
                            "pending receive dropped after it matched; message discarded"
                        );
                    }
                }
            }
        }
    }
}

fn shared_transport(requests: &[Request<'_>]) -> Option<Arc<dyn Transport>> {
    requests.first().map(|r| Arc::clone(&r.transport))
}

/// Returns `true` iff every request is complete (or cancelled).
///
/// Never blocks. Idempotent once it has returned `true`.
pub fn test_all(requests: &mut [Request<'_>]) -> Result<bool> {
    let mut all = true;
    for request in requests.iter_mut() {
        if request.is_pending() && !request.test()? {
            all = false;
        }
    }
    Ok(all)
}

/// Blocks until every request is complete.
pub fn wait_all(requests: &mut [Request<'_>]) -> Result<()> {
    let Some(transport) = shared_transport(requests) else {
        return Ok(());
    };
    loop {
        let seen = transport.activity();
        if test_all(requests)? {
            return Ok(());
        }
        transport.wait_activity(seen)?;
    }
}

/// Complete at most one pending request without blocking.
///
/// Requests are polled in index order and the first one found complete is
/// returned; when several could complete, which one is reported is only a
/// consequence of that polling order. Requests that are no longer pending
/// are skipped. Returns `None` if nothing completed.
pub fn test_any(requests: &mut [Request<'_>]) -> Result<Option<usize>> {
    for (index, request) in requests.iter_mut().enumerate() {
        if request.is_pending() && request.test()? {
            return Ok(Some(index));
        }
    }
    Ok(None)
}

/// Blocks until at least one pending request completes and returns its index.
///
/// Same selection rule as [`test_any`]. Returns `None` without blocking if
/// no request is pending.
pub fn wait_any(requests: &mut [Request<'_>]) -> Result<Option<usize>> {
    let Some(transport) = shared_transport(requests) else {
        return Ok(None);
    };
    loop {
        if !requests.iter().any(Request::is_pending) {
            return Ok(None);
        }
        let seen = transport.activity();
        if let Some(index) = test_any(requests)? {
            return Ok(Some(index));
        }
        transport.wait_activity(seen)?;
    }
}

/// Test every pending request; return the indices of those that completed.
///
/// Never blocks.
pub fn test_some(requests: &mut [Request<'_>]) -> Result<Vec<usize>> {
    let mut completed = Vec::new();
    for (index, request) in requests.iter_mut().enumerate() {
        if request.is_pending() && request.test()? {
            completed.push(index);
        }
    }
    Ok(completed)
}

/// Blocks until at least one pending request completes; returns every index
/// that completed during the call.
///
/// Returns an empty set without blocking if no request is pending.
pub fn wait_some(requests: &mut [Request<'_>]) -> Result<Vec<usize>> {
    let Some(transport) = shared_transport(requests) else {
        return Ok(Vec::new());
    };
    loop {
        if !requests.iter().any(Request::is_pending) {
            return Ok(Vec::new());
        }
        let seen = transport.activity();
        let completed = test_some(requests)?;
        if !completed.is_empty() {
            return Ok(completed);
        }
        transport.wait_activity(seen)?;
    }
}
