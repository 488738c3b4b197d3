//! Error types for ferroctl

use thiserror::Error;

/// Result type for controller and communicator operations
pub type Result<T> = std::result::Result<T, Error>;

/// Broad category of an [`Error`].
///
/// | Class            | Recovery                                              |
/// |------------------|-------------------------------------------------------|
/// | `Transport`      | Local; retry if the caller's protocol allows it        |
/// | `Misuse`         | None; the caller broke a documented precondition      |
/// | `GroupFormation` | None; the universe has been aborted                   |
/// | `Dispatch`       | Local; an invocation arrived that nobody will handle   |
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorClass {
    /// A send, receive or progress call failed in the transport.
    Transport,
    /// A precondition of the API was violated.
    Misuse,
    /// Deriving a communicator or sub-controller failed.
    GroupFormation,
    /// A remote invocation could not be dispatched.
    Dispatch,
}

/// Error types for controller and communicator operations
#[derive(Error, Debug)]
pub enum Error {
    /// The controller or transport has not been initialized
    #[error("transport has not been initialized")]
    NotInitialized,

    /// The controller has already been finalized
    #[error("controller has been finalized")]
    Finalized,

    /// The transport could not be reached at start-up
    #[error("transport unavailable: {0}")]
    TransportUnavailable(String),

    /// Invalid rank specified
    #[error("invalid rank: {0}")]
    InvalidRank(i32),

    /// Invalid tag specified
    #[error("invalid tag: {0}")]
    InvalidTag(i32),

    /// A rank appears more than once in a process group
    #[error("rank {0} already present in process group")]
    DuplicateRank(i32),

    /// The calling rank is not part of the group it tried to join
    #[error("rank {0} is not a member of the requested group")]
    NotAMember(i32),

    /// Invalid colour passed to a partitioning call
    #[error("invalid partition colour: {0}")]
    InvalidColor(i32),

    /// Invalid buffer provided
    #[error("invalid buffer: {0}")]
    InvalidBuffer(String),

    /// Incoming message does not fit the receive buffer
    #[error("message of {incoming} bytes truncated into a {capacity}-byte buffer")]
    Truncated {
        /// Size of the incoming message in bytes
        incoming: usize,
        /// Capacity of the receive buffer in bytes
        capacity: usize,
    },

    /// Transport-level fault on a send, receive or progress call
    #[error("transport fault: {0}")]
    Transport(String),

    /// The universe was aborted, by a fatal fault or an explicit abort
    #[error("run aborted: {0}")]
    Aborted(String),

    /// Deriving a communicator or sub-controller failed
    #[error("group formation failed during {operation}: {source}")]
    GroupFormation {
        /// The collective that was forming the group
        operation: &'static str,
        /// Underlying failure
        #[source]
        source: Box<Error>,
    },

    /// No callable was registered for an execute call
    #[error("no method registered for rank {0}")]
    NoMethod(i32),

    /// A remote invocation arrived for a tag that will never be handled
    #[error("no handler will ever be registered for RMI tag {tag} (from rank {source_rank})")]
    UnhandledInvocation {
        /// Invocation tag
        tag: i32,
        /// Rank that triggered the invocation
        source_rank: i32,
    },

    /// Tag reserved for internal control traffic
    #[error("RMI tag {0} is reserved")]
    ReservedTag(i32),

    /// Handler registration was closed on this dispatcher
    #[error("RMI handler registration is closed")]
    RegistrationClosed,

    /// A control frame could not be decoded
    #[error("malformed RMI frame: {0}")]
    MalformedFrame(String),

    /// Internal error
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Classify this error according to its recovery policy.
    pub fn class(&self) -> ErrorClass {
        match self {
            Error::Transport(_) | Error::Truncated { .. } | Error::Aborted(_) => {
                ErrorClass::Transport
            }
            Error::GroupFormation { .. } => ErrorClass::GroupFormation,
            Error::UnhandledInvocation { .. } | Error::MalformedFrame(_) => ErrorClass::Dispatch,
            Error::TransportUnavailable(_) => ErrorClass::Transport,
            Error::NotInitialized
            | Error::Finalized
            | Error::InvalidRank(_)
            | Error::InvalidTag(_)
            | Error::DuplicateRank(_)
            | Error::NotAMember(_)
            | Error::InvalidColor(_)
            | Error::InvalidBuffer(_)
            | Error::NoMethod(_)
            | Error::ReservedTag(_)
            | Error::RegistrationClosed
            | Error::Internal(_) => ErrorClass::Misuse,
        }
    }

    /// Whether this error leaves the run unrecoverable.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::GroupFormation { .. } | Error::Aborted(_))
    }

    pub(crate) fn group_formation(operation: &'static str, source: Error) -> Self {
        match source {
            // Don't nest: the first failure already names the operation.
            e @ Error::GroupFormation { .. } => e,
            e => Error::GroupFormation {
                operation,
                source: Box::new(e),
            },
        }
    }
}
