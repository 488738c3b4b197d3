//! Message status information.
//!
//! This module provides the [`Status`] struct returned by receive, probe and
//! request-completion operations, describing a message's origin and size.

/// Information about a probed or received message.
///
/// Returned by [`Communicator::probe`](crate::Communicator::probe) and
/// [`Communicator::iprobe`](crate::Communicator::iprobe) to describe an
/// incoming message without consuming it, and by receives to describe the
/// message that was consumed.
///
/// # Example
///
/// ```
/// use ferroctl::{transport::local, Communicator, ANY_SOURCE};
///
/// local::launch(2, |transport| {
///     let world = Communicator::world(transport).unwrap();
///     if world.rank() == 1 {
///         world.send(&[1.0f64, 2.0, 3.0], 0, 5).unwrap();
///     } else {
///         let status = world.probe::<f64>(ANY_SOURCE, 5).unwrap();
///         assert_eq!((status.source, status.tag, status.count), (1, 5, 3));
///         let mut buf = vec![0.0f64; status.count as usize];
///         world.recv(&mut buf, status.source, status.tag).unwrap();
///     }
/// })
/// .unwrap();
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Status {
    /// Source rank of the message.
    pub source: i32,
    /// Tag of the message.
    pub tag: i32,
    /// Number of elements in the message.
    pub count: i64,
    /// Size of the message in bytes.
    pub bytes: u64,
}

impl Status {
    /// Status of a send: there is no incoming message to describe.
    pub(crate) fn empty() -> Self {
        Status {
            source: crate::ANY_SOURCE,
            tag: crate::ANY_TAG,
            count: 0,
            bytes: 0,
        }
    }
}
