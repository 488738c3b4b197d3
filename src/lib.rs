//! # ferroctl
//!
//! A controller for a fixed group of cooperating processes, with isolated
//! communicators and remote method invocations.
//!
//! This crate provides:
//! - A [`ProcessController`] owning process lifecycle, a primary
//!   [`Communicator`] and a private [`RmiDispatcher`]
//! - Type-safe generic point-to-point and collective operations
//! - Nonblocking operations with [`Request`] handles and completion sets
//! - Communicator derivation (duplicate, group, split, per-node split)
//! - Remote method invocations that never collide with user traffic
//! - A pluggable [`transport::Transport`], with an in-process
//!   [`transport::local`] backend running each rank on its own thread
//!
//! ## Supported Types
//!
//! All communication operations are generic over [`Datatype`]:
//! `i8`, `u8`, `i32`, `u32`, `i64`, `u64`, `f32`, `f64`
//!
//! ## Quick Start
//!
//! ```
//! use ferroctl::{transport::local, ProcessController, ReduceOp};
//!
//! local::launch_unstarted(4, |transport| -> Result<(), ferroctl::Error> {
//!     let mut controller = ProcessController::new(transport);
//!     controller.initialize(&mut std::env::args().collect(), false)?;
//!     let world = controller.communicator()?;
//!
//!     let rank = world.rank();
//!     let mut data = vec![0.0f64; 100];
//!     if rank == 0 {
//!         data.fill(42.0);
//!     }
//!     world.broadcast(&mut data, 0)?;
//!
//!     let sum = world.allreduce_scalar(rank as f64, ReduceOp::Sum)?;
//!     assert_eq!(sum, 6.0);
//!
//!     controller.finalize(false)
//! })
//! .unwrap()
//! .into_iter()
//! .collect::<Result<Vec<_>, _>>()
//! .unwrap();
//! ```
//!
//! ## Feature Flags
//!
//! | Feature | Description |
//! |---------|-------------|
//! | `debug` | Trace every envelope posted to the local transport |
//!
//! ## Logging
//!
//! The crate logs through [`tracing`] and never installs a subscriber.
//! [`ProcessController::span`] gives a span carrying the local rank.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_possible_wrap)]
#![allow(clippy::cast_sign_loss)]
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::similar_names)]

mod collective;
mod comm;
mod config;
mod controller;
mod datatype;
mod error;
mod group;
pub mod request;
pub mod rmi;
mod status;
pub mod transport;

pub use comm::Communicator;
pub use config::{ControllerConfig, RmiDelivery, RMI_SYNC_VAR};
pub use controller::{ControllerState, ProcessController};
pub use datatype::{Datatype, DatatypeTag};
pub use error::{Error, ErrorClass, Result};
pub use group::{partition_members, ProcessGroup};
pub use request::{Request, RequestState};
pub use rmi::{
    DispatchState, Invocation, ProcessMode, RmiDispatcher, RmiHandlerId, RmiOutcome,
    BREAK_RMI_TAG, RMI_TAG,
};
pub use status::Status;

/// Wildcard source rank for receives and probes.
pub const ANY_SOURCE: i32 = -1;

/// Wildcard tag for receives and probes.
pub const ANY_TAG: i32 = -1;

/// Colour opting a rank out of [`Communicator::split`].
pub const UNDEFINED: i32 = -1;

/// Reduction operations
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum ReduceOp {
    /// Sum of values
    Sum = 0,
    /// Maximum value
    Max = 1,
    /// Minimum value
    Min = 2,
    /// Product of values
    Prod = 3,
}
