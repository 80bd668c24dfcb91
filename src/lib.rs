//! Point-to-point request engine and derived datatypes for message passing
//!
//! This crate implements the object model of in-flight point-to-point operations of a message
//! passing layer: immediate and persistent sends and receives, their completion and cancellation
//! state machine, a buffered-send region, and the datatype engine that describes strided,
//! indexed and nested memory layouts and packs them into contiguous wire buffers.
//!
//! Moving bytes between processes is delegated to a [`Transport`](transport::Transport). The
//! crate ships an in-process [`Loopback`](transport::loopback::Loopback) transport that connects
//! any number of ranks living in the same thread.
//!
//! # Usage
//!
//! ```
//! use mpi_p2p::traits::*;
//! use mpi_p2p::transport::loopback::Loopback;
//!
//! let mut endpoints = Loopback::world(2).into_iter();
//! let universe0 = mpi_p2p::initialize(endpoints.next().unwrap()).unwrap();
//! let universe1 = mpi_p2p::initialize(endpoints.next().unwrap()).unwrap();
//! let (world0, world1) = (universe0.world(), universe1.world());
//!
//! let msg = [4.0f64, 8.0, 15.0];
//! world0.process_at_rank(1).send(&msg[..]).unwrap();
//!
//! let mut buf = [0.0f64; 3];
//! let status = world1.process_at_rank(0).receive_into(&mut buf[..]).unwrap();
//! assert_eq!(buf, msg);
//! assert_eq!(status.source_rank(), 0);
//! assert_eq!(status.count(&f64::equivalent_datatype()), 3);
//! ```
//!
//! # Features
//!
//! - **Datatypes**: contiguous, vector, hvector, indexed, hindexed, indexed block, struct,
//!   resized and subarray constructors, bound markers, commit, pack and unpack.
//! - **Point to point communication**: standard, buffered, synchronous and ready mode sends in
//!   blocking, immediate and persistent variants, receives in the same variants, send-receive.
//! - **Requests**: wait, test, cancel, free and status queries, on single requests and on
//!   collections (`any`, `all`, `some`).
//! - **Buffered sends**: a user supplied region shared by all buffered-mode sends.
//!
//! The `derive` feature provides `#[derive(Equivalence)]` for structs, the `complex` feature
//! describes `num_complex::Complex` values.

pub mod bsend;
pub mod datatype;
mod engine;
pub mod environment;
pub mod error;
pub mod point_to_point;
pub mod raw;
pub mod request;
pub mod topology;
pub mod transport;

/// Re-exports all traits.
pub mod traits {
    pub use crate::datatype::traits::*;
    pub use crate::point_to_point::traits::*;
    pub use crate::raw::traits::*;
    pub use crate::request::traits::*;
    pub use crate::topology::traits::*;
}

pub use crate::engine::Context;
pub use crate::environment::{initialize, initialize_with_config, Config, Universe};
pub use crate::error::{Error, ErrorKind, Result};

/// Encodes number of values in multi-value messages.
pub type Count = i32;
/// Can be used to tag messages on the sender side and match on the receiver side.
pub type Tag = i32;
/// A byte displacement within a buffer
pub type Address = isize;

#[doc(hidden)]
pub mod internal {
    #[cfg(feature = "derive")]
    pub use memoffset;
    pub use once_cell::sync::Lazy;
}
