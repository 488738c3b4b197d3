//! Element datatype trait and type tag mapping.
//!
//! This module provides the [`Datatype`] trait, a sealed trait that maps Rust
//! primitive types to a wire tag, a fixed element width and a little-endian
//! byte encoding, for use in generic communication operations.
//!
//! # Supported Types
//!
//! | Rust Type | Width | Tag Value |
//! |-----------|-------|-----------|
//! | `f32`     | 4     | 0         |
//! | `f64`     | 8     | 1         |
//! | `i32`     | 4     | 2         |
//! | `i64`     | 8     | 3         |
//! | `u8`      | 1     | 4         |
//! | `u32`     | 4     | 5         |
//! | `u64`     | 8     | 6         |
//! | `i8`      | 1     | 7         |

use bytes::{BufMut, Bytes, BytesMut};

use crate::ReduceOp;

/// Seals [`Datatype`] against implementations outside this crate.
mod sealed {
    pub trait Sealed {}
}

/// Tag values identifying the element type of a buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum DatatypeTag {
    /// 32-bit floating point
    F32 = 0,
    /// 64-bit floating point
    F64 = 1,
    /// 32-bit signed integer
    I32 = 2,
    /// 64-bit signed integer
    I64 = 3,
    /// 8-bit unsigned integer
    U8 = 4,
    /// 32-bit unsigned integer
    U32 = 5,
    /// 64-bit unsigned integer
    U64 = 6,
    /// 8-bit signed integer
    I8 = 7,
}

/// Trait for types that can be used in communication operations.
///
/// This is a **sealed trait**: it cannot be implemented outside this crate.
/// Supported types: [`f32`], [`f64`], [`i32`], [`i64`], [`u8`], [`u32`], [`u64`], [`i8`].
///
/// # Example
///
/// ```
/// use ferroctl::transport::local;
///
/// local::launch(2, |transport| {
///     let world = ferroctl::Communicator::world(transport).unwrap();
///
///     // Works with f64
///     let mut data_f64 = vec![1.0f64; 10];
///     world.broadcast(&mut data_f64, 0).unwrap();
///
///     // Works with i32
///     let mut data_i32 = vec![42i32; 10];
///     world.broadcast(&mut data_i32, 0).unwrap();
/// })
/// .unwrap();
/// ```
pub trait Datatype: sealed::Sealed + Copy + Send + PartialEq + std::fmt::Debug + 'static {
    /// The datatype tag identifying this type.
    const TAG: DatatypeTag;

    /// Width of one element in bytes.
    const SIZE: usize;

    /// Zero value, used to initialise scratch buffers.
    const ZERO: Self;

    /// Append the little-endian encoding of `data` to `out`.
    fn encode(data: &[Self], out: &mut BytesMut);

    /// Decode `bytes` into the front of `out`.
    ///
    /// `bytes.len()` must be a multiple of [`SIZE`](Self::SIZE) and fit in `out`.
    fn decode(bytes: &[u8], out: &mut [Self]);

    /// Combine two values with a reduction operator.
    fn combine(a: Self, b: Self, op: ReduceOp) -> Self;
}

/// Encode a slice into a frozen payload.
pub(crate) fn to_bytes<T: Datatype>(data: &[T]) -> Bytes {
    let mut out = BytesMut::with_capacity(data.len() * T::SIZE);
    T::encode(data, &mut out);
    out.freeze()
}

/// Number of whole elements of `T` in `len` bytes.
pub(crate) fn element_count<T: Datatype>(len: usize) -> i64 {
    (len / T::SIZE) as i64
}

macro_rules! impl_datatype {
    (@common $kind:ident $ty:ty, $tag:expr, $zero:expr) => {
        impl sealed::Sealed for $ty {}

        impl Datatype for $ty {
            const TAG: DatatypeTag = $tag;
            const SIZE: usize = std::mem::size_of::<$ty>();
            const ZERO: Self = $zero;

            fn encode(data: &[Self], out: &mut BytesMut) {
                out.reserve(data.len() * Self::SIZE);
                for value in data {
                    out.put_slice(&value.to_le_bytes());
                }
            }

            fn decode(bytes: &[u8], out: &mut [Self]) {
                for (chunk, slot) in bytes.chunks_exact(Self::SIZE).zip(out.iter_mut()) {
                    let mut raw = [0u8; std::mem::size_of::<$ty>()];
                    raw.copy_from_slice(chunk);
                    *slot = <$ty>::from_le_bytes(raw);
                }
            }

            fn combine(a: Self, b: Self, op: ReduceOp) -> Self {
                combine_impl!($kind, a, b, op)
            }
        }
    };
    (int $ty:ty, $tag:expr) => {
        impl_datatype!(@common int $ty, $tag, 0);
    };
    (float $ty:ty, $tag:expr) => {
        impl_datatype!(@common float $ty, $tag, 0.0);
    };
}

macro_rules! combine_impl {
    (float, $a:ident, $b:ident, $op:ident) => {
        match $op {
            ReduceOp::Sum => $a + $b,
            ReduceOp::Prod => $a * $b,
            ReduceOp::Max => $a.max($b),
            ReduceOp::Min => $a.min($b),
        }
    };
    (int, $a:ident, $b:ident, $op:ident) => {
        match $op {
            ReduceOp::Sum => $a.wrapping_add($b),
            ReduceOp::Prod => $a.wrapping_mul($b),
            ReduceOp::Max => std::cmp::max($a, $b),
            ReduceOp::Min => std::cmp::min($a, $b),
        }
    };
}

impl_datatype!(float f32, DatatypeTag::F32);
impl_datatype!(float f64, DatatypeTag::F64);
impl_datatype!(int i32, DatatypeTag::I32);
impl_datatype!(int i64, DatatypeTag::I64);
impl_datatype!(int u8, DatatypeTag::U8);
impl_datatype!(int u32, DatatypeTag::U32);
impl_datatype!(int u64, DatatypeTag::U64);
impl_datatype!(int i8, DatatypeTag::I8);
