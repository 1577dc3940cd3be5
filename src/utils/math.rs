use num_traits::{Float, FromPrimitive, ToPrimitive};
use std::fmt::{Debug, Display};
use std::iter::Sum;
use std::ops::{AddAssign, DivAssign, MulAssign, SubAssign};

use crate::data::nearest_neighbours::NnDescentFloat;

///////////
// Float //
///////////

/// Floating point type the solver is generic over
///
/// Bundles the bounds every kernel in this crate needs, so signatures can use
/// a single `T: SneFloat` instead of repeating the full list. Implemented for
/// `f32` and `f64` via the blanket impl; the nearest neighbour index limits
/// it to those two.
pub trait SneFloat:
    Float
    + FromPrimitive
    + ToPrimitive
    + Send
    + Sync
    + Sum
    + AddAssign
    + SubAssign
    + MulAssign
    + DivAssign
    + Default
    + Debug
    + Display
    + NnDescentFloat
    + 'static
{
}

impl<T> SneFloat for T where
    T: Float
        + FromPrimitive
        + ToPrimitive
        + Send
        + Sync
        + Sum
        + AddAssign
        + SubAssign
        + MulAssign
        + DivAssign
        + Default
        + Debug
        + Display
        + NnDescentFloat
        + 'static
{
}

/// Shorthand for `T::from_f64(x).unwrap()`
#[inline(always)]
pub fn cast<T: SneFloat>(x: f64) -> T {
    T::from_f64(x).unwrap()
}

/////////////
// Helpers //
/////////////

/// Squared euclidean distance between two equally long slices
#[inline(always)]
pub fn squared_euclidean<T: SneFloat>(a: &[T], b: &[T]) -> T {
    a.iter()
        .zip(b)
        .map(|(&x, &y)| (x - y) * (x - y))
        .fold(T::zero(), |acc, d| acc + d)
}

/// L1 distance between two equally long slices
#[inline(always)]
pub fn manhattan<T: SneFloat>(a: &[T], b: &[T]) -> T {
    a.iter()
        .zip(b)
        .map(|(&x, &y)| (x - y).abs())
        .fold(T::zero(), |acc, d| acc + d)
}

/// Smallest power of two that is `>= x` (with `x = 0` mapping to 1)
#[inline]
pub fn next_pow2(x: usize) -> usize {
    x.max(1).next_power_of_two()
}

////////////
// Morton //
////////////

/// Spread the lower 16 bits of `v` so that there is one zero bit between each
#[inline]
fn spread_bits_2(v: u32) -> u64 {
    let mut x = (v & 0xffff) as u64;
    x = (x | (x << 8)) & 0x00ff_00ff;
    x = (x | (x << 4)) & 0x0f0f_0f0f;
    x = (x | (x << 2)) & 0x3333_3333;
    x = (x | (x << 1)) & 0x5555_5555;
    x
}

/// Spread the lower 10 bits of `v` so that there are two zero bits between each
#[inline]
fn spread_bits_3(v: u32) -> u64 {
    let mut x = (v & 0x3ff) as u64;
    x = (x | (x << 16)) & 0x0300_00ff;
    x = (x | (x << 8)) & 0x0300_f00f;
    x = (x | (x << 4)) & 0x030c_30c3;
    x = (x | (x << 2)) & 0x0924_9249;
    x
}

/// Morton (Z-order) code of an integer texel coordinate
///
/// ### Params
///
/// * `coords` - Texel coordinates, 2 or 3 entries. Axis 0 occupies the least
///   significant bit of every interleaved group, matching the child order
///   used by the hierarchies (bit `d` of a child index selects the upper half
///   along axis `d`).
///
/// ### Returns
///
/// The interleaved code
#[inline]
pub fn morton_encode(coords: &[u32]) -> u64 {
    match coords.len() {
        2 => spread_bits_2(coords[0]) | (spread_bits_2(coords[1]) << 1),
        3 => {
            spread_bits_3(coords[0]) | (spread_bits_3(coords[1]) << 1) | (spread_bits_3(coords[2]) << 2)
        }
        _ => unreachable!("only 2 and 3 dimensional codes are supported"),
    }
}

/// Inverse of [`morton_encode`]
#[inline]
pub fn morton_decode(code: u64, n_dims: usize) -> [u32; 3] {
    let mut out = [0u32; 3];
    let mut bit = 0;
    let mut c = code;
    while c != 0 {
        let d = bit % n_dims;
        let level = bit / n_dims;
        if c & 1 == 1 {
            out[d] |= 1 << level;
        }
        c >>= 1;
        bit += 1;
    }
    out
}
