//! Gather operators and deterministic reduction.
//!
//! A gather combines one value per node into a single result that every node
//! receives. Values travel as raw `u64` bits; the `Gatherable` trait maps each
//! supported type to and from those bits and defines the operators on it.
//!
//! # Determinism
//!
//! Contributions are folded in node-index order (node 0 first), never in
//! arrival order. Floating-point sums therefore give bit-identical results on
//! every run with the same inputs.

use crate::error::{PipeError, Result};

/// Reduction operators for `gather`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GatherOp {
    Sum,
    Product,
    Min,
    Max,
    And,
    Or,
    Xor,
}

impl GatherOp {
    /// Bitwise operators are only defined on integers.
    pub fn is_bitwise(self) -> bool {
        matches!(self, GatherOp::And | GatherOp::Or | GatherOp::Xor)
    }
}

/// A value that can take part in a gather.
pub trait Gatherable: Copy + Send + 'static {
    /// Type name used in error messages.
    const TYPE_NAME: &'static str;

    fn to_bits(self) -> u64;

    fn from_bits(bits: u64) -> Self;

    /// Whether `op` is defined for this type.
    fn supports(op: GatherOp) -> bool;

    /// Combine two values. Only called with supported operators.
    fn combine(self, other: Self, op: GatherOp) -> Self;
}

macro_rules! gatherable_int {
    ($($t:ty => $bits:ty),* $(,)?) => {$(
        impl Gatherable for $t {
            const TYPE_NAME: &'static str = stringify!($t);

            fn to_bits(self) -> u64 {
                self as $bits as u64
            }

            fn from_bits(bits: u64) -> Self {
                bits as $bits as $t
            }

            fn supports(_op: GatherOp) -> bool {
                true
            }

            fn combine(self, other: Self, op: GatherOp) -> Self {
                match op {
                    GatherOp::Sum => self.wrapping_add(other),
                    GatherOp::Product => self.wrapping_mul(other),
                    GatherOp::Min => self.min(other),
                    GatherOp::Max => self.max(other),
                    GatherOp::And => self & other,
                    GatherOp::Or => self | other,
                    GatherOp::Xor => self ^ other,
                }
            }
        }
    )*};
}

gatherable_int!(
    u8 => u8, u16 => u16, u32 => u32, u64 => u64,
    i8 => u8, i16 => u16, i32 => u32, i64 => u64,
);

impl Gatherable for bool {
    const TYPE_NAME: &'static str = "bool";

    fn to_bits(self) -> u64 {
        self as u64
    }

    fn from_bits(bits: u64) -> Self {
        bits != 0
    }

    fn supports(op: GatherOp) -> bool {
        !matches!(op, GatherOp::Sum | GatherOp::Product)
    }

    fn combine(self, other: Self, op: GatherOp) -> Self {
        match op {
            GatherOp::Min | GatherOp::And => self & other,
            GatherOp::Max | GatherOp::Or => self | other,
            GatherOp::Xor => self ^ other,
            GatherOp::Sum | GatherOp::Product => self,
        }
    }
}

macro_rules! gatherable_float {
    ($($t:ty => $bits:ty),* $(,)?) => {$(
        impl Gatherable for $t {
            const TYPE_NAME: &'static str = stringify!($t);

            fn to_bits(self) -> u64 {
                <$t>::to_bits(self) as u64
            }

            fn from_bits(bits: u64) -> Self {
                <$t>::from_bits(bits as $bits)
            }

            fn supports(op: GatherOp) -> bool {
                !op.is_bitwise()
            }

            fn combine(self, other: Self, op: GatherOp) -> Self {
                match op {
                    GatherOp::Sum => self + other,
                    GatherOp::Product => self * other,
                    GatherOp::Min => self.min(other),
                    GatherOp::Max => self.max(other),
                    GatherOp::And | GatherOp::Or | GatherOp::Xor => self,
                }
            }
        }
    )*};
}

gatherable_float!(f32 => u32, f64 => u64);

/// Fail early if `op` cannot be applied to `T`.
pub fn check_supported<T: Gatherable>(op: GatherOp) -> Result<()> {
    if T::supports(op) {
        Ok(())
    } else {
        Err(PipeError::UnsupportedGatherOp {
            op,
            type_name: T::TYPE_NAME,
        }
        .into())
    }
}

/// Reduce contributions given in node-index order.
///
/// Returns `None` for an empty slice.
pub fn reduce_bits<T: Gatherable>(contributions: &[u64], op: GatherOp) -> Option<u64> {
    let (first, rest) = contributions.split_first()?;
    let folded = rest
        .iter()
        .fold(T::from_bits(*first), |acc, &bits| acc.combine(T::from_bits(bits), op));
    Some(folded.to_bits())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;

    fn reduce<T: Gatherable>(values: &[T], op: GatherOp) -> T {
        let bits: Vec<u64> = values.iter().map(|v| v.to_bits()).collect();
        T::from_bits(reduce_bits::<T>(&bits, op).unwrap())
    }

    #[test]
    fn test_integer_operators() {
        let values = [5u32, 3, 12, 6];
        assert_eq!(reduce(&values, GatherOp::Sum), 26);
        assert_eq!(reduce(&values, GatherOp::Product), 1080);
        assert_eq!(reduce(&values, GatherOp::Min), 3);
        assert_eq!(reduce(&values, GatherOp::Max), 12);
        assert_eq!(reduce(&values, GatherOp::And), 5 & 3 & 12 & 6);
        assert_eq!(reduce(&values, GatherOp::Or), 5 | 3 | 12 | 6);
        assert_eq!(reduce(&values, GatherOp::Xor), 5 ^ 3 ^ 12 ^ 6);
    }

    #[test]
    fn test_signed_values_survive_bits() {
        let values = [-7i32, 4, -1];
        assert_eq!(reduce(&values, GatherOp::Min), -7);
        assert_eq!(reduce(&values, GatherOp::Sum), -4);
        assert_eq!(i16::from_bits((-3i16).to_bits()), -3);
    }

    #[test]
    fn test_float_sum_in_node_order() {
        let values = [1e16f64, 1.0, -1e16];
        let expected = (1e16f64 + 1.0) + -1e16;
        assert_eq!(reduce(&values, GatherOp::Sum).to_bits(), expected.to_bits());
        assert_eq!(reduce(&[2.5f32, -1.0], GatherOp::Max), 2.5);
    }

    #[test]
    fn test_bitwise_on_float_rejected() {
        assert!(check_supported::<f64>(GatherOp::Sum).is_ok());
        assert!(matches!(
            check_supported::<f64>(GatherOp::Or),
            Err(Error::Pipe(PipeError::UnsupportedGatherOp { .. }))
        ));
        assert!(check_supported::<bool>(GatherOp::Sum).is_err());
    }

    #[test]
    fn test_bool_operators() {
        assert!(!reduce(&[true, false, true], GatherOp::And));
        assert!(reduce(&[false, false, true], GatherOp::Or));
    }

    #[test]
    fn test_single_contribution() {
        assert_eq!(reduce(&[42u64], GatherOp::Sum), 42);
        assert_eq!(reduce_bits::<u64>(&[], GatherOp::Sum), None);
    }
}
