//! Division by a runtime-fixed modulus without the divide unit.
//!
//! `Divisor` precomputes a reciprocal `(fac, tip, sft)` for a modulus
//! `n` so that `m / n` and `m % n` become a double-width multiply plus
//! shifts. The bucket index of every probe is `code % total_entry`, so
//! this runs on the hottest path of both engines.
//!
//! For every `m` in the word's range the results equal the native
//! `m / n` and `m % n`; the tests sweep random inputs and the boundary
//! values for each width.

/// Precomputed reciprocal for one modulus of word type `W`.
#[derive(Debug, Clone, Copy, Default)]
pub struct Divisor<W> {
    val: W,
    fac: W,
    tip: W,
    sft: u32,
}

macro_rules! impl_divisor {
    ($word:ty, $double:ty) => {
        impl Divisor<$word> {
            pub fn new(n: $word) -> Self {
                let mut d = Divisor { val: n, fac: 0, tip: 0, sft: 0 };
                if n == 0 {
                    return d;
                }
                d.sft = <$word>::BITS - 1;
                let mut m: $word = 1 << d.sft;
                while m > n {
                    m >>= 1;
                    d.sft -= 1;
                }
                d.fac = <$word>::MAX;
                d.tip = <$word>::MAX;
                if m == n {
                    // n is a power of two; the saturated factor reduces
                    // the multiply to a plain shift.
                    return d;
                }
                d.fac = (((m as $double) << <$word>::BITS) / n as $double) as $word;
                let r = d.fac.wrapping_mul(n).wrapping_add(n);
                if r <= m {
                    d.fac += 1;
                    d.tip = 0;
                } else {
                    d.tip = d.fac;
                }
                d
            }

            #[inline(always)]
            pub fn value(&self) -> $word {
                self.val
            }

            #[inline(always)]
            pub fn div(&self, m: $word) -> $word {
                let wide = (self.fac as $double) * (m as $double) + self.tip as $double;
                (wide >> (<$word>::BITS + self.sft)) as $word
            }

            #[inline(always)]
            pub fn rem(&self, m: $word) -> $word {
                m - self.val * self.div(m)
            }
        }
    };
}

impl_divisor!(u8, u16);
impl_divisor!(u16, u32);
impl_divisor!(u32, u64);
impl_divisor!(u64, u128);

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    macro_rules! check_divisor {
        ($name:ident, $word:ty) => {
            #[test]
            fn $name() {
                let mut rng = StdRng::seed_from_u64(0x05715AA7);
                let moduli: &[$word] = &[
                    <$word>::MAX,
                    <$word>::MAX / 2 + 1,
                    <$word>::MAX / 2,
                    17, 13, 11, 9, 7, 5, 3, 2, 1,
                ];
                for &n in moduli {
                    let d = Divisor::<$word>::new(n);
                    assert_eq!(d.value(), n);
                    let mut check = |m: $word| {
                        assert_eq!(d.div(m), m / n, "{m} / {n}");
                        assert_eq!(d.rem(m), m % n, "{m} % {n}");
                    };
                    check(0);
                    check(1);
                    check(<$word>::MAX);
                    for _ in 0..1000 {
                        check(rng.gen());
                    }
                }
            }
        };
    }

    check_divisor!(div_u8, u8);
    check_divisor!(div_u16, u16);
    check_divisor!(div_u32, u32);
    check_divisor!(div_u64, u64);

    #[test]
    fn zero_modulus_is_inert() {
        let d = Divisor::<u32>::new(0);
        assert_eq!(d.value(), 0);
    }
}
