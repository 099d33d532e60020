use std::{cmp::Ordering, fmt, num::Wrapping};

/// Wrapping 32-bit sequence number compared in serial-number arithmetic.
#[derive(PartialEq, Eq, Clone, Copy, Hash, Default)]
pub struct Seq {
    n: u32,
}

impl Seq {
    #[must_use]
    pub const fn from_u32(n: u32) -> Self {
        Seq { n }
    }

    #[must_use]
    pub const fn to_u32(self) -> u32 {
        self.n
    }

    #[must_use]
    pub fn add_u32(self, n: u32) -> Seq {
        let s = Wrapping(self.n) + Wrapping(n);
        Seq { n: s.0 }
    }

    pub fn increment(&mut self) {
        *self = self.add_u32(1);
    }

    /// Advances and returns the previous value, never handing out `0`.
    ///
    /// Zero is reserved on the wire for packets not bound to a message.
    pub fn next_nonzero(&mut self) -> Seq {
        if self.n == 0 {
            self.increment();
        }
        let current = *self;
        self.increment();
        current
    }
}

impl fmt::Debug for Seq {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Seq({})", self.n)
    }
}

impl PartialOrd for Seq {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Seq {
    fn cmp(&self, other: &Self) -> Ordering {
        match self.n.cmp(&other.n) {
            Ordering::Less => {
                let diff = other.n - self.n;
                if diff <= u32::MAX / 2 {
                    Ordering::Less
                } else {
                    Ordering::Greater
                }
            }
            Ordering::Equal => Ordering::Equal,
            Ordering::Greater => {
                let diff = self.n - other.n;
                if diff <= u32::MAX / 2 {
                    Ordering::Greater
                } else {
                    Ordering::Less
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::Seq;

    #[test]
    fn cmp_wraparound() {
        let a = Seq::from_u32(u32::MAX);
        let b = Seq::from_u32(u32::MIN);
        assert!(a < b);
    }

    #[test]
    fn cmp_far() {
        let a = Seq::from_u32(0);
        let b = Seq::from_u32(i32::MAX as u32);
        let c = Seq::from_u32(i32::MAX as u32 + 1);
        assert!(a < b);
        assert!(c < a);
    }

    #[test]
    fn add_wraparound() {
        let a = Seq::from_u32(u32::MAX);
        assert_eq!(a.add_u32(2).to_u32(), 1);
    }

    #[test]
    fn next_nonzero_skips_zero() {
        let mut s = Seq::from_u32(u32::MAX);
        assert_eq!(s.next_nonzero().to_u32(), u32::MAX);
        assert_eq!(s.next_nonzero().to_u32(), 1);
        assert_eq!(s.next_nonzero().to_u32(), 2);
    }
}
