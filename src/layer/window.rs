use tracing::error;

pub const DEFAULT_WINDOW_MAX: u32 = 65_536;

/// Bytes of reliable traffic in flight towards one peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReliableWindow {
    in_flight: u32,
    max: u32,
}

#[derive(Debug, PartialEq, Eq)]
pub struct WindowFull {
    pub in_flight: u32,
    pub requested: u32,
    pub max: u32,
}

impl ReliableWindow {
    #[inline]
    fn check_rep(&self) {
        assert!(self.in_flight <= self.max);
    }

    #[must_use]
    pub fn new(max: u32) -> Self {
        let this = ReliableWindow { in_flight: 0, max };
        this.check_rep();
        this
    }

    #[must_use]
    pub fn can_reserve(&self, len: u32) -> bool {
        self.in_flight as u64 + len as u64 <= self.max as u64
    }

    pub fn try_reserve(&mut self, len: u32) -> Result<(), WindowFull> {
        if !self.can_reserve(len) {
            return Err(WindowFull {
                in_flight: self.in_flight,
                requested: len,
                max: self.max,
            });
        }
        self.in_flight += len;
        self.check_rep();
        Ok(())
    }

    /// Releasing more than is in flight is a bookkeeping bug: fatal in debug
    /// builds, clamped to zero in release builds.
    pub fn release(&mut self, len: u32) {
        if len > self.in_flight {
            error!(
                in_flight = self.in_flight,
                len, "releasing more window than in flight"
            );
            debug_assert!(len <= self.in_flight, "window underflow");
            self.in_flight = 0;
        } else {
            self.in_flight -= len;
        }
        self.check_rep();
    }

    pub fn reset(&mut self) {
        self.in_flight = 0;
    }

    #[must_use]
    #[inline]
    pub fn in_flight(&self) -> u32 {
        self.in_flight
    }

    #[must_use]
    #[inline]
    pub fn max(&self) -> u32 {
        self.max
    }
}

#[cfg(test)]
mod tests {
    use super::{ReliableWindow, WindowFull};

    #[test]
    fn test_reserve_release() {
        let mut wnd = ReliableWindow::new(100);
        wnd.try_reserve(60).unwrap();
        assert_eq!(
            wnd.try_reserve(41),
            Err(WindowFull {
                in_flight: 60,
                requested: 41,
                max: 100
            })
        );
        wnd.try_reserve(40).unwrap();
        assert_eq!(wnd.in_flight(), 100);
        wnd.release(100);
        assert_eq!(wnd.in_flight(), 0);
    }

    #[test]
    #[cfg_attr(debug_assertions, should_panic(expected = "window underflow"))]
    fn test_underflow() {
        let mut wnd = ReliableWindow::new(100);
        wnd.try_reserve(10).unwrap();
        wnd.release(11);
        assert_eq!(wnd.in_flight(), 0);
    }
}
