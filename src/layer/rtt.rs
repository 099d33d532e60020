use std::time::Duration;

const ALPHA: f64 = 1.0 / 8.0;
const BETA: f64 = 1.0 / 4.0;
const MAX_RTO_MS: u64 = 60_000;
const DEFAULT_RTO_MS: u64 = 3_000; // make it bigger to avoid RTO floods
const MIN_RTO_MS: u64 = 250;
pub const MAX_RTO: Duration = Duration::from_millis(MAX_RTO_MS);
pub const DEFAULT_RTO: Duration = Duration::from_millis(DEFAULT_RTO_MS);
pub const MIN_RTO: Duration = Duration::from_millis(MIN_RTO_MS);

/// Jacobson/Karels round-trip estimator.
#[derive(Debug, Clone, PartialEq)]
pub struct RttEstimator {
    srtt: Option<Duration>,
    rttvar: Duration,
    rto: Duration,
}

impl Default for RttEstimator {
    fn default() -> Self {
        Self::new()
    }
}

impl RttEstimator {
    #[inline]
    fn check_rep(&self) {
        assert!(MIN_RTO <= self.rto && self.rto <= MAX_RTO);
    }

    #[must_use]
    pub fn new() -> Self {
        let this = RttEstimator {
            srtt: None,
            rttvar: Duration::ZERO,
            rto: DEFAULT_RTO,
        };
        this.check_rep();
        this
    }

    pub fn update(&mut self, sample: Duration) {
        match self.srtt {
            Some(srtt) => {
                let srtt_s = srtt.as_secs_f64();
                let sample_s = sample.as_secs_f64();
                let new_srtt = srtt_s + ALPHA * (sample_s - srtt_s);
                let err = (sample_s - new_srtt).abs();
                let rttvar_s = self.rttvar.as_secs_f64();
                let new_rttvar = rttvar_s + BETA * (err - rttvar_s);
                self.srtt = Some(Duration::from_secs_f64(new_srtt.max(0.0)));
                self.rttvar = Duration::from_secs_f64(new_rttvar.max(0.0));
            }
            None => {
                self.srtt = Some(sample);
                self.rttvar = sample / 2;
            }
        }
        let srtt = self.srtt.unwrap_or(sample);
        let rto = srtt + self.rttvar * 4;
        self.rto = rto.clamp(MIN_RTO, MAX_RTO);
        self.check_rep();
    }

    #[must_use]
    #[inline]
    pub fn rto(&self) -> Duration {
        self.rto
    }

    #[must_use]
    #[inline]
    pub fn srtt(&self) -> Option<Duration> {
        self.srtt
    }

    #[must_use]
    #[inline]
    pub fn rttvar(&self) -> Duration {
        self.rttvar
    }
}
