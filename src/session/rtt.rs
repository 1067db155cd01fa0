use std::time::Duration;

/// Number of round-trip samples the estimator keeps per worker path.
const SAMPLE_WINDOW: usize = 64;

/// Per-path retransmission timing: a rolling window of round-trip samples,
///  reduced to `mean + 4 * std_dev` and clamped into `[min_rto, max_rto]`.
///  Every acknowledged chunk reports one sample to the worker that sent it,
///  so each path adapts to its own latency independently.
pub struct RttTracker {
    samples: SampleWindow,
    cached_sum: f64,
    cached_square_sum: f64,
    min_rto: Duration,
    max_rto: Duration,
}

impl RttTracker {
    pub fn new(initial_rtt: Duration, min_rto: Duration, max_rto: Duration) -> RttTracker {
        let initial = initial_rtt.as_secs_f64();
        let mut samples = SampleWindow::new();
        assert!(samples.add(initial).is_none());

        RttTracker {
            samples,
            cached_sum: initial,
            cached_square_sum: initial * initial,
            min_rto,
            max_rto,
        }
    }

    pub fn add_sample(&mut self, rtt: Duration) {
        let value = rtt.as_secs_f64();
        if let Some(evicted) = self.samples.add(value) {
            self.cached_sum -= evicted;
            self.cached_square_sum -= evicted * evicted;
        }

        self.cached_sum += value;
        self.cached_square_sum += value * value;
    }

    fn mean(&self) -> f64 {
        self.cached_sum / self.samples.len() as f64
    }

    fn std_dev(&self) -> f64 {
        if self.samples.len() < 2 {
            // pragmatic value that serves the purpose of standard deviation in this context
            return 0.0;
        }

        let mean = self.mean();
        let diff_of_squares = self.cached_square_sum - mean * mean * self.samples.len() as f64;

        (diff_of_squares.max(0.0) / (self.samples.len() - 1) as f64).sqrt()
    }

    #[cfg(test)]
    pub fn sample_count(&self) -> usize {
        self.samples.len()
    }

    /// The age beyond which an unacknowledged chunk sent on this path is
    ///  scheduled for retransmission.
    pub fn rto(&self) -> Duration {
        let raw = Duration::from_secs_f64(self.mean() + 4.0 * self.std_dev());
        raw.clamp(self.min_rto, self.max_rto)
    }
}

enum SampleWindow {
    Growing(Vec<f64>),
    Ring {
        buf: Vec<f64>,
        next: usize,
    },
}

impl SampleWindow {
    fn new() -> SampleWindow {
        SampleWindow::Growing(vec![])
    }

    fn len(&self) -> usize {
        match self {
            SampleWindow::Growing(buf) => buf.len(),
            SampleWindow::Ring { buf, .. } => buf.len(),
        }
    }

    /// adds a new sample, returning the sample that was evicted in its place (if any)
    #[must_use]
    fn add(&mut self, value: f64) -> Option<f64> {
        match self {
            SampleWindow::Growing(buf) => {
                buf.push(value);
                if buf.len() == SAMPLE_WINDOW {
                    let buf = std::mem::take(buf);
                    *self = SampleWindow::Ring { buf, next: 0 };
                }
                None
            }
            SampleWindow::Ring { buf, next } => {
                let evicted = buf[*next];
                buf[*next] = value;
                *next = (*next + 1) % SAMPLE_WINDOW;
                Some(evicted)
            }
        }
    }
}
