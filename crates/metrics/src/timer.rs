use std::time::{
    Duration,
    Instant,
};

use prometheus::HistogramVec;

use crate::{
    STATUS_ERROR,
    STATUS_SUCCESS,
    reporting::{
        fq_name,
        observe_with_labels,
    },
};

/// Observes the time from construction to drop into a histogram labelled
/// with `status`. A timer dropped without [`StatusTimer::finish`] or
/// [`StatusTimer::finish_with`] records `error`, so early returns through
/// `?` are counted as failures.
pub struct StatusTimer {
    histogram: &'static HistogramVec,
    started: Instant,
    status: &'static str,
}

impl StatusTimer {
    pub fn new(histogram: &'static HistogramVec) -> Self {
        Self {
            histogram,
            started: Instant::now(),
            status: STATUS_ERROR,
        }
    }

    pub fn finish(self) -> Duration {
        self.finish_with(STATUS_SUCCESS)
    }

    pub fn finish_with(mut self, status: &'static str) -> Duration {
        self.status = status;
        self.started.elapsed()
    }
}

impl Drop for StatusTimer {
    fn drop(&mut self) {
        if std::thread::panicking() {
            return;
        }
        let elapsed = self.started.elapsed();
        tracing::debug!(
            "{} took {elapsed:?} ({})",
            fq_name(self.histogram),
            self.status
        );
        observe_with_labels(self.histogram, elapsed.as_secs_f64(), &[self.status]);
    }
}
