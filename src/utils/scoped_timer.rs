use tokio::time::Instant;
use tracing::trace;

/// Emits the elapsed time of a storage call when dropped
pub(crate) struct ScopedTimer {
    start: Instant,
    name: &'static str,
}

impl ScopedTimer {
    pub(crate) fn new(name: &'static str) -> Self {
        Self {
            start: Instant::now(),
            name,
        }
    }
}

impl Drop for ScopedTimer {
    fn drop(&mut self) {
        let elapsed = self.start.elapsed();
        crate::metrics::STORAGE_OP_DURATION
            .with_label_values(&[self.name])
            .observe(elapsed.as_secs_f64() * 1000.0);
        trace!(target: "timing", "[TIMING] {} took {} ms", self.name, elapsed.as_millis());
    }
}
