//! Reporting of suspicious client environments
//!
//! Some hosts can detect that the client is being inspected or tampered
//! with, such as an attached debugger or a modified runtime. Those
//! observations are recorded as security events and nothing more. Ending
//! the session stays with the lifecycle controller.

use std::sync::Arc;

use ostiary_clock::{Clock, System};

use crate::events::{SecurityEvent, SecurityEventKind, SecurityEventSink};

/// Records environment anomalies as security events
pub struct AnomalyObserver<C = System> {
    events: Arc<dyn SecurityEventSink>,
    clock: C,
}

impl AnomalyObserver<System> {
    /// Constructs an observer reporting to `events`
    pub fn new(events: Arc<dyn SecurityEventSink>) -> Self {
        Self {
            events,
            clock: System,
        }
    }
}

impl<C> AnomalyObserver<C> {
    /// Sets a custom clock to be used
    ///
    /// Useful for testing purposes
    pub fn with_clock<D>(self, clock: D) -> AnomalyObserver<D> {
        AnomalyObserver {
            events: self.events,
            clock,
        }
    }
}

impl<C: Clock> AnomalyObserver<C> {
    /// Records an anomaly of the given `kind`
    ///
    /// `detail` must not carry credentials or identifying data.
    pub fn report(&self, kind: &str, detail: &str) {
        tracing::debug!(kind, "environment anomaly observed");
        self.events.log(
            SecurityEvent::new(SecurityEventKind::EnvironmentAnomaly, self.clock.now())
                .with("kind", kind)
                .with("detail", detail),
        );
    }
}

impl<C: std::fmt::Debug> std::fmt::Debug for AnomalyObserver<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("AnomalyObserver")
            .field("clock", &self.clock)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use ostiary_clock::{EpochMillis, TestClock};

    use super::*;
    use crate::events::MemorySink;

    #[test]
    fn report_only_emits_an_event() {
        let events = Arc::new(MemorySink::new());
        let observer =
            AnomalyObserver::new(events.clone()).with_clock(TestClock::new(EpochMillis(42)));

        observer.report("devtools_open", "console detached");

        let logged = events.events();
        assert_eq!(logged.len(), 1);
        assert_eq!(logged[0].kind(), SecurityEventKind::EnvironmentAnomaly);
        assert_eq!(logged[0].timestamp(), EpochMillis(42));
        assert_eq!(logged[0].payload()["kind"], "devtools_open");
        assert_eq!(logged[0].payload()["detail"], "console detached");
    }
}
