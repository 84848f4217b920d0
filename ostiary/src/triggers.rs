//! Fan-in of environment signals into recheck requests
//!
//! Focus, visibility and connectivity changes, along with a coarse periodic
//! tick, are all treated as equivalent hints that the session should be
//! rechecked. They are funnelled through one queue and processed by a
//! single task, so rechecks never overlap.

use std::{
    fmt,
    sync::{Mutex, MutexGuard, PoisonError, Weak},
};

use async_trait::async_trait;
use tokio::{
    sync::{mpsc, oneshot},
    task::JoinHandle,
    time::{Duration, Instant, MissedTickBehavior},
};

use crate::config::TriggerConfig;

/// An environment hint that the session should be rechecked
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Signal {
    /// The application regained focus
    FocusGained,
    /// The document became visible
    BecameVisible,
    /// The network came back online
    NetworkOnline,
    /// The periodic timer fired
    PeriodicTick,
}

impl Signal {
    /// The signals delivered by environment listeners
    pub const LISTENED: [Signal; 3] = [
        Signal::FocusGained,
        Signal::BecameVisible,
        Signal::NetworkOnline,
    ];

    /// A short name for diagnostics
    pub const fn as_str(self) -> &'static str {
        match self {
            Signal::FocusGained => "focus",
            Signal::BecameVisible => "visibility",
            Signal::NetworkOnline => "online",
            Signal::PeriodicTick => "tick",
        }
    }
}

impl fmt::Display for Signal {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The receiver of recheck requests
#[async_trait]
pub trait RecheckTarget: Send + Sync {
    /// Rechecks the session in response to `signal`
    async fn recheck(&self, signal: Signal);
}

struct Running {
    signals: mpsc::UnboundedSender<Signal>,
    _halt: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

/// Funnels environment signals into deduplicated rechecks
pub struct TriggerMultiplexer {
    config: TriggerConfig,
    running: Mutex<Option<Running>>,
}

impl TriggerMultiplexer {
    /// Constructs a stopped multiplexer
    pub fn new(config: TriggerConfig) -> Self {
        Self {
            config,
            running: Mutex::new(None),
        }
    }

    fn running(&self) -> MutexGuard<'_, Option<Running>> {
        self.running.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Registers the signal listeners and starts the periodic timer
    ///
    /// Only a weak reference to `target` is held; once it is dropped the
    /// multiplexer halts. Calling `start` while running has no effect.
    pub fn start(&self, target: Weak<dyn RecheckTarget>) {
        let mut running = self.running();
        if running.as_ref().map_or(false, |r| !r.task.is_finished()) {
            tracing::trace!("trigger multiplexer already running");
            return;
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let (halt, halted) = oneshot::channel();
        let task = tokio::spawn(multiplex(target, rx, halted, self.config.clone()));
        *running = Some(Running {
            signals: tx,
            _halt: halt,
            task,
        });

        tracing::debug!(
            tick_interval = self.config.tick_interval.0,
            "trigger multiplexer started"
        );
    }

    /// Deregisters the listeners and cancels the periodic timer
    ///
    /// A recheck already under way runs to completion, but no further
    /// rechecks start. Safe to call any number of times.
    pub fn stop(&self) {
        if self.running().take().is_some() {
            tracing::debug!("trigger multiplexer stopped");
        }
    }

    /// Delivers an environment signal
    ///
    /// Returns `false` if the multiplexer is not running.
    pub fn notify(&self, signal: Signal) -> bool {
        match &*self.running() {
            Some(running) => running.signals.send(signal).is_ok(),
            None => false,
        }
    }

    /// The number of registered listeners, the periodic timer included
    pub fn active_listeners(&self) -> usize {
        match &*self.running() {
            Some(running) if !running.task.is_finished() => Signal::LISTENED.len() + 1,
            _ => 0,
        }
    }
}

impl Drop for TriggerMultiplexer {
    fn drop(&mut self) {
        self.stop();
    }
}

impl fmt::Debug for TriggerMultiplexer {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("TriggerMultiplexer")
            .field("config", &self.config)
            .field("active_listeners", &self.active_listeners())
            .finish()
    }
}

async fn multiplex(
    target: Weak<dyn RecheckTarget>,
    mut signals: mpsc::UnboundedReceiver<Signal>,
    mut halted: oneshot::Receiver<()>,
    config: TriggerConfig,
) {
    let period = Duration::from(config.tick_interval).max(Duration::from_millis(1));
    let dedup_window = Duration::from(config.dedup_window);

    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let mut last_recheck: Option<Instant> = None;

    loop {
        let signal = tokio::select! {
            biased;
            _ = &mut halted => break,
            signal = signals.recv() => match signal {
                Some(signal) => signal,
                None => break,
            },
            _ = ticker.tick() => Signal::PeriodicTick,
        };

        let mut coalesced = 0usize;
        while signals.try_recv().is_ok() {
            coalesced += 1;
        }

        if let Some(last) = last_recheck {
            if last.elapsed() < dedup_window {
                tracing::trace!(%signal, coalesced, "recheck ran recently, skipping");
                continue;
            }
        }

        let target = match target.upgrade() {
            Some(target) => target,
            None => {
                tracing::debug!("recheck target dropped, halting trigger multiplexer");
                break;
            }
        };

        tracing::trace!(%signal, coalesced, "rechecking session");
        last_recheck = Some(Instant::now());
        target.recheck(signal).await;
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use ostiary_clock::DurationMillis;

    use super::*;

    #[derive(Debug, Default)]
    struct Recorder {
        seen: Mutex<Vec<Signal>>,
        delay: Duration,
    }

    impl Recorder {
        fn seen(&self) -> Vec<Signal> {
            self.seen.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl RecheckTarget for Recorder {
        async fn recheck(&self, signal: Signal) {
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            self.seen.lock().unwrap().push(signal);
        }
    }

    fn started() -> (Arc<Recorder>, TriggerMultiplexer) {
        let recorder = Arc::new(Recorder::default());
        let multiplexer = TriggerMultiplexer::new(TriggerConfig::default());
        let target: Arc<dyn RecheckTarget> = recorder.clone();
        multiplexer.start(Arc::downgrade(&target));
        (recorder, multiplexer)
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn burst_of_signals_yields_one_recheck() {
        let (recorder, multiplexer) = started();

        assert!(multiplexer.notify(Signal::FocusGained));
        assert!(multiplexer.notify(Signal::BecameVisible));
        settle().await;

        assert_eq!(recorder.seen(), vec![Signal::FocusGained]);
    }

    #[tokio::test(start_paused = true)]
    async fn signals_within_dedup_window_are_skipped() {
        let (recorder, multiplexer) = started();

        multiplexer.notify(Signal::FocusGained);
        settle().await;
        multiplexer.notify(Signal::NetworkOnline);
        settle().await;
        assert_eq!(recorder.seen().len(), 1);

        tokio::time::sleep(Duration::from_secs(1)).await;
        multiplexer.notify(Signal::NetworkOnline);
        settle().await;
        assert_eq!(
            recorder.seen(),
            vec![Signal::FocusGained, Signal::NetworkOnline]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn periodic_tick_fires_on_interval() {
        let (recorder, _multiplexer) = started();

        tokio::time::sleep(Duration::from_secs(29)).await;
        assert!(recorder.seen().is_empty());

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(recorder.seen(), vec![Signal::PeriodicTick]);

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(recorder.seen().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn start_is_idempotent() {
        let (recorder, multiplexer) = started();
        let target: Arc<dyn RecheckTarget> = recorder.clone();
        multiplexer.start(Arc::downgrade(&target));

        assert_eq!(multiplexer.active_listeners(), 4);

        tokio::time::sleep(Duration::from_secs(31)).await;
        assert_eq!(recorder.seen(), vec![Signal::PeriodicTick]);
    }

    #[tokio::test(start_paused = true)]
    async fn halts_when_target_is_dropped() {
        let multiplexer = TriggerMultiplexer::new(TriggerConfig::new(
            DurationMillis::from_secs(5),
            DurationMillis::from_secs(1),
        ));
        {
            let target: Arc<dyn RecheckTarget> = Arc::new(Recorder::default());
            multiplexer.start(Arc::downgrade(&target));
        }

        tokio::time::sleep(Duration::from_secs(6)).await;
        assert_eq!(multiplexer.active_listeners(), 0);
    }

    mod when_stopped {
        use super::*;

        #[tokio::test(start_paused = true)]
        async fn stop_twice_leaves_nothing_registered() {
            let (recorder, multiplexer) = started();

            multiplexer.stop();
            multiplexer.stop();

            assert_eq!(multiplexer.active_listeners(), 0);
            assert!(!multiplexer.notify(Signal::FocusGained));

            tokio::time::sleep(Duration::from_secs(61)).await;
            assert!(recorder.seen().is_empty());
        }

        #[tokio::test(start_paused = true)]
        async fn recheck_under_way_runs_to_completion() {
            let recorder = Arc::new(Recorder {
                delay: Duration::from_secs(1),
                ..Recorder::default()
            });
            let multiplexer = TriggerMultiplexer::new(TriggerConfig::default());
            let target: Arc<dyn RecheckTarget> = recorder.clone();
            multiplexer.start(Arc::downgrade(&target));

            multiplexer.notify(Signal::FocusGained);
            settle().await;
            multiplexer.stop();
            assert_eq!(multiplexer.active_listeners(), 0);

            tokio::time::sleep(Duration::from_secs(61)).await;
            assert_eq!(recorder.seen(), vec![Signal::FocusGained]);
            assert!(!multiplexer.notify(Signal::NetworkOnline));
        }

        #[tokio::test(start_paused = true)]
        async fn can_be_restarted() {
            let (recorder, multiplexer) = started();
            multiplexer.stop();

            let target: Arc<dyn RecheckTarget> = recorder.clone();
            multiplexer.start(Arc::downgrade(&target));
            assert_eq!(multiplexer.active_listeners(), 4);

            multiplexer.notify(Signal::BecameVisible);
            settle().await;
            assert_eq!(recorder.seen(), vec![Signal::BecameVisible]);
        }
    }
}
