//! Free-running timeline driven by wall-clock time.

use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::timeline::Timeline;

#[derive(Debug, Default)]
struct StopSignal {
    stopped: Mutex<bool>,
    cv: Condvar,
}

/// Background thread that advances a timeline by one tick per `period`.
///
/// Tick deadlines are computed from the previous deadline rather than from when the thread woke
/// up, so scheduling jitter does not accumulate into drift.
#[derive(Debug)]
pub struct TimelineTicker {
    timeline: Timeline,
    period: Duration,
    ticks: Arc<AtomicU64>,
    stop: Arc<StopSignal>,
    handle: Option<JoinHandle<()>>,
}

impl TimelineTicker {
    pub fn spawn(timeline: Timeline, period: Duration) -> io::Result<Self> {
        let ticks = Arc::new(AtomicU64::new(0));
        let stop = Arc::new(StopSignal::default());

        let handle = {
            let timeline = timeline.clone();
            let ticks = ticks.clone();
            let stop = stop.clone();
            thread::Builder::new()
                .name(format!("{} ticker", timeline.name()))
                .spawn(move || run(timeline, period, ticks, stop))?
        };

        Ok(Self {
            timeline,
            period,
            ticks,
            stop,
            handle: Some(handle),
        })
    }

    pub fn timeline(&self) -> &Timeline {
        &self.timeline
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    /// Ticks applied so far.
    pub fn ticks(&self) -> u64 {
        self.ticks.load(Ordering::Acquire)
    }

    /// Stop ticking and join the thread. Idempotent.
    pub fn stop(&mut self) {
        {
            let mut stopped = self
                .stop
                .stopped
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            *stopped = true;
        }
        self.stop.cv.notify_all();

        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                tracing::warn!(timeline = %self.timeline.name(), "ticker thread panicked");
            }
            tracing::debug!(timeline = %self.timeline.name(), ticks = self.ticks(), "ticker exiting");
        }
    }
}

impl Drop for TimelineTicker {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run(timeline: Timeline, period: Duration, ticks: Arc<AtomicU64>, stop: Arc<StopSignal>) {
    let mut last = Instant::now();
    loop {
        // A period too long to represent never ticks.
        let target = last.checked_add(period);
        {
            let mut stopped = stop.stopped.lock().unwrap_or_else(PoisonError::into_inner);
            loop {
                if *stopped {
                    return;
                }
                let Some(target) = target else {
                    stopped = stop.cv.wait(stopped).unwrap_or_else(PoisonError::into_inner);
                    continue;
                };
                let now = Instant::now();
                if now >= target {
                    break;
                }
                stopped = stop
                    .cv
                    .wait_timeout(stopped, target - now)
                    .unwrap_or_else(PoisonError::into_inner)
                    .0;
            }
        }

        match timeline.advance(1) {
            Ok(current) => {
                ticks.fetch_add(1, Ordering::AcqRel);
                tracing::trace!(timeline = %timeline.name(), current, "tick");
            }
            Err(err) => {
                tracing::debug!(timeline = %timeline.name(), "ticker stopping: {err}");
                return;
            }
        }
        if let Some(target) = target {
            last = target;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ticker_signals_fences_over_time() {
        let timeline = Timeline::new("vsync");
        let fence = timeline.create_fence(3).unwrap();
        let mut ticker = TimelineTicker::spawn(timeline.clone(), Duration::from_millis(1)).unwrap();

        fence.wait(Duration::from_secs(10)).unwrap();
        ticker.stop();
        assert!(ticker.ticks() >= 3);
        assert_eq!(timeline.current(), ticker.ticks());
    }

    #[test]
    fn unrepresentable_period_never_ticks_and_still_stops() {
        let timeline = Timeline::new("idle");
        let mut ticker = TimelineTicker::spawn(timeline.clone(), Duration::MAX).unwrap();
        thread::sleep(Duration::from_millis(10));
        ticker.stop();
        assert_eq!(ticker.ticks(), 0);
        assert_eq!(timeline.current(), 0);
    }

    #[test]
    fn ticker_exits_when_timeline_destroyed() {
        let timeline = Timeline::new("t");
        let mut ticker = TimelineTicker::spawn(timeline.clone(), Duration::from_millis(1)).unwrap();
        timeline.destroy();
        thread::sleep(Duration::from_millis(20));
        let ticks = ticker.ticks();
        ticker.stop();
        assert_eq!(ticker.ticks(), ticks);
    }
}
