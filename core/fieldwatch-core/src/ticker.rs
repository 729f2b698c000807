//! Periodic compliance ticks on a background thread.

use chrono::Utc;
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::engine::FieldwatchEngine;

type StopSignal = Arc<(Mutex<bool>, Condvar)>;

pub struct ComplianceTicker {
    stop: StopSignal,
    handle: Option<JoinHandle<()>>,
}

impl ComplianceTicker {
    /// Ticks the engine every `compliance.tick_interval_secs`.
    pub fn start(engine: Arc<FieldwatchEngine>) -> Self {
        let interval = engine.config().compliance.tick_interval();
        tracing::info!(interval_secs = interval.as_secs(), "Compliance ticker started");
        Self::spawn(interval, move || {
            let tick = engine.tick(Utc::now());
            if !tick.escalated.is_empty() {
                tracing::warn!(escalated = tick.escalated.len(), "Escalated unacknowledged alerts");
            }
        })
    }

    /// Runs `on_tick` every `interval` until stopped. The first run happens
    /// after one interval.
    pub fn spawn<F>(interval: Duration, mut on_tick: F) -> Self
    where
        F: FnMut() + Send + 'static,
    {
        let stop: StopSignal = Arc::new((Mutex::new(false), Condvar::new()));
        let signal = Arc::clone(&stop);
        let handle = thread::spawn(move || {
            let (lock, cvar) = &*signal;
            loop {
                let stopped = lock.lock().unwrap_or_else(|p| p.into_inner());
                let (stopped, _) = cvar
                    .wait_timeout_while(stopped, interval, |stopped| !*stopped)
                    .unwrap_or_else(|p| p.into_inner());
                if *stopped {
                    break;
                }
                drop(stopped);
                on_tick();
            }
        });
        Self {
            stop,
            handle: Some(handle),
        }
    }

    pub fn stop(mut self) {
        self.halt();
    }

    fn halt(&mut self) {
        let (lock, cvar) = &*self.stop;
        *lock.lock().unwrap_or_else(|p| p.into_inner()) = true;
        cvar.notify_all();
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                tracing::error!("Compliance ticker thread panicked");
            }
        }
    }
}

impl Drop for ComplianceTicker {
    fn drop(&mut self) {
        self.halt();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Instant;

    #[test]
    fn ticks_until_stopped() {
        let count = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&count);
        let ticker = ComplianceTicker::spawn(Duration::from_millis(10), move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        let deadline = Instant::now() + Duration::from_secs(5);
        while count.load(Ordering::SeqCst) < 2 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        ticker.stop();

        let after_stop = count.load(Ordering::SeqCst);
        assert!(after_stop >= 2);
        thread::sleep(Duration::from_millis(30));
        assert_eq!(count.load(Ordering::SeqCst), after_stop);
    }

    #[test]
    fn stop_interrupts_long_interval() {
        let ticker = ComplianceTicker::spawn(Duration::from_secs(3600), || {});
        let started = Instant::now();
        ticker.stop();
        assert!(started.elapsed() < Duration::from_secs(5));
    }
}
