//! Traffic tracker: request-rate driven instance invocation.
//!
//! Counts discovery requests per service type. Once per window the current
//! count is compared with the previous window's; when traffic has grown by
//! at least the invoke ratio the invoke callback is called for that type.
//! Scale-up only: shrinking traffic is left to the inactivity reaper.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Mutex;
use std::time::Duration;

use tracing::{debug, info, warn};

/// Callback type for invoking one more instance of a service type.
pub type InvokeCallback = Box<dyn Fn(&str) -> BoxFuture + Send + Sync>;

pub type BoxFuture = std::pin::Pin<
    Box<dyn std::future::Future<Output = anyhow::Result<()>> + Send>,
>;

/// Request counts for one service type.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TrafficCounter {
    pub current: u64,
    pub previous: u64,
}

impl TrafficCounter {
    /// Growth of this window over the last one. An idle previous window
    /// counts as one request.
    pub fn growth(&self) -> f64 {
        self.current as f64 / self.previous.max(1) as f64
    }

    /// Close the window.
    fn roll(&mut self) {
        self.previous = self.current;
        self.current = 0;
    }
}

pub struct TrafficTracker {
    counters: Mutex<HashMap<String, TrafficCounter>>,
    invoke_ratio: f64,
    invoke_fn: Option<InvokeCallback>,
}

impl TrafficTracker {
    pub fn new(invoke_ratio: f64) -> Self {
        Self {
            counters: Mutex::new(HashMap::new()),
            invoke_ratio,
            invoke_fn: None,
        }
    }

    /// Set the callback used to invoke new instances.
    pub fn with_invoke_fn<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(String) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let callback: InvokeCallback =
            Box::new(move |service_type: &str| Box::pin(f(service_type.to_string())) as BoxFuture);
        self.invoke_fn = Some(callback);
        self
    }

    pub fn invoke_ratio(&self) -> f64 {
        self.invoke_ratio
    }

    /// Count one request for `service_type`, creating its counter.
    pub fn record_request(&self, service_type: &str) {
        let Ok(mut counters) = self.counters.lock() else {
            warn!("traffic counters poisoned");
            return;
        };
        match counters.get_mut(service_type) {
            Some(counter) => counter.current += 1,
            None => {
                counters.insert(
                    service_type.to_string(),
                    TrafficCounter {
                        current: 1,
                        previous: 0,
                    },
                );
            }
        }
    }

    pub fn counter(&self, service_type: &str) -> Option<TrafficCounter> {
        self.counters.lock().ok()?.get(service_type).copied()
    }

    /// Close the window for every counter and return the types whose
    /// growth reached the invoke ratio.
    pub fn roll(&self) -> Vec<String> {
        let Ok(mut counters) = self.counters.lock() else {
            warn!("traffic counters poisoned");
            return Vec::new();
        };
        let mut due = Vec::new();
        for (service_type, counter) in counters.iter_mut() {
            if counter.growth() >= self.invoke_ratio {
                debug!(
                    service = %service_type,
                    current = counter.current,
                    previous = counter.previous,
                    "traffic growth reached invoke ratio"
                );
                due.push(service_type.clone());
            }
            counter.roll();
        }
        due.sort();
        due
    }

    /// One window: roll the counters, then invoke outside the lock.
    pub async fn tick(&self) -> Vec<String> {
        let due = self.roll();
        if let Some(ref invoke_fn) = self.invoke_fn {
            for service_type in &due {
                if let Err(e) = invoke_fn(service_type).await {
                    warn!(service = %service_type, error = %e, "instance invocation failed");
                }
            }
        }
        due
    }

    /// Run the tick loop.
    pub async fn run(&self, window: Duration, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        info!(window_ms = window.as_millis() as u64, "traffic tracker started");

        let mut ticker = tokio::time::interval(window);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.tick().await;
                }
                _ = shutdown.changed() => {
                    info!("traffic tracker shutting down");
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counting_tracker(ratio: f64) -> (TrafficTracker, Arc<Mutex<Vec<String>>>) {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let seen = calls.clone();
        let tracker = TrafficTracker::new(ratio).with_invoke_fn(move |service| {
            let seen = seen.clone();
            async move {
                seen.lock().unwrap().push(service);
                anyhow::Ok(())
            }
        });
        (tracker, calls)
    }

    fn record(tracker: &TrafficTracker, service: &str, n: usize) {
        for _ in 0..n {
            tracker.record_request(service);
        }
    }

    #[test]
    fn record_creates_counter() {
        let tracker = TrafficTracker::new(1.2);
        assert!(tracker.counter("echo").is_none());
        record(&tracker, "echo", 3);
        assert_eq!(
            tracker.counter("echo"),
            Some(TrafficCounter {
                current: 3,
                previous: 0
            })
        );
    }

    #[test]
    fn growth_treats_idle_window_as_one() {
        let idle = TrafficCounter {
            current: 1,
            previous: 0,
        };
        assert_eq!(idle.growth(), 1.0);
        let doubled = TrafficCounter {
            current: 10,
            previous: 5,
        };
        assert_eq!(doubled.growth(), 2.0);
    }

    #[test]
    fn roll_moves_current_to_previous() {
        let tracker = TrafficTracker::new(1.2);
        record(&tracker, "echo", 4);
        tracker.roll();
        assert_eq!(
            tracker.counter("echo"),
            Some(TrafficCounter {
                current: 0,
                previous: 4
            })
        );
    }

    #[tokio::test]
    async fn fires_once_when_ratio_reached() {
        let (tracker, calls) = counting_tracker(1.2);

        // Establish previous = 5.
        record(&tracker, "echo", 5);
        tracker.tick().await;
        calls.lock().unwrap().clear();

        // 6 / 5 = 1.2 reaches the ratio exactly.
        record(&tracker, "echo", 6);
        let due = tracker.tick().await;
        assert_eq!(due, vec!["echo".to_string()]);
        assert_eq!(*calls.lock().unwrap(), vec!["echo".to_string()]);
    }

    #[tokio::test]
    async fn below_ratio_does_not_fire() {
        let (tracker, calls) = counting_tracker(1.2);
        record(&tracker, "echo", 5);
        tracker.tick().await;
        calls.lock().unwrap().clear();

        record(&tracker, "echo", 5);
        assert!(tracker.tick().await.is_empty());
        assert!(calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn single_request_after_idle_does_not_fire() {
        let (tracker, calls) = counting_tracker(1.2);
        record(&tracker, "echo", 1);
        assert!(tracker.tick().await.is_empty());
        assert!(calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn each_type_is_judged_separately() {
        let (tracker, calls) = counting_tracker(1.2);
        record(&tracker, "echo", 4);
        record(&tracker, "reverse", 1);
        let due = tracker.tick().await;
        assert_eq!(due, vec!["echo".to_string()]);
        assert_eq!(calls.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn failed_invocation_is_logged_not_fatal() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let counter = attempts.clone();
        let tracker = TrafficTracker::new(1.2).with_invoke_fn(move |_service| {
            counter.fetch_add(1, Ordering::SeqCst);
            async { Err::<(), _>(anyhow::anyhow!("no agent")) }
        });
        record(&tracker, "echo", 3);
        record(&tracker, "reverse", 3);
        assert_eq!(tracker.tick().await.len(), 2);
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn run_loop_ticks_until_shutdown() {
        let (tracker, calls) = counting_tracker(1.2);
        let tracker = Arc::new(tracker);
        record(&tracker, "echo", 10);

        let (tx, rx) = tokio::sync::watch::channel(false);
        let runner = tracker.clone();
        let handle = tokio::spawn(async move { runner.run(Duration::from_millis(20), rx).await });

        tokio::time::sleep(Duration::from_millis(100)).await;
        tx.send(true).unwrap();
        handle.await.unwrap();

        assert_eq!(*calls.lock().unwrap(), vec!["echo".to_string()]);
        assert_eq!(tracker.counter("echo").unwrap().current, 0);
    }
}
