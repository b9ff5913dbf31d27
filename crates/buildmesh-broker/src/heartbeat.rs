//! Application liveness on top of the routing exchange.
//!
//! The heartbeat layer wraps any [`Exchange`] and stamps every application
//! with the time of its last received message. A periodic sweep sends PING to
//! every known application and unregisters the ones whose last-seen timestamp
//! is older than the configured timeout. The sweep pauses itself while no
//! applications are registered and resumes on the next registration.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use buildmesh_proto::message::{Reply, Request};

use crate::error::Result;
use crate::exchange::{Dispatch, Exchange};

#[derive(Debug, Clone, Copy)]
pub struct HeartbeatConfig {
    /// Sweep and ping period.
    pub period: Duration,
    /// Silence after which an application is treated as disconnected.
    pub timeout: Duration,
}

impl HeartbeatConfig {
    /// Config with the default timeout of three periods.
    pub fn with_period(period: Duration) -> Self {
        Self {
            period,
            timeout: 3 * period,
        }
    }
}

struct Liveness {
    last_seen: Instant,
    endpoint: Arc<dyn Dispatch>,
}

/// An [`Exchange`] decorator adding PING-based liveness.
pub struct Heartbeat {
    inner: Arc<dyn Exchange>,
    config: HeartbeatConfig,
    tracked: Mutex<HashMap<String, Liveness>>,
    resume: Notify,
    shutdown: CancellationToken,
}

impl Heartbeat {
    /// Wraps `inner` and spawns the sweep task. Must be called inside a tokio
    /// runtime.
    pub fn new(inner: Arc<dyn Exchange>, config: HeartbeatConfig) -> Arc<Self> {
        let heartbeat = Arc::new(Self {
            inner,
            config,
            tracked: Mutex::new(HashMap::new()),
            resume: Notify::new(),
            shutdown: CancellationToken::new(),
        });

        let this = heartbeat.clone();
        tokio::spawn(async move {
            loop {
                let idle = this.tracked.lock().unwrap().is_empty();
                tokio::select! {
                    _ = this.shutdown.cancelled() => return,
                    _ = this.resume.notified(), if idle => continue,
                    _ = tokio::time::sleep(this.config.period), if !idle => this.sweep(),
                }
            }
        });

        heartbeat
    }

    /// Stops the sweep task.
    pub fn stop(&self) {
        self.shutdown.cancel();
    }

    fn track(&self, app: &str, endpoint: &Arc<dyn Dispatch>) {
        let mut tracked = self.tracked.lock().unwrap();
        let was_empty = tracked.is_empty();
        tracked
            .entry(app.to_string())
            .or_insert_with(|| Liveness {
                last_seen: Instant::now(),
                endpoint: endpoint.clone(),
            })
            .last_seen = Instant::now();
        if was_empty {
            self.resume.notify_one();
        }
    }

    fn sweep(&self) {
        let now = Instant::now();
        let mut expired = Vec::new();
        {
            let mut tracked = self.tracked.lock().unwrap();
            tracked.retain(|app, liveness| {
                if now.duration_since(liveness.last_seen) > self.config.timeout {
                    warn!(%app, "heartbeat timed out");
                    expired.push(app.clone());
                    false
                } else {
                    true
                }
            });
            for (app, liveness) in tracked.iter() {
                debug!(%app, "sending ping");
                if let Err(e) = liveness.endpoint.dispatch_ping(app) {
                    warn!(%app, error = %e, "failed to send ping");
                }
            }
        }
        // The routing table lock is taken only after ours is released.
        for app in expired {
            self.inner.unregister_app(&app);
        }
    }
}

impl Exchange for Heartbeat {
    fn register_method(&self, app: &str, endpoint: Arc<dyn Dispatch>, method: &str) -> Result<()> {
        self.track(app, &endpoint);
        self.inner.register_method(app, endpoint, method)
    }

    fn unregister_method(&self, app: &str, method: &str) {
        self.inner.unregister_method(app, method);
    }

    fn unregister_app(&self, app: &str) {
        self.tracked.lock().unwrap().remove(app);
        self.inner.unregister_app(app);
    }

    fn unregister_endpoint(&self, endpoint_id: u64) {
        self.tracked
            .lock()
            .unwrap()
            .retain(|_, liveness| liveness.endpoint.endpoint_id() != endpoint_id);
        self.inner.unregister_endpoint(endpoint_id);
    }

    fn handle_request(&self, sender: &str, request: Request, src: Arc<dyn Dispatch>) {
        self.track(sender, &src);
        self.inner.handle_request(sender, request, src);
    }

    fn handle_interrupt(&self, sender: &str, request_id: u16) {
        self.inner.handle_interrupt(sender, request_id);
    }

    fn handle_progress(&self, receiver: &str, request_id: u16) {
        self.inner.handle_progress(receiver, request_id);
    }

    fn handle_stream_frame(&self, receiver: &str, tag: u16, body: Vec<u8>) {
        self.inner.handle_stream_frame(receiver, tag, body);
    }

    fn handle_reply(&self, receiver: &str, reply: Reply) {
        self.inner.handle_reply(receiver, reply);
    }

    fn note_activity(&self, app: &str) {
        if let Some(liveness) = self.tracked.lock().unwrap().get_mut(app) {
            liveness.last_seen = Instant::now();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::RoundRobin;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct PingCounter {
        pings: AtomicUsize,
    }

    impl PingCounter {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                pings: AtomicUsize::new(0),
            })
        }
    }

    impl Dispatch for PingCounter {
        fn endpoint_id(&self) -> u64 {
            1
        }

        fn dispatch_request(
            &self,
            _: &str,
            _: &str,
            _: Request,
        ) -> buildmesh_proto::Result<()> {
            Ok(())
        }

        fn dispatch_interrupt(&self, _: &str, _: &str, _: u16) -> buildmesh_proto::Result<()> {
            Ok(())
        }

        fn dispatch_progress(&self, _: &str, _: u16) -> buildmesh_proto::Result<()> {
            Ok(())
        }

        fn dispatch_stream_frame(&self, _: &str, _: u16, _: Vec<u8>) -> buildmesh_proto::Result<()> {
            Ok(())
        }

        fn dispatch_reply(&self, _: &str, _: Reply) -> buildmesh_proto::Result<()> {
            Ok(())
        }

        fn dispatch_ping(&self, _: &str) -> buildmesh_proto::Result<()> {
            self.pings.fetch_add(1, Ordering::Relaxed);
            Ok(())
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn silent_app_is_unregistered_within_the_timeout() {
        let inner = Arc::new(RoundRobin::new());
        let heartbeat = Heartbeat::new(
            inner.clone(),
            HeartbeatConfig::with_period(Duration::from_millis(30)),
        );
        let endpoint = PingCounter::new();

        heartbeat
            .register_method("w1", endpoint.clone(), "mesh.any.bash")
            .unwrap();
        assert_eq!(inner.provider_count("mesh.any.bash"), 1);

        // Stay silent past 3 periods; the sweep must drop the app.
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(inner.provider_count("mesh.any.bash"), 0);
        assert!(endpoint.pings.load(Ordering::Relaxed) >= 1);

        heartbeat.stop();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn activity_keeps_the_app_alive() {
        let inner = Arc::new(RoundRobin::new());
        let heartbeat = Heartbeat::new(
            inner.clone(),
            HeartbeatConfig::with_period(Duration::from_millis(30)),
        );
        let endpoint = PingCounter::new();

        heartbeat
            .register_method("w1", endpoint.clone(), "mesh.any.bash")
            .unwrap();

        for _ in 0..10 {
            tokio::time::sleep(Duration::from_millis(30)).await;
            heartbeat.note_activity("w1");
        }
        assert_eq!(inner.provider_count("mesh.any.bash"), 1);

        heartbeat.stop();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn sweep_resumes_after_going_idle() {
        let inner = Arc::new(RoundRobin::new());
        let heartbeat = Heartbeat::new(
            inner.clone(),
            HeartbeatConfig::with_period(Duration::from_millis(20)),
        );
        let endpoint = PingCounter::new();

        heartbeat
            .register_method("w1", endpoint.clone(), "mesh.any.bash")
            .unwrap();
        heartbeat.unregister_app("w1");
        assert!(inner.apps().is_empty());

        // Re-register after the sweep went idle; it must pick the app up again.
        tokio::time::sleep(Duration::from_millis(60)).await;
        heartbeat
            .register_method("w2", endpoint.clone(), "mesh.any.bash")
            .unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(inner.provider_count("mesh.any.bash"), 0);

        heartbeat.stop();
    }
}
