//! Endpoint supervision with restart-on-crash.
//!
//! The supervisor owns a set of endpoint factories. For each factory it runs
//! one supervising task that instantiates the endpoint, serves it, and on
//! crash re-instantiates it -- unless crashes come too fast: three
//! consecutive errors drop the endpoint for good. An endpoint run that lasts
//! longer than the one-second window earns one error back.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::{BrokerError, Result};

/// Sliding window after which a surviving endpoint earns back restart budget.
pub const ERROR_WINDOW: Duration = Duration::from_secs(1);

/// Consecutive errors after which an endpoint is dropped.
pub const MAX_CONSECUTIVE_ERRORS: u32 = 3;

pub type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send>>;

/// A supervised listener endpoint.
///
/// The supervisor guarantees `serve` is called at most once per instance and
/// `close` at most once after it.
pub trait Endpoint: Send + Sync + 'static {
    fn serve(self: Arc<Self>) -> BoxFuture<Result<()>>;
    fn close(&self);
}

pub type EndpointFactory = Box<dyn Fn() -> Result<Arc<dyn Endpoint>> + Send + Sync>;

/// Report emitted when a supervised endpoint crashes or is dropped.
#[derive(Debug)]
pub struct CrashReport {
    pub factory_id: String,
    /// True when the error budget is exhausted and the endpoint will not be
    /// restarted.
    pub dropped: bool,
    pub error: Option<BrokerError>,
}

/// Supervises endpoint instances created from registered factories.
pub struct Supervisor {
    factories: Mutex<HashMap<String, EndpointFactory>>,
    monitor: Mutex<Option<mpsc::UnboundedSender<CrashReport>>>,
    serving: AtomicBool,
    term: CancellationToken,
    done: CancellationToken,
}

impl Supervisor {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            factories: Mutex::new(HashMap::new()),
            monitor: Mutex::new(None),
            serving: AtomicBool::new(false),
            term: CancellationToken::new(),
            done: CancellationToken::new(),
        })
    }

    /// Registers an endpoint factory under `id`.
    ///
    /// # Panics
    ///
    /// Panics when called after [`Supervisor::listen_and_serve`]; the factory
    /// set is fixed once serving starts.
    pub fn register_endpoint_factory(&self, id: impl Into<String>, factory: EndpointFactory) {
        assert!(
            !self.serving.load(Ordering::SeqCst),
            "register_endpoint_factory called after listen_and_serve"
        );
        let id = id.into();
        info!(factory = %id, "registered endpoint factory");
        self.factories.lock().unwrap().insert(id, factory);
    }

    /// Routes crash reports to `monitor_tx`. The channel closes when every
    /// supervising task has exited.
    ///
    /// # Panics
    ///
    /// Panics when called after [`Supervisor::listen_and_serve`].
    pub fn monitor(&self, monitor_tx: mpsc::UnboundedSender<CrashReport>) {
        assert!(
            !self.serving.load(Ordering::SeqCst),
            "monitor called after listen_and_serve"
        );
        *self.monitor.lock().unwrap() = Some(monitor_tx);
    }

    /// Starts one supervising task per registered factory and returns.
    ///
    /// # Panics
    ///
    /// Panics when called twice.
    pub fn listen_and_serve(self: &Arc<Self>) {
        assert!(
            !self.serving.swap(true, Ordering::SeqCst),
            "listen_and_serve called twice"
        );

        let factories: Vec<(String, EndpointFactory)> =
            self.factories.lock().unwrap().drain().collect();
        let monitor = self.monitor.lock().unwrap().take();

        let mut tasks = tokio::task::JoinSet::new();
        for (id, factory) in factories {
            let this = self.clone();
            let monitor = monitor.clone();
            tasks.spawn(async move { this.supervise(id, factory, monitor).await });
        }

        // Closing the last monitor sender clone closes the channel, which is
        // the "all supervising tasks exited" signal.
        let done = self.done.clone();
        tokio::spawn(async move {
            while tasks.join_next().await.is_some() {}
            drop(monitor);
            done.cancel();
        });
    }

    /// Signals every supervising task to close its endpoint and exit.
    pub fn terminate(&self) {
        info!("supervisor terminating");
        self.term.cancel();
    }

    /// Completes when every supervising task has exited.
    pub async fn terminated(&self) {
        self.done.cancelled().await;
    }

    async fn supervise(
        &self,
        id: String,
        factory: EndpointFactory,
        monitor: Option<mpsc::UnboundedSender<CrashReport>>,
    ) {
        let report = |dropped: bool, error: Option<BrokerError>| {
            if let Some(monitor) = &monitor {
                let _ = monitor.send(CrashReport {
                    factory_id: id.clone(),
                    dropped,
                    error,
                });
            }
        };

        let mut error_counter: u32 = 0;
        loop {
            if error_counter == MAX_CONSECUTIVE_ERRORS {
                warn!(factory = %id, "error threshold reached, dropping endpoint");
                report(true, None);
                return;
            }
            if self.term.is_cancelled() {
                return;
            }

            info!(factory = %id, "instantiating endpoint");
            let endpoint = match factory() {
                Ok(endpoint) => endpoint,
                Err(e) => {
                    error!(factory = %id, error = %e, "failed to instantiate endpoint");
                    error_counter += 1;
                    report(false, Some(e));
                    continue;
                }
            };

            // Close the running instance when termination is requested.
            let watcher_return = CancellationToken::new();
            {
                let term = self.term.clone();
                let watcher_return = watcher_return.clone();
                let endpoint = endpoint.clone();
                let id = id.clone();
                tokio::spawn(async move {
                    tokio::select! {
                        _ = term.cancelled() => {
                            info!(factory = %id, "terminating endpoint");
                            endpoint.close();
                        }
                        _ = watcher_return.cancelled() => {}
                    }
                });
            }

            let listen_timestamp = Instant::now();
            debug!(factory = %id, "endpoint entering serve");
            let result = endpoint.clone().serve().await;
            debug!(factory = %id, "endpoint left serve");
            watcher_return.cancel();

            match result {
                Ok(()) => {
                    info!(factory = %id, "endpoint terminated cleanly");
                    return;
                }
                Err(e) => {
                    endpoint.close();
                    error!(factory = %id, error = %e, "endpoint crashed");
                    error_counter += 1;
                    report(false, Some(e));
                }
            }

            // A long-lived run earns back one unit of restart budget.
            if listen_timestamp.elapsed() > ERROR_WINDOW && error_counter > 0 {
                debug!(factory = %id, "decrementing error counter");
                error_counter -= 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    /// Endpoint whose first `crashes` serve calls fail immediately.
    struct FlakyEndpoint {
        closed: CancellationToken,
        fail: bool,
    }

    impl Endpoint for FlakyEndpoint {
        fn serve(self: Arc<Self>) -> BoxFuture<Result<()>> {
            Box::pin(async move {
                if self.fail {
                    return Err(BrokerError::Proto(
                        buildmesh_proto::ProtoError::Connection("bind failed".to_string()),
                    ));
                }
                self.closed.cancelled().await;
                Ok(())
            })
        }

        fn close(&self) {
            self.closed.cancel();
        }
    }

    fn flaky_factory(crashes: u32) -> (EndpointFactory, Arc<AtomicU32>) {
        let instantiations = Arc::new(AtomicU32::new(0));
        let counter = instantiations.clone();
        let factory: EndpointFactory = Box::new(move || {
            let n = counter.fetch_add(1, Ordering::SeqCst);
            Ok(Arc::new(FlakyEndpoint {
                closed: CancellationToken::new(),
                fail: n < crashes,
            }) as Arc<dyn Endpoint>)
        });
        (factory, instantiations)
    }

    #[tokio::test]
    async fn restarts_after_transient_crashes() {
        let supervisor = Supervisor::new();
        let (factory, instantiations) = flaky_factory(2);
        let (tx, mut rx) = mpsc::unbounded_channel();

        supervisor.register_endpoint_factory("rpc", factory);
        supervisor.monitor(tx);
        supervisor.listen_and_serve();

        // Two crash reports, then the endpoint stays up.
        for _ in 0..2 {
            let report = rx.recv().await.unwrap();
            assert!(!report.dropped);
            assert!(report.error.is_some());
        }

        supervisor.terminate();
        supervisor.terminated().await;
        assert_eq!(instantiations.load(Ordering::SeqCst), 3);
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn drops_endpoint_after_error_budget_is_spent() {
        let supervisor = Supervisor::new();
        let (factory, _) = flaky_factory(u32::MAX);
        let (tx, mut rx) = mpsc::unbounded_channel();

        supervisor.register_endpoint_factory("rpc", factory);
        supervisor.monitor(tx);
        supervisor.listen_and_serve();

        let mut reports = Vec::new();
        while let Some(report) = rx.recv().await {
            reports.push(report);
        }
        assert_eq!(reports.len(), MAX_CONSECUTIVE_ERRORS as usize + 1);
        assert!(reports.last().unwrap().dropped);
        supervisor.terminated().await;
    }

    #[tokio::test]
    async fn terminate_closes_running_endpoints() {
        let supervisor = Supervisor::new();
        let (factory, instantiations) = flaky_factory(0);

        supervisor.register_endpoint_factory("rpc", factory);
        supervisor.listen_and_serve();

        // Give the supervising task a beat to instantiate.
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(instantiations.load(Ordering::SeqCst), 1);

        supervisor.terminate();
        supervisor.terminated().await;
    }

    #[tokio::test]
    #[should_panic(expected = "after listen_and_serve")]
    async fn registering_after_serve_panics() {
        let supervisor = Supervisor::new();
        supervisor.listen_and_serve();
        let (factory, _) = flaky_factory(0);
        supervisor.register_endpoint_factory("late", factory);
    }
}
