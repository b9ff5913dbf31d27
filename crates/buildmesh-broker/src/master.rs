//! The master lifecycle value.
//!
//! A [`Master`] wires a routing exchange (optionally wrapped with heartbeat
//! liveness), a TCP endpoint factory and a supervisor into one value with
//! explicit `start`/`terminate`/`wait` operations. There is no process-wide
//! default instance; tests construct isolated masters on port 0.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tracing::error;

use buildmesh_proto::{ProtoError, TokenConfig};

use crate::endpoint::{EndpointConfig, TcpEndpoint};
use crate::error::{BrokerError, Result};
use crate::exchange::{Exchange, RoundRobin};
use crate::heartbeat::{Heartbeat, HeartbeatConfig};
use crate::supervisor::{Endpoint, EndpointFactory, Supervisor};

#[derive(Clone, Debug)]
pub struct MasterConfig {
    /// Listen address, e.g. `0.0.0.0:9300`. Port 0 picks a free port.
    pub addr: String,
    /// Shared bearer token; `None` accepts every connection.
    pub token: Option<String>,
    /// Heartbeat period; `None` or zero disables liveness checking.
    pub heartbeat: Option<Duration>,
}

/// A running buildmesh master.
pub struct Master {
    supervisor: Arc<Supervisor>,
    heartbeat: Option<Arc<Heartbeat>>,
    bound: watch::Receiver<Option<SocketAddr>>,
    last_error: Arc<Mutex<Option<BrokerError>>>,
}

impl Master {
    /// Builds the routing core and starts listening.
    ///
    /// Must be called inside a tokio runtime; the endpoint supervisor and the
    /// crash monitor run as background tasks.
    pub fn start(config: MasterConfig) -> Self {
        let exchange: Arc<dyn Exchange> = Arc::new(RoundRobin::new());
        let (exchange, heartbeat) = match config.heartbeat {
            Some(period) if !period.is_zero() => {
                let heartbeat = Heartbeat::new(exchange, HeartbeatConfig::with_period(period));
                (heartbeat.clone() as Arc<dyn Exchange>, Some(heartbeat))
            }
            _ => (exchange, None),
        };

        let auth = match &config.token {
            Some(token) => TokenConfig::with_token(token),
            None => TokenConfig::disabled(),
        };

        let (bound_tx, bound_rx) = watch::channel(None);
        let endpoint_config = EndpointConfig {
            addr: config.addr.clone(),
            auth,
            heartbeat_period: config.heartbeat.filter(|p| !p.is_zero()),
        };

        let factory: EndpointFactory = Box::new(move || {
            let endpoint = TcpEndpoint::new(endpoint_config.clone(), exchange.clone());

            // Republish the instance's bound address; restarts rebind.
            let mut endpoint_bound = endpoint.bound_addr();
            let bound_tx = bound_tx.clone();
            tokio::spawn(async move {
                if endpoint_bound.wait_for(Option::is_some).await.is_ok() {
                    let addr = *endpoint_bound.borrow();
                    let _ = bound_tx.send(addr);
                }
            });

            Ok(endpoint as Arc<dyn Endpoint>)
        });

        let supervisor = Supervisor::new();
        let (monitor_tx, mut monitor_rx) = mpsc::unbounded_channel();
        supervisor.register_endpoint_factory("tcp_rpc", factory);
        supervisor.monitor(monitor_tx);
        supervisor.listen_and_serve();

        let last_error = Arc::new(Mutex::new(None));
        {
            let last_error = last_error.clone();
            tokio::spawn(async move {
                while let Some(report) = monitor_rx.recv().await {
                    if let Some(e) = report.error {
                        error!(factory = %report.factory_id, error = %e, dropped = report.dropped,
                            "endpoint crash");
                        *last_error.lock().unwrap() = Some(e);
                    }
                }
            });
        }

        Self {
            supervisor,
            heartbeat,
            bound: bound_rx,
            last_error,
        }
    }

    /// The address the master is listening on. Completes once the endpoint
    /// has bound its listener.
    pub async fn local_addr(&self) -> Result<SocketAddr> {
        let mut bound = self.bound.clone();
        let addr = bound
            .wait_for(Option::is_some)
            .await
            .map_err(|_| ProtoError::Terminated)?;
        Ok(addr.unwrap())
    }

    /// Requests shutdown of every endpoint.
    pub fn terminate(&self) {
        if let Some(heartbeat) = &self.heartbeat {
            heartbeat.stop();
        }
        self.supervisor.terminate();
    }

    /// Completes when every endpoint has shut down.
    pub async fn terminated(&self) {
        self.supervisor.terminated().await;
    }

    /// Blocks until the master terminates; returns the last endpoint error
    /// observed, if any.
    pub async fn wait(&self) -> Option<BrokerError> {
        self.terminated().await;
        self.last_error.lock().unwrap().take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn starts_binds_and_terminates() {
        let master = Master::start(MasterConfig {
            addr: "127.0.0.1:0".to_string(),
            token: None,
            heartbeat: None,
        });

        let addr = master.local_addr().await.unwrap();
        assert_ne!(addr.port(), 0);

        master.terminate();
        assert!(master.wait().await.is_none());
    }

    #[tokio::test]
    async fn two_masters_are_isolated() {
        let a = Master::start(MasterConfig {
            addr: "127.0.0.1:0".to_string(),
            token: None,
            heartbeat: None,
        });
        let b = Master::start(MasterConfig {
            addr: "127.0.0.1:0".to_string(),
            token: None,
            heartbeat: None,
        });

        assert_ne!(a.local_addr().await.unwrap(), b.local_addr().await.unwrap());

        a.terminate();
        b.terminate();
        a.terminated().await;
        b.terminated().await;
    }
}
