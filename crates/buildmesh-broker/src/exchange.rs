//! Request routing and round-robin provider selection.
//!
//! The exchange is the broker's single logical routing core. Endpoints feed
//! it decoded messages; it keeps the routing table and relays each message to
//! the endpoint owning the destination connection.
//!
//! All table reads and writes happen under one mutex. No operation holds the
//! mutex across a network write: `dispatch_*` on an endpoint only posts the
//! message to the destination connection's send queue and reports failure
//! synchronously.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use buildmesh_proto::job::code;
use buildmesh_proto::message::{Reply, Request};
use tracing::{debug, info, warn};

use crate::error::{BrokerError, Result};

/// The emit side of a transport endpoint, as seen by the exchange.
///
/// Each method locates the destination connection inside the endpoint and
/// posts one message on it, failing with `UnknownReceiver` when no connection
/// carries that identity. The exchange borrows endpoints; it never owns them.
pub trait Dispatch: Send + Sync {
    /// Stable id distinguishing endpoint instances for mass-unregister.
    fn endpoint_id(&self) -> u64;

    fn dispatch_request(&self, receiver: &str, sender: &str, request: Request)
        -> buildmesh_proto::Result<()>;
    fn dispatch_interrupt(
        &self,
        receiver: &str,
        sender: &str,
        request_id: u16,
    ) -> buildmesh_proto::Result<()>;
    fn dispatch_progress(&self, receiver: &str, request_id: u16) -> buildmesh_proto::Result<()>;
    fn dispatch_stream_frame(
        &self,
        receiver: &str,
        tag: u16,
        body: Vec<u8>,
    ) -> buildmesh_proto::Result<()>;
    fn dispatch_reply(&self, receiver: &str, reply: Reply) -> buildmesh_proto::Result<()>;
    fn dispatch_ping(&self, receiver: &str) -> buildmesh_proto::Result<()>;
}

/// Routing operations an endpoint invokes on the broker core.
pub trait Exchange: Send + Sync {
    /// Installs `app` as a provider of `method`. Idempotent per (app, method):
    /// a duplicate registration fails with `AlreadyRegistered` and has no
    /// side effects.
    fn register_method(&self, app: &str, endpoint: Arc<dyn Dispatch>, method: &str) -> Result<()>;

    fn unregister_method(&self, app: &str, method: &str);

    /// Cascade-unregisters every method `app` provides and drops its entry.
    fn unregister_app(&self, app: &str);

    /// Unregisters every app attached to the endpoint. Called on endpoint
    /// shutdown.
    fn unregister_endpoint(&self, endpoint_id: u64);

    fn handle_request(&self, sender: &str, request: Request, src: Arc<dyn Dispatch>);
    fn handle_interrupt(&self, sender: &str, request_id: u16);
    fn handle_progress(&self, receiver: &str, request_id: u16);
    fn handle_stream_frame(&self, receiver: &str, tag: u16, body: Vec<u8>);
    fn handle_reply(&self, receiver: &str, reply: Reply);

    /// Liveness hook: called by endpoints for every message received from
    /// `app`, including PONG. The plain exchange ignores it.
    fn note_activity(&self, app: &str) {
        let _ = app;
    }
}

struct AppRecord {
    endpoint: Arc<dyn Dispatch>,
    methods: HashSet<String>,
    /// request id -> name of the app processing that outbound request.
    outbound: HashMap<u16, String>,
}

struct ProvidersRecord {
    ring: Vec<String>,
    cursor: usize,
}

impl ProvidersRecord {
    fn next_provider(&mut self) -> &str {
        self.cursor = (self.cursor + 1) % self.ring.len();
        &self.ring[self.cursor]
    }
}

#[derive(Default)]
struct Tables {
    apps: HashMap<String, AppRecord>,
    providers: HashMap<String, ProvidersRecord>,
    apps_by_endpoint: HashMap<u64, HashSet<String>>,
}

impl Tables {
    /// Ensures an app record exists; apps enter the table on first message.
    fn register_app(&mut self, app: &str, endpoint: &Arc<dyn Dispatch>) {
        if self.apps.contains_key(app) {
            return;
        }
        info!(app, "application connected");
        self.apps.insert(
            app.to_string(),
            AppRecord {
                endpoint: endpoint.clone(),
                methods: HashSet::new(),
                outbound: HashMap::new(),
            },
        );
        self.apps_by_endpoint
            .entry(endpoint.endpoint_id())
            .or_default()
            .insert(app.to_string());
    }

    fn unregister_method(&mut self, app: &str, method: &str) {
        let Some(record) = self.apps.get_mut(app) else {
            warn!(app, method, "unregister_method: app not found");
            return;
        };
        record.methods.remove(method);

        if let Some(providers) = self.providers.get_mut(method) {
            providers.ring.retain(|name| name != app);
            if providers.ring.is_empty() {
                self.providers.remove(method);
            }
        }
    }

    fn unregister_app(&mut self, app: &str) {
        let Some(record) = self.apps.get(app) else {
            warn!(app, "unregister_app: app not found");
            return;
        };
        let endpoint_id = record.endpoint.endpoint_id();
        let methods: Vec<String> = record.methods.iter().cloned().collect();
        for method in methods {
            self.unregister_method(app, &method);
        }
        self.apps.remove(app);
        if let Some(apps) = self.apps_by_endpoint.get_mut(&endpoint_id) {
            apps.remove(app);
        }
        info!(app, "application disconnected");
    }
}

/// The round-robin routing exchange.
pub struct RoundRobin {
    tables: Mutex<Tables>,
}

impl RoundRobin {
    pub fn new() -> Self {
        Self {
            tables: Mutex::new(Tables::default()),
        }
    }

    /// Number of currently registered providers for a method (for tests and
    /// introspection).
    pub fn provider_count(&self, method: &str) -> usize {
        let tables = self.tables.lock().unwrap();
        tables.providers.get(method).map_or(0, |p| p.ring.len())
    }

    /// Names of currently known applications.
    pub fn apps(&self) -> Vec<String> {
        let tables = self.tables.lock().unwrap();
        tables.apps.keys().cloned().collect()
    }

    fn reject(src: &dyn Dispatch, sender: &str, request_id: u16, return_code: u8, reason: &str) {
        let reply = Reply {
            request_id,
            return_code,
            return_value: reason.as_bytes().to_vec(),
        };
        if let Err(e) = src.dispatch_reply(sender, reply) {
            warn!(sender, error = %e, "failed to reject request");
        }
    }
}

impl Default for RoundRobin {
    fn default() -> Self {
        Self::new()
    }
}

impl Exchange for RoundRobin {
    fn register_method(&self, app: &str, endpoint: Arc<dyn Dispatch>, method: &str) -> Result<()> {
        let mut tables = self.tables.lock().unwrap();
        tables.register_app(app, &endpoint);

        let record = tables.apps.get_mut(app).unwrap();
        if !record.methods.insert(method.to_string()) {
            warn!(app, method, "method already registered");
            return Err(BrokerError::AlreadyRegistered {
                app: app.to_string(),
                method: method.to_string(),
            });
        }

        match tables.providers.get_mut(method) {
            Some(providers) => providers.ring.push(app.to_string()),
            None => {
                tables.providers.insert(
                    method.to_string(),
                    ProvidersRecord {
                        ring: vec![app.to_string()],
                        cursor: 0,
                    },
                );
            }
        }

        debug!(app, method, "method registered");
        Ok(())
    }

    fn unregister_method(&self, app: &str, method: &str) {
        let mut tables = self.tables.lock().unwrap();
        tables.unregister_method(app, method);
    }

    fn unregister_app(&self, app: &str) {
        let mut tables = self.tables.lock().unwrap();
        tables.unregister_app(app);
    }

    fn unregister_endpoint(&self, endpoint_id: u64) {
        let mut tables = self.tables.lock().unwrap();
        let Some(apps) = tables.apps_by_endpoint.remove(&endpoint_id) else {
            return;
        };
        for app in apps {
            tables.unregister_app(&app);
        }
    }

    fn handle_request(&self, sender: &str, request: Request, src: Arc<dyn Dispatch>) {
        let mut tables = self.tables.lock().unwrap();
        tables.register_app(sender, &src);

        let Some(providers) = tables.providers.get_mut(&request.method) else {
            debug!(sender, method = %request.method, "no provider for method");
            Self::reject(&*src, sender, request.id, code::NO_PROVIDER, "No method available");
            return;
        };

        let provider = providers.next_provider().to_string();
        let request_id = request.id;

        // Remember who is processing this request so interrupts and the reply
        // can be relayed. A duplicate id from the same sender is a protocol
        // violation; keep the original mapping.
        let sender_record = tables.apps.get_mut(sender).unwrap();
        if sender_record.outbound.contains_key(&request_id) {
            warn!(sender, request_id, "request id already in flight");
            return;
        }
        sender_record.outbound.insert(request_id, provider.clone());

        let endpoint = tables.apps.get(&provider).unwrap().endpoint.clone();
        if let Err(e) = endpoint.dispatch_request(&provider, sender, request) {
            tables
                .apps
                .get_mut(sender)
                .unwrap()
                .outbound
                .remove(&request_id);
            Self::reject(
                &*src,
                sender,
                request_id,
                code::DISPATCH_FAILED,
                &format!("Failed to dispatch request: {}", e),
            );
        }
    }

    fn handle_interrupt(&self, sender: &str, request_id: u16) {
        let tables = self.tables.lock().unwrap();
        let Some(receiver) = tables
            .apps
            .get(sender)
            .and_then(|app| app.outbound.get(&request_id))
        else {
            // A replay from a side that already disconnected; drop silently.
            return;
        };
        let receiver = receiver.clone();
        if let Some(app) = tables.apps.get(&receiver) {
            if let Err(e) = app.endpoint.dispatch_interrupt(&receiver, sender, request_id) {
                warn!(receiver = %receiver, error = %e, "failed to relay interrupt");
            }
        }
    }

    fn handle_progress(&self, receiver: &str, request_id: u16) {
        let tables = self.tables.lock().unwrap();
        if let Some(app) = tables.apps.get(receiver) {
            if let Err(e) = app.endpoint.dispatch_progress(receiver, request_id) {
                warn!(receiver, error = %e, "failed to relay progress");
            }
        }
    }

    fn handle_stream_frame(&self, receiver: &str, tag: u16, body: Vec<u8>) {
        let tables = self.tables.lock().unwrap();
        if let Some(app) = tables.apps.get(receiver) {
            if let Err(e) = app.endpoint.dispatch_stream_frame(receiver, tag, body) {
                warn!(receiver, error = %e, "failed to relay stream frame");
            }
        }
    }

    fn handle_reply(&self, receiver: &str, reply: Reply) {
        let mut tables = self.tables.lock().unwrap();
        let Some(app) = tables.apps.get_mut(receiver) else {
            return;
        };
        // The reply resolves the request and drops the relay mapping. A reply
        // with no mapping is a replay for an id already resolved; drop it so
        // the reply stays the last message a requester sees for that id.
        if app.outbound.remove(&reply.request_id).is_none() {
            debug!(receiver, request_id = reply.request_id, "reply for unmapped request");
            return;
        }
        if let Err(e) = app.endpoint.dispatch_reply(receiver, reply) {
            warn!(receiver, error = %e, "failed to relay reply");
        }
    }
}
