//! OpCode → handler table and runtime dispatch.
//!
//! Construction is explicit registration: each [`Controller`] registers its
//! handlers with a [`DispatcherBuilder`] from a plain function call, not
//! reflection. Once built, the table is an immutable `HashMap` shared by
//! every connection; the runtime dispatch path pays no reflection cost,
//! only a hash lookup.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use palisade_core::{Authority, CoreError};
use palisade_proto::{Packet, PayloadType};

use crate::connection::Connection;

/// A handler's reply: the OpCode, status code, and payload type to frame the
/// response under, plus its payload. `connection.send` applies compression
/// and AEAD transparently.
#[derive(Debug, Clone)]
pub struct Reply {
    /// OpCode the reply is framed under.
    pub id: u16,
    /// Application-level status code.
    pub code: u16,
    /// Payload type (`Binary` or `String`) the reply is framed under.
    pub kind: PayloadType,
    /// Reply payload.
    pub payload: Bytes,
}

impl Reply {
    /// A reply with status code 0 (success) and `Binary` payload type.
    #[must_use]
    pub fn new(id: u16, payload: impl Into<Bytes>) -> Self {
        Self { id, code: 0, kind: PayloadType::Binary, payload: payload.into() }
    }

    /// A reply carrying an explicit application status code, `Binary`
    /// payload type.
    #[must_use]
    pub fn with_code(id: u16, code: u16, payload: impl Into<Bytes>) -> Self {
        Self { id, code, kind: PayloadType::Binary, payload: payload.into() }
    }

    /// A reply with status code 0 and an explicit payload type.
    #[must_use]
    pub fn with_type(id: u16, kind: PayloadType, payload: impl Into<Bytes>) -> Self {
        Self { id, code: 0, kind, payload: payload.into() }
    }
}

/// Boxed future returned by a compiled handler invocation.
pub type HandlerFuture = Pin<Box<dyn Future<Output = Option<Reply>> + Send>>;

/// A compiled handler: `(connection, packet) -> future<optional reply>`.
///
/// Takes the connection by `Arc` rather than by reference so the boxed
/// future has no borrowed lifetime to track.
pub type HandlerFn = Arc<dyn Fn(Arc<Connection>, Packet) -> HandlerFuture + Send + Sync>;

/// Attribute-driven policy evaluated before a handler runs.
#[derive(Debug, Clone)]
pub struct HandlerPolicy {
    /// Minimum authority the connection must hold.
    pub required_authority: Authority,
    /// Require the connection to be `Authenticated`.
    pub require_encrypted: bool,
    /// Abort the handler if it runs longer than this.
    pub timeout: Option<Duration>,
    /// Charge the per-endpoint bandwidth limiter before invoking.
    pub rate_limited: bool,
}

impl Default for HandlerPolicy {
    fn default() -> Self {
        Self {
            required_authority: Authority::Guest,
            require_encrypted: false,
            timeout: Some(Duration::from_secs(5)),
            rate_limited: false,
        }
    }
}

struct HandlerEntry {
    policy: HandlerPolicy,
    handler: HandlerFn,
}

/// A controller that registers one or more OpCode handlers.
///
/// Both built-in controllers (`handlers::handshake`, `handlers::keepalive`)
/// implement this; application code can define more and register them the
/// same way.
pub trait Controller {
    /// Register this controller's handlers with `builder`.
    ///
    /// # Errors
    ///
    /// `ConfigInvalid` if an OpCode this controller wants is already taken.
    fn register(builder: &mut DispatcherBuilder) -> Result<(), CoreError>;
}

/// Accumulates `(OpCode, policy, handler)` registrations before freezing
/// them into a [`Dispatcher`].
#[derive(Default)]
pub struct DispatcherBuilder {
    entries: HashMap<u16, HandlerEntry>,
}

impl DispatcherBuilder {
    /// Create an empty builder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` under `op_code`.
    ///
    /// # Errors
    ///
    /// `ConfigInvalid` if `op_code` is already registered - duplicate
    /// OpCodes are a construction-time error, never a runtime one.
    pub fn register(&mut self, op_code: u16, policy: HandlerPolicy, handler: HandlerFn) -> Result<(), CoreError> {
        if self.entries.contains_key(&op_code) {
            return Err(CoreError::ConfigInvalid(format!("duplicate opcode {op_code:#06x}")));
        }
        self.entries.insert(op_code, HandlerEntry { policy, handler });
        Ok(())
    }

    /// Register every handler a [`Controller`] type exposes.
    ///
    /// # Errors
    ///
    /// Propagates `C::register`'s `ConfigInvalid` on a duplicate OpCode.
    pub fn register_controller<C: Controller>(&mut self) -> Result<(), CoreError> {
        C::register(self)
    }

    /// Freeze registrations into an immutable [`Dispatcher`].
    #[must_use]
    pub fn build(self) -> Dispatcher {
        Dispatcher { entries: self.entries }
    }
}

/// Immutable OpCode → handler table, safe to share across every connection.
pub struct Dispatcher {
    entries: HashMap<u16, HandlerEntry>,
}

impl Dispatcher {
    /// Look up, policy-check, and invoke the handler for `packet.header.id()`.
    ///
    /// Never panics and never propagates a handler's internal error past
    /// this call - every failure mode is logged and the frame is dropped,
    /// so malformed or disallowed inbound data never crashes the process.
    pub async fn dispatch(&self, connection: &Arc<Connection>, packet: Packet) {
        let op_code = packet.header.id();

        let Some(entry) = self.entries.get(&op_code) else {
            tracing::warn!(opcode = format!("{op_code:#06x}"), "unknown opcode");
            return;
        };

        if !connection.core().permits(entry.policy.required_authority) {
            tracing::warn!(opcode = format!("{op_code:#06x}"), "permission denied");
            return;
        }

        if entry.policy.require_encrypted && !connection.is_authenticated() {
            tracing::warn!(opcode = format!("{op_code:#06x}"), "opcode requires an authenticated connection");
            return;
        }

        if entry.policy.rate_limited && !connection.charge_rate_limit(packet.payload.len()).await {
            tracing::warn!(opcode = format!("{op_code:#06x}"), "rate limited, dropping");
            return;
        }

        let invocation = (entry.handler)(Arc::clone(connection), packet);
        let reply = match entry.policy.timeout {
            Some(timeout) => match tokio::time::timeout(timeout, invocation).await {
                Ok(reply) => reply,
                Err(_) => {
                    tracing::warn!(opcode = format!("{op_code:#06x}"), "handler timed out");
                    None
                },
            },
            None => invocation.await,
        };

        if let Some(reply) = reply {
            connection.send(reply.id, reply.code, reply.kind, reply.payload).await;
        }
    }
}
