//! Message controller collaboration interface
//!
//! A [`MessageController`] is the extension point through which application
//! request/response/message semantics are layered on top of the transport.
//! Controllers are registered per [`MessageKind`]; lifecycle events
//! (connect/disconnect/shutdown) go to every registered controller, data and
//! data-error events go to the controller owning the message kind.
//!
//! All callbacks fire synchronously on the thread calling `update` (or, for
//! shutdown, the thread calling `shutdown`), never on the receive thread,
//! and never while a driver lock is held — controllers may call back into
//! the driver. Events observed on the receive thread are queued and drained
//! by the next `update` call.

use crate::stats::StatsInner;
use parking_lot::RwLock;
use snp_protocol::{CompletionFn, MessageKind, SessionId, TransmitId};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

/// An authenticated, decrypted application message.
pub struct MessageData {
    pub session_id: SessionId,
    pub kind: MessageKind,
    pub uid: u32,
    pub peer: SocketAddr,
    pub payload: Vec<u8>,
}

/// Why a well-formed, non-duplicate message packet was not delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageDataError {
    InvalidHeaderHmac,
    InvalidSignature,
    InvalidDataHmac,
    /// Declared payload missing or unreadable
    DataRetrieval,
    Decryption,
}

/// Context for an [`MessageController::on_message_data_error`] callback.
#[derive(Debug, Clone, Copy)]
pub struct MessageDataErrorArgs {
    pub session_id: SessionId,
    pub kind: MessageKind,
    pub uid: u32,
    pub peer: SocketAddr,
    pub error: MessageDataError,
}

/// Pluggable application-side message handler.
///
/// Authentication failures indicate either an attack or version skew, so
/// [`Self::on_message_data_error`] is surfaced rather than silently counted.
pub trait MessageController: Send + Sync {
    /// Called once when the controller is registered with a driver.
    fn on_initialize(&self) {}
    /// Called once when the owning driver shuts down.
    fn on_shutdown(&self) {}
    /// A connection reached its ready state.
    fn on_connect(&self, _session_id: SessionId) {}
    /// A connection was disconnected or failed. Fired exactly once per
    /// connection.
    fn on_disconnect(&self, _session_id: SessionId) {}
    /// An authenticated, decrypted message arrived.
    fn on_message_data(&self, data: MessageData);
    /// An otherwise well-formed message packet failed authentication or
    /// decryption.
    fn on_message_data_error(&self, _args: MessageDataErrorArgs) {}
}

/// Packet filter hook: return `false` to drop the datagram before any
/// processing. Used by tests to inject loss.
pub type PacketFilter = Box<dyn Fn(&[u8], SocketAddr) -> bool + Send + Sync>;

/// Deferred work produced while a driver lock is held, fired after release.
pub(crate) enum Notification {
    Connect(SessionId),
    Disconnect(SessionId),
    Data(MessageData),
    DataError(MessageDataErrorArgs),
    Completion(CompletionFn, TransmitId),
}

/// Controllers registered with a driver, keyed by message kind.
#[derive(Default)]
pub(crate) struct ControllerSet {
    by_kind: RwLock<HashMap<MessageKind, Arc<dyn MessageController>>>,
}

impl ControllerSet {
    pub fn set(&self, kind: MessageKind, controller: Arc<dyn MessageController>) {
        controller.on_initialize();
        self.by_kind.write().insert(kind, controller);
    }

    fn for_kind(&self, kind: MessageKind) -> Option<Arc<dyn MessageController>> {
        self.by_kind.read().get(&kind).cloned()
    }

    /// Every registered controller, deduplicated (one controller may own
    /// several kinds).
    fn all(&self) -> Vec<Arc<dyn MessageController>> {
        let map = self.by_kind.read();
        let mut out: Vec<Arc<dyn MessageController>> = Vec::with_capacity(map.len());
        for controller in map.values() {
            if !out.iter().any(|c| Arc::ptr_eq(c, controller)) {
                out.push(controller.clone());
            }
        }
        out
    }

    pub fn notify_shutdown(&self) {
        for controller in self.all() {
            controller.on_shutdown();
        }
    }

    /// Fire a batch of deferred notifications. Must be called with no driver
    /// lock held.
    pub fn dispatch(&self, notifications: Vec<Notification>, stats: &StatsInner) {
        for notification in notifications {
            match notification {
                Notification::Connect(session_id) => {
                    for controller in self.all() {
                        controller.on_connect(session_id);
                    }
                }
                Notification::Disconnect(session_id) => {
                    for controller in self.all() {
                        controller.on_disconnect(session_id);
                    }
                }
                Notification::Data(data) => match self.for_kind(data.kind) {
                    Some(controller) => controller.on_message_data(data),
                    None => {
                        tracing::debug!(kind = ?data.kind, "no controller for message kind");
                    }
                },
                Notification::DataError(args) => {
                    stats.drop_packet();
                    if let Some(controller) = self.for_kind(args.kind) {
                        controller.on_message_data_error(args);
                    }
                }
                Notification::Completion(callback, id) => callback(id),
            }
        }
    }
}
