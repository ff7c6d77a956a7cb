use crate::support::Cid;
use crate::timeout::TimeoutHandle;
use serde_json::Value;

/// Application-level events emitted by the multiplexer.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    /// A complete document arrived on a connection.
    Packet(Cid, Value),
    IncomingConnection(Cid),
    OutgoingConnection(Cid),
    ConnectionClosed(Cid),
    Listening(Cid),
    FdManaged(Cid),
    FdUnmanaged(Cid),
    ConnectionError(Cid, String),
    /// The framing parser flagged the stream as garbage; the in-buffer was
    /// flushed and the connection stays open.
    ProtocolError(Cid, String),
    Timeout(Value),
    KeyboardInterrupt,
}

/// Diagnostic events mirroring the raw I/O activity. Only useful for
/// debugging; everything of application interest is an [`Event`].
#[derive(Debug, Clone, PartialEq)]
pub enum Trace {
    Listening { cid: Cid, addr: String },
    WillConnect { addr: String },
    Connecting { cid: Cid, addr: String },
    Connected { cid: Cid, peer: String },
    NewConnection { cid: Cid, peer: String },
    Read { cid: Cid, bytes: usize },
    Write { cid: Cid, bytes: usize },
    WakeUp { reason: String },
    WakeUpCleared,
    Ready { cid: Cid, readiness: String },
    Loop,
    Disconnecting { cid: Cid },
    ConnectionClosed { cid: Cid },
    Error { cid: Cid, code: i32, name: &'static str, message: String },
    TimeoutAdded { handle: TimeoutHandle, seconds: f64 },
    TimeoutCanceled { handle: TimeoutHandle },
    Timeout { handle: TimeoutHandle },
    Hold { cid: Cid },
    Unhold { cid: Cid },
    FdAdded { cid: Cid },
    FdRemoved { cid: Cid },
    MainLoopStarted,
    MainLoopStopped,
    Exception { context: String },
}
