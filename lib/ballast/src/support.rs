use serde_json::Value;
use std::fmt;
use std::io;
use std::sync::Arc;

/// Connection identifier. This is the OS file descriptor of the managed
/// endpoint, which keeps the id stable across the handle's whole lifetime.
pub type Cid = i32;

/// Outcome of a framing pass over a connection's in-buffer.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Status {
    /// One or more complete documents were extracted.
    Ok,
    /// The stream is corrupted and the in-buffer must be flushed.
    Garbage,
    /// The stream is well-formed so far but no document has completed.
    Undefined,
}

/// Splits a byte stream into documents and serialises documents back into
/// bytes. The multiplexer holds a default implementation; each connection
/// may carry its own.
pub trait Framing: Send {
    /// Scan the accumulated in-buffer and return the extraction status, the
    /// decoded documents, and how many leading bytes the caller must drop.
    fn decode(&mut self, buf: &[u8]) -> (Status, Vec<Value>, usize);

    /// Serialise one outbound document.
    fn encode(&mut self, doc: &Value) -> Vec<u8>;
}

/// Builds a fresh framing state for a new connection. Listeners keep a
/// factory so accepted children each get their own parser.
pub type FramingFactory = Arc<dyn Fn() -> Box<dyn Framing> + Send + Sync>;

#[derive(Debug)]
pub enum Error {
    /// No managed handle with this id.
    UnknownCid(Cid),
    /// `add_fd` was called with a descriptor that is already managed.
    AlreadyManaged(Cid),
    /// Host name resolution produced no address of the requested family.
    Resolve(String),
    Tls(native_tls::Error),
    Io(io::Error),
}

impl From<io::Error> for Error {
    fn from(io_error: io::Error) -> Self {
        Error::Io(io_error)
    }
}

impl From<native_tls::Error> for Error {
    fn from(tls_error: native_tls::Error) -> Self {
        Error::Tls(tls_error)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::UnknownCid(cid) => write!(f, "CID not in use: {}", cid),
            Error::AlreadyManaged(fd) => write!(f, "FD already managed: {}", fd),
            Error::Resolve(host) => write!(f, "no address found for {}", host),
            Error::Tls(err) => write!(f, "TLS failure: {}", err),
            Error::Io(err) => write!(f, "{}", err),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// Symbolic name for the errno values a socket loop commonly surfaces.
pub fn errno_name(code: i32) -> &'static str {
    match code {
        libc::EAGAIN => "EAGAIN",
        libc::EBADF => "EBADF",
        libc::ECONNABORTED => "ECONNABORTED",
        libc::ECONNREFUSED => "ECONNREFUSED",
        libc::ECONNRESET => "ECONNRESET",
        libc::EHOSTUNREACH => "EHOSTUNREACH",
        libc::EINPROGRESS => "EINPROGRESS",
        libc::EINTR => "EINTR",
        libc::ENETUNREACH => "ENETUNREACH",
        libc::ENOENT => "ENOENT",
        libc::ENOTCONN => "ENOTCONN",
        libc::EPIPE => "EPIPE",
        libc::ETIMEDOUT => "ETIMEDOUT",
        _ => "EUNKNOWN",
    }
}
