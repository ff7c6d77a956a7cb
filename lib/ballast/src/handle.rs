use crate::buffer::Buffer;
use crate::support::{Cid, Error, Framing, FramingFactory, Result};
use mio::net::{TcpListener, TcpStream};
use mio::Ready;
use mio_uds::{UnixListener, UnixStream};
use native_tls::{HandshakeError, Identity, MidHandshakeTlsStream, TlsAcceptor, TlsConnector, TlsStream};
use std::fs;
use std::io::{self, Read, Write};
use std::mem;
use std::os::unix::io::{AsRawFd, RawFd};
use std::path::PathBuf;
use std::sync::Arc;

/// TLS role of a managed endpoint.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum TlsFlag {
    Off,
    Server,
    Client,
}

/// Server-side TLS settings: a PEM file holding both the certificate chain
/// and the private key.
#[derive(Debug, Clone)]
pub struct TlsServerConfig {
    pub cert: PathBuf,
}

impl TlsServerConfig {
    pub fn new<P: Into<PathBuf>>(cert: P) -> TlsServerConfig {
        TlsServerConfig { cert: cert.into() }
    }

    pub fn acceptor(&self) -> Result<TlsAcceptor> {
        let pem = fs::read(&self.cert).map_err(Error::Io)?;
        let identity = Identity::from_pkcs8(&pem, &pem)?;
        TlsAcceptor::new(identity).map_err(Into::into)
    }
}

/// The underlying endpoint of a handle.
pub enum Transport {
    TcpListener(TcpListener),
    UnixListener(UnixListener),
    Tcp(TcpStream),
    Unix(UnixStream),
    Tls(TlsStream<TcpStream>),
    TlsHandshake(Option<MidHandshakeTlsStream<TcpStream>>),
    Fd(RawFd),
    // Transient placeholder while a stream is being re-wrapped.
    Detached,
}

impl Transport {
    #[inline]
    pub fn fd(&self) -> RawFd {
        match self {
            Transport::TcpListener(listener) => listener.as_raw_fd(),
            Transport::UnixListener(listener) => listener.as_raw_fd(),
            Transport::Tcp(stream) => stream.as_raw_fd(),
            Transport::Unix(stream) => stream.as_raw_fd(),
            Transport::Tls(stream) => stream.get_ref().as_raw_fd(),
            Transport::TlsHandshake(Some(mid)) => mid.get_ref().as_raw_fd(),
            Transport::TlsHandshake(None) | Transport::Detached => -1,
            Transport::Fd(fd) => *fd,
        }
    }

    #[inline]
    pub fn is_handshaking(&self) -> bool {
        matches!(self, Transport::TlsHandshake(_))
    }

    #[inline]
    pub fn is_tls(&self) -> bool {
        matches!(self, Transport::Tls(_) | Transport::TlsHandshake(_))
    }

    /// Pending socket error, if the OS reports one (`SO_ERROR`).
    pub fn take_error(&self) -> Option<io::Error> {
        let result = match self {
            Transport::TcpListener(listener) => listener.take_error(),
            Transport::UnixListener(listener) => listener.take_error(),
            Transport::Tcp(stream) => stream.take_error(),
            Transport::Unix(stream) => stream.take_error(),
            Transport::Tls(stream) => stream.get_ref().take_error(),
            Transport::TlsHandshake(Some(mid)) => mid.get_ref().take_error(),
            Transport::TlsHandshake(None) | Transport::Detached | Transport::Fd(_) => Ok(None),
        };
        result.ok().and_then(|err| err)
    }

    pub fn describe_peer(&self) -> String {
        match self {
            Transport::Tcp(stream) => stream
                .peer_addr()
                .map(|addr| addr.to_string())
                .unwrap_or_else(|_| "?".to_string()),
            Transport::Unix(stream) => stream
                .peer_addr()
                .map(|addr| format!("{:?}", addr))
                .unwrap_or_else(|_| "?".to_string()),
            Transport::Tls(stream) => stream
                .get_ref()
                .peer_addr()
                .map(|addr| addr.to_string())
                .unwrap_or_else(|_| "?".to_string()),
            Transport::Fd(fd) => format!("fd {}", fd),
            _ => "?".to_string(),
        }
    }

    /// Close the endpoint. Sockets close when dropped; raw descriptors need
    /// an explicit close, TLS sessions get a best-effort shutdown notice.
    pub fn close(&mut self) {
        match self {
            Transport::Tls(stream) => {
                let _ = stream.shutdown();
            }
            Transport::Fd(fd) => {
                if *fd >= 0 {
                    unsafe { libc::close(*fd) };
                }
            }
            _ => (),
        }
    }
}

fn fd_read(fd: RawFd, buf: &mut [u8]) -> io::Result<usize> {
    let count = unsafe { libc::read(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
    if count < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(count as usize)
    }
}

fn fd_write(fd: RawFd, buf: &[u8]) -> io::Result<usize> {
    let count = unsafe { libc::write(fd, buf.as_ptr() as *const libc::c_void, buf.len()) };
    if count < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(count as usize)
    }
}

impl Read for Transport {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Transport::Tcp(stream) => stream.read(buf),
            Transport::Unix(stream) => stream.read(buf),
            Transport::Tls(stream) => stream.read(buf),
            Transport::Fd(fd) => fd_read(*fd, buf),
            // Data waits until the handshake completes.
            Transport::TlsHandshake(_) => Err(io::ErrorKind::WouldBlock.into()),
            _ => Err(io::Error::new(io::ErrorKind::Other, "not a data transport")),
        }
    }
}

impl Write for Transport {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Transport::Tcp(stream) => stream.write(buf),
            Transport::Unix(stream) => stream.write(buf),
            Transport::Tls(stream) => stream.write(buf),
            Transport::Fd(fd) => fd_write(*fd, buf),
            Transport::TlsHandshake(_) => Err(io::ErrorKind::WouldBlock.into()),
            _ => Err(io::Error::new(io::ErrorKind::Other, "not a data transport")),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Transport::Tcp(stream) => stream.flush(),
            Transport::Unix(stream) => stream.flush(),
            Transport::Tls(stream) => stream.flush(),
            _ => Ok(()),
        }
    }
}

/// Result of pushing a TLS handshake forward.
pub enum HandshakeProgress {
    Done,
    Pending,
    Failed(io::Error),
}

/// Per-endpoint record: the transport, both FIFO buffers, the poll interest
/// mask, lifecycle flags and the framing state. The handle id is the OS
/// file descriptor of the transport.
pub struct Handle {
    pub(crate) cid: Cid,
    pub(crate) transport: Transport,
    // Events this handle polls for; an empty mask schedules release.
    pub(crate) interest: Ready,
    // Interest currently registered with the demultiplexer.
    pub(crate) registered: Option<Ready>,
    pub(crate) listening: bool,
    pub(crate) connecting: bool,
    pub(crate) hold: bool,
    pub(crate) dont_close: bool,
    pub(crate) tls: TlsFlag,
    // Listener side: wraps accepted children.
    pub(crate) acceptor: Option<Arc<TlsAcceptor>>,
    // Outbound side: SNI name for the client handshake.
    pub(crate) tls_host: Option<String>,
    pub(crate) framing: Box<dyn Framing>,
    // Inherited by accepted children.
    pub(crate) framing_factory: FramingFactory,
    pub(crate) in_buf: Buffer,
    pub(crate) out_buf: Buffer,
    // Stop reading once the in-buffer holds this many bytes (0 = no cap).
    pub(crate) read_until: usize,
    // Unix listener paths are unlinked when the handle is released.
    pub(crate) unlink_path: Option<PathBuf>,
}

impl Handle {
    pub fn new(transport: Transport, framing_factory: FramingFactory) -> Handle {
        let cid = transport.fd();
        let framing = framing_factory();

        Handle {
            cid,
            transport,
            interest: Ready::readable(),
            registered: None,
            listening: false,
            connecting: false,
            hold: false,
            dont_close: false,
            tls: TlsFlag::Off,
            acceptor: None,
            tls_host: None,
            framing,
            framing_factory,
            in_buf: Buffer::new(),
            out_buf: Buffer::new(),
            read_until: 0,
            unlink_path: None,
        }
    }

    /// Append outbound bytes and raise writable interest. Returns the new
    /// out-buffer length.
    #[inline]
    pub fn add_out_data(&mut self, bytes: &[u8]) -> usize {
        self.out_buf.extend(bytes);
        self.interest.insert(Ready::writable());
        self.out_buf.len()
    }

    /// The interest mask to register with the demultiplexer. A handshaking
    /// endpoint needs both directions regardless of application interest.
    #[inline]
    pub fn desired_interest(&self) -> Ready {
        if self.transport.is_handshaking() {
            Ready::readable() | Ready::writable()
        } else {
            self.interest
        }
    }

    pub fn start_tls_server(&mut self, acceptor: &TlsAcceptor) -> HandshakeProgress {
        let stream = match mem::replace(&mut self.transport, Transport::Detached) {
            Transport::Tcp(stream) => stream,
            other => {
                self.transport = other;
                return HandshakeProgress::Pending;
            }
        };

        self.tls = TlsFlag::Server;
        self.finish_handshake(acceptor.accept(stream))
    }

    pub fn start_tls_client(&mut self) -> HandshakeProgress {
        // Peer verification is off: the sockets live on loopback or behind
        // operator-provided certificates.
        let connector = match TlsConnector::builder()
            .danger_accept_invalid_certs(true)
            .danger_accept_invalid_hostnames(true)
            .build()
        {
            Ok(connector) => connector,
            Err(err) => return HandshakeProgress::Failed(io::Error::new(io::ErrorKind::Other, err)),
        };

        let domain = self
            .tls_host
            .clone()
            .unwrap_or_else(|| "localhost".to_string());

        let stream = match mem::replace(&mut self.transport, Transport::Detached) {
            Transport::Tcp(stream) => stream,
            other => {
                self.transport = other;
                return HandshakeProgress::Pending;
            }
        };

        self.tls = TlsFlag::Client;
        self.finish_handshake(connector.connect(&domain, stream))
    }

    /// Resume a handshake parked on would-block.
    pub fn drive_handshake(&mut self) -> HandshakeProgress {
        let mid = match &mut self.transport {
            Transport::TlsHandshake(slot) => match slot.take() {
                Some(mid) => mid,
                None => return HandshakeProgress::Pending,
            },
            _ => return HandshakeProgress::Done,
        };

        self.finish_handshake(mid.handshake())
    }

    fn finish_handshake(
        &mut self,
        result: std::result::Result<TlsStream<TcpStream>, HandshakeError<TcpStream>>,
    ) -> HandshakeProgress {
        match result {
            Ok(stream) => {
                self.transport = Transport::Tls(stream);
                HandshakeProgress::Done
            }
            Err(HandshakeError::WouldBlock(mid)) => {
                self.transport = Transport::TlsHandshake(Some(mid));
                HandshakeProgress::Pending
            }
            Err(HandshakeError::Failure(err)) => {
                HandshakeProgress::Failed(io::Error::new(io::ErrorKind::Other, err))
            }
        }
    }
}
