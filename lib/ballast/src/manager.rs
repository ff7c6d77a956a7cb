use crate::event::{Event, Trace};
use crate::framing::JsonFraming;
use crate::handle::{Handle, HandshakeProgress, TlsFlag, TlsServerConfig, Transport};
use crate::support::{errno_name, Cid, Error, FramingFactory, Result, Status};
use crate::timeout::{TimeoutHandle, TimeoutWheel};
use indexmap::IndexMap;
use lux::logging;
use lux::logging::Logger;
use mio::unix::{EventedFd, UnixReady};
use mio::{Events, Poll, PollOpt, Ready, Registration, SetReadiness, Token};
use native_tls::TlsAcceptor;
use net2::TcpBuilder;
use serde_json::Value;
use std::cmp;
use std::io;
use std::mem;
use std::net::{Ipv4Addr, Ipv6Addr, ToSocketAddrs};
use std::os::unix::io::RawFd;
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

// The wake-up channel shares the selector with the managed descriptors.
const WAKE: Token = Token(std::usize::MAX - 1);
const READ_CHUNK: usize = 4096;
const LISTEN_BACKLOG: i32 = 5;

type LowListener = Arc<dyn Fn(&Trace) + Send + Sync>;
type HighListener = Arc<dyn Fn(&Event) + Send + Sync>;

/// Events produced while the registry lock is held, delivered to the
/// listener lists only after it has been released.
struct Outbox {
    traces: Vec<Trace>,
    events: Vec<Event>,
}

impl Outbox {
    fn new() -> Outbox {
        Outbox {
            traces: Vec::new(),
            events: Vec::new(),
        }
    }

    fn is_empty(&self) -> bool {
        self.traces.is_empty() && self.events.is_empty()
    }
}

struct State {
    handles: IndexMap<Cid, Handle>,
    wheel: TimeoutWheel,
    // While true the loop keeps waiting even with no managed handles.
    running: bool,
    stop_on_exception: bool,
    stop_on_interrupt: bool,
    default_framing: FramingFactory,
}

/// The I/O multiplexer: a single poll loop owning listening sockets,
/// accepted and outbound connections, raw descriptors and timeouts.
///
/// All entry points are thread-safe; calls from outside the loop thread
/// synchronise on the registry and poke the wake-up channel so the change
/// becomes visible on the next iteration. Listener callbacks always run on
/// the loop thread and must not block.
pub struct Manager {
    poll: Poll,
    wake: SetReadiness,
    _wake_registration: Registration,
    state: Mutex<State>,
    low_listeners: Mutex<Vec<LowListener>>,
    high_listeners: Mutex<Vec<HighListener>>,
    interrupted: Arc<AtomicBool>,
    log: Logger,
}

impl Manager {
    /// Create a manager with the default JSON document framing.
    pub fn new<'a, L: Into<Option<&'a Logger>>>(log: L) -> Result<Manager> {
        Self::with_framing(log, JsonFraming::factory())
    }

    pub fn with_framing<'a, L: Into<Option<&'a Logger>>>(
        log: L,
        default_framing: FramingFactory,
    ) -> Result<Manager> {
        let log = match log.into() {
            Some(log) => log.new(logging::o!()),
            None => Logger::root(logging::Discard, logging::o!()),
        };

        let poll = Poll::new()?;
        let (registration, wake) = Registration::new2();
        poll.register(&registration, WAKE, Ready::readable(), PollOpt::level())?;

        Ok(Manager {
            poll,
            wake,
            _wake_registration: registration,
            state: Mutex::new(State {
                handles: IndexMap::new(),
                wheel: TimeoutWheel::new(),
                running: true,
                stop_on_exception: false,
                stop_on_interrupt: true,
                default_framing,
            }),
            low_listeners: Mutex::new(Vec::new()),
            high_listeners: Mutex::new(Vec::new()),
            interrupted: Arc::new(AtomicBool::new(false)),
            log,
        })
    }

    pub fn register_low_level_listener<F: Fn(&Trace) + Send + Sync + 'static>(&self, listener: F) {
        self.low_listeners.lock().unwrap().push(Arc::new(listener));
    }

    pub fn register_high_level_listener<F: Fn(&Event) + Send + Sync + 'static>(&self, listener: F) {
        self.high_listeners.lock().unwrap().push(Arc::new(listener));
    }

    /// Stop the manager when a callback in the high-level list panics.
    pub fn stop_on_exception(&self, value: bool) {
        self.state.lock().unwrap().stop_on_exception = value;
    }

    /// Stop on SIGINT (default) instead of surfacing a keyboard-interrupt
    /// event.
    pub fn stop_on_keyboard_interrupt(&self, value: bool) {
        self.state.lock().unwrap().stop_on_interrupt = value;
    }

    /// Ask the loop to return once it manages no handles anymore.
    pub fn stop_when_idle(&self, value: bool) {
        self.state.lock().unwrap().running = !value;
    }

    /// Create a listening TCP socket on all interfaces. `SO_REUSEADDR` is
    /// set so the port can be rebound immediately after a restart.
    pub fn listen(&self, port: u16, ipv6: bool, tls: Option<TlsServerConfig>) -> Result<Cid> {
        let std_listener = if ipv6 {
            let builder = TcpBuilder::new_v6()?;
            builder.reuse_address(true)?;
            builder.bind((Ipv6Addr::UNSPECIFIED, port))?;
            builder.listen(LISTEN_BACKLOG)?
        } else {
            let builder = TcpBuilder::new_v4()?;
            builder.reuse_address(true)?;
            builder.bind((Ipv4Addr::UNSPECIFIED, port))?;
            builder.listen(LISTEN_BACKLOG)?
        };
        std_listener.set_nonblocking(true)?;
        let listener = mio::net::TcpListener::from_std(std_listener)?;

        let acceptor = match tls {
            Some(config) => Some(Arc::new(config.acceptor()?)),
            None => None,
        };

        self.install_listener(
            Transport::TcpListener(listener),
            acceptor,
            None,
            format!("port {}", port),
        )
    }

    /// Create a listening unix-domain socket. The path is unlinked again
    /// when the listener is released.
    pub fn listen_unix<P: AsRef<Path>>(&self, path: P) -> Result<Cid> {
        let path = path.as_ref();
        let listener = mio_uds::UnixListener::bind(path)?;

        self.install_listener(
            Transport::UnixListener(listener),
            None,
            Some(path.to_path_buf()),
            path.display().to_string(),
        )
    }

    /// Start a non-blocking connection to a peer. Completion is detected by
    /// writability; with `tls` the client handshake starts at that point.
    pub fn connect(&self, host: &str, port: u16, ipv6: bool, tls: bool) -> Result<Cid> {
        self.emit_trace(Trace::WillConnect {
            addr: format!("{}:{}", host, port),
        });

        let addr = (host, port)
            .to_socket_addrs()?
            .find(|candidate| candidate.is_ipv6() == ipv6)
            .ok_or_else(|| Error::Resolve(format!("{}:{}", host, port)))?;
        let stream = mio::net::TcpStream::connect(&addr)?;

        let flag = if tls { TlsFlag::Client } else { TlsFlag::Off };
        self.install_outbound(
            Transport::Tcp(stream),
            flag,
            Some(host.to_string()),
            addr.to_string(),
        )
    }

    /// Start a non-blocking connection to a unix-domain socket.
    pub fn connect_unix<P: AsRef<Path>>(&self, path: P) -> Result<Cid> {
        let path = path.as_ref();
        self.emit_trace(Trace::WillConnect {
            addr: path.display().to_string(),
        });

        let stream = mio_uds::UnixStream::connect(path)?;
        self.install_outbound(
            Transport::Unix(stream),
            TlsFlag::Off,
            None,
            path.display().to_string(),
        )
    }

    /// Manage an arbitrary file descriptor. Duplicate adds fail. With
    /// `dont_close` the descriptor survives release; with `hold` no data is
    /// read until `unhold`.
    pub fn add_fd(&self, fd: RawFd, dont_close: bool, hold: bool) -> Result<Cid> {
        let mut outbox = Outbox::new();
        {
            let mut state = self.state.lock().unwrap();
            if state.handles.contains_key(&fd) {
                return Err(Error::AlreadyManaged(fd));
            }

            let mut handle = Handle::new(Transport::Fd(fd), state.default_framing.clone());
            handle.dont_close = dont_close;
            if hold {
                handle.hold = true;
                handle.interest.remove(Ready::readable());
            }
            state.handles.insert(fd, handle);
        }

        outbox.traces.push(Trace::FdAdded { cid: fd });
        if hold {
            outbox.traces.push(Trace::Hold { cid: fd });
        }
        outbox.events.push(Event::FdManaged(fd));
        self.dispatch(outbox);
        self.wakeup(&format!("new FD {} added", fd));

        Ok(fd)
    }

    /// Stop managing a descriptor without closing it.
    pub fn remove_fd(&self, fd: RawFd) -> Result<()> {
        {
            let mut state = self.state.lock().unwrap();
            let handle = state.handles.get_mut(&fd).ok_or(Error::UnknownCid(fd))?;
            handle.dont_close = true;
        }
        self.disconnect(fd)
    }

    /// Encode a document with the connection's framing and queue it.
    pub fn send(&self, cid: Cid, doc: &Value) -> Result<usize> {
        let bytes = {
            let mut state = self.state.lock().unwrap();
            let handle = state.handles.get_mut(&cid).ok_or(Error::UnknownCid(cid))?;
            handle.framing.encode(doc)
        };
        self.send_raw(cid, &bytes)
    }

    /// Queue raw bytes on a connection. Returns the out-buffer length.
    pub fn send_raw(&self, cid: Cid, bytes: &[u8]) -> Result<usize> {
        let buffered = {
            let mut state = self.state.lock().unwrap();
            let handle = state.handles.get_mut(&cid).ok_or(Error::UnknownCid(cid))?;
            handle.add_out_data(bytes)
        };
        self.wakeup(&format!("out data ready on {}", cid));
        Ok(buffered)
    }

    /// Stop reading from the connection and schedule its release once the
    /// out-buffer has drained. Honours `dont_close`. Idempotent.
    pub fn disconnect(&self, cid: Cid) -> Result<()> {
        let mut outbox = Outbox::new();
        {
            let mut state = self.state.lock().unwrap();
            let handle = state.handles.get_mut(&cid).ok_or(Error::UnknownCid(cid))?;
            handle.hold = false;
            handle.interest.remove(Ready::readable());
        }
        outbox.traces.push(Trace::Disconnecting { cid });
        self.dispatch(outbox);
        self.wakeup(&format!("socket {} no more active", cid));
        Ok(())
    }

    pub fn close(&self, cid: Cid) -> Result<()> {
        self.disconnect(cid)
    }

    /// Stop reading from this connection; arriving data backs up in the
    /// kernel buffer (or blocks the peer) until `unhold`.
    pub fn hold(&self, cid: Cid) -> Result<()> {
        let mut outbox = Outbox::new();
        {
            let mut state = self.state.lock().unwrap();
            let handle = state.handles.get_mut(&cid).ok_or(Error::UnknownCid(cid))?;
            handle.hold = true;
            handle.interest.remove(Ready::readable());
        }
        outbox.traces.push(Trace::Hold { cid });
        self.dispatch(outbox);
        self.wakeup(&format!("socket {} now being held", cid));
        Ok(())
    }

    /// Hold automatically once the in-buffer holds `after` bytes.
    pub fn hold_after(&self, cid: Cid, after: usize) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let handle = state.handles.get_mut(&cid).ok_or(Error::UnknownCid(cid))?;
        handle.read_until = after;
        Ok(())
    }

    /// Resume reading a held connection.
    pub fn unhold(&self, cid: Cid) -> Result<()> {
        let mut outbox = Outbox::new();
        {
            let mut state = self.state.lock().unwrap();
            let handle = state.handles.get_mut(&cid).ok_or(Error::UnknownCid(cid))?;
            handle.hold = false;
            handle.interest.insert(Ready::readable());
        }
        outbox.traces.push(Trace::Unhold { cid });
        self.dispatch(outbox);
        self.wakeup(&format!("socket {} no more being held", cid));
        Ok(())
    }

    /// Replace the framing of a connection. On a listener the factory is
    /// inherited by accepted children instead.
    pub fn set_framing(&self, cid: Cid, factory: FramingFactory) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let handle = state.handles.get_mut(&cid).ok_or(Error::UnknownCid(cid))?;
        handle.framing = factory();
        handle.framing_factory = factory;
        Ok(())
    }

    /// Deliver a high-level timeout event `seconds` from now.
    pub fn set_timeout(&self, seconds: f64, payload: Value) -> TimeoutHandle {
        let handle = {
            let mut state = self.state.lock().unwrap();
            state
                .wheel
                .add(Duration::from_secs_f64(seconds.max(0.0)), payload)
        };
        self.emit_trace(Trace::TimeoutAdded { handle, seconds });
        self.wakeup(&format!("new timeout {} set", handle));
        handle
    }

    /// Cancel a pending timeout; races with an already fired entry are
    /// benign.
    pub fn cancel_timeout(&self, handle: TimeoutHandle) {
        self.state.lock().unwrap().wheel.cancel(handle);
        self.emit_trace(Trace::TimeoutCanceled { handle });
    }

    /// Disconnect every handle and make the loop return once they have
    /// drained.
    pub fn stop(&self) {
        let mut outbox = Outbox::new();
        {
            let mut state = self.state.lock().unwrap();
            if state.handles.is_empty() && !state.running {
                return;
            }
            state.running = false;
            for (&cid, handle) in state.handles.iter_mut() {
                handle.hold = false;
                handle.interest.remove(Ready::readable());
                outbox.traces.push(Trace::Disconnecting { cid });
            }
        }
        self.dispatch(outbox);
        self.wakeup("manager is shutting down");
    }

    /// Run the loop until `stop` (or SIGINT with the default policy).
    pub fn main(&self) {
        let _ = signal_hook::flag::register(
            signal_hook::consts::SIGINT,
            Arc::clone(&self.interrupted),
        );

        self.emit_trace(Trace::MainLoopStarted);
        let mut events = Events::with_capacity(1024);
        while self.iterate(&mut events) {}
        self.emit_trace(Trace::MainLoopStopped);
    }

    /// One loop iteration. Returns false once there is nothing left to do.
    pub fn loop_once(&self) -> bool {
        let mut events = Events::with_capacity(256);
        self.iterate(&mut events)
    }

    fn iterate(&self, events: &mut Events) -> bool {
        let mut outbox = Outbox::new();

        let timeout = {
            let mut state = self.state.lock().unwrap();
            self.housekeeping(&mut state, &mut outbox);
            if state.handles.is_empty() && !state.running {
                drop(state);
                self.dispatch(outbox);
                return false;
            }
            state.wheel.next_delay()
        };

        let mut poll_ok = true;
        match self.poll.poll(events, timeout) {
            Ok(_) => (),
            Err(ref err) if err.kind() == io::ErrorKind::Interrupted => poll_ok = false,
            Err(err) => {
                // Unrecoverable demultiplexer failure.
                logging::error!(self.log, "poll failed"; "error" => %err);
                outbox.traces.push(Trace::Exception {
                    context: format!("poll failed: {}", err),
                });
                self.dispatch(outbox);
                self.stop();
                return true;
            }
        }

        if self.interrupted.swap(false, Ordering::SeqCst) {
            let stop = self.state.lock().unwrap().stop_on_interrupt;
            if stop {
                self.dispatch(mem::replace(&mut outbox, Outbox::new()));
                self.stop();
                return true;
            }
            outbox.events.push(Event::KeyboardInterrupt);
        }

        {
            let mut state = self.state.lock().unwrap();

            for (handle, payload) in state.wheel.pop_due() {
                outbox.traces.push(Trace::Timeout { handle });
                outbox.events.push(Event::Timeout(payload));
            }

            if poll_ok {
                if events.is_empty() {
                    outbox.traces.push(Trace::Loop);
                }
                for event in events.iter() {
                    if event.token() == WAKE {
                        let _ = self.wake.set_readiness(Ready::empty());
                        outbox.traces.push(Trace::WakeUpCleared);
                        continue;
                    }

                    let cid = event.token().0 as Cid;
                    outbox.traces.push(Trace::Ready {
                        cid,
                        readiness: format!("{:?}", event.readiness()),
                    });
                    self.dispatch_ready(&mut state, cid, event.readiness(), &mut outbox);
                }
            }
        }

        self.dispatch(outbox);
        true
    }

    /// Sync the registry with the demultiplexer: register changed interest
    /// masks, release handles whose mask went empty and are not held.
    fn housekeeping(&self, state: &mut State, outbox: &mut Outbox) {
        let mut to_release: Vec<Cid> = Vec::new();

        for (&cid, handle) in state.handles.iter_mut() {
            if handle.interest.is_empty() {
                if handle.registered.take().is_some() {
                    let fd = cid as RawFd;
                    let _ = self.poll.deregister(&EventedFd(&fd));
                }
                if !handle.hold {
                    to_release.push(cid);
                }
                continue;
            }

            let desired = handle.desired_interest();
            if handle.registered != Some(desired) {
                let fd = cid as RawFd;
                let result = if handle.registered.is_some() {
                    self.poll
                        .reregister(&EventedFd(&fd), Token(cid as usize), desired, PollOpt::level())
                } else {
                    self.poll
                        .register(&EventedFd(&fd), Token(cid as usize), desired, PollOpt::level())
                };
                match result {
                    Ok(()) => handle.registered = Some(desired),
                    Err(err) => {
                        logging::warn!(self.log, "poll registration failed";
                                       "cid" => cid, "error" => %err);
                        handle.interest = Ready::empty();
                        handle.hold = false;
                    }
                }
            }
        }

        for cid in to_release {
            self.release(state, cid, outbox);
        }
    }

    /// Remove a handle from the registry and close its transport unless it
    /// is marked dont-close.
    fn release(&self, state: &mut State, cid: Cid, outbox: &mut Outbox) {
        let mut handle = match state.handles.swap_remove(&cid) {
            Some(handle) => handle,
            None => return,
        };

        if handle.registered.take().is_some() {
            let fd = cid as RawFd;
            let _ = self.poll.deregister(&EventedFd(&fd));
        }

        if handle.dont_close {
            // Leak the transport wrapper; the descriptor belongs to someone
            // else from here on.
            mem::forget(handle.transport);
            outbox.traces.push(Trace::FdRemoved { cid });
            outbox.events.push(Event::FdUnmanaged(cid));
        } else {
            if let Some(path) = handle.unlink_path.take() {
                if path.exists() {
                    let _ = std::fs::remove_file(&path);
                }
            }
            handle.transport.close();
            outbox.traces.push(Trace::ConnectionClosed { cid });
            outbox.events.push(Event::ConnectionClosed(cid));
        }
    }

    fn dispatch_ready(&self, state: &mut State, cid: Cid, ready: Ready, outbox: &mut Outbox) {
        let uready = UnixReady::from(ready);

        let (handshaking, connecting, listening) = match state.handles.get(&cid) {
            Some(handle) => (
                handle.transport.is_handshaking(),
                handle.connecting,
                handle.listening,
            ),
            None => return,
        };

        if uready.is_error() {
            self.erroneous(state, cid, None, outbox);
            return;
        }

        if handshaking {
            if ready.is_readable() || ready.is_writable() {
                self.continue_handshake(state, cid, outbox);
            }
            return;
        }

        if ready.is_writable() {
            if connecting {
                self.complete_connection(state, cid, outbox);
            } else {
                self.write_ready(state, cid, outbox);
            }
        }

        if ready.is_readable() {
            if listening {
                self.accept_ready(state, cid, outbox);
            } else {
                self.read_ready(state, cid, outbox);
            }
        }

        // The peer shut down and nothing is left to read.
        if uready.is_hup() && !uready.is_error() && !ready.is_readable() {
            self.hangup(state, cid, outbox);
        }
    }

    fn accept_ready(&self, state: &mut State, cid: Cid, outbox: &mut Outbox) {
        let (accepted, factory, acceptor) = {
            let listener = match state.handles.get_mut(&cid) {
                Some(handle) => handle,
                None => return,
            };
            let accepted = match &listener.transport {
                Transport::TcpListener(sock) => {
                    sock.accept().map(|(stream, _)| Some(Transport::Tcp(stream)))
                }
                Transport::UnixListener(sock) => sock
                    .accept()
                    .map(|opt| opt.map(|(stream, _)| Transport::Unix(stream))),
                _ => return,
            };
            (
                accepted,
                listener.framing_factory.clone(),
                listener.acceptor.clone(),
            )
        };

        let transport = match accepted {
            Ok(Some(transport)) => transport,
            Ok(None) => return,
            Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => return,
            Err(err) => {
                self.erroneous(state, cid, Some(err), outbox);
                return;
            }
        };

        let child = Handle::new(transport, factory);
        let child_cid = child.cid;
        let peer = child.transport.describe_peer();
        state.handles.insert(child_cid, child);

        outbox.traces.push(Trace::NewConnection {
            cid: child_cid,
            peer,
        });
        outbox.events.push(Event::IncomingConnection(child_cid));

        if let Some(acceptor) = acceptor {
            let progress = match state.handles.get_mut(&child_cid) {
                Some(handle) => handle.start_tls_server(&acceptor),
                None => return,
            };
            self.apply_handshake_progress(state, child_cid, progress, outbox);
        }
    }

    fn complete_connection(&self, state: &mut State, cid: Cid, outbox: &mut Outbox) {
        let (peer, start_tls) = {
            let handle = match state.handles.get_mut(&cid) {
                Some(handle) => handle,
                None => return,
            };
            handle.connecting = false;
            handle.interest.insert(Ready::readable());
            if handle.out_buf.is_empty() {
                handle.interest.remove(Ready::writable());
            }
            (
                handle.transport.describe_peer(),
                handle.tls == TlsFlag::Client,
            )
        };

        if start_tls {
            let progress = match state.handles.get_mut(&cid) {
                Some(handle) => handle.start_tls_client(),
                None => return,
            };
            if !self.apply_handshake_progress(state, cid, progress, outbox) {
                return;
            }
        }

        outbox.traces.push(Trace::Connected { cid, peer });
        outbox.events.push(Event::OutgoingConnection(cid));
    }

    fn continue_handshake(&self, state: &mut State, cid: Cid, outbox: &mut Outbox) {
        let progress = match state.handles.get_mut(&cid) {
            Some(handle) => handle.drive_handshake(),
            None => return,
        };
        self.apply_handshake_progress(state, cid, progress, outbox);
    }

    fn apply_handshake_progress(
        &self,
        state: &mut State,
        cid: Cid,
        progress: HandshakeProgress,
        outbox: &mut Outbox,
    ) -> bool {
        match progress {
            HandshakeProgress::Done | HandshakeProgress::Pending => true,
            HandshakeProgress::Failed(err) => {
                self.erroneous(state, cid, Some(err), outbox);
                false
            }
        }
    }

    fn read_ready(&self, state: &mut State, cid: Cid, outbox: &mut Outbox) {
        enum After {
            Parse,
            HalfClose,
            Hold,
            Broken(io::Error),
        }

        let capped = match state.handles.get(&cid) {
            Some(handle) => handle.read_until > 0 && handle.in_buf.len() >= handle.read_until,
            None => return,
        };
        if capped {
            self.hold_in_loop(state, cid, outbox);
            return;
        }

        let mut total = 0;
        let outcome = {
            let handle = match state.handles.get_mut(&cid) {
                Some(handle) => handle,
                None => return,
            };
            let max = if handle.read_until > 0 {
                cmp::min(READ_CHUNK, handle.read_until - handle.in_buf.len())
            } else {
                READ_CHUNK
            };
            let tls = handle.transport.is_tls();
            let raw_fd = matches!(handle.transport, Transport::Fd(_));

            loop {
                match handle.in_buf.ingress(&mut handle.transport, max) {
                    Ok(0) => {
                        if total == 0 {
                            break After::HalfClose;
                        }
                        break After::Parse;
                    }
                    Ok(count) => {
                        total += count;
                        // Plain sockets are read once per readiness; TLS may
                        // hold decrypted data that no longer shows up in the
                        // selector, so drain it until would-block.
                        if !tls {
                            break After::Parse;
                        }
                    }
                    Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => break After::Parse,
                    Err(err) => {
                        // A write-only descriptor keeps POLLIN raised; park
                        // it instead of spinning on EBADF.
                        if raw_fd && err.raw_os_error() == Some(libc::EBADF) {
                            break After::Hold;
                        }
                        break After::Broken(err);
                    }
                }
            }
        };

        match outcome {
            After::Broken(err) => {
                self.erroneous(state, cid, Some(err), outbox);
                return;
            }
            After::Hold => {
                self.hold_in_loop(state, cid, outbox);
                return;
            }
            After::HalfClose => {
                if let Some(handle) = state.handles.get_mut(&cid) {
                    handle.interest.remove(Ready::readable());
                }
                return;
            }
            After::Parse => (),
        }

        if total == 0 {
            return;
        }
        outbox.traces.push(Trace::Read { cid, bytes: total });

        let cap_hit = match state.handles.get(&cid) {
            Some(handle) => handle.read_until > 0 && handle.in_buf.len() >= handle.read_until,
            None => return,
        };
        if cap_hit {
            self.hold_in_loop(state, cid, outbox);
        }

        let (status, docs) = {
            let handle = match state.handles.get_mut(&cid) {
                Some(handle) => handle,
                None => return,
            };
            let Handle {
                ref mut framing,
                ref mut in_buf,
                ..
            } = *handle;
            let (status, docs, consumed) = framing.decode(in_buf.data_slice());
            in_buf.consume(consumed);
            if status == Status::Garbage {
                in_buf.clear();
            }
            (status, docs)
        };

        match status {
            Status::Ok => {
                for doc in docs {
                    outbox.events.push(Event::Packet(cid, doc));
                }
            }
            Status::Garbage => {
                outbox
                    .events
                    .push(Event::ProtocolError(cid, "packet malformed".to_string()));
            }
            Status::Undefined => (),
        }
    }

    fn write_ready(&self, state: &mut State, cid: Cid, outbox: &mut Outbox) {
        let result = {
            let handle = match state.handles.get_mut(&cid) {
                Some(handle) => handle,
                None => return,
            };
            let Handle {
                ref mut out_buf,
                ref mut transport,
                ..
            } = *handle;
            out_buf.egress(transport)
        };

        match result {
            Ok(count) => {
                if count > 0 {
                    outbox.traces.push(Trace::Write { cid, bytes: count });
                }
                if let Some(handle) = state.handles.get_mut(&cid) {
                    if handle.out_buf.is_empty() {
                        handle.interest.remove(Ready::writable());
                    }
                }
            }
            Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => (),
            Err(err) => self.erroneous(state, cid, Some(err), outbox),
        }
    }

    /// Surface a transport error and schedule the handle's release.
    fn erroneous(&self, state: &mut State, cid: Cid, err: Option<io::Error>, outbox: &mut Outbox) {
        let handle = match state.handles.get_mut(&cid) {
            Some(handle) => handle,
            None => return,
        };
        if handle.interest.is_empty() {
            // Already being released.
            return;
        }

        let err = err.or_else(|| handle.transport.take_error());
        let (code, message) = match err {
            Some(err) => (err.raw_os_error().unwrap_or(0), err.to_string()),
            None => (0, "unspecified socket error".to_string()),
        };

        handle.interest = Ready::empty();
        handle.hold = false;

        outbox.traces.push(Trace::Error {
            cid,
            code,
            name: errno_name(code),
            message: message.clone(),
        });
        outbox.events.push(Event::ConnectionError(cid, message));
    }

    fn hangup(&self, state: &mut State, cid: Cid, outbox: &mut Outbox) {
        if let Some(handle) = state.handles.get_mut(&cid) {
            handle.hold = false;
            handle.interest.remove(Ready::readable());
            outbox.traces.push(Trace::Disconnecting { cid });
        }
    }

    fn hold_in_loop(&self, state: &mut State, cid: Cid, outbox: &mut Outbox) {
        if let Some(handle) = state.handles.get_mut(&cid) {
            if !handle.hold {
                handle.hold = true;
                handle.interest.remove(Ready::readable());
                outbox.traces.push(Trace::Hold { cid });
            }
        }
    }

    fn install_listener(
        &self,
        transport: Transport,
        acceptor: Option<Arc<TlsAcceptor>>,
        unlink: Option<PathBuf>,
        addr: String,
    ) -> Result<Cid> {
        let mut outbox = Outbox::new();
        let cid = {
            let mut state = self.state.lock().unwrap();
            let mut handle = Handle::new(transport, state.default_framing.clone());
            let cid = handle.cid;
            handle.listening = true;
            handle.tls = if acceptor.is_some() {
                TlsFlag::Server
            } else {
                TlsFlag::Off
            };
            handle.acceptor = acceptor;
            handle.unlink_path = unlink;
            state.handles.insert(cid, handle);
            cid
        };

        outbox.traces.push(Trace::Listening { cid, addr });
        outbox.events.push(Event::Listening(cid));
        self.dispatch(outbox);
        self.wakeup(&format!("new listening socket {}", cid));

        Ok(cid)
    }

    fn install_outbound(
        &self,
        transport: Transport,
        tls: TlsFlag,
        tls_host: Option<String>,
        addr: String,
    ) -> Result<Cid> {
        let mut outbox = Outbox::new();
        let cid = {
            let mut state = self.state.lock().unwrap();
            let mut handle = Handle::new(transport, state.default_framing.clone());
            let cid = handle.cid;
            handle.connecting = true;
            handle.interest = Ready::readable() | Ready::writable();
            handle.tls = tls;
            handle.tls_host = tls_host;
            state.handles.insert(cid, handle);
            cid
        };

        outbox.traces.push(Trace::Connecting { cid, addr });
        self.dispatch(outbox);
        self.wakeup(&format!("socket {} waiting for connection", cid));

        Ok(cid)
    }

    /// Force the loop out of its blocking wait.
    fn wakeup(&self, reason: &str) {
        self.emit_trace(Trace::WakeUp {
            reason: reason.to_string(),
        });
        let _ = self.wake.set_readiness(Ready::readable());
    }

    fn emit_trace(&self, trace: Trace) {
        let mut outbox = Outbox::new();
        outbox.traces.push(trace);
        self.dispatch(outbox);
    }

    /// Invoke the listener lists. Runs without the registry lock so the
    /// callbacks may call back into the manager; panics are contained.
    fn dispatch(&self, outbox: Outbox) {
        if outbox.is_empty() {
            return;
        }

        let lows: Vec<LowListener> = self.low_listeners.lock().unwrap().clone();
        for trace in &outbox.traces {
            logging::trace!(self.log, "io"; "trace" => ?trace);
            for listener in &lows {
                if panic::catch_unwind(AssertUnwindSafe(|| listener(trace))).is_err() {
                    logging::error!(self.log, "low level listener panicked"; "trace" => ?trace);
                }
            }
        }

        let highs: Vec<HighListener> = self.high_listeners.lock().unwrap().clone();
        for event in &outbox.events {
            logging::debug!(self.log, "event"; "event" => ?event);
            for listener in &highs {
                if panic::catch_unwind(AssertUnwindSafe(|| listener(event))).is_err() {
                    logging::error!(self.log, "high level listener panicked"; "event" => ?event);
                    let stop = self.state.lock().unwrap().stop_on_exception;
                    if stop {
                        self.stop();
                    }
                }
            }
        }
    }
}
