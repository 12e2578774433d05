//! Parent-side RPC client: spawns the host, mirrors state, survives broken
//! pipes, and supports abort from another thread.

use std::io::{BufReader, Read, Write};
use std::process::{Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use thiserror::Error;

use super::proto::{read_frame, write_frame, LogLevel, Reply};
use super::RemoteObject;

/// Broken-pipe respawn budget per call.
const RESPAWN_RETRIES: u32 = 3;

#[derive(Debug, Error)]
pub enum ChildError {
    /// The call was cancelled by `abort()`.
    #[error("child process call aborted")]
    Aborted,
    /// The child reported the call failed.
    #[error("remote call failed: {0}")]
    Remote(String),
    /// Pipe or spawn failure that survived the respawn budget.
    #[error("child process transport failed: {0}")]
    Transport(String),
}

/// One live connection to a host, plus whatever must be torn down to abort
/// it.
pub struct Connection {
    pub reader: Box<dyn Read + Send>,
    pub writer: Box<dyn Write + Send>,
    pub guard: ConnectionGuard,
}

/// Teardown handle for an in-flight connection.
pub enum ConnectionGuard {
    /// A spawned host process (killed as a process group).
    Process(std::process::Child),
    /// An in-process host thread reached over a socket pair.
    #[cfg(unix)]
    Stream(std::os::unix::net::UnixStream),
    None,
}

impl ConnectionGuard {
    fn terminate(&mut self) {
        match self {
            ConnectionGuard::Process(child) => {
                #[cfg(unix)]
                unsafe {
                    // The host was spawned as its own process group; take the
                    // whole group down so helpers die with it.
                    libc::kill(-(child.id() as libc::pid_t), libc::SIGKILL);
                }
                let _ = child.kill();
                let _ = child.wait();
            }
            #[cfg(unix)]
            ConnectionGuard::Stream(stream) => {
                let _ = stream.shutdown(std::net::Shutdown::Both);
            }
            ConnectionGuard::None => {}
        }
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.terminate();
    }
}

/// How the client reaches a host: spawn a process, or hand the frames to an
/// in-process serve thread.
pub trait Transport: Send + Sync {
    fn connect(&self) -> std::io::Result<Connection>;
}

/// Command line that starts a host speaking the protocol on stdio.
#[derive(Debug, Clone)]
pub struct HostCommand {
    pub program: std::path::PathBuf,
    pub args: Vec<String>,
}

impl HostCommand {
    pub fn new(program: impl Into<std::path::PathBuf>, args: Vec<String>) -> Self {
        HostCommand {
            program: program.into(),
            args,
        }
    }
}

/// Spawns `HostCommand` with piped stdio, in its own process group.
pub struct ProcessTransport {
    command: HostCommand,
}

impl ProcessTransport {
    pub fn new(command: HostCommand) -> Self {
        ProcessTransport { command }
    }
}

impl Transport for ProcessTransport {
    fn connect(&self) -> std::io::Result<Connection> {
        let mut cmd = Command::new(&self.command.program);
        cmd.args(&self.command.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped());
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            unsafe {
                cmd.pre_exec(|| {
                    libc::setpgid(0, 0);
                    Ok(())
                });
            }
        }
        let mut child = cmd.spawn()?;
        let stdin = child.stdin.take().expect("piped stdin");
        let stdout = child.stdout.take().expect("piped stdout");
        Ok(Connection {
            reader: Box::new(stdout),
            writer: Box::new(stdin),
            guard: ConnectionGuard::Process(child),
        })
    }
}

/// Runs the host's serve loop on a thread in this process, connected by a
/// socket pair. Used by tests and by callers that want the protocol without
/// the isolation.
#[cfg(unix)]
pub struct ThreadTransport {
    serve_fn: Arc<dyn Fn(Box<dyn Read + Send>, Box<dyn Write + Send>) + Send + Sync>,
}

#[cfg(unix)]
impl ThreadTransport {
    pub fn new<S: RemoteObject>() -> Self {
        ThreadTransport {
            serve_fn: Arc::new(|reader, writer| {
                if let Err(e) = super::host::serve::<S>(reader, writer) {
                    tracing::debug!("in-process host exited: {:#}", e);
                }
            }),
        }
    }
}

#[cfg(unix)]
impl Transport for ThreadTransport {
    fn connect(&self) -> std::io::Result<Connection> {
        let (parent, child) = std::os::unix::net::UnixStream::pair()?;
        let serve_fn = Arc::clone(&self.serve_fn);
        let child_reader = child.try_clone()?;
        std::thread::spawn(move || {
            serve_fn(Box::new(child_reader), Box::new(child));
        });
        let reader = parent.try_clone()?;
        Ok(Connection {
            reader: Box::new(reader),
            writer: Box::new(parent.try_clone()?),
            guard: ConnectionGuard::Stream(parent),
        })
    }
}

struct Pipes {
    reader: BufReader<Box<dyn Read + Send>>,
    writer: Box<dyn Write + Send>,
}

/// Runs a `RemoteObject`'s calls in a host, one call at a time.
///
/// The parent keeps the object's state and ships it with every request; the
/// host ships the updated state back on every return, so lazily populated
/// fields (caches, auth tokens) stay in sync.
pub struct ChildProcess<S: RemoteObject> {
    inner: Mutex<ClientInner<S>>,
    /// Guard of the live connection, reachable while `inner` is locked by a
    /// call so `abort` can cut it from another thread.
    live_guard: Mutex<Option<ConnectionGuard>>,
    aborted: AtomicBool,
    transport: Box<dyn Transport>,
    on_event: Box<dyn Fn(&S::Event) + Send + Sync>,
}

struct ClientInner<S> {
    state: S,
    pipes: Option<Pipes>,
}

impl<S: RemoteObject> ChildProcess<S> {
    pub fn new(
        object: S,
        transport: Box<dyn Transport>,
        on_event: impl Fn(&S::Event) + Send + Sync + 'static,
    ) -> Self {
        ChildProcess {
            inner: Mutex::new(ClientInner {
                state: object,
                pipes: None,
            }),
            live_guard: Mutex::new(None),
            aborted: AtomicBool::new(false),
            transport,
            on_event: Box::new(on_event),
        }
    }

    /// Spawn-on-demand host process client.
    pub fn spawn(
        object: S,
        command: HostCommand,
        on_event: impl Fn(&S::Event) + Send + Sync + 'static,
    ) -> Self {
        Self::new(object, Box::new(ProcessTransport::new(command)), on_event)
    }

    /// Invoke one call in the host. Serial per instance: concurrent callers
    /// queue on the internal mutex.
    pub fn call(&self, call: S::Call) -> Result<S::Value, ChildError>
    where
        S::Call: Clone,
    {
        let mut inner = self.inner.lock().unwrap();
        let mut respawns_left = RESPAWN_RETRIES;
        loop {
            if self.aborted.load(Ordering::SeqCst) {
                return Err(ChildError::Aborted);
            }
            if inner.pipes.is_none() {
                match self.connect() {
                    Ok(pipes) => inner.pipes = Some(pipes),
                    Err(e) => {
                        return Err(ChildError::Transport(format!("spawn failed: {}", e)))
                    }
                }
            }
            match self.round_trip(&mut inner, call.clone()) {
                Ok(value) => return Ok(value),
                Err(RoundTripError::Fault(message)) => return Err(ChildError::Remote(message)),
                Err(RoundTripError::Io(e)) => {
                    self.drop_connection(&mut inner);
                    if self.aborted.load(Ordering::SeqCst) {
                        return Err(ChildError::Aborted);
                    }
                    if respawns_left == 0 {
                        return Err(ChildError::Transport(format!("{}", e)));
                    }
                    respawns_left -= 1;
                    tracing::warn!(
                        respawns_left,
                        "child pipe broke mid-call, respawning: {}",
                        e
                    );
                }
            }
        }
    }

    /// Kill the host (process group and all) and fail any in-flight call.
    /// Idempotent; the next `call` after an abort keeps failing until
    /// `reset_abort`.
    pub fn abort(&self) {
        self.aborted.store(true, Ordering::SeqCst);
        if let Some(mut guard) = self.live_guard.lock().unwrap().take() {
            guard.terminate();
        }
    }

    /// Allow calls again after an abort; the next call respawns the host.
    pub fn reset_abort(&self) {
        self.aborted.store(false, Ordering::SeqCst);
    }

    /// Copy of the mirrored object state.
    pub fn state(&self) -> S
    where
        S: Clone,
    {
        self.inner.lock().unwrap().state.clone()
    }

    fn connect(&self) -> std::io::Result<Pipes> {
        let Connection {
            reader,
            writer,
            guard,
        } = self.transport.connect()?;
        *self.live_guard.lock().unwrap() = Some(guard);
        Ok(Pipes {
            reader: BufReader::new(reader),
            writer,
        })
    }

    fn drop_connection(&self, inner: &mut ClientInner<S>) {
        inner.pipes = None;
        if let Some(mut guard) = self.live_guard.lock().unwrap().take() {
            guard.terminate();
        }
    }

    fn round_trip(
        &self,
        inner: &mut ClientInner<S>,
        call: S::Call,
    ) -> Result<S::Value, RoundTripError> {
        // Serialize the request against the current state without moving it.
        let pipes = {
            let pipes = inner.pipes.as_mut().expect("connected");
            let request = RequestRef {
                state: &inner.state,
                call: &call,
            };
            write_frame(&mut pipes.writer, &request).map_err(io_from_anyhow)?;
            &mut *pipes
        };
        loop {
            let reply: Reply<S::Value, S, S::Event> =
                read_frame(&mut pipes.reader).map_err(RoundTripError::Io)?;
            match reply {
                Reply::Return { value, state } => {
                    inner.state = state;
                    return Ok(value);
                }
                Reply::Fault { message } => return Err(RoundTripError::Fault(message)),
                Reply::Log {
                    target,
                    level,
                    message,
                } => emit_child_log(&target, level, &message),
                Reply::Event { event } => (self.on_event)(&event),
            }
        }
    }
}

/// Borrowing twin of `proto::Request` so a call does not clone the state.
#[derive(serde::Serialize)]
struct RequestRef<'a, C, S> {
    state: &'a S,
    call: &'a C,
}

enum RoundTripError {
    Io(std::io::Error),
    Fault(String),
}

fn io_from_anyhow(e: anyhow::Error) -> RoundTripError {
    match e.downcast::<std::io::Error>() {
        Ok(io) => RoundTripError::Io(io),
        Err(other) => RoundTripError::Io(std::io::Error::new(
            std::io::ErrorKind::Other,
            format!("{:#}", other),
        )),
    }
}

/// Re-emit a child log record in the parent's pipeline. The original logger
/// name rides along as a field since tracing targets are static.
fn emit_child_log(target: &str, level: LogLevel, message: &str) {
    match level {
        LogLevel::Error => tracing::error!(child_target = %target, "{}", message),
        LogLevel::Warn => tracing::warn!(child_target = %target, "{}", message),
        LogLevel::Info => tracing::info!(child_target = %target, "{}", message),
        LogLevel::Debug => tracing::debug!(child_target = %target, "{}", message),
        LogLevel::Trace => tracing::trace!(child_target = %target, "{}", message),
    }
}
