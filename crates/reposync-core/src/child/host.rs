//! Child-side serve loop: read a request, rebuild the object from its
//! mirrored state, dispatch, send the updated state back.

use anyhow::Result;
use std::io::{Read, Write};
use std::sync::{Arc, Mutex};

use super::proto::{read_frame, write_frame, LogLevel, Reply, Request};
use super::RemoteObject;

/// Handle a child-side call hands to the parent mid-call: log records and
/// callback events, written ahead of the terminal reply frame.
pub struct Outbox<E> {
    writer: Arc<Mutex<Box<dyn Write + Send>>>,
    _marker: std::marker::PhantomData<fn(E)>,
}

impl<E: serde::Serialize> Outbox<E> {
    fn new(writer: Arc<Mutex<Box<dyn Write + Send>>>) -> Self {
        Outbox {
            writer,
            _marker: std::marker::PhantomData,
        }
    }

    /// Forward a log record to the parent's logging pipeline. Write failures
    /// are swallowed; the terminal reply will surface the broken pipe.
    pub fn log(&self, level: LogLevel, target: &str, message: impl Into<String>) {
        let frame: Reply<(), (), E> = Reply::Log {
            target: target.to_string(),
            level,
            message: message.into(),
        };
        let mut writer = self.writer.lock().unwrap();
        let _ = write_frame(&mut **writer, &frame);
    }

    /// Invoke the parent-side event hook (a progress callback, typically).
    pub fn event(&self, event: E) {
        let frame: Reply<(), (), E> = Reply::Event { event };
        let mut writer = self.writer.lock().unwrap();
        let _ = write_frame(&mut **writer, &frame);
    }
}

/// Serve requests until the parent closes the pipe.
///
/// Each request is self-contained: the object is rebuilt from the request's
/// state, so the loop itself holds nothing between calls.
pub fn serve<S: RemoteObject>(
    mut reader: Box<dyn Read + Send>,
    writer: Box<dyn Write + Send>,
) -> Result<()> {
    let writer = Arc::new(Mutex::new(writer));
    loop {
        let request: Request<S::Call, S> = match read_frame(&mut reader) {
            Ok(r) => r,
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::BrokenPipe => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        let Request { mut state, call } = request;
        let outbox = Outbox::new(Arc::clone(&writer));
        let reply: Reply<S::Value, S, S::Event> = match state.dispatch(call, &outbox) {
            Ok(value) => Reply::Return { value, state },
            Err(message) => Reply::Fault { message },
        };
        let mut w = writer.lock().unwrap();
        write_frame(&mut **w, &reply)?;
    }
}

/// Serve over this process's stdin/stdout; the entry point a host binary
/// calls from its hidden subcommand.
pub fn serve_stdio<S: RemoteObject>() -> Result<()> {
    serve::<S>(Box::new(std::io::stdin()), Box::new(std::io::stdout()))
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};
    use std::os::unix::net::UnixStream;

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct Counter {
        count: u64,
    }

    #[derive(Serialize, Deserialize)]
    enum CounterCall {
        Add(u64),
        Fail,
    }

    impl RemoteObject for Counter {
        type Call = CounterCall;
        type Value = u64;
        type Event = String;

        fn dispatch(&mut self, call: CounterCall, outbox: &Outbox<String>) -> Result<u64, String> {
            match call {
                CounterCall::Add(n) => {
                    self.count += n;
                    outbox.log(LogLevel::Debug, "counter", format!("count is {}", self.count));
                    outbox.event(format!("added {}", n));
                    Ok(self.count)
                }
                CounterCall::Fail => Err("counter asked to fail".into()),
            }
        }
    }

    fn run_serve() -> UnixStream {
        let (parent, child) = UnixStream::pair().unwrap();
        let reader = child.try_clone().unwrap();
        std::thread::spawn(move || {
            let _ = serve::<Counter>(Box::new(reader), Box::new(child));
        });
        parent
    }

    #[test]
    fn dispatch_returns_value_and_updated_state() {
        let mut stream = run_serve();
        let mut reader = stream.try_clone().unwrap();
        write_frame(
            &mut stream,
            &Request {
                state: Counter { count: 10 },
                call: CounterCall::Add(5),
            },
        )
        .unwrap();

        let mut saw_log = false;
        let mut saw_event = false;
        loop {
            match read_frame::<Reply<u64, Counter, String>>(&mut reader).unwrap() {
                Reply::Log { message, .. } => {
                    assert!(message.contains("15"));
                    saw_log = true;
                }
                Reply::Event { event } => {
                    assert_eq!(event, "added 5");
                    saw_event = true;
                }
                Reply::Return { value, state } => {
                    assert_eq!(value, 15);
                    assert_eq!(state.count, 15);
                    break;
                }
                Reply::Fault { message } => panic!("fault: {}", message),
            }
        }
        assert!(saw_log && saw_event);
    }

    #[test]
    fn dispatch_error_becomes_fault() {
        let mut stream = run_serve();
        let mut reader = stream.try_clone().unwrap();
        write_frame(
            &mut stream,
            &Request {
                state: Counter { count: 0 },
                call: CounterCall::Fail,
            },
        )
        .unwrap();
        match read_frame::<Reply<u64, Counter, String>>(&mut reader).unwrap() {
            Reply::Fault { message } => assert!(message.contains("asked to fail")),
            other => panic!("unexpected reply: {:?}", other),
        }
    }
}
