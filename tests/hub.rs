//! Hub event-loop integration tests.
//!
//! # Running with tracing
//!
//! Use TEST_LOG environment variable to control tracing verbosity (like -v, -vv, -vvv):
//!
//! ```bash
//! # Info level (equivalent to -v)
//! TEST_LOG=1 cargo test --test hub -- --nocapture
//!
//! # Debug level (equivalent to -vv)
//! TEST_LOG=2 cargo test --test hub -- --nocapture
//!
//! # Trace level (equivalent to -vvv)
//! TEST_LOG=3 cargo test --test hub -- --nocapture
//! ```

use std::io::{Read, Write};
use std::net::TcpStream;
use std::sync::{Arc, Mutex, Once};
use std::thread;
use std::time::{Duration, Instant};

use streamhub::{ErrorKind, Hub, HubContext, HubHandler, NoopHandler, Stream};

static INIT: Once = Once::new();

// ============================================================================
// Tracing Initialization
// ============================================================================

/// Initialize tracing based on TEST_LOG environment variable
///
/// Verbosity levels (like -v, -vv, -vvv):
/// - TEST_LOG=1: Info level
/// - TEST_LOG=2: Debug level
/// - TEST_LOG=3: Trace level
///
/// Example: TEST_LOG=2 cargo test --test hub -- --nocapture
fn init_tracing() {
    INIT.call_once(|| {
        if let Ok(level_str) = std::env::var("TEST_LOG") {
            let verbosity = level_str.parse::<u8>().unwrap_or(0);

            if verbosity > 0 {
                let level = match verbosity {
                    1 => "info",
                    2 => "debug",
                    _ => "trace", // 3 or more
                };

                let filter = format!("streamhub={}", level);
                let _ = tracing_subscriber::fmt()
                    .with_env_filter(tracing_subscriber::EnvFilter::new(filter))
                    .with_target(true)
                    .with_writer(std::io::stderr)
                    .with_test_writer()
                    .try_init();
            }
        }
    });
}

// ============================================================================
// Test Harness
// ============================================================================

/// What the instrumented handlers observed, shared with the test body.
#[derive(Debug, Default)]
struct Record {
    created: Vec<usize>,
    /// Target name and abnormal flag of every connection_closed invocation.
    closed: Vec<(String, bool)>,
    data_calls: usize,
    rejected_closes: Vec<ErrorKind>,
}

type Shared = Arc<Mutex<Record>>;

fn make_hub(handler: Box<dyn HubHandler>) -> Hub {
    init_tracing();
    let config = config::Config::builder().build().expect("empty config");
    Hub::new(&config, handler).expect("create hub")
}

fn listen_local(hub: &mut Hub) -> (usize, std::net::SocketAddr) {
    let id = hub
        .connect("tcpin:port=0;address=127.0.0.1")
        .expect("listen on an ephemeral port");
    let addr = hub.local_addr(id).expect("listener has a bound address");
    (id, addr)
}

/// Steps the hub with a short timeout until the condition holds.
fn drive(hub: &mut Hub, mut done: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !done() {
        assert!(Instant::now() < deadline, "timed out driving the hub");
        assert!(hub.step(Some(Duration::from_millis(20))).expect("step"));
    }
}

/// Echoes every incoming byte back, one byte per callback, and records
/// everything it sees.
struct EchoHandler {
    shared: Shared,
}

impl HubHandler for EchoHandler {
    fn connection_created(&mut self, _ctx: &mut HubContext<'_>, id: usize) {
        self.shared.lock().unwrap().created.push(id);
    }

    fn incoming_data(&mut self, ctx: &mut HubContext<'_>, id: usize) {
        self.shared.lock().unwrap().data_calls += 1;
        let stream = ctx.stream(id).expect("reported stream is live");
        let mut byte = [0u8; 1];
        stream.read(&mut byte).expect("read the available byte");
        stream.write(&byte).expect("echo the byte");
    }

    fn connection_closed(&mut self, _ctx: &mut HubContext<'_>, stream: &dyn Stream, abnormal: bool) {
        self.shared
            .lock()
            .unwrap()
            .closed
            .push((stream.target_name().to_owned(), abnormal));
    }
}

// ============================================================================
// Timeout Semantics
// ============================================================================

#[test]
fn step_zero_never_blocks() {
    let mut hub = make_hub(Box::new(NoopHandler));
    listen_local(&mut hub);

    let start = Instant::now();
    for _ in 0..10 {
        assert!(hub.step(Some(Duration::ZERO)).expect("non-blocking step"));
    }
    assert!(
        start.elapsed() < Duration::from_millis(100),
        "step(0) must not block"
    );
}

#[test]
fn bounded_step_returns_true_on_timeout() {
    let mut hub = make_hub(Box::new(NoopHandler));
    listen_local(&mut hub);

    // No activity: the timeout elapsing is not a stop.
    assert!(hub.step(Some(Duration::from_millis(10))).expect("step"));
}

// ============================================================================
// Termination
// ============================================================================

#[test]
fn cross_thread_stop_interrupts_a_blocked_step() {
    let mut hub = make_hub(Box::new(NoopHandler));
    let handle = hub.handle();

    let stopper = thread::spawn(move || {
        thread::sleep(Duration::from_millis(100));
        handle.stop();
    });

    let start = Instant::now();
    let alive = hub.step(None).expect("blocked step");
    assert!(!alive, "stop must be reported as termination");
    assert!(
        start.elapsed() < Duration::from_secs(2),
        "stop must interrupt the wait through the waker, not a timeout"
    );
    stopper.join().expect("stopper thread");
}

#[test]
fn stop_request_terminates_exactly_one_step() {
    let mut hub = make_hub(Box::new(NoopHandler));
    listen_local(&mut hub);

    hub.stop();
    assert!(!hub.step(Some(Duration::ZERO)).expect("stopped step"));
    // The request was consumed; the hub keeps running.
    assert!(hub.step(Some(Duration::ZERO)).expect("next step"));
}

#[test]
fn stop_from_inside_a_callback() {
    struct StopOnData {
        shared: Shared,
    }

    impl HubHandler for StopOnData {
        fn incoming_data(&mut self, ctx: &mut HubContext<'_>, id: usize) {
            self.shared.lock().unwrap().data_calls += 1;
            let stream = ctx.stream(id).expect("reported stream is live");
            let mut byte = [0u8; 1];
            stream.read(&mut byte).expect("read the available byte");
            ctx.stop();
        }
    }

    let shared = Shared::default();
    let mut hub = make_hub(Box::new(StopOnData {
        shared: shared.clone(),
    }));
    let (_listener_id, addr) = listen_local(&mut hub);

    let client = thread::spawn(move || {
        let mut socket = TcpStream::connect(addr).expect("connect");
        socket.write_all(b"z").expect("send");
        // Hold the connection open until the server side goes away.
        let mut byte = [0u8; 1];
        let _ = socket.read(&mut byte);
    });

    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        assert!(Instant::now() < deadline, "timed out waiting for stop");
        match hub.step(Some(Duration::from_millis(20))).expect("step") {
            true => continue,
            false => break,
        }
    }
    assert_eq!(shared.lock().unwrap().data_calls, 1);

    drop(hub);
    client.join().expect("client thread");
}

// ============================================================================
// Accept, Echo, Close
// ============================================================================

#[test]
fn accept_echo_and_eof_close() {
    let shared = Shared::default();
    let mut hub = make_hub(Box::new(EchoHandler {
        shared: shared.clone(),
    }));
    let (_listener_id, addr) = listen_local(&mut hub);

    let client = thread::spawn(move || {
        let mut socket = TcpStream::connect(addr).expect("connect");
        socket.write_all(b"ping").expect("send");
        let mut echo = [0u8; 4];
        socket.read_exact(&mut echo).expect("receive echo");
        assert_eq!(&echo, b"ping");
        // Dropping the socket gives the server an orderly end of input.
    });

    drive(&mut hub, || shared.lock().unwrap().closed.len() == 1);
    client.join().expect("client thread");

    let record = shared.lock().unwrap();
    assert_eq!(record.created.len(), 1, "exactly one accept");
    assert_eq!(record.data_calls, 4, "one callback per echoed byte");

    let (target, abnormal) = &record.closed[0];
    assert!(
        target.starts_with("tcp:host=127.0.0.1;port="),
        "accepted streams carry a peer-derived target name, got {target}"
    );
    assert!(!abnormal, "end of input is an ordinary close");

    let accepted_id = record.created[0];
    drop(record);
    assert!(
        hub.stream(accepted_id).is_none(),
        "a closed stream must be absent from the hub"
    );

    // The close was reported exactly once; further cycles stay quiet.
    for _ in 0..3 {
        assert!(hub.step(Some(Duration::from_millis(10))).expect("step"));
    }
    assert_eq!(shared.lock().unwrap().closed.len(), 1);
}

#[test]
fn queued_connections_are_both_accepted() {
    let shared = Shared::default();
    let mut hub = make_hub(Box::new(EchoHandler {
        shared: shared.clone(),
    }));
    let (_listener_id, addr) = listen_local(&mut hub);

    // Both connections sit in the accept queue before the first step;
    // they are taken one per cycle, but neither may be left behind.
    let first = TcpStream::connect(addr).expect("first connect");
    let second = TcpStream::connect(addr).expect("second connect");

    drive(&mut hub, || shared.lock().unwrap().created.len() == 2);

    let record = shared.lock().unwrap();
    assert_eq!(record.created.len(), 2);
    drop(record);

    drop(first);
    drop(second);
    drive(&mut hub, || shared.lock().unwrap().closed.len() == 2);
}

#[test]
fn unconsumed_bytes_report_ready_again() {
    let shared = Shared::default();
    let mut hub = make_hub(Box::new(EchoHandler {
        shared: shared.clone(),
    }));
    let (_listener_id, addr) = listen_local(&mut hub);

    // A single burst of four bytes; the handler consumes one per
    // callback, so the remaining bytes must keep reporting ready.
    let mut socket = TcpStream::connect(addr).expect("connect");
    socket.write_all(b"wxyz").expect("send");

    drive(&mut hub, || shared.lock().unwrap().data_calls == 4);

    let mut echo = [0u8; 4];
    socket.read_exact(&mut echo).expect("receive echo");
    assert_eq!(&echo, b"wxyz");
}

#[test]
fn close_stream_never_reports_connection_closed() {
    let shared = Shared::default();
    let mut hub = make_hub(Box::new(EchoHandler {
        shared: shared.clone(),
    }));
    let (_listener_id, addr) = listen_local(&mut hub);

    let client = thread::spawn(move || {
        let socket = TcpStream::connect(addr).expect("connect");
        // Wait for the server to close us.
        let mut byte = [0u8; 1];
        let got = (&socket).read(&mut byte).expect("read until close");
        assert_eq!(got, 0, "server must close the connection");
    });

    drive(&mut hub, || shared.lock().unwrap().created.len() == 1);
    let accepted_id = shared.lock().unwrap().created[0];

    hub.close_stream(accepted_id).expect("close accepted stream");
    client.join().expect("client thread");

    for _ in 0..3 {
        assert!(hub.step(Some(Duration::from_millis(10))).expect("step"));
    }
    assert!(
        shared.lock().unwrap().closed.is_empty(),
        "close_stream must not invoke connection_closed"
    );

    // A second close of the same id is a rejected double close.
    let err = hub.close_stream(accepted_id).expect_err("double close");
    assert_eq!(err.kind(), ErrorKind::InvalidOperation);
}

#[test]
fn closing_the_new_stream_inside_connection_created() {
    struct CloseOnCreate {
        shared: Shared,
    }

    impl HubHandler for CloseOnCreate {
        fn connection_created(&mut self, ctx: &mut HubContext<'_>, id: usize) {
            ctx.close_stream(id).expect("close the accepted stream");
            self.shared.lock().unwrap().created.push(id);
        }

        fn connection_closed(
            &mut self,
            _ctx: &mut HubContext<'_>,
            stream: &dyn Stream,
            abnormal: bool,
        ) {
            self.shared
                .lock()
                .unwrap()
                .closed
                .push((stream.target_name().to_owned(), abnormal));
        }
    }

    let shared = Shared::default();
    let mut hub = make_hub(Box::new(CloseOnCreate {
        shared: shared.clone(),
    }));
    let (_listener_id, addr) = listen_local(&mut hub);

    let client = thread::spawn(move || {
        let socket = TcpStream::connect(addr).expect("connect");
        let mut byte = [0u8; 1];
        let got = (&socket).read(&mut byte).expect("read until close");
        assert_eq!(got, 0, "server must close immediately");
    });

    drive(&mut hub, || shared.lock().unwrap().created.len() == 1);
    client.join().expect("client thread");

    // The in-callback close is honored without a close report and without
    // corrupting the hub.
    for _ in 0..3 {
        assert!(hub.step(Some(Duration::from_millis(10))).expect("step"));
    }
    let record = shared.lock().unwrap();
    assert!(record.closed.is_empty());
    let accepted_id = record.created[0];
    drop(record);
    assert!(hub.stream(accepted_id).is_none());
}

#[test]
fn close_during_connection_closed_is_rejected() {
    struct CloseInClosed {
        shared: Shared,
    }

    impl HubHandler for CloseInClosed {
        fn connection_created(&mut self, _ctx: &mut HubContext<'_>, id: usize) {
            self.shared.lock().unwrap().created.push(id);
        }

        fn connection_closed(
            &mut self,
            ctx: &mut HubContext<'_>,
            stream: &dyn Stream,
            abnormal: bool,
        ) {
            let mut record = self.shared.lock().unwrap();
            let id = *record.created.last().expect("a stream was created");
            // The reported stream is already detached; closing it again
            // must be rejected, not corrupt the hub.
            let err = ctx.close_stream(id).expect_err("stream is detached");
            record.rejected_closes.push(err.kind());
            record
                .closed
                .push((stream.target_name().to_owned(), abnormal));
        }
    }

    let shared = Shared::default();
    let mut hub = make_hub(Box::new(CloseInClosed {
        shared: shared.clone(),
    }));
    let (_listener_id, addr) = listen_local(&mut hub);

    let client = thread::spawn(move || {
        // Connect and immediately hang up.
        drop(TcpStream::connect(addr).expect("connect"));
    });

    drive(&mut hub, || shared.lock().unwrap().closed.len() == 1);
    client.join().expect("client thread");

    let record = shared.lock().unwrap();
    assert_eq!(record.rejected_closes, vec![ErrorKind::InvalidOperation]);
    drop(record);

    // The hub survived the contract-violation attempt.
    assert!(hub.step(Some(Duration::ZERO)).expect("step"));
}

// ============================================================================
// No-Read Guard
// ============================================================================

#[test]
fn unconsumed_incoming_data_trips_the_guard() {
    struct IgnoresData {
        shared: Shared,
    }

    impl HubHandler for IgnoresData {
        fn incoming_data(&mut self, _ctx: &mut HubContext<'_>, _id: usize) {
            // Deliberately consumes nothing.
            self.shared.lock().unwrap().data_calls += 1;
        }
    }

    let shared = Shared::default();
    let mut hub = make_hub(Box::new(IgnoresData {
        shared: shared.clone(),
    }));
    let (_listener_id, addr) = listen_local(&mut hub);

    let client = thread::spawn(move || {
        let mut socket = TcpStream::connect(addr).expect("connect");
        socket.write_all(b"x").expect("send");
        // Hold the connection open so the pending byte keeps reporting.
        let mut byte = [0u8; 1];
        let _ = socket.read(&mut byte);
    });

    drive(&mut hub, || shared.lock().unwrap().data_calls == 1);

    let deadline = Instant::now() + Duration::from_secs(5);
    let err = loop {
        assert!(Instant::now() < deadline, "guard never tripped");
        match hub.step(Some(Duration::from_millis(20))) {
            Ok(true) => continue,
            Ok(false) => panic!("unexpected stop"),
            Err(err) => break err,
        }
    };
    assert_eq!(err.kind(), ErrorKind::PreviousIncomingDataNotRead);
    assert!(err.stream().is_some(), "the guard names the offending stream");
    // The callback ran exactly once; the engine refused to retry it.
    assert_eq!(shared.lock().unwrap().data_calls, 1);

    drop(hub);
    client.join().expect("client thread");
}

// ============================================================================
// Client-Style Use
// ============================================================================

#[test]
fn synchronous_io_outside_the_loop() {
    let shared = Shared::default();
    let mut server = make_hub(Box::new(EchoHandler {
        shared: shared.clone(),
    }));
    let (_listener_id, addr) = listen_local(&mut server);

    let mut client = make_hub(Box::new(NoopHandler));
    let id = client
        .connect(&format!("tcp:host={};port={}", addr.ip(), addr.port()))
        .expect("connect to the echo server");

    let stream = client.stream(id).expect("stream is live");
    stream.write(b"ab").expect("send");

    // Service the server until both bytes have been echoed.
    drive(&mut server, || shared.lock().unwrap().data_calls == 2);

    let stream = client.stream(id).expect("stream is live");
    let mut echo = [0u8; 2];
    stream.read(&mut echo).expect("receive echo");
    assert_eq!(&echo, b"ab");
}
