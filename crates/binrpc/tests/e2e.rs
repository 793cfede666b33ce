//! Full-stack round trip: server, IO threads, client channel.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc, Arc};
use std::time::Duration;

use binrpc::{
    code, Dispatcher, LogPublisher, MethodDef, RpcChannel, RpcConfig, RpcController, RpcService,
    RpcStatus, ServerControl, StaticResolver, TcpServer,
};
use binrpc_net::IoThread;

struct CalcService;

impl RpcService for CalcService {
    fn name(&self) -> &str {
        "Calc"
    }

    fn methods(&self) -> Vec<MethodDef> {
        vec![MethodDef::raw("Add", |payload| {
            let text = std::str::from_utf8(payload)
                .map_err(|_| RpcStatus::new(400, "payload is not utf-8"))?;
            let (a, b) = text
                .split_once(',')
                .ok_or_else(|| RpcStatus::new(400, "expected \"a,b\""))?;
            let a: i64 = a.trim().parse().map_err(|_| RpcStatus::new(400, "bad lhs"))?;
            let b: i64 = b.trim().parse().map_err(|_| RpcStatus::new(400, "bad rhs"))?;
            Ok((a + b).to_string().into_bytes())
        })]
    }
}

fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .try_init();
}

/// Server built and run on its own thread (the loop is not Send); the
/// effective address and a stop control come back over a channel.
fn spawn_server(config: RpcConfig) -> (std::net::SocketAddr, ServerControl) {
    let (tx, rx) = mpsc::channel();
    std::thread::Builder::new()
        .name("e2e-server".into())
        .spawn(move || {
            let dispatcher = Arc::new(Dispatcher::new(Arc::new(LogPublisher)));
            dispatcher
                .register(&CalcService, &config.listen_addr.to_string())
                .expect("register");
            let server = TcpServer::new(&config, dispatcher).expect("server");
            tx.send((server.local_addr(), server.control())).unwrap();
            server.start();
        })
        .unwrap();
    rx.recv().expect("server startup")
}

fn call(
    channel: &RpcChannel,
    config: &RpcConfig,
    method: &str,
    payload: &[u8],
    msg_id: &str,
) -> Result<binrpc::RpcMessage, RpcStatus> {
    let controller = Arc::new(RpcController::new(config.call_timeout, config.max_retry));
    let (tx, rx) = mpsc::channel();
    channel.call(method, payload.to_vec(), msg_id, controller, move |result| {
        let _ = tx.send(result);
    });
    rx.recv_timeout(Duration::from_secs(5)).expect("call outcome")
}

#[test]
fn calc_add_round_trip() {
    init_tracing();
    let config = RpcConfig::default();
    let (addr, control) = spawn_server(config.clone());

    let client_loop = IoThread::start("e2e-client").unwrap();
    let channel = RpcChannel::new(
        client_loop.handle(),
        addr.to_string(),
        Arc::new(StaticResolver),
        &config,
    );

    let rsp = call(&channel, &config, "Calc.Add", b"2,3", "msg-0001").expect("response");
    assert_eq!(rsp.payload, b"5");
    assert_eq!(rsp.msg_id, "msg-0001");
    assert_eq!(rsp.method, "Calc.Add");
    assert_eq!(rsp.err_code, 0);

    client_loop.stop();
    control.stop();
}

#[test]
fn unknown_method_comes_back_as_error_frame() {
    init_tracing();
    let config = RpcConfig::default();
    let (addr, control) = spawn_server(config.clone());

    let client_loop = IoThread::start("e2e-client-err").unwrap();
    let channel = RpcChannel::new(
        client_loop.handle(),
        addr.to_string(),
        Arc::new(StaticResolver),
        &config,
    );

    let status = call(&channel, &config, "Calc.Sub", b"9,4", "msg-0002").expect_err("error status");
    assert_eq!(status.code, code::METHOD_NOT_FOUND);

    client_loop.stop();
    control.stop();
}

#[test]
fn sequential_calls_keep_msg_ids_straight() {
    init_tracing();
    let config = RpcConfig::default();
    let (addr, control) = spawn_server(config.clone());

    let client_loop = IoThread::start("e2e-client-seq").unwrap();
    let channel = RpcChannel::new(
        client_loop.handle(),
        addr.to_string(),
        Arc::new(StaticResolver),
        &config,
    );

    let counter = AtomicUsize::new(0);
    for (payload, expect) in [("1,1", "2"), ("10,20", "30"), ("-4,4", "0")] {
        let id = format!("msg-{}", counter.fetch_add(1, Ordering::Relaxed));
        let rsp = call(&channel, &config, "Calc.Add", payload.as_bytes(), &id).expect("response");
        assert_eq!(rsp.msg_id, id);
        assert_eq!(rsp.payload, expect.as_bytes());
    }

    client_loop.stop();
    control.stop();
}

#[test]
fn silent_peer_times_out_and_connection_is_torn_down() {
    init_tracing();
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();

    // Peer that accepts, swallows the request without answering, then
    // watches for the client's close.
    let peer = std::thread::spawn(move || {
        use std::io::Read;
        let (mut stream, _) = listener.accept().unwrap();
        stream
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        let codec = binrpc::FrameCodec::new();
        let mut in_buf = binrpc::Buffer::new(256);
        let mut raw = [0u8; 1024];
        let request = loop {
            let n = stream.read(&mut raw).unwrap();
            assert!(n > 0, "peer saw EOF before a full request");
            in_buf.append(&raw[..n]);
            let (mut msgs, _) = codec.decode(&mut in_buf);
            if !msgs.is_empty() {
                break msgs.remove(0);
            }
        };
        let peer_closed = matches!(stream.read(&mut raw), Ok(0));
        (request, peer_closed)
    });

    let config = RpcConfig {
        call_timeout: Duration::from_millis(300),
        ..RpcConfig::default()
    };
    let client_loop = IoThread::start("e2e-silent").unwrap();
    let channel = RpcChannel::new(
        client_loop.handle(),
        addr.to_string(),
        Arc::new(StaticResolver),
        &config,
    );

    let status = call(&channel, &config, "Calc.Add", b"1,1", "msg-0100").expect_err("timeout");
    assert_eq!(status.code, code::CALL_TIMEOUT);

    let (request, peer_closed) = peer.join().unwrap();
    assert_eq!(request.method, "Calc.Add");
    assert_eq!(request.msg_id, "msg-0100");
    assert!(peer_closed, "timed-out call left its connection open");

    client_loop.stop();
}

#[test]
fn response_wins_and_a_late_timeout_stays_quiet() {
    init_tracing();
    let config = RpcConfig {
        call_timeout: Duration::from_millis(400),
        ..RpcConfig::default()
    };
    let (addr, control) = spawn_server(config.clone());

    let client_loop = IoThread::start("e2e-client-late").unwrap();
    let channel = RpcChannel::new(
        client_loop.handle(),
        addr.to_string(),
        Arc::new(StaticResolver),
        &config,
    );

    let controller = Arc::new(RpcController::new(config.call_timeout, config.max_retry));
    let (tx, rx) = mpsc::channel();
    channel.call(
        "Calc.Add",
        b"3,4".to_vec(),
        "msg-0200",
        controller,
        move |result| {
            let _ = tx.send(result);
        },
    );
    let rsp = rx
        .recv_timeout(Duration::from_secs(5))
        .expect("first completion")
        .expect("response");
    assert_eq!(rsp.payload, b"7");

    // The timeout timer still fires after the response; the finished
    // flag must swallow it instead of completing the call twice.
    assert!(rx.recv_timeout(Duration::from_millis(700)).is_err());

    client_loop.stop();
    control.stop();
}

#[test]
fn connect_to_dead_port_fails_with_connect_error() {
    init_tracing();
    let config = RpcConfig::default();

    // Port with nothing listening.
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let client_loop = IoThread::start("e2e-client-dead").unwrap();
    let channel = RpcChannel::new(
        client_loop.handle(),
        addr.to_string(),
        Arc::new(StaticResolver),
        &config,
    );

    let status = call(&channel, &config, "Calc.Add", b"1,2", "msg-0009").expect_err("failure");
    assert!(
        status.code == code::FAILED_CONNECT || status.code == code::CALL_TIMEOUT,
        "unexpected status {status:?}"
    );

    client_loop.stop();
}
