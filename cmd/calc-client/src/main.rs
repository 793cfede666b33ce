//! Demo client: calls Calc.Add on a running calc-server.
//!
//! Usage: calc-client [server_addr] [a,b]
//! Defaults: 127.0.0.1:12345 and "2,3".

use std::sync::{mpsc, Arc};
use std::time::Duration;

use binrpc::{RpcChannel, RpcConfig, RpcController, StaticResolver};
use binrpc_net::IoThread;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let mut args = std::env::args().skip(1);
    let target = args.next().unwrap_or_else(|| "127.0.0.1:12345".to_string());
    let payload = args.next().unwrap_or_else(|| "2,3".to_string());

    let config = RpcConfig::default();
    let io = match IoThread::start("calc-client-io") {
        Ok(io) => io,
        Err(err) => {
            error!(%err, "io thread startup failed");
            std::process::exit(1);
        }
    };

    let channel = RpcChannel::new(io.handle(), target, Arc::new(StaticResolver), &config);
    let controller = Arc::new(RpcController::new(config.call_timeout, config.max_retry));

    let (tx, rx) = mpsc::channel();
    channel.call(
        "Calc.Add",
        payload.clone().into_bytes(),
        "calc-client-1",
        controller,
        move |result| {
            let _ = tx.send(result);
        },
    );

    match rx.recv_timeout(Duration::from_secs(5)) {
        Ok(Ok(rsp)) => {
            let sum = String::from_utf8_lossy(&rsp.payload).into_owned();
            info!(input = %payload, %sum, "Calc.Add succeeded");
            println!("{payload} = {sum}");
        }
        Ok(Err(status)) => {
            error!(code = status.code, info = %status.info, "call failed");
            std::process::exit(1);
        }
        Err(_) => {
            error!("no response within deadline");
            std::process::exit(1);
        }
    }
    io.stop();
}
