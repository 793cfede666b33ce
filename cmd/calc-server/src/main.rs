//! Demo server: listens on the given address and serves Calc.Add.
//!
//! Usage: calc-server [listen_addr]   (default 127.0.0.1:12345)

use std::sync::Arc;

use binrpc::{Dispatcher, LogPublisher, MethodDef, RpcConfig, RpcService, RpcStatus, TcpServer};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

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

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let mut config = RpcConfig::default();
    if let Some(addr) = std::env::args().nth(1) {
        match addr.parse() {
            Ok(addr) => config.listen_addr = addr,
            Err(err) => {
                error!(%err, %addr, "bad listen address");
                std::process::exit(2);
            }
        }
    } else {
        config.listen_addr = "127.0.0.1:12345".parse().expect("default address");
    }

    let dispatcher = Arc::new(Dispatcher::new(Arc::new(LogPublisher)));
    if let Err(err) = dispatcher.register(&CalcService, &config.listen_addr.to_string()) {
        error!(%err, "service registration failed");
        std::process::exit(1);
    }

    let server = match TcpServer::new(&config, dispatcher) {
        Ok(server) => server,
        Err(err) => {
            error!(%err, "server startup failed");
            std::process::exit(1);
        }
    };
    info!(addr = %server.local_addr(), "calc-server listening");
    server.start();
}
