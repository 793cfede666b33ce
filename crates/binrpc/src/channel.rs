//! Client call orchestration
//!
//! A channel targets one logical peer. Each call posts its whole
//! sequence to the owning loop: resolve, connect (with bounded
//! retries), write the request, wait for the matching msg_id. A
//! timeout timer is scheduled beside the call and the controller's
//! finished flag arbitrates whichever fires first.

use std::net::SocketAddr;
use std::rc::Rc;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use binrpc_core::error::code;
use binrpc_core::{RpcConfig, RpcMessage};
use binrpc_net::{EventLoop, LoopHandle};
use tracing::{debug, warn};

use crate::client::TcpClient;
use crate::connection::{ConnCloseHandle, ConnState};
use crate::controller::RpcController;
use crate::resolver::AddressResolver;
use crate::service::RpcStatus;

type CallDone = Box<dyn FnOnce(Result<RpcMessage, RpcStatus>) + Send>;

pub struct RpcChannel {
    handle: LoopHandle,
    target: String,
    resolver: Arc<dyn AddressResolver>,
    buffer_size: usize,
    connect_timeout: Duration,
}

impl RpcChannel {
    pub fn new(
        handle: LoopHandle,
        target: impl Into<String>,
        resolver: Arc<dyn AddressResolver>,
        config: &RpcConfig,
    ) -> Self {
        RpcChannel {
            handle,
            target: target.into(),
            resolver,
            buffer_size: config.buffer_size,
            connect_timeout: config.connect_timeout,
        }
    }

    /// Issue one call. `done` fires exactly once, with the response or
    /// with the status of whatever failed first (resolve, connect
    /// after retries, timeout, or an error frame).
    pub fn call(
        &self,
        method: &str,
        payload: Vec<u8>,
        msg_id: &str,
        controller: Arc<RpcController>,
        done: impl FnOnce(Result<RpcMessage, RpcStatus>) + Send + 'static,
    ) {
        controller.set_msg_id(msg_id);
        let complete: Arc<Mutex<Option<CallDone>>> = Arc::new(Mutex::new(Some(Box::new(done))));
        let teardown: Arc<Mutex<Option<ConnCloseHandle>>> = Arc::new(Mutex::new(None));

        {
            let ctrl = controller.clone();
            let complete = complete.clone();
            let teardown = teardown.clone();
            self.handle
                .schedule(controller.timeout(), false, move || {
                    if !ctrl.finish() {
                        return;
                    }
                    warn!(msg_id = %ctrl.msg_id(), "call timed out");
                    // The peer never answered; nothing else will close
                    // this connection, so do it here.
                    if let Some(conn) = teardown.lock().unwrap_or_else(|e| e.into_inner()).take()
                    {
                        conn.close();
                    }
                    ctrl.set_error(code::CALL_TIMEOUT, "call timeout");
                    if let Some(done) = take(&complete) {
                        done(Err(RpcStatus::new(code::CALL_TIMEOUT, "call timeout")));
                    }
                });
        }

        let tries_left = controller.max_retry();
        CallAttempt {
            handle: self.handle.clone(),
            target: self.target.clone(),
            resolver: self.resolver.clone(),
            buffer_size: self.buffer_size,
            connect_timeout: self.connect_timeout,
            method: method.to_string(),
            payload,
            msg_id: msg_id.to_string(),
            controller,
            complete,
            teardown,
            tries_left,
        }
        .launch();
    }
}

fn take(complete: &Arc<Mutex<Option<CallDone>>>) -> Option<CallDone> {
    complete.lock().unwrap_or_else(|e| e.into_inner()).take()
}

/// One connect-and-call attempt; failures respawn it while retries
/// remain.
struct CallAttempt {
    handle: LoopHandle,
    target: String,
    resolver: Arc<dyn AddressResolver>,
    buffer_size: usize,
    connect_timeout: Duration,
    method: String,
    payload: Vec<u8>,
    msg_id: String,
    controller: Arc<RpcController>,
    complete: Arc<Mutex<Option<CallDone>>>,
    teardown: Arc<Mutex<Option<ConnCloseHandle>>>,
    tries_left: u32,
}

impl CallAttempt {
    fn fail(&self, code: i32, info: String) {
        if !self.controller.finish() {
            return;
        }
        self.controller.set_error(code, info.clone());
        if let Some(done) = take(&self.complete) {
            done(Err(RpcStatus::new(code, info)));
        }
    }

    fn launch(self) {
        let Some(addr) = self.resolver.resolve(&self.target) else {
            warn!(target = %self.target, "address resolution failed");
            self.fail(
                code::FAILED_CONNECT,
                format!("cannot resolve {:?}", self.target),
            );
            return;
        };
        self.controller.set_peer_addr(Some(addr));
        let handle = self.handle.clone();
        handle.post(move |lp| self.run_on_loop(lp, addr));
    }

    fn run_on_loop(self, lp: &EventLoop, addr: SocketAddr) {
        if self.controller.is_finished() || self.controller.is_cancelled() {
            return;
        }
        let client = match TcpClient::new(lp, addr, self.buffer_size) {
            Ok(client) => Rc::new(client),
            Err(err) => {
                self.fail(code::FAILED_CONNECT, err.to_string());
                return;
            }
        };

        // A pending connect that never resolves would otherwise sit in
        // the loop forever; bound it and fail the call.
        {
            let pending = client.close_handle();
            let ctrl = self.controller.clone();
            let complete = self.complete.clone();
            lp.handle().schedule(self.connect_timeout, false, move || {
                if pending.state() != ConnState::NotConnected {
                    return;
                }
                pending.close();
                if !ctrl.finish() {
                    return;
                }
                warn!(msg_id = %ctrl.msg_id(), "connect timed out");
                ctrl.set_error(code::FAILED_CONNECT, "connect timeout");
                if let Some(done) = take(&complete) {
                    done(Err(RpcStatus::new(code::FAILED_CONNECT, "connect timeout")));
                }
            });
        }

        let client2 = client.clone();
        client.connect(move |result| match result {
            Ok(()) => {
                // The call may have timed out while the connect was in
                // flight; the fresh connection must not outlive it.
                if self.controller.is_finished() || self.controller.is_cancelled() {
                    client2.close();
                    return;
                }
                self.send_and_await(&client2);
            }
            Err(err) => self.retry_or_fail(err.to_string()),
        });
    }

    fn send_and_await(self, client: &Rc<TcpClient>) {
        self.controller.set_local_addr(client.local_addr());
        // Hand the timeout path a way to reach this connection.
        *self.teardown.lock().unwrap_or_else(|e| e.into_inner()) = Some(client.close_handle());
        debug!(msg_id = %self.msg_id, method = %self.method, peer = %client.peer_addr(), "sending request");

        // Waiter first, so a fast response cannot slip past.
        let waiter = {
            let ctrl = self.controller.clone();
            let complete = self.complete.clone();
            let cb_client = client.clone();
            client.read_message(
                self.msg_id.clone(),
                Box::new(move |rsp| {
                    // Single-shot channel: done with this connection.
                    cb_client.shutdown();
                    if !ctrl.finish() {
                        return;
                    }
                    ctrl.set_error(rsp.err_code, rsp.err_info.clone());
                    let result = if rsp.err_code == 0 {
                        Ok(rsp)
                    } else {
                        Err(RpcStatus::new(rsp.err_code, rsp.err_info))
                    };
                    if let Some(done) = take(&complete) {
                        done(result);
                    }
                }),
            )
        };
        if let Err(err) = waiter {
            client.close();
            self.fail(code::FAILED_CONNECT, err.to_string());
            return;
        }

        let request = RpcMessage::request(self.msg_id.clone(), self.method.clone(), self.payload.clone());
        if let Err(err) = client.write_message(request, None) {
            client.close();
            self.fail(code::FAILED_CONNECT, err.to_string());
        }
    }

    fn retry_or_fail(mut self, err: String) {
        if self.tries_left > 0 && !self.controller.is_finished() {
            self.tries_left -= 1;
            warn!(err = %err, tries_left = self.tries_left, "connect failed, retrying");
            self.launch();
        } else {
            self.fail(code::FAILED_CONNECT, err);
        }
    }
}
