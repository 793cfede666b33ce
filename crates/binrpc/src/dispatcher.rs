//! Request dispatch
//!
//! Routes `Service.Method` names to registered handlers. Every path
//! out of [`Dispatcher::dispatch`] produces a reply, error paths
//! included, with the request's msg_id and method copied in before any
//! routing decision.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use tracing::{debug, info, warn};

use binrpc_core::error::code;
use binrpc_core::RpcMessage;

use crate::discovery::ServicePublisher;
use crate::error::RpcError;
use crate::service::{MethodDef, RpcService};

struct ServiceEntry {
    methods: Vec<MethodDef>,
    index: HashMap<String, usize>,
}

pub struct Dispatcher {
    services: RwLock<HashMap<String, ServiceEntry>>,
    publisher: Arc<dyn ServicePublisher>,
}

impl Dispatcher {
    pub fn new(publisher: Arc<dyn ServicePublisher>) -> Self {
        Dispatcher {
            services: RwLock::new(HashMap::new()),
            publisher,
        }
    }

    /// Register a service and publish each of its methods under
    /// `advertise_addr`.
    pub fn register(
        &self,
        service: &dyn RpcService,
        advertise_addr: &str,
    ) -> Result<(), RpcError> {
        let name = service.name().to_string();
        {
            let services = self.services.read().unwrap_or_else(|e| e.into_inner());
            if services.contains_key(&name) {
                return Err(RpcError::DuplicateService(name));
            }
        }

        let methods = service.methods();
        let mut index = HashMap::with_capacity(methods.len());
        for (i, m) in methods.iter().enumerate() {
            index.insert(m.name.clone(), i);
            self.publisher.publish(&name, &m.name, advertise_addr)?;
        }

        let mut services = self.services.write().unwrap_or_else(|e| e.into_inner());
        if services.contains_key(&name) {
            return Err(RpcError::DuplicateService(name));
        }
        info!(service = %name, methods = methods.len(), "service registered");
        services.insert(name, ServiceEntry { methods, index });
        Ok(())
    }

    /// Route `request` and hand the response to `reply`. The handler
    /// may complete synchronously or hold its `Done` for later; either
    /// way `reply` fires exactly once per request.
    pub fn dispatch(&self, request: &RpcMessage, reply: impl FnOnce(RpcMessage) + 'static) {
        let mut response = RpcMessage::response_for(request);

        let Some((service_name, method_name)) = split_full_name(&request.method) else {
            warn!(method = %request.method, "unparseable method name");
            response.set_error(code::PARSE_SERVICE_NAME, "parse service name error");
            reply(response);
            return;
        };

        let handler = {
            let services = self.services.read().unwrap_or_else(|e| e.into_inner());
            let Some(entry) = services.get(service_name) else {
                warn!(service = service_name, "service not found");
                response.set_error(code::SERVICE_NOT_FOUND, "service not found");
                reply(response);
                return;
            };
            let Some(&idx) = entry.index.get(method_name) else {
                warn!(service = service_name, method = method_name, "method not found");
                response.set_error(code::METHOD_NOT_FOUND, "method not found");
                reply(response);
                return;
            };
            entry.methods[idx].handler.clone()
        };

        debug!(service = service_name, method = method_name, msg_id = %request.msg_id, "dispatching");
        handler(
            &request.payload,
            Box::new(move |result| {
                match result {
                    Ok(payload) => response.payload = payload,
                    Err(status) => response.set_error(status.code, status.info),
                }
                reply(response);
            }),
        );
    }
}

/// Split `Service.Method` at the first dot; both halves must be
/// non-empty.
fn split_full_name(full: &str) -> Option<(&str, &str)> {
    let (service, method) = full.split_once('.')?;
    if service.is_empty() || method.is_empty() {
        return None;
    }
    Some((service, method))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discovery::LogPublisher;
    use crate::service::RpcStatus;
    use std::cell::RefCell;
    use std::rc::Rc;
    use std::sync::atomic::{AtomicBool, Ordering};

    struct EchoService {
        invoked: Arc<AtomicBool>,
    }

    impl RpcService for EchoService {
        fn name(&self) -> &str {
            "Echo"
        }

        fn methods(&self) -> Vec<MethodDef> {
            let invoked = self.invoked.clone();
            vec![
                MethodDef::raw("Say", move |payload| {
                    invoked.store(true, Ordering::SeqCst);
                    Ok(payload.to_vec())
                }),
                MethodDef::raw("Fail", |_payload| {
                    Err(RpcStatus::new(700, "application error"))
                }),
            ]
        }
    }

    fn dispatcher_with_echo() -> (Arc<Dispatcher>, Arc<AtomicBool>) {
        let invoked = Arc::new(AtomicBool::new(false));
        let d = Arc::new(Dispatcher::new(Arc::new(LogPublisher)));
        d.register(
            &EchoService {
                invoked: invoked.clone(),
            },
            "127.0.0.1:0",
        )
        .unwrap();
        (d, invoked)
    }

    fn dispatch_collect(d: &Dispatcher, req: &RpcMessage) -> RpcMessage {
        let out: Rc<RefCell<Option<RpcMessage>>> = Rc::new(RefCell::new(None));
        let slot = out.clone();
        d.dispatch(req, move |rsp| *slot.borrow_mut() = Some(rsp));
        let rsp = out.borrow_mut().take().expect("reply fired");
        rsp
    }

    #[test]
    fn routes_to_handler_and_echoes_payload() {
        let (d, invoked) = dispatcher_with_echo();
        let req = RpcMessage::request("m1", "Echo.Say", b"hello".to_vec());
        let rsp = dispatch_collect(&d, &req);
        assert!(invoked.load(Ordering::SeqCst));
        assert_eq!(rsp.err_code, 0);
        assert_eq!(rsp.payload, b"hello");
        assert_eq!(rsp.msg_id, "m1");
        assert_eq!(rsp.method, "Echo.Say");
    }

    #[test]
    fn dotless_name_is_a_parse_error() {
        let (d, invoked) = dispatcher_with_echo();
        for bad in ["EchoSay", "", ".Say", "Echo."] {
            let req = RpcMessage::request("m", bad, Vec::new());
            let rsp = dispatch_collect(&d, &req);
            assert_eq!(rsp.err_code, code::PARSE_SERVICE_NAME, "name: {bad:?}");
            assert_eq!(rsp.msg_id, "m");
        }
        assert!(!invoked.load(Ordering::SeqCst));
    }

    #[test]
    fn unknown_service_is_reported() {
        let (d, invoked) = dispatcher_with_echo();
        let req = RpcMessage::request("m", "Nope.Say", Vec::new());
        let rsp = dispatch_collect(&d, &req);
        assert_eq!(rsp.err_code, code::SERVICE_NOT_FOUND);
        assert!(!invoked.load(Ordering::SeqCst));
    }

    #[test]
    fn unknown_method_is_reported() {
        let (d, invoked) = dispatcher_with_echo();
        let req = RpcMessage::request("m", "Echo.Nope", Vec::new());
        let rsp = dispatch_collect(&d, &req);
        assert_eq!(rsp.err_code, code::METHOD_NOT_FOUND);
        assert!(!invoked.load(Ordering::SeqCst));
    }

    #[test]
    fn handler_error_status_lands_in_reply() {
        let (d, _) = dispatcher_with_echo();
        let req = RpcMessage::request("m", "Echo.Fail", Vec::new());
        let rsp = dispatch_collect(&d, &req);
        assert_eq!(rsp.err_code, 700);
        assert_eq!(rsp.err_info, "application error");
    }

    #[test]
    fn duplicate_registration_is_refused() {
        let (d, _) = dispatcher_with_echo();
        let dup = EchoService {
            invoked: Arc::new(AtomicBool::new(false)),
        };
        assert!(matches!(
            d.register(&dup, "127.0.0.1:0"),
            Err(RpcError::DuplicateService(_))
        ));
    }
}
