use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use coprocess_core::api::{DEFAULT_GRPC_MAX_MESSAGE_BYTES, DispatcherService};
use coprocess_core::driver::{
    CallOptions, DriverError, DriverRegistry, GrpcDispatcher, MiddlewareDriver,
    dispatch_event_once, dispatch_once,
};
use coprocess_core::hooks::{
    EventMessage, FnEventHandler, FnHook, HookContext, HookError, HookRegistry, StaticHook,
    StaticHookConfig, StaticReturnOverrides,
};
use coprocess_core::host::{HostApi, HostEvent, InMemoryHost};
use coprocess_core::middleware::{
    AUTH_FAILURE_EVENT, ApiSpec, CoProcessMiddleware, RequestOutcome, SessionKey,
};
use coprocess_proto::{HookType, Object, SessionState};
use http::{Method, Request, Response, StatusCode};
use serde_json::json;
use tokio::net::TcpListener;
use tokio_stream::wrappers::TcpListenerStream;
use tonic::Code;
use tonic::transport::{Channel, Server};

async fn start_server(service: DispatcherService) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    tokio::spawn(async move {
        Server::builder()
            .add_service(service.into_server(DEFAULT_GRPC_MAX_MESSAGE_BYTES))
            .serve_with_incoming(TcpListenerStream::new(listener))
            .await
            .expect("serve");
    });
    addr
}

async fn connect(addr: SocketAddr) -> Channel {
    Channel::from_shared(format!("http://{addr}"))
        .expect("endpoint")
        .connect()
        .await
        .expect("connect")
}

fn uppercase_body(mut object: Object, ctx: &HookContext) -> Result<Object, HookError> {
    let request = object
        .request
        .as_mut()
        .ok_or_else(|| HookError::InvalidInput("missing request".to_string()))?;
    let seen = ctx.host().get_data("seen")?.unwrap_or_default();
    ctx.host().store_data("seen", &format!("{seen}x"), 60)?;
    request.raw_body = request.body.to_uppercase().into_bytes();
    request
        .set_headers
        .insert("X-Seen".to_string(), format!("{seen}x"));
    request.add_params.insert("hooked".to_string(), "1".to_string());
    Ok(object)
}

fn authenticate(mut object: Object, _ctx: &HookContext) -> Result<Object, HookError> {
    let token = object
        .request
        .as_ref()
        .and_then(|request| request.headers.get("Authorization").cloned())
        .unwrap_or_default();
    if token == "Bearer good-token-1234" {
        object.session = Some(SessionState {
            rate: 10.0,
            per: 60.0,
            ..Default::default()
        });
        object
            .metadata
            .insert("token".to_string(), "good-token-1234".to_string());
    } else if let Some(overrides) = object
        .request
        .as_mut()
        .and_then(|request| request.return_overrides.as_mut())
    {
        overrides.response_code = 401;
        overrides.response_error = "invalid token".to_string();
    }
    Ok(object)
}

fn rewrite_response(mut object: Object, _ctx: &HookContext) -> Result<Object, HookError> {
    let response = object
        .response
        .as_mut()
        .ok_or_else(|| HookError::InvalidInput("missing response".to_string()))?;
    response.status_code = 299;
    response.raw_body = b"rewritten".to_vec();
    response
        .headers
        .insert("X-Response-Hook".to_string(), "1".to_string());
    Ok(object)
}

fn forward_to_host(event: EventMessage, ctx: &HookContext) -> Result<(), HookError> {
    ctx.host()
        .trigger_event(&event.handler_name, &event.message.to_string())?;
    Ok(())
}

fn registry() -> HookRegistry {
    let mut registry = HookRegistry::new();
    registry
        .register_hook("uppercase", Arc::new(FnHook::new(uppercase_body)))
        .register_hook("auth", Arc::new(FnHook::new(authenticate)))
        .register_hook("response", Arc::new(FnHook::new(rewrite_response)))
        .register_hook(
            "deny",
            Arc::new(StaticHook::new(StaticHookConfig {
                name: "deny".to_string(),
                return_overrides: Some(StaticReturnOverrides {
                    response_code: 418,
                    response_body: "short and stout".to_string(),
                    override_error: true,
                    ..Default::default()
                }),
                ..Default::default()
            })),
        )
        .register_event_handler("audit", Arc::new(FnEventHandler::new(forward_to_host)))
        .register_event_handler(
            AUTH_FAILURE_EVENT,
            Arc::new(FnEventHandler::new(forward_to_host)),
        );
    registry
}

struct Harness {
    addr: SocketAddr,
    host: Arc<InMemoryHost>,
    drivers: Arc<DriverRegistry>,
}

impl Harness {
    async fn start() -> Self {
        let host = Arc::new(InMemoryHost::new());
        let addr = start_server(DispatcherService::new(registry(), host.clone())).await;
        let dispatcher = GrpcDispatcher::from_channel(connect(addr).await)
            .with_timeout(Some(Duration::from_secs(5)));
        let mut drivers = DriverRegistry::new(true);
        drivers.register(MiddlewareDriver::Grpc, Arc::new(dispatcher));
        Self {
            addr,
            host,
            drivers: Arc::new(drivers),
        }
    }

    fn middleware(&self, hook_type: HookType, hook_name: &str, spec: ApiSpec) -> CoProcessMiddleware {
        let spec = ApiSpec {
            driver: MiddlewareDriver::Grpc,
            ..spec
        };
        CoProcessMiddleware::new(hook_type, hook_name, Arc::new(spec), self.drivers.clone())
    }
}

fn request(uri: &str, body: &'static str) -> Request<Bytes> {
    Request::builder()
        .method(Method::POST)
        .uri(uri)
        .header("host", "gateway.local")
        .body(Bytes::from_static(body.as_bytes()))
        .expect("request")
}

#[tokio::test]
async fn e2e_pre_hook_mutates_request_through_grpc() {
    let harness = Harness::start().await;
    let middleware = harness.middleware(HookType::Pre, "uppercase", ApiSpec::default());
    assert!(middleware.enabled_for_spec());

    let mut req = request("/items?page=2", "hello");
    let outcome = middleware.process_request(&mut req).await;
    assert!(matches!(outcome, RequestOutcome::Continue));
    assert_eq!(req.body().as_ref(), b"HELLO");
    assert_eq!(req.headers().get("x-seen").expect("header"), "x");
    assert_eq!(req.uri().path(), "/items");
    assert_eq!(req.uri().query(), Some("hooked=1&page=2"));
    assert_eq!(harness.host.get_data("seen").expect("get"), Some("x".to_string()));

    let mut req = request("/items", "again");
    middleware.process_request(&mut req).await;
    assert_eq!(req.headers().get("x-seen").expect("header"), "xx");
}

#[tokio::test]
async fn e2e_custom_key_check_attaches_session() {
    let harness = Harness::start().await;
    let spec = ApiSpec {
        org_id: "org-e2e".to_string(),
        enable_coprocess_auth: true,
        ..Default::default()
    };
    let middleware = harness.middleware(HookType::CustomKeyCheck, "auth", spec);

    let mut req = request("/secure", "");
    req.headers_mut()
        .insert("authorization", "Bearer good-token-1234".parse().expect("value"));
    assert!(matches!(
        middleware.process_request(&mut req).await,
        RequestOutcome::Continue
    ));
    let session = req.extensions().get::<SessionState>().expect("session");
    assert_eq!(session.org_id, "org-e2e");
    assert_eq!(session.rate, 10.0);
    assert_eq!(
        req.extensions().get::<SessionKey>(),
        Some(&SessionKey("good-token-1234".to_string()))
    );

    let mut events = harness.host.subscribe();
    let mut req = request("/secure", "");
    req.headers_mut()
        .insert("authorization", "Bearer bad".parse().expect("value"));
    match middleware.process_request(&mut req).await {
        RequestOutcome::Reject { status, message, .. } => {
            assert_eq!(status, StatusCode::UNAUTHORIZED);
            assert_eq!(message, "invalid token");
        }
        other => panic!("unexpected outcome {other:?}"),
    }

    let event = tokio::time::timeout(Duration::from_secs(2), events.recv())
        .await
        .expect("event in time")
        .expect("event");
    assert_eq!(event.name, AUTH_FAILURE_EVENT);
    let message: serde_json::Value = serde_json::from_str(&event.payload).expect("json");
    assert_eq!(message["message"], "Auth Failure");
    assert_eq!(message["path"], "/secure");
}

#[tokio::test]
async fn e2e_return_overrides_respond_directly() {
    let harness = Harness::start().await;
    let middleware = harness.middleware(HookType::Post, "deny", ApiSpec::default());
    match middleware.process_request(&mut request("/tea", "")).await {
        RequestOutcome::Respond(response) => {
            assert_eq!(response.status(), StatusCode::IM_A_TEAPOT);
            assert_eq!(response.body().as_ref(), b"short and stout");
        }
        other => panic!("unexpected outcome {other:?}"),
    }
}

#[tokio::test]
async fn e2e_response_hook_rewrites_upstream_response() {
    let harness = Harness::start().await;
    let middleware = harness.middleware(HookType::Response, "response", ApiSpec::default());
    let mut response = Response::builder()
        .status(StatusCode::OK)
        .header("content-type", "text/plain")
        .body(Bytes::from_static(b"upstream"))
        .expect("response");

    middleware
        .handle_response(&request("/r", ""), &mut response, None)
        .await
        .expect("handle response");

    assert_eq!(response.status().as_u16(), 299);
    assert_eq!(response.body().as_ref(), b"rewritten");
    assert_eq!(response.headers().get("x-response-hook").expect("hook"), "1");
    assert_eq!(response.headers().get("content-type").expect("type"), "text/plain");
    assert_eq!(response.headers().get("content-length").expect("length"), "9");
}

#[tokio::test]
async fn e2e_unknown_hook_returns_object_unchanged() {
    let harness = Harness::start().await;
    let middleware = harness.middleware(HookType::Pre, "missing", ApiSpec::default());
    let mut req = request("/same?x=1", "body");
    assert!(matches!(
        middleware.process_request(&mut req).await,
        RequestOutcome::Continue
    ));
    assert_eq!(req.uri(), "/same?x=1");
    assert_eq!(req.body().as_ref(), b"body");
}

#[tokio::test]
async fn e2e_one_shot_helpers_and_events() {
    let harness = Harness::start().await;
    let target = format!("tcp://{}", harness.addr);
    let mut events = harness.host.subscribe();

    let returned = dispatch_once(
        &target,
        Object {
            hook_name: "deny".to_string(),
            request: Some(Default::default()),
            ..Default::default()
        },
        &CallOptions {
            timeout: Some(Duration::from_secs(5)),
            metadata: vec![("x-request-id".to_string(), "e2e".to_string())],
            compression: false,
        },
    )
    .await
    .expect("dispatch");
    let overrides = returned
        .request
        .and_then(|request| request.return_overrides)
        .expect("overrides");
    assert_eq!(overrides.response_code, 418);

    let payload = EventMessage::new("audit", json!({"user": "alice"}))
        .to_payload()
        .expect("payload");
    dispatch_event_once(&target, payload, &CallOptions::default())
        .await
        .expect("event");
    let event = tokio::time::timeout(Duration::from_secs(2), events.recv())
        .await
        .expect("event in time")
        .expect("event");
    assert_eq!(
        event,
        HostEvent {
            name: "audit".to_string(),
            payload: "{\"user\":\"alice\"}".to_string(),
        }
    );

    let err = dispatch_event_once(&target, "not json".to_string(), &CallOptions::default())
        .await
        .expect_err("invalid payload");
    match err {
        DriverError::Rpc(status) => assert_eq!(status.code(), Code::InvalidArgument),
        other => panic!("unexpected error {other:?}"),
    }
}

#[tokio::test]
async fn e2e_empty_registry_is_unimplemented() {
    let addr = start_server(DispatcherService::default()).await;
    let err = dispatch_once(&addr.to_string(), Object::default(), &CallOptions::default())
        .await
        .expect_err("unimplemented");
    match err {
        DriverError::Rpc(status) => {
            assert_eq!(status.code(), Code::Unimplemented);
            assert_eq!(status.message(), "Method not implemented!");
        }
        other => panic!("unexpected error {other:?}"),
    }
}
