//! Client-side protocol tests against a miniature in-process host.
//!
//! The mini host speaks the wire protocol over the in-memory transport:
//! enough of the handle and route surfaces to exercise proxies, the
//! handler stack, and framing from the client's point of view.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::json;

use wp_client::{
    route_handler, EvalArg, FetchRequest, FetchResponse, FulfillOptions, Harness,
    PageEnvironment, RequestOverrides, RouteMatcher,
};
use wp_runtime::message::{
    BridgeMessage, HandleAction, HandleMessage, HandleRequest, HandleResolve, HeaderEntry,
    RouteAction, RouteMessage, RouteRequest, RouteResolve,
};
use wp_runtime::remote::{parse, serialize, RemoteValue, ValueNode};
use wp_runtime::transport::{link, memory_pair, MessageSender};

const SESSION: &str = "11111111-2222-4333-8444-555555555555";

#[derive(Clone, Debug)]
enum Target {
    Json(serde_json::Value),
    Undefined,
}

impl Target {
    fn to_remote(&self) -> RemoteValue {
        match self {
            Target::Json(value) => RemoteValue::from_json(value),
            Target::Undefined => RemoteValue::undefined(),
        }
    }
}

#[derive(Default)]
struct HostState {
    targets: Mutex<Vec<Option<Target>>>,
    toggles: Mutex<Vec<bool>>,
    actions: Mutex<Vec<(RouteAction, Option<Vec<u8>>)>>,
    disposes: Mutex<Vec<u32>>,
    next_route_id: Mutex<u32>,
}

impl HostState {
    fn seeded() -> Arc<Self> {
        let state = Self::default();
        *state.targets.lock() = vec![
            Some(Target::Json(json!("context"))),
            Some(Target::Json(json!("page"))),
            None,
            Some(Target::Json(json!("X"))),
            Some(Target::Json(json!("Y"))),
            Some(Target::Json(json!("Z"))),
        ];
        Arc::new(state)
    }

    fn target_ids(&self) -> Vec<u32> {
        self.targets
            .lock()
            .iter()
            .enumerate()
            .filter_map(|(id, slot)| slot.as_ref().map(|_| id as u32))
            .collect()
    }

    fn register(&self, target: Target) -> u32 {
        let mut targets = self.targets.lock();
        targets.push(Some(target));
        (targets.len() - 1) as u32
    }
}

struct MiniHost {
    state: Arc<HostState>,
    sender: MessageSender,
}

impl MiniHost {
    fn spawn(state: Arc<HostState>) -> (Self, wp_runtime::transport::TransportParts) {
        let (host_parts, client_parts) = memory_pair();
        let (sender, mut receiver) = link(host_parts);
        let loop_state = Arc::clone(&state);
        let loop_sender = sender.clone();
        tokio::spawn(async move {
            let Some(Ok(handshake)) = receiver.recv_raw_text().await else {
                return;
            };
            assert_eq!(handshake, SESSION);
            while let Some(next) = receiver.recv().await {
                let Ok(envelope) = next else { continue };
                match envelope.message {
                    BridgeMessage::Handle(HandleMessage::Request(request)) => {
                        answer_handle(&loop_state, &loop_sender, request);
                    }
                    BridgeMessage::Route(RouteMessage::Toggle(toggle)) => {
                        loop_state.toggles.lock().push(toggle.enable);
                        let ack = BridgeMessage::Route(RouteMessage::Resolve(RouteResolve {
                            id: None,
                            resolve_id: toggle.resolve_id,
                            error: None,
                        }));
                        loop_sender.send(&ack, None).unwrap();
                    }
                    BridgeMessage::Route(RouteMessage::Action(action)) => {
                        let ack = BridgeMessage::Route(RouteMessage::Resolve(RouteResolve {
                            id: Some(action.id),
                            resolve_id: action.resolve_id,
                            error: None,
                        }));
                        loop_state.actions.lock().push((action, envelope.body));
                        loop_sender.send(&ack, None).unwrap();
                    }
                    other => panic!("unexpected message on mini host: {other:?}"),
                }
            }
        });
        (
            Self { state, sender },
            client_parts,
        )
    }

    /// Pushes an intercepted request at the client, as the host would.
    fn push_request(&self, url: &str, body: Option<&[u8]>) -> u32 {
        let id = {
            let mut next = self.state.next_route_id.lock();
            let id = *next;
            *next += 1;
            id
        };
        let message = BridgeMessage::Route(RouteMessage::Request(RouteRequest {
            id,
            url: url.into(),
            method: if body.is_some() { "POST" } else { "GET" }.into(),
            headers_array: vec![HeaderEntry {
                name: "accept".into(),
                value: "*/*".into(),
            }],
            resource_type: "fetch".into(),
            is_navigation_request: false,
            has_body: body.is_some(),
        }));
        self.sender.send(&message, body).unwrap();
        id
    }

    /// Waits until an action for route `id` arrives.
    async fn action_for(&self, id: u32) -> (RouteAction, Option<Vec<u8>>) {
        for _ in 0..200 {
            if let Some(found) = self
                .state
                .actions
                .lock()
                .iter()
                .find(|(action, _)| action.id == id)
                .cloned()
            {
                return found;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        panic!("no action for route {id}");
    }
}

fn resolve_value(request: &HandleRequest, value: &RemoteValue, error: bool) -> BridgeMessage {
    let serialized = serialize(&value.graph, value.root, None).unwrap();
    BridgeMessage::Handle(HandleMessage::Resolve(HandleResolve {
        id: request.id,
        resolve_id: request.resolve_id,
        result: serde_json::to_value(&serialized).unwrap(),
        error,
    }))
}

fn resolve_plain(request: &HandleRequest, result: serde_json::Value) -> BridgeMessage {
    BridgeMessage::Handle(HandleMessage::Resolve(HandleResolve {
        id: request.id,
        resolve_id: request.resolve_id,
        result,
        error: false,
    }))
}

fn resolve_thrown(request: &HandleRequest, message: &str) -> BridgeMessage {
    let mut value = RemoteValue::undefined();
    value.root = value.graph.error("Error", message, None, None);
    resolve_value(request, &value, true)
}

fn answer_handle(state: &Arc<HostState>, sender: &MessageSender, request: HandleRequest) {
    let target = state
        .targets
        .lock()
        .get(request.id as usize)
        .cloned()
        .flatten();
    if request.action == HandleAction::Dispose {
        state.disposes.lock().push(request.id);
        if let Some(slot) = state.targets.lock().get_mut(request.id as usize) {
            *slot = None;
        }
        let _ = sender.send(&resolve_plain(&request, serde_json::Value::Null), None);
        return;
    }
    let Some(target) = target else {
        let _ = sender.send(
            &resolve_thrown(&request, &format!("target {} is disposed", request.id)),
            None,
        );
        return;
    };
    let reply = match request.action {
        HandleAction::Evaluate => {
            let source = request.fn_source.as_deref().unwrap_or_default();
            match source {
                "1 + 2" => resolve_value(&request, &RemoteValue::from_json(&json!(3)), false),
                "(_, passed) => passed" => {
                    let arg = request.arg.as_ref().unwrap();
                    let ids = state.target_ids();
                    let (graph, root) = parse(arg, Some(&ids)).unwrap();
                    match graph.node(root) {
                        ValueNode::Handle(id) => {
                            let passed = state.targets.lock()[*id as usize].clone().unwrap();
                            resolve_value(&request, &passed.to_remote(), false)
                        }
                        _ => resolve_value(&request, &RemoteValue::new(graph, root), false),
                    }
                }
                "() => ({ p: [1, 2] })" => {
                    if request.h == Some(true) {
                        let id = state.register(Target::Json(json!({ "p": [1, 2] })));
                        resolve_plain(&request, json!(id))
                    } else {
                        resolve_value(
                            &request,
                            &RemoteValue::from_json(&json!({ "p": [1, 2] })),
                            false,
                        )
                    }
                }
                "() => { throw new Error('boom') }" => resolve_thrown(&request, "boom"),
                other => resolve_thrown(&request, &format!("unknown source {other:?}")),
            }
        }
        HandleAction::JsonValue => resolve_value(&request, &target.to_remote(), false),
        HandleAction::GetProperty => {
            let name = request.name.as_deref().unwrap_or_default();
            let registered = match &target {
                Target::Json(serde_json::Value::Object(map)) => match map.get(name) {
                    Some(value) => state.register(Target::Json(value.clone())),
                    None => state.register(Target::Undefined),
                },
                _ => state.register(Target::Undefined),
            };
            resolve_plain(&request, json!(registered))
        }
        HandleAction::GetProperties => {
            let pairs: Vec<(String, u32)> = match &target {
                Target::Json(serde_json::Value::Object(map)) => map
                    .iter()
                    .map(|(name, value)| {
                        (name.clone(), state.register(Target::Json(value.clone())))
                    })
                    .collect(),
                _ => Vec::new(),
            };
            resolve_plain(&request, serde_json::to_value(pairs).unwrap())
        }
        HandleAction::Dispose => unreachable!(),
    };
    let _ = sender.send(&reply, None);
}

#[derive(Default)]
struct RecordingEnv {
    fetches: Mutex<Vec<FetchRequest>>,
    exits: Mutex<Vec<i32>>,
}

#[async_trait]
impl PageEnvironment for RecordingEnv {
    async fn fetch(&self, request: FetchRequest) -> wp_client::Result<FetchResponse> {
        self.fetches.lock().push(request);
        Ok(FetchResponse {
            status: 404,
            headers: vec![],
            body: b"not found".to_vec(),
        })
    }

    fn dispatch_done(&self, exit_code: i32) {
        self.exits.lock().push(exit_code);
    }
}

fn harness_with_host() -> (Harness, MiniHost, Arc<RecordingEnv>) {
    let state = HostState::seeded();
    let (host, client_parts) = MiniHost::spawn(state);
    let env = Arc::new(RecordingEnv::default());
    let harness = Harness::connect(client_parts, SESSION, env.clone()).unwrap();
    (harness, host, env)
}

#[tokio::test]
async fn evaluate_resolves_a_serialized_result() {
    let (harness, _host, _env) = harness_with_host();
    let result = harness.page_handle().evaluate("1 + 2", ()).await.unwrap();
    assert_eq!(result.to_json().unwrap(), json!(3));
}

#[tokio::test]
async fn passing_a_handle_argument_yields_the_referenced_object() {
    let (harness, _host, _env) = harness_with_host();
    // Ids 3..5 hold "X", "Y", "Z" on the host.
    let page = harness.page_handle();
    let handle_of_4 = {
        let mut graph = wp_runtime::remote::ValueGraph::new();
        let root = graph.handle(4);
        EvalArg::from(RemoteValue::new(graph, root))
    };
    let result = page
        .evaluate("(_, passed) => passed", handle_of_4)
        .await
        .unwrap();
    assert_eq!(result.to_json().unwrap(), json!("Y"));
}

#[tokio::test]
async fn evaluate_handle_get_property_json_value() {
    let (harness, _host, _env) = harness_with_host();
    let page = harness.page_handle();

    let object = page
        .evaluate_handle("() => ({ p: [1, 2] })", ())
        .await
        .unwrap();
    let p = object.get_property("p").await.unwrap();
    assert_eq!(p.json_value().await.unwrap(), json!([1, 2]));

    let missing = object.get_property("not-exist").await.unwrap();
    let value = missing.remote_value().await.unwrap();
    assert!(matches!(value.node(), ValueNode::Undefined));
    assert_eq!(missing.json_value().await.unwrap(), serde_json::Value::Null);
}

#[tokio::test]
async fn get_properties_registers_each_value() {
    let (harness, _host, _env) = harness_with_host();
    let object = harness
        .page_handle()
        .evaluate_handle("() => ({ p: [1, 2] })", ())
        .await
        .unwrap();
    let properties = object.get_properties().await.unwrap();
    assert_eq!(properties.len(), 1);
    assert_eq!(properties[0].0, "p");
    assert_eq!(properties[0].1.json_value().await.unwrap(), json!([1, 2]));
}

#[tokio::test]
async fn thrown_values_reject_with_remote_errors() {
    let (harness, _host, _env) = harness_with_host();
    let err = harness
        .page_handle()
        .evaluate("() => { throw new Error('boom') }", ())
        .await
        .unwrap_err();
    match err {
        wp_client::Error::Remote { name, message, .. } => {
            assert_eq!(name, "Error");
            assert_eq!(message, "boom");
        }
        other => panic!("expected remote error, got {other:?}"),
    }
}

#[tokio::test]
async fn dispose_rejects_later_operations() {
    let (harness, host, _env) = harness_with_host();
    let object = harness
        .page_handle()
        .evaluate_handle("() => ({ p: [1, 2] })", ())
        .await
        .unwrap();
    let id = object.id();
    object.dispose().await.unwrap();
    assert!(host.state.disposes.lock().contains(&id));

    let err = object.json_value().await.unwrap_err();
    match err {
        wp_client::Error::HandleDisposed(disposed) => assert_eq!(disposed, id),
        other => panic!("expected disposed error, got {other:?}"),
    }
    // Disposing again is a no-op.
    object.dispose().await.unwrap();
}

#[tokio::test]
async fn dropping_the_last_proxy_sends_a_gc_dispose() {
    let (harness, host, _env) = harness_with_host();
    let object = harness
        .page_handle()
        .evaluate_handle("() => ({ p: [1, 2] })", ())
        .await
        .unwrap();
    let id = object.id();

    let clone = object.clone();
    drop(object);
    tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    // A live clone shares the refcount; nothing was sent yet.
    assert!(!host.state.disposes.lock().contains(&id));

    drop(clone);
    for _ in 0..100 {
        if host.state.disposes.lock().contains(&id) {
            return;
        }
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    }
    panic!("GC dispose never arrived");
}

#[tokio::test]
async fn route_fulfill_resolves_after_the_host_ack() {
    let (harness, host, _env) = harness_with_host();
    let fulfilled = Arc::new(Mutex::new(false));
    let seen = Arc::clone(&fulfilled);
    let handler = route_handler(move |route| {
        let seen = Arc::clone(&seen);
        async move {
            route.fulfill(FulfillOptions::text("routed")).await?;
            *seen.lock() = true;
            Ok(())
        }
    });
    harness
        .context_route(RouteMatcher::glob("/route").unwrap(), handler, None)
        .await
        .unwrap();
    assert_eq!(host.state.toggles.lock().as_slice(), [true]);

    let id = host.push_request("http://127.0.0.1:8000/route", None);
    let (action, body) = host.action_for(id).await;
    assert_eq!(action.action, wp_runtime::message::RouteActionKind::Fulfill);
    assert_eq!(action.status, Some(200));
    assert_eq!(body.as_deref(), Some(&b"routed"[..]));
    // The handler's fulfill future resolved only after our ack.
    tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    assert!(*fulfilled.lock());
}

#[tokio::test]
async fn expired_handlers_leave_the_stack_before_invocation() {
    let (harness, host, _env) = harness_with_host();
    let handler = route_handler(|route| async move {
        route.fulfill(FulfillOptions::text("once")).await
    });
    harness
        .context_route(RouteMatcher::glob("/once").unwrap(), handler, Some(1))
        .await
        .unwrap();

    let first = host.push_request("http://h/once", None);
    let (action, _) = host.action_for(first).await;
    assert_eq!(action.action, wp_runtime::message::RouteActionKind::Fulfill);

    // Second request: the handler is gone, the bridge continues as-is.
    let second = host.push_request("http://h/once", None);
    let (action, _) = host.action_for(second).await;
    assert_eq!(action.action, wp_runtime::message::RouteActionKind::Continue);

    // The stack emptied, so interception toggled back off.
    for _ in 0..100 {
        if host.state.toggles.lock().as_slice() == [true, false] {
            return;
        }
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    }
    panic!("toggle-off after expiry never arrived");
}

#[tokio::test]
async fn stacked_handlers_run_top_down_and_unroute_restores_the_bottom() {
    let (harness, host, _env) = harness_with_host();
    let bottom = route_handler(|route| async move {
        route.fulfill(FulfillOptions::text("bottom")).await
    });
    let top = route_handler(|route| async move {
        route.fulfill(FulfillOptions::text("top")).await
    });
    let matcher = RouteMatcher::glob("/stacked").unwrap();
    harness
        .context_route(matcher.clone(), bottom.clone(), None)
        .await
        .unwrap();
    harness
        .context_route(matcher.clone(), top.clone(), None)
        .await
        .unwrap();

    let id = host.push_request("http://h/stacked", None);
    let (_, body) = host.action_for(id).await;
    assert_eq!(body.as_deref(), Some(&b"top"[..]));

    harness
        .context_unroute(&matcher, Some(&top))
        .await
        .unwrap();
    let id = host.push_request("http://h/stacked", None);
    let (_, body) = host.action_for(id).await;
    assert_eq!(body.as_deref(), Some(&b"bottom"[..]));
}

#[tokio::test]
async fn fallback_overrides_are_visible_to_the_next_handler() {
    let (harness, host, _env) = harness_with_host();
    let bottom = route_handler(|route| async move {
        let request = route.request();
        assert_eq!(request.method, "GET");
        let injected = request
            .headers
            .iter()
            .any(|h| h.name == "x-injected" && h.value == "yes");
        assert!(injected, "fallback override not visible");
        route.continue_(None).await
    });
    let top = route_handler(|route| async move {
        let mut headers = route.request().headers;
        headers.push(HeaderEntry {
            name: "x-injected".into(),
            value: "yes".into(),
        });
        route.fallback(Some(RequestOverrides {
            headers: Some(headers),
            ..Default::default()
        }))?;
        Ok(())
    });
    let matcher = RouteMatcher::glob("/fall").unwrap();
    harness.context_route(matcher.clone(), bottom, None).await.unwrap();
    harness.context_route(matcher, top, None).await.unwrap();

    let id = host.push_request("http://h/fall", None);
    let (action, _) = host.action_for(id).await;
    assert_eq!(action.action, wp_runtime::message::RouteActionKind::Continue);
    let headers = action.headers.unwrap();
    assert!(headers.iter().any(|h| h.name == "x-injected"));
}

#[tokio::test]
async fn second_terminal_action_errors_synchronously() {
    let (harness, host, _env) = harness_with_host();
    let failures: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&failures);
    let handler = route_handler(move |route| {
        let sink = Arc::clone(&sink);
        async move {
            route.fulfill(FulfillOptions::text("first")).await?;
            if let Err(err) = route.abort(None).await {
                sink.lock().push(err.to_string());
            }
            if let Err(err) = route.fallback(None) {
                sink.lock().push(err.to_string());
            }
            Ok(())
        }
    });
    harness
        .context_route(RouteMatcher::glob("/twice").unwrap(), handler, None)
        .await
        .unwrap();

    let id = host.push_request("http://h/twice", None);
    host.action_for(id).await;
    for _ in 0..100 {
        if failures.lock().len() == 2 {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    }
    let recorded = failures.lock().clone();
    assert_eq!(recorded.len(), 2, "got: {recorded:?}");
    for failure in recorded {
        assert!(failure.contains("already handled"), "got: {failure}");
    }
}

#[tokio::test]
async fn continue_sends_post_data_and_overlapping_routes_complete() {
    let (harness, host, _env) = harness_with_host();
    let handler = route_handler(|route| async move {
        let body = route.request().post_data;
        route
            .continue_(Some(RequestOverrides {
                post_data: body,
                ..Default::default()
            }))
            .await
    });
    harness
        .context_route(RouteMatcher::glob("/post").unwrap(), handler, None)
        .await
        .unwrap();

    let first = host.push_request("http://h/post", Some(b"alpha"));
    let second = host.push_request("http://h/post", Some(b"beta"));
    let (a, a_body) = host.action_for(first).await;
    let (b, b_body) = host.action_for(second).await;
    assert_eq!(a.has_post_data, Some(true));
    assert_eq!(a_body.as_deref(), Some(&b"alpha"[..]));
    assert_eq!(b.has_post_data, Some(true));
    assert_eq!(b_body.as_deref(), Some(&b"beta"[..]));
}

#[tokio::test]
async fn bypass_fetch_marks_the_request() {
    let (harness, _host, env) = harness_with_host();
    let response = harness
        .bypass_fetch(FetchRequest::get("http://h/anything"))
        .await
        .unwrap();
    assert_eq!(response.status, 404);
    let fetches = env.fetches.lock();
    assert_eq!(fetches.len(), 1);
    let marker = format!("bypass-{SESSION}");
    assert!(fetches[0]
        .headers
        .iter()
        .any(|h| h.name == marker && h.value == "true"));
}

#[tokio::test]
async fn done_fires_once() {
    let (harness, _host, env) = harness_with_host();
    harness.done(3);
    harness.done(0);
    assert_eq!(env.exits.lock().as_slice(), [3]);
}

#[tokio::test]
async fn failing_init_callback_reports_done_one() {
    let (harness, _host, env) = harness_with_host();
    harness.on_init(|| async { Ok(()) });
    harness.on_init(|| async {
        Err(wp_client::Error::Env("init blew up".into()))
    });
    harness.run_init().await;
    assert_eq!(env.exits.lock().as_slice(), [1]);
}
