//! Dispatcher behaviour through its public entry points.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use futures::StreamExt;
use parking_lot::Mutex;
use serde_json::{Value, json};
use skein_core::{
    BatchItemResult, Bytes, CONTEXT_HEADER, CacheDirective, EphemeralCache, HeaderName,
    HeaderValue, RpcError, RpcResponse, StatusCode,
};
use skein_server::{Args, CallContext, Dispatcher, DispatcherConfig, Namespace};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn counted_math(counter: Arc<AtomicUsize>) -> Namespace {
    let add = move |args: Args| {
        counter.fetch_add(1, Ordering::SeqCst);
        async move {
            let (a, b): (i64, i64) = args.decode()?;
            Ok(a + b)
        }
    };
    Namespace::new().method("add", add)
}

async fn body(response: RpcResponse) -> (StatusCode, Bytes) {
    let cached = response.materialize().await.unwrap();
    (cached.status, cached.body)
}

async fn error(response: RpcResponse) -> RpcError {
    let (status, bytes) = body(response).await;
    RpcError::from_body(status.as_u16(), &bytes)
}

#[tokio_test_lite::test]
async fn reserved_and_private_names_are_not_found() {
    init_tracing();
    let counter = Arc::new(AtomicUsize::new(0));
    let hits = counter.clone();
    let touch = move |_: Args| {
        hits.fetch_add(1, Ordering::SeqCst);
        async { Ok::<_, RpcError>(true) }
    };
    let root = Namespace::new()
        .method("call", touch.clone())
        .method("callMany", touch.clone())
        .method("fetch", touch.clone())
        .method("_x", touch.clone())
        .method("#x", touch.clone())
        .method("$x", touch.clone())
        .nest("ok", Namespace::new().method("_x", touch));
    let dispatcher = Dispatcher::new(root);

    let names = [
        "call", "callMany", "fetch", "_x", "#x", "$x", "ok._x", "missing", "ok.missing.deeper",
    ];
    for resource in names {
        let response = dispatcher.call(&json!({ "resource": resource }), None).await;
        let err = error(response).await;
        assert_eq!(err.status, 404, "{resource}");
        assert_eq!(err.message, "resource not found");
        assert_eq!(err.context["resource"], resource);
    }
    assert_eq!(counter.load(Ordering::SeqCst), 0);
}

#[tokio_test_lite::test]
async fn duplicate_batch_items_execute_once() {
    init_tracing();
    let counter = Arc::new(AtomicUsize::new(0));
    let dispatcher = Dispatcher::new(counted_math(counter.clone()));

    let raw = json!({
        "resource": "batch",
        "batch": true,
        "args": [
            {"resource": "add", "args": [2, 3]},
            {"resource": "add", "args": [2, 3], "responseType": "object"},
            {"resource": "add", "args": [4, 5]},
        ]
    });
    let (status, bytes) = body(dispatcher.call_many(&raw).await).await;
    assert_eq!(status, StatusCode::OK);

    let items: Vec<BatchItemResult> = serde_json::from_slice(&bytes).unwrap();
    let values: Vec<Value> = items
        .iter()
        .map(|item| serde_json::from_slice(&item.body).unwrap())
        .collect();
    assert_eq!(values, vec![json!(5), json!(5), json!(9)]);
    assert_eq!(items[0].body, items[1].body);
    assert_eq!(items[1].response_type, skein_core::ResponseType::Object);
    assert_eq!(counter.load(Ordering::SeqCst), 2);
}

#[tokio_test_lite::test]
async fn batch_item_errors_stay_in_their_position() {
    init_tracing();
    let dispatcher = Dispatcher::new(counted_math(Arc::default()));
    let raw = json!({
        "resource": "batch",
        "batch": true,
        "args": [
            {"resource": "add", "args": [1, 2]},
            {"resource": "_private"},
            {"resource": "add", "args": ["a", 2]},
        ]
    });
    let (_, bytes) = body(dispatcher.call_many(&raw).await).await;
    let items: Vec<BatchItemResult> = serde_json::from_slice(&bytes).unwrap();
    let statuses: Vec<u16> = items.iter().map(|i| i.status).collect();
    assert_eq!(statuses, vec![200, 404, 400]);
    assert!(items[0].ok);
    assert!(!items[1].ok);
}

#[tokio_test_lite::test]
async fn hooks_run_outermost_first() {
    init_tracing();
    let log = Arc::new(Mutex::new(Vec::<String>::new()));

    let record = |tag: &'static str, log: Arc<Mutex<Vec<String>>>| {
        move |env: skein_core::Envelope| {
            log.lock().push(tag.to_string());
            async move { Ok::<_, RpcError>(env) }
        }
    };
    let doubling = |mut env: skein_core::Envelope| async move {
        env.args = env
            .args
            .iter()
            .map(|v| json!(v.as_i64().unwrap_or(0) * 2))
            .collect();
        Ok::<_, RpcError>(env)
    };
    let after_log = log.clone();
    let stamp = move |resp: RpcResponse| {
        after_log.lock().push("after:root".to_string());
        async move {
            Ok::<_, RpcError>(resp.with_header(
                HeaderName::from_static("x-hooked"),
                HeaderValue::from_static("yes"),
            ))
        }
    };

    let inner = counted_math(Arc::default())
        .on_before_request(record("before:inner", log.clone()))
        .on_before_request(doubling);
    let root = Namespace::new()
        .on_before_request(record("before:root", log.clone()))
        .on_after_response(stamp)
        .nest("math", inner);
    let dispatcher = Dispatcher::new(root);

    let response = dispatcher
        .call(&json!({"resource": "math.add", "args": [1, 2]}), None)
        .await;
    assert_eq!(response.headers().get("x-hooked").unwrap(), "yes");
    let (_, bytes) = body(response).await;
    assert_eq!(&bytes[..], b"6");
    assert_eq!(
        *log.lock(),
        vec!["before:root", "before:inner", "after:root"]
    );
}

#[tokio_test_lite::test]
async fn hook_errors_are_normalized() {
    init_tracing();
    let root = counted_math(Arc::default()).on_before_request(|_env| async move {
        Err::<skein_core::Envelope, _>(RpcError::new(401, "token required"))
    });
    let dispatcher = Dispatcher::new(root);
    let raw = json!({"resource": "add", "args": [1, 2]});
    let err = error(dispatcher.call(&raw, None).await).await;
    assert_eq!(err.status, 401);
    assert_eq!(err.envelope(), Some(&raw));
}

fn audited(user: &str) -> Result<String, RpcError> {
    // Deep inside handler code: no context parameter in sight.
    let ctx = CallContext::current().ok_or_else(|| RpcError::internal("no call context"))?;
    ctx.set("user", user);
    ctx.set_private("secret", "hunter2");
    ctx.set_header("x-audited", "1")?;
    Ok(format!("hello {user}"))
}

#[tokio_test_lite::test]
async fn context_is_ambient_and_exposes_only_public_entries() {
    init_tracing();
    let root = Namespace::new().method("greet", |args: Args| async move {
        let user: String = args.arg(0)?;
        let greeting = audited(&user)?;
        CallContext::current()
            .ok_or_else(|| RpcError::internal("no call context"))?
            .set_status(StatusCode::CREATED);
        Ok(greeting)
    });
    let dispatcher = Dispatcher::new(root);

    let response = dispatcher
        .call(&json!({"resource": "greet", "args": ["ada"]}), None)
        .await;
    assert_eq!(response.status(), StatusCode::CREATED);
    assert_eq!(response.headers().get("x-audited").unwrap(), "1");
    let exposed: Value =
        serde_json::from_slice(response.headers().get(CONTEXT_HEADER).unwrap().as_bytes()).unwrap();
    assert_eq!(exposed, json!({"user": "ada"}));
    let (_, bytes) = body(response).await;
    assert_eq!(&bytes[..], b"hello ada");
}

#[tokio_test_lite::test]
async fn concurrent_calls_see_their_own_context() {
    init_tracing();
    let root = Namespace::new().method("echo", |args: Args| async move {
        let ctx = CallContext::current().ok_or_else(|| RpcError::internal("no call context"))?;
        let tag: String = args.arg(0)?;
        ctx.set("tag", tag.clone());
        tokio::task::yield_now().await;
        let seen = ctx.get("tag").unwrap_or(Value::Null);
        Ok(json!({"sent": tag, "seen": seen}))
    });
    let dispatcher = Dispatcher::new(root);

    let calls = (0..16).map(|i| {
        let dispatcher = dispatcher.clone();
        async move {
            let raw = json!({"resource": "echo", "args": [format!("t{i}")]});
            body(dispatcher.call(&raw, None).await).await.1
        }
    });
    for bytes in futures::future::join_all(calls).await {
        let v: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(v["sent"], v["seen"]);
    }
}

fn cached_counter(counter: Arc<AtomicUsize>, directive: Option<CacheDirective>) -> Namespace {
    Namespace::new().handler("now", move |args: Args| {
        let n = counter.fetch_add(1, Ordering::SeqCst);
        let directive = directive.clone();
        async move {
            let mut response = RpcResponse::from_value(json!({ "n": n, "len": args.len() }));
            if let Some(directive) = directive {
                response = response.with_cache(directive);
            }
            Ok(response)
        }
    })
}

#[tokio_test_lite::test]
async fn cache_directive_controls_persistence() {
    init_tracing();
    let raw = json!({"resource": "now"});

    for (directive, expected) in [
        (Some(CacheDirective::Default), 1),
        (Some(CacheDirective::Skip), 2),
        (None, 2),
    ] {
        let counter = Arc::new(AtomicUsize::new(0));
        let dispatcher = Dispatcher::builder(cached_counter(counter.clone(), directive.clone()))
            .cache(EphemeralCache::new())
            .build();
        let (_, first) = body(dispatcher.call(&raw, None).await).await;
        let (_, second) = body(dispatcher.call(&raw, None).await).await;
        assert_eq!(counter.load(Ordering::SeqCst), expected, "{directive:?}");
        if expected == 1 {
            assert_eq!(first, second);
        }
    }
}

#[tokio_test_lite::test]
async fn tagged_entries_can_be_invalidated() {
    init_tracing();
    let counter = Arc::new(AtomicUsize::new(0));
    let cache = EphemeralCache::new();
    let directive = CacheDirective::tagged(["clock"], None);
    let dispatcher = Dispatcher::builder(cached_counter(counter.clone(), Some(directive)))
        .cache(cache.clone())
        .build();
    let raw = json!({"resource": "now"});

    dispatcher.call(&raw, None).await;
    dispatcher.call(&raw, None).await;
    assert_eq!(counter.load(Ordering::SeqCst), 1);

    assert_eq!(cache.invalidate_tag("clock"), 1);
    dispatcher.call(&raw, None).await;
    assert_eq!(counter.load(Ordering::SeqCst), 2);
}

#[tokio_test_lite::test]
async fn payload_calls_bypass_the_cache() {
    init_tracing();
    let counter = Arc::new(AtomicUsize::new(0));
    let dispatcher =
        Dispatcher::builder(cached_counter(counter.clone(), Some(CacheDirective::Default)))
            .cache(EphemeralCache::new())
            .build();
    let raw = json!({"resource": "now"});
    for _ in 0..3 {
        dispatcher
            .call(&raw, Some(Bytes::from_static(b"upload")))
            .await;
    }
    assert_eq!(counter.load(Ordering::SeqCst), 3);
}

#[tokio_test_lite::test]
async fn streams_are_materialized_only_when_cached() {
    init_tracing();
    let root = Namespace::new().handler("chunks", |_: Args| async move {
        let chunks = futures::stream::iter(vec![
            Ok(Bytes::from_static(b"a,")),
            Ok(Bytes::from_static(b"b")),
        ]);
        Ok(RpcResponse::stream(chunks.boxed()))
    });
    let raw = json!({"resource": "chunks"});

    let plain = Dispatcher::new(root.clone());
    let response = plain.call(&raw, None).await;
    assert!(response.body().is_stream());
    assert_eq!(body(response).await.1, Bytes::from_static(b"a,b"));

    let cached = Dispatcher::builder(root)
        .cache(EphemeralCache::new())
        .config(DispatcherConfig::default())
        .build();
    let response = cached.call(&raw, None).await;
    assert!(!response.body().is_stream());
    assert_eq!(body(response).await.1, Bytes::from_static(b"a,b"));
}

#[tokio_test_lite::test]
async fn joined_and_cached_calls_carry_the_producer_context() {
    init_tracing();
    let runs = Arc::new(AtomicUsize::new(0));
    let counter = runs.clone();
    let root = Namespace::new().handler("create", move |_: Args| {
        counter.fetch_add(1, Ordering::SeqCst);
        async move {
            tokio::task::yield_now().await;
            if let Some(ctx) = CallContext::current() {
                ctx.set_status(StatusCode::CREATED);
                ctx.set("id", 7);
                ctx.set_header("x-created-by", "create").unwrap();
            }
            Ok(RpcResponse::from_value(json!({"ok": true})).with_cache(true))
        }
    });
    let dispatcher = Dispatcher::builder(root).cache(EphemeralCache::new()).build();
    let raw = json!({"resource": "create"});

    let (owner, joiner) = futures::join!(
        dispatcher.call(&raw, None),
        dispatcher.call(&raw, None)
    );
    let hit = dispatcher.call(&raw, None).await;
    assert_eq!(runs.load(Ordering::SeqCst), 1);

    let owner = owner.materialize().await.unwrap();
    for other in [joiner, hit] {
        let other = other.materialize().await.unwrap();
        assert_eq!(other.status, owner.status);
        assert_eq!(other.headers, owner.headers);
        assert_eq!(other.body, owner.body);
    }
    assert_eq!(owner.status, StatusCode::CREATED);
    assert_eq!(owner.headers[CONTEXT_HEADER], r#"{"id":7}"#);
    assert_eq!(owner.headers["x-created-by"], "create");
}
