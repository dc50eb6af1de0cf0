//! skein-demo: serve a few sample resources over HTTP.
//!
//! # Usage
//!
//! ```bash
//! SKEIN_LISTEN=127.0.0.1:8080 skein-demo --cache
//! curl -s localhost:8080/rpc -H 'content-type: application/json' \
//!     -d '{"resource":"math.add","args":[2,3]}'
//! ```

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use clap::Parser;
use serde::Deserialize;
use serde_json::json;
use skein::server::http::{router, serve};
use skein::server::{Args, CallContext, Dispatcher, DispatcherConfig, Namespace};
use skein::{CacheDirective, EphemeralCache, RpcError, RpcResponse};
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "skein-demo")]
#[command(about = "Standalone skein dispatcher with sample resources")]
struct Cli {
    /// Address to listen on
    #[arg(long, env = "SKEIN_LISTEN", default_value = "127.0.0.1:8080")]
    listen: String,

    /// Route the dispatcher is mounted on
    #[arg(long, env = "SKEIN_PATH", default_value = "/rpc")]
    path: String,

    /// Enable the in-process response cache
    #[arg(long, env = "SKEIN_CACHE")]
    cache: bool,

    /// Include error source chains in responses
    #[arg(long)]
    expose_errors: bool,
}

#[derive(Debug, Deserialize)]
struct Greeting {
    name: String,
    #[serde(default)]
    shout: bool,
}

fn math() -> Namespace {
    Namespace::new()
        .method("add", |args: Args| async move {
            let a: f64 = args.arg(0)?;
            let b: f64 = args.arg(1)?;
            Ok(a + b)
        })
        .method("sum", |args: Args| async move {
            let values: Vec<f64> = args.decode()?;
            Ok(values.iter().sum::<f64>())
        })
}

fn root() -> Namespace {
    Namespace::new()
        .on_before_request(|envelope: skein::Envelope| async move {
            if let Some(ctx) = CallContext::current() {
                ctx.set("resource", envelope.resource.clone());
            }
            Ok(envelope)
        })
        .nest("math", math())
        .method("greet", |args: Args| async move {
            let greeting: Greeting = args.arg(0)?;
            let text = format!("hello, {}", greeting.name);
            Ok(if greeting.shout { text.to_uppercase() } else { text })
        })
        .handler("clock", |_: Args| async move {
            let now = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map_err(|e| RpcError::from_error(&e))?;
            Ok(RpcResponse::from_value(json!({ "unix_ms": now.as_millis() as u64 }))
                .with_cache(CacheDirective::tagged(["clock"], Some(Duration::from_secs(2)))))
        })
        .method("upload", |args: Args| async move {
            let name: Option<String> = args.arg(0)?;
            let size = args.payload().map_or(0, |p| p.len());
            tracing::info!(?name, size, "received upload");
            Ok(json!({ "name": name, "size": size }))
        })
        .method("_stats", |_: Args| async { Ok::<_, RpcError>("hidden") })
}

fn main() -> std::io::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    rt.block_on(run(cli))
}

async fn run(cli: Cli) -> std::io::Result<()> {
    let config = DispatcherConfig::default().with_error_detail(cli.expose_errors);
    let mut builder = Dispatcher::builder(root()).config(config);
    if cli.cache {
        let cache = EphemeralCache::new();
        cache.spawn_sweeper(Duration::from_secs(5));
        builder = builder.cache(cache);
    }
    let dispatcher = builder.build();

    for resource in dispatcher.resources() {
        tracing::info!(%resource, "serving");
    }

    let listener = TcpListener::bind(&cli.listen).await?;
    serve(listener, router(&cli.path, dispatcher)).await
}
