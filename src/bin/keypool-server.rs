use std::sync::Arc;

use clap::Parser as _;
use keypool::pool::http::router;
use keypool::pool::{GeminiValidator, KeyPool, PoolHttpState, PoolStores};
use keypool::PoolConfig;

#[path = "keypool_server/cli.rs"]
mod cli;

use cli::ServerArgs;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = ServerArgs::parse();

    let mut config = match args.config.as_ref() {
        Some(path) => PoolConfig::load(path).await?,
        None => PoolConfig::default(),
    };
    args.apply(&mut config);
    config.validate()?;
    let _otel_guard = init_logging(&args, &config.instance_id())?;

    let stores = open_stores(&args).await?;
    let validator = Arc::new(GeminiValidator::new(&config.validator)?);
    let pool = KeyPool::new(&config, stores, validator);

    let write_token = args.write_token()?;
    let read_token = args.read_token();
    let admin_enabled = write_token.is_some() || read_token.is_some();

    let mut state = PoolHttpState::new(pool);
    if let Some(token) = write_token {
        state = state.with_admin_token(token);
    }
    if let Some(token) = read_token {
        state = state.with_admin_read_token(token);
    }

    let listener = tokio::net::TcpListener::bind(&config.listen).await?;
    tracing::info!(
        listen = %config.listen,
        instance_id = %state.pool().instance_id(),
        admin_enabled,
        "keypool server listening"
    );
    axum::serve(listener, router(state)).await?;
    Ok(())
}

async fn open_stores(args: &ServerArgs) -> Result<PoolStores, Box<dyn std::error::Error>> {
    if let Some(_sqlite_path) = args.sqlite.as_ref() {
        #[cfg(feature = "store-sqlite")]
        {
            let store = keypool::pool::SqliteStore::new(_sqlite_path);
            store.init().await?;
            tracing::info!(path = %_sqlite_path.display(), "using sqlite store");
            return Ok(PoolStores::shared(store));
        }
        #[cfg(not(feature = "store-sqlite"))]
        {
            return Err("sqlite store requires `--features store-sqlite`".into());
        }
    }

    if let Some(_redis_url) = args.redis.as_ref() {
        #[cfg(feature = "store-redis")]
        {
            let mut store = keypool::pool::RedisStore::new(_redis_url)?;
            if let Some(prefix) = args.redis_prefix.as_ref() {
                store = store.with_prefix(prefix.clone());
            }
            store.ping().await?;
            tracing::info!(prefix = store.prefix(), "using redis store");
            return Ok(PoolStores::shared(store));
        }
        #[cfg(not(feature = "store-redis"))]
        {
            return Err("redis store requires `--features store-redis`".into());
        }
    }

    tracing::warn!("no durable store configured; credentials live in memory only");
    Ok(PoolStores::memory())
}

fn init_fmt_logging(json_logs: bool) -> Result<(), Box<dyn std::error::Error>> {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false);
    let installed = if json_logs {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
    if let Err(err) = installed {
        return Err(format!("failed to install log subscriber: {err}").into());
    }
    Ok(())
}

#[cfg(feature = "otel")]
fn init_logging(
    args: &ServerArgs,
    instance_id: &str,
) -> Result<Option<keypool::pool::otel::OtelGuard>, Box<dyn std::error::Error>> {
    if !args.otel_enabled() {
        init_fmt_logging(args.json_logs)?;
        return Ok(None);
    }

    let options = keypool::pool::otel::TracingOptions {
        service_name: "keypool-server",
        instance_id,
        endpoint: args.otel_endpoint.as_deref(),
        json_logs: args.json_logs,
    };
    Ok(Some(keypool::pool::otel::init_tracing(&options)?))
}

#[cfg(not(feature = "otel"))]
fn init_logging(
    args: &ServerArgs,
    _instance_id: &str,
) -> Result<Option<()>, Box<dyn std::error::Error>> {
    if args.otel_enabled() {
        return Err("otel requires `--features otel`".into());
    }
    init_fmt_logging(args.json_logs)?;
    Ok(None)
}
