use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use mapforge::prelude::*;
use mapforge_transport::Transport;
use tracing_subscriber::EnvFilter;

/// Collaborative tabletop map server.
#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Args {
    /// Address to listen on
    #[clap(short, long, default_value = mapforge::DEFAULT_BIND_ADDR)]
    listen: String,
    /// Init file with the client preamble (reloaded on SIGHUP)
    #[clap(short, long)]
    init_file: Option<PathBuf>,
    /// Password every player must log in with
    #[clap(short, long)]
    password: Option<String>,
    /// Password for the GM login
    #[clap(long)]
    gm_password: Option<String>,
    /// Seconds between MARCO pings (0 disables)
    #[clap(long, default_value = "60")]
    ping_interval: u64,
    /// Log filter, e.g. "debug" or "mapforge=trace" (overrides RUST_LOG)
    #[clap(long)]
    log_level: Option<String>,
    /// Log every protocol line at trace level
    #[clap(long)]
    trace_messages: bool,
    /// Accept WebSocket clients instead of raw TCP
    #[clap(long)]
    websocket: bool,
}

#[tokio::main]
async fn main() -> Result<(), ServerError> {
    let args = Args::parse();

    let filter = match &args.log_level {
        Some(level) => EnvFilter::try_new(level).unwrap_or_else(|_| "info".into()),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let mut builder = MapServerBuilder::new()
        .bind(&args.listen)
        .ping_interval(Duration::from_secs(args.ping_interval))
        .trace_messages(args.trace_messages);
    if let Some(path) = &args.init_file {
        builder = builder.init_file(path.clone());
    }

    match (&args.password, &args.gm_password) {
        (Some(password), gm) => {
            let mut auth = SharedSecretAuthenticator::new(password.clone());
            if let Some(gm) = gm {
                auth = auth.gm_secret(gm.clone());
            }
            start(builder, &args, auth).await
        }
        (None, Some(gm)) => start(builder, &args, OpenAuthenticator::with_gm_secret(gm.clone())).await,
        (None, None) => {
            tracing::warn!("no passwords set, anyone may log in as anyone (including GM)");
            start(builder, &args, OpenAuthenticator::new()).await
        }
    }
}

async fn start<A: Authenticator>(
    builder: MapServerBuilder,
    args: &Args,
    auth: A,
) -> Result<(), ServerError> {
    #[cfg(feature = "websocket")]
    if args.websocket {
        return serve(builder.build_websocket(auth, MemoryStore::new()).await?).await;
    }
    #[cfg(not(feature = "websocket"))]
    if args.websocket {
        tracing::warn!("built without WebSocket support, listening on TCP");
    }
    serve(builder.build(auth, MemoryStore::new()).await?).await
}

async fn serve<T: Transport, A: Authenticator>(
    server: MapServer<T, A, MemoryStore>,
) -> Result<(), ServerError> {
    let shutdown = server.shutdown_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("interrupt received");
            shutdown.shutdown();
        }
    });

    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let preamble = server.preamble();
        tokio::spawn(async move {
            let mut hangup = match signal(SignalKind::hangup()) {
                Ok(hangup) => hangup,
                Err(e) => {
                    tracing::warn!(error = %e, "cannot listen for SIGHUP, init file reload disabled");
                    return;
                }
            };
            while hangup.recv().await.is_some() {
                tracing::info!("SIGHUP received, reloading init file");
                if let Err(e) = preamble.reload().await {
                    tracing::warn!(error = %e, "init file reload failed");
                }
            }
        });
    }

    server.run().await
}
