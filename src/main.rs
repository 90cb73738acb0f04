//! Process bootstrap: flags, runtime, logging, listeners, shutdown.

use anyhow::Result;
use chrono::Local;
use clap::Parser;
use rolling_file::{RollingConditionBasic, RollingFileAppender};
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use relaydns::admin::{self, AdminState};
use relaydns::config::Config;
use relaydns::dns_server::DnsServer;
use relaydns::resolver::Resolver;
use relaydns::store::RecordStore;
use relaydns::upstream::{Forwarder, UdpUpstream};

// 自定义本地时间格式化器，解决日志默认输出 UTC 时间的问题
struct LocalTimer;
impl fmt::time::FormatTime for LocalTimer {
    fn format_time(&self, w: &mut fmt::format::Writer<'_>) -> std::fmt::Result {
        write!(w, "{}", Local::now().format("%Y-%m-%dT%H:%M:%S%.3f%:z"))
    }
}

#[derive(Parser, Debug)]
#[command(name = "relaydns")]
#[command(about = "A caching and forwarding DNS resolver", long_about = None)]
struct Args {
    /// Address both listeners bind on.
    #[arg(long, default_value = "0.0.0.0")]
    address: String,

    /// Port serving UDP DNS lookups.
    #[arg(long, default_value_t = 4000)]
    dns_port: u16,

    /// Port serving the HTTP admin API.
    #[arg(long, default_value_t = 5000)]
    admin_port: u16,

    /// Upstream resolver for forwarded lookups; empty disables forwarding.
    #[arg(long, default_value = "8.8.8.8")]
    upstream: String,

    #[arg(long, default_value_t = 53)]
    upstream_port: u16,

    /// Upstream exchange timeout in milliseconds (floor 500).
    #[arg(long, default_value_t = 2000)]
    upstream_timeout_ms: u64,
}

fn main() -> Result<()> {
    // 根据机器真实核心数手动构建多线程运行时
    let cores = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4);

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(cores)
        .thread_name("relaydns-worker")
        .enable_all()
        .build()?;

    runtime.block_on(async_main(cores))
}

async fn async_main(cores: usize) -> Result<()> {
    std::fs::create_dir_all("logs").unwrap_or_default();

    let file_appender = RollingFileAppender::new(
        "logs/relaydns.log",
        RollingConditionBasic::new().daily(),
        30,
    )?;
    let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(
            fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false)
                .with_timer(LocalTimer),
        )
        .with(fmt::layer().with_writer(std::io::stdout).with_timer(LocalTimer))
        .init();

    let args = Args::parse();
    info!("Starting relaydns version {}", env!("CARGO_PKG_VERSION"));
    info!(
        ">>> Multi-core optimization enabled: utilizing {} independent worker threads",
        cores
    );

    let config = Config::new(
        &args.address,
        args.dns_port,
        args.admin_port,
        &args.upstream,
        args.upstream_port,
        args.upstream_timeout_ms,
    )?;

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let store = RecordStore::new(shutdown_rx.clone());

    let upstream: Option<Arc<dyn Forwarder>> = match config.upstream {
        Some(peer) => {
            info!("Forwarding unresolved lookups to upstream {}", peer);
            Some(Arc::new(UdpUpstream::new(peer, config.upstream_timeout)))
        }
        None => None,
    };

    let resolver = Arc::new(Resolver::new(store.clone(), upstream));
    let dns_server = DnsServer::bind(config.dns_bind, resolver.clone()).await?;

    let admin_state = AdminState::new(store.clone(), resolver.clone(), shutdown_rx.clone());
    let admin_router = admin::router(admin_state.clone());
    let admin_listener = tokio::net::TcpListener::bind(config.admin_bind).await?;
    info!("🚀 Admin API bound on http://{}", config.admin_bind);

    let mut admin_shutdown = shutdown_rx.clone();
    let admin_task = tokio::spawn(async move {
        let shutdown = async move {
            let _ = admin_shutdown.changed().await;
        };
        if let Err(e) = axum::serve(admin_listener, admin_router)
            .with_graceful_shutdown(shutdown)
            .await
        {
            error!("Admin API server failed: {}", e);
        }
    });

    let dns_task = {
        let shutdown_rx = shutdown_rx.clone();
        tokio::spawn(async move { dns_server.run(shutdown_rx).await })
    };

    tokio::signal::ctrl_c().await?;
    info!("--- Shutdown signal received, draining background tasks ---");
    let _ = shutdown_tx.send(true);

    // 先停监听，再等后台任务全部退出，保证没有半删除状态的记录。
    let _ = dns_task.await;
    let _ = admin_task.await;
    admin_state.join_refresh_tasks().await;
    store.join().await;

    info!("Goodbye.");
    Ok(())
}
