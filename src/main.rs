use std::path::PathBuf;
use std::sync::Arc;
use std::time::SystemTime;

use anyhow::Context as _;
use clap::Parser;
use log::info;

use refaudit::config::{self, Snapshot};
use refaudit::gitcli::GitCliLog;
use refaudit::http;
use refaudit::metrics::Metrics;
use refaudit::rules::Registry;
use refaudit::sched::{self, InProcessQueue, TaskQueue};
use refaudit::store::MemStore;
use refaudit::task::Deps;
use refaudit::tracker::LogTracker;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// TOML config file.
    #[arg(long, short)]
    config: PathBuf,
    /// Address for the task-handler and status surface.
    #[arg(long, default_value = "127.0.0.1:8021")]
    listen: String,
    /// Directory holding bare mirrors of the audited repos.
    #[arg(long, default_value = "refaudit-mirrors")]
    mirror_dir: PathBuf,
    /// Run one scheduler pass, drain the task queue, then exit.
    #[arg(long)]
    once: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();
    let args = Args::parse();

    let file = config::load(&args.config)?;
    let registry = Registry::with_builtin();
    let snapshot = Arc::new(Snapshot::build(file, &registry)?);
    let deps = Deps {
        store: Arc::new(MemStore::new()),
        gitlog: Arc::new(GitCliLog::new(args.mirror_dir)),
        tracker: Arc::new(LogTracker::new()),
        metrics: Arc::new(Metrics::new()),
    };
    let (queue, mut rx) = InProcessQueue::new();
    let queue: Arc<dyn TaskQueue> = Arc::new(queue);
    let app = http::App {
        deps: deps.clone(),
        snapshot: snapshot.clone(),
        queue: queue.clone(),
    };

    if args.once {
        sched::tick(&snapshot, &deps, &queue, SystemTime::now()).await;
        while let Ok(uri) = rx.try_recv() {
            http::handle_task_uri(&app, &uri).await;
        }
        return Ok(());
    }

    tokio::spawn(http::serve_queue(rx, app.clone()));
    {
        let snapshot = snapshot.clone();
        let deps = deps.clone();
        let queue = queue.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(snapshot.tuning.cadence);
            loop {
                ticker.tick().await;
                sched::tick(&snapshot, &deps, &queue, SystemTime::now()).await;
            }
        });
    }

    let listener = tokio::net::TcpListener::bind(&args.listen)
        .await
        .context("binding listen address")?;
    info!("listening on {}", args.listen);
    axum::serve(listener, http::router(app))
        .await
        .context("serving HTTP")?;
    Ok(())
}
