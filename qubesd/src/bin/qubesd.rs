use anyhow::{Context, Result};
use clap::Parser;
use log::{error, info, warn};
use qubesd::admin::server::AdminServer;
use qubesd::hypervisor::{Hypervisor, OfflineHypervisor};
use qubesd::memory::{MemoryBalancer, NullBalancer, SocketBalancer};
use qubesd::qdb::{CommandQubesDb, NullQubesDb, QubesDb};
use qubesd::worker::Worker;
use qubesd::{App, Backends, Settings};
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser)]
#[clap(about, version, author)]
struct Args {
    /// Path to the config file
    #[clap(short, long)]
    config: Option<PathBuf>,

    /// Run without touching the hypervisor or the guest bus
    #[clap(long)]
    offline: bool,
}

fn build_backends(settings: &Settings) -> Result<Backends> {
    if settings.offline {
        warn!("offline mode: hypervisor and guest bus are disabled");
        return Ok(Backends {
            hypervisor: Arc::new(OfflineHypervisor),
            qdb: Arc::new(NullQubesDb),
            balancer: Arc::new(NullBalancer),
        });
    }

    #[cfg(feature = "libvirt")]
    let hypervisor: Arc<dyn Hypervisor> = Arc::new(
        qubesd::hypervisor::libvirt::LibvirtHypervisor::new("xen:///system")
            .context("connecting to libvirt")?,
    );
    #[cfg(not(feature = "libvirt"))]
    let hypervisor: Arc<dyn Hypervisor> = {
        warn!("built without libvirt support, lifecycle operations are disabled");
        Arc::new(OfflineHypervisor)
    };

    let qdb: Arc<dyn QubesDb> = Arc::new(CommandQubesDb);
    let balancer: Arc<dyn MemoryBalancer> = match &settings.qmemman_socket {
        Some(socket) => Arc::new(SocketBalancer::new(socket)),
        None => Arc::new(NullBalancer),
    };
    Ok(Backends {
        hypervisor,
        qdb,
        balancer,
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();
    let args = Args::parse();

    let mut settings = Settings::load(args.config.as_deref())?;
    if args.offline {
        settings.offline = true;
    }

    let backends = build_backends(&settings)?;
    let app = App::init(settings, backends)
        .await
        .context("initializing application")?;
    info!("store loaded from {}", app.settings.store_path.display());

    let mut worker = Worker::new(app.clone());
    worker.spawn_check_loop();
    tokio::spawn(async move {
        loop {
            if let Err(e) = worker.handle().await {
                error!("worker handler failed: {}", e);
            }
            error!("worker thread exited!")
        }
    });

    if !app.settings.offline {
        app.autostart_domains().await;
    }

    let listener = AdminServer::bind(&app).await?;
    let server = {
        let app = app.clone();
        tokio::spawn(AdminServer::run(app, listener))
    };

    tokio::signal::ctrl_c().await.context("waiting for signal")?;
    info!("shutting down");
    server.abort();
    app.save().await?;
    Ok(())
}
