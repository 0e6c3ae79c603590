use std::sync::Arc;

use actix_web::{middleware::Logger, web, App, HttpServer};
use anyhow::Context;
use log::{info, warn};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use blobber::chain::registration::{health_check_loop, register_blobber};
use blobber::chain::HttpChainClient;
use blobber::challenge::{poll_challenges, process_challenges, HttpValidatorClient};
use blobber::config::BlobberConfig;
use blobber::context::{spawn_supervised, BlobberContext, Services};
use blobber::db::Database;
use blobber::disk::DiskBalancer;
use blobber::filestore::LocalFileStore;
use blobber::handlers;
use blobber::node::NodeIdentity;
use blobber::writemarker::RedemptionWorker;

#[actix_web::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = BlobberConfig::load().context("loading configuration")?;

    // Initialize RocksDB
    let db = Arc::new(
        Database::new(&config.node.db_path)
            .with_context(|| format!("opening database at {}", config.node.db_path))?,
    );

    let identity = if config.node.secret_key.is_empty() {
        warn!("No secret key configured, generating an ephemeral identity");
        NodeIdentity::generate()
    } else {
        NodeIdentity::from_secret_hex(&config.node.secret_key).context("loading node identity")?
    };
    let identity = Arc::new(identity);
    info!("Starting blobber {}", identity.id());

    let chain = Arc::new(HttpChainClient::new(config.chain.clone(), identity.clone())?);
    let validators = Arc::new(HttpValidatorClient::new(&config.chain)?);
    let balancer = Arc::new(DiskBalancer::new(config.disk.clone()).context("scanning volumes")?);
    let files = Arc::new(LocalFileStore::new(balancer.clone()));

    let ctx = Arc::new(BlobberContext::new(
        config.clone(),
        Services {
            db: db.clone(),
            identity,
            chain: chain.clone(),
            validators,
            files,
            balancer: balancer.clone(),
        },
    ));

    if config.node.register_on_start {
        register_blobber(&ctx).await.context("registering blobber")?;
    }

    let cancel = CancellationToken::new();
    let (sender, receiver) = mpsc::unbounded_channel();
    let mut tasks = vec![
        spawn_supervised(
            "challenge_poller",
            poll_challenges(ctx.clone(), sender, cancel.clone()),
        ),
        spawn_supervised(
            "challenge_processor",
            process_challenges(ctx.clone(), receiver, cancel.clone()),
        ),
        spawn_supervised(
            "health_check",
            health_check_loop(ctx.clone(), cancel.clone()),
        ),
    ];

    let redemption = Arc::new(RedemptionWorker::new(
        db,
        ctx.locks.clone(),
        chain,
        config.write_marker.clone(),
        config.chain.sleep_before_verify(),
    ));
    let redemption_cancel = cancel.clone();
    tasks.push(spawn_supervised("write_marker_redemption", async move {
        redemption.run(redemption_cancel).await;
        Ok(())
    }));

    let balancer_cancel = cancel.clone();
    tasks.push(spawn_supervised("disk_balancer", async move {
        balancer.run(balancer_cancel).await;
        Ok(())
    }));

    // Start HTTP server
    let app_ctx = web::Data::new(ctx.clone());
    info!("Listening on {}", config.node.bind_address);
    let served = HttpServer::new(move || {
        App::new()
            .wrap(Logger::default())
            .app_data(app_ctx.clone())
            .configure(handlers::configure)
    })
    .bind(&config.node.bind_address)
    .with_context(|| format!("binding {}", config.node.bind_address))?
    .run()
    .await;

    info!("Shutting down background tasks");
    cancel.cancel();
    for task in tasks {
        if let Err(e) = task.await {
            warn!("Background task did not stop cleanly: {}", e);
        }
    }
    ctx.persist.flush().await;
    info!("Blobber stopped");

    served.context("running HTTP server")
}
