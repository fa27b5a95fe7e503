use std::future::ready;
use std::sync::Arc;

use anyhow::Error;
use axum::{routing::get, Router};
use delta_common::blob::S3BlobStore;
use delta_common::bus::KafkaBus;
use delta_common::health::HealthRegistry;
use delta_common::metrics::{serve, setup_metrics_routes};
use delta_common::store::RedisEntityStore;
use delta_worker::config::{Config, StateSettings};
use delta_worker::pipeline::Pipeline;
use delta_worker::state::{EntityStoreProvider, SnapshotArchiveProvider, StateProvider};
use delta_worker::trigger::{consume, TriggerConsumer};
use envconfig::Envconfig;
use tokio::task::JoinHandle;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

fn setup_tracing() {
    let log_layer = tracing_subscriber::fmt::layer().with_filter(EnvFilter::from_default_env());
    tracing_subscriber::registry().with(log_layer).init();
}

pub async fn index() -> &'static str {
    "delta worker"
}

fn start_health_liveness_server(
    config: &Config,
    liveness: HealthRegistry,
) -> Result<JoinHandle<()>, Error> {
    let router = Router::new()
        .route("/", get(index))
        .route("/_readiness", get(index))
        .route("/_liveness", get(move || ready(liveness.get_status())));
    let router = setup_metrics_routes(router)?;
    let bind = config.bind();
    Ok(tokio::task::spawn(async move {
        if let Err(e) = serve(router, &bind).await {
            error!("failed to serve health and metrics: {}", e);
        }
    }))
}

#[tokio::main]
async fn main() -> Result<(), Error> {
    setup_tracing();
    info!("Starting up...");

    let config = Config::init_from_env()?;
    let settings = config.pipeline_settings()?;

    let liveness = HealthRegistry::new("liveness");
    let producer_liveness = liveness.register(
        "kafka_producer".to_string(),
        time::Duration::seconds(30),
    );
    let consumer_liveness = liveness.register(
        "trigger_consumer".to_string(),
        time::Duration::seconds(30),
    );
    start_health_liveness_server(&config, liveness)?;

    let blobs = Arc::new(S3BlobStore::from_env(config.s3_endpoint.clone()).await);
    let bus = Arc::new(KafkaBus::new(&config.kafka, producer_liveness)?);

    let provider: Arc<dyn StateProvider> = match &settings.state {
        StateSettings::EntityStore {
            id_property,
            collection,
            chunk_size,
        } => {
            let store = RedisEntityStore::new(config.redis_url.clone()).await?;
            Arc::new(EntityStoreProvider::new(
                Arc::new(store),
                collection.clone(),
                id_property.clone(),
                *chunk_size,
                settings.mapping.clone(),
            ))
        }
        StateSettings::SnapshotArchive { .. } => {
            Arc::new(SnapshotArchiveProvider::new(blobs.clone(), &settings))
        }
    };
    info!(
        "processing deliveries from {} with {} state",
        settings.inbox,
        provider.name()
    );

    let pipeline = Pipeline::new(settings, blobs, provider, bus.clone());
    let consumer = TriggerConsumer::new(&config.kafka, &config.consumer)?;

    tokio::select! {
        res = consume(&consumer, &pipeline, &consumer_liveness) => {
            if let Err(e) = res {
                error!("trigger consumer stopped: {}", e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Shutting down");
        }
    }

    bus.flush()?;
    Ok(())
}
