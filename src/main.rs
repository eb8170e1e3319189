use actix_web::{web, App, HttpServer};
use actix_web_prom::PrometheusMetricsBuilder;
use std::env;
use std::fs;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{error, info, Level};

use wheel_execution_rs::api::{self, ApiState};
use wheel_execution_rs::broker::alpaca::AlpacaBroker;
use wheel_execution_rs::broker::DataFeed;
use wheel_execution_rs::config::Settings;
use wheel_execution_rs::context::CycleContext;
use wheel_execution_rs::engine::WheelEngine;
use wheel_execution_rs::persistence::blob_store::RedbBlobStore;

/// Resolve `*_FILE` environment indirections (container secret mounts)
/// into their plain counterparts before anything reads them.
fn load_secrets_from_files() {
    const FILE_SUFFIX: &str = "_FILE";

    let vars: Vec<(String, String)> = env::vars().collect();
    for (key, value) in vars {
        if !key.ends_with(FILE_SUFFIX) {
            continue;
        }

        let target_key = key.trim_end_matches(FILE_SUFFIX);
        if env::var(target_key).is_ok() || value.is_empty() {
            continue;
        }

        if let Ok(contents) = fs::read_to_string(&value) {
            let trimmed = contents.trim().to_string();
            if !trimmed.is_empty() {
                env::set_var(target_key, trimmed);
            }
        }
    }
}

#[tokio::main]
async fn main() -> std::io::Result<()> {
    load_secrets_from_files();
    dotenv::dotenv().ok();

    // Structured JSON logging; level overridable via RUST_LOG
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::Registry;

    let fmt_layer = tracing_subscriber::fmt::layer().json().with_target(false);
    let subscriber = Registry::default()
        .with(tracing_subscriber::EnvFilter::from_default_env().add_directive(Level::INFO.into()))
        .with(fmt_layer);
    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");

    info!("wheel-execution-rs starting");

    let settings = Settings::new().expect("❌ critical: Failed to load configuration");

    let broker = match AlpacaBroker::new(&settings.broker) {
        Ok(b) => Arc::new(b),
        Err(e) => {
            error!("❌ Failed to create broker client: {}", e);
            std::process::exit(1);
        }
    };
    info!("✅ Broker client initialized (paper={})", settings.broker.paper);

    let blob_path =
        env::var("BLOB_STORE_PATH").unwrap_or_else(|_| "wheel_artifacts.redb".to_string());
    let blobs = match RedbBlobStore::new(&blob_path) {
        Ok(store) => Arc::new(store),
        Err(e) => {
            error!("❌ Failed to open blob store at {}: {}", blob_path, e);
            std::process::exit(1);
        }
    };
    info!("✅ Opportunity store opened at {}", blob_path);

    let feed = DataFeed::from_config(&settings.broker.feed);
    let engine = Arc::new(WheelEngine::new(
        broker,
        blobs,
        settings.strategy.clone(),
        feed,
        CycleContext::system(),
    ));
    info!(
        universe = settings.strategy.universe.len(),
        feed = feed.as_str(),
        "✅ Engine initialized"
    );

    let registry = prometheus::default_registry().clone();
    let prometheus = PrometheusMetricsBuilder::new("wheel_execution")
        .registry(registry)
        .endpoint("/metrics")
        .build()
        .unwrap();

    let state = web::Data::new(ApiState {
        engine,
        cycle_gate: Arc::new(Mutex::new(())),
        cycle_timeout: Duration::from_secs(settings.server.cycle_timeout_secs),
    });

    let bind_address = format!("0.0.0.0:{}", settings.server.port);
    info!("🚀 Starting API server on {}", bind_address);

    HttpServer::new(move || {
        let cors = actix_cors::Cors::default()
            .allow_any_origin()
            .allow_any_method()
            .allow_any_header();

        App::new()
            .wrap(cors)
            .wrap(prometheus.clone())
            .app_data(state.clone())
            .configure(api::config)
    })
    .bind(&bind_address)?
    .run()
    .await
}
