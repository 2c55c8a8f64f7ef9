use std::sync::Arc;

use actix_web::{middleware::Logger, web, App, HttpServer};
use metrics_exporter_prometheus::PrometheusBuilder;
use sqlx::postgres::PgPoolOptions;

use optrelay_backend::{
    config::settings::{FeedConfig, Settings},
    db::redis::RedisPool,
    middleware::metrics::Metrics,
    routes::{health::health_scope, metrics::metrics_scope, ws::ws_scope},
    services::catalog::{postgres::PostgresCatalog, InstrumentCatalog},
    services::credential_store::{CredentialStore, RedisCredentialStore},
};

fn init_logging() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
}

#[actix_web::main]
async fn main() -> anyhow::Result<()> {
    init_logging();
    log::info!("starting optrelay backend…");

    let settings = Settings::new().unwrap_or_else(|e| {
        eprintln!("failed to load settings: {e}");
        std::process::exit(1);
    });
    let feed_config = FeedConfig::from_env();
    let port = settings.server_port;

    let pg_pool = PgPoolOptions::new()
        .max_connections(5)
        .connect(&settings.database_url)
        .await?;

    let redis_pool = RedisPool::new(&settings.redis_url).await?;

    let catalog: Arc<dyn InstrumentCatalog> = Arc::new(PostgresCatalog::load(&pg_pool).await?);
    let credential_store: Arc<dyn CredentialStore> =
        Arc::new(RedisCredentialStore::new(redis_pool.clone()));

    let prometheus_handle = PrometheusBuilder::new().install_recorder()?;

    HttpServer::new(move || {
        App::new()
            .wrap(Logger::default())
            .wrap(Metrics)
            .app_data(web::Data::new(settings.clone()))
            .app_data(web::Data::new(feed_config))
            .app_data(web::Data::new(pg_pool.clone()))
            .app_data(web::Data::new(redis_pool.clone()))
            .app_data(web::Data::new(catalog.clone()))
            .app_data(web::Data::new(credential_store.clone()))
            .app_data(web::Data::new(prometheus_handle.clone()))
            .service(health_scope())
            .service(metrics_scope())
            .service(ws_scope())
    })
    .bind(("0.0.0.0", port))?
    .run()
    .await?;

    Ok(())
}
