use actix_cors::Cors;
use actix_web::{middleware::Logger, web, App, HttpServer};
use dotenv::dotenv;
use std::net::TcpListener;
use tracing::{error, info};

mod config;
mod db;
mod error;
mod handlers;
mod routes;
mod services;

use crate::config::AppSettings;
use crate::db::connection::{create_pool, verify_connection};
use crate::db::repositories::config_history_repository::ConfigHistoryRepository;
use crate::db::repositories::config_queue_repository::ConfigQueueRepository;
use crate::db::repositories::config_snapshot_repository::ConfigSnapshotRepository;
use crate::db::repositories::device_repository::DeviceRepository;
use crate::db::repositories::device_token_repository::DeviceTokenRepository;
use crate::db::repositories::security_key_repository::SecurityKeyRepository;
use crate::db::repositories::user_repository::UserRepository;
use crate::services::command_relay::CommandRelay;
use crate::services::config_delivery::ConfigDeliveryEngine;
use crate::services::session_registry::SessionRegistry;
use crate::services::token_store::TokenStore;

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    // Load environment variables from .env file
    dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    // Load application settings
    let app_settings = match AppSettings::from_env() {
        Ok(settings) => settings,
        Err(e) => {
            error!("Failed to load application settings: {}", e);
            error!("Cannot start server without valid settings");
            std::process::exit(1);
        }
    };

    // Database connection setup
    let db_pool = match create_pool(&app_settings.database.url).await {
        Ok(pool) => {
            if let Err(e) = verify_connection(&pool).await {
                error!("Database connection verification failed: {}", e);
                error!("Cannot start server without a working database connection");
                std::process::exit(1);
            }
            info!("Database connection established successfully");
            pool
        }
        Err(e) => {
            error!("Failed to create database connection pool: {}", e);
            error!("Cannot start server without a working database connection");
            std::process::exit(1);
        }
    };

    // Shared state: one registry and one delivery engine for the whole
    // process, handed to every worker.
    let registry = SessionRegistry::new();
    let token_store = TokenStore::new(
        DeviceTokenRepository::new(db_pool.clone()),
        app_settings.auth.clone(),
    );
    let device_repository = DeviceRepository::new(db_pool.clone());
    let user_repository = UserRepository::new(db_pool.clone());
    let history_repository = ConfigHistoryRepository::new(db_pool.clone());

    let delivery_engine = ConfigDeliveryEngine::new(
        registry.clone(),
        ConfigQueueRepository::new(db_pool.clone()),
        ConfigSnapshotRepository::new(db_pool.clone()),
        history_repository.clone(),
        token_store.clone(),
        app_settings.delivery.clone(),
    );

    let command_relay = CommandRelay::new(
        user_repository.clone(),
        device_repository.clone(),
        SecurityKeyRepository::new(db_pool.clone()),
        registry.clone(),
        app_settings.auth.clone(),
    );

    // Background retry worker for queued configuration. The handle is not
    // kept; the worker runs for the life of the process.
    let _ = delivery_engine.start_retry_worker();
    info!(
        interval_secs = app_settings.delivery.retry_interval_secs,
        "Configuration retry worker started"
    );

    let host = &app_settings.server.host;
    let port = app_settings.server.port;

    info!("Starting server at http://{}:{}", host, port);

    let server_addr = format!("{}:{}", host, port);
    let listener = TcpListener::bind(server_addr)?;

    HttpServer::new(move || {
        let app_settings = app_settings.clone();

        // Configure CORS using actix-cors
        let mut cors = Cors::default().supports_credentials();

        if app_settings.server.cors_origins.contains(&"*".to_string()) {
            cors = cors.allow_any_origin();
        } else {
            for origin in &app_settings.server.cors_origins {
                cors = cors.allowed_origin(origin);
            }
        }

        cors = cors.allow_any_method().allow_any_header();

        App::new()
            .wrap(Logger::default())
            .wrap(cors)
            .app_data(web::Data::new(app_settings))
            .app_data(web::Data::new(db_pool.clone()))
            .app_data(web::Data::new(registry.clone()))
            .app_data(web::Data::new(token_store.clone()))
            .app_data(web::Data::new(device_repository.clone()))
            .app_data(web::Data::new(user_repository.clone()))
            .app_data(web::Data::new(history_repository.clone()))
            .app_data(web::Data::new(delivery_engine.clone()))
            .app_data(web::Data::new(command_relay.clone()))
            // Health check endpoint
            .service(web::resource("/health").route(web::get().to(handlers::health::health_check)))
            // Device link WebSocket
            .service(
                web::resource("/ws")
                    .route(web::get().to(handlers::link_handlers::device_link_ws_handler)),
            )
            // HTTP API
            .service(web::scope("/api").configure(routes::configure_routes))
    })
    .listen(listener)?
    .run()
    .await
}
