mod audio;
mod bargein;
mod call;
mod config;
mod db;
mod error;
mod eventlog;
mod finalize;
mod handlers;
mod notify;
mod realtime;
mod summary;
mod tasks;
mod tenant;
mod twilio;
mod types;

use crate::config::Settings;
use crate::types::AppState;

use axum::{
    routing::{get, post},
    Router,
};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::{error, info};
use tracing_subscriber::prelude::*;

#[tokio::main]
async fn main() {
    let subscriber = tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .compact()
                .with_file(true)
                .with_line_number(true),
        )
        .with(tracing_subscriber::filter::Targets::new().with_targets([
            ("hyper", tracing_subscriber::filter::LevelFilter::OFF),
            ("tungstenite", tracing_subscriber::filter::LevelFilter::INFO),
            ("voicebridge", tracing_subscriber::filter::LevelFilter::DEBUG),
        ]));
    tracing::subscriber::set_global_default(subscriber).unwrap();

    let settings = match Settings::from_env() {
        Ok(s) => s,
        Err(e) => {
            error!("invalid configuration: {e}");
            std::process::exit(1);
        }
    };

    let db = match &settings.database_url {
        Some(url) => db::connect_pool(url).await,
        None => {
            info!("DATABASE_URL not set; running without the reservation store");
            None
        }
    };
    if let Some(pool) = &db {
        if let Err(e) = sqlx::migrate!("./migrations").run(pool).await {
            error!(error=%e, "failed to run migrations");
            std::process::exit(1);
        }
    }

    let http_client = reqwest::Client::new();
    let port = settings.port;
    let app_state = Arc::new(AppState {
        settings,
        db,
        http_client,
        calls: Mutex::new(HashMap::new()),
    });

    let app = Router::new()
        .route("/call/stream", get(handlers::ws_handler))
        .route("/twilio/voice", post(handlers::twiml_voice_handler))
        .route("/", get(|| async { "OK" }))
        .with_state(app_state);

    info!(port, "starting voicebridge");
    axum::Server::bind(&format!("0.0.0.0:{port}").parse().unwrap())
        .serve(app.into_make_service())
        .await
        .unwrap();
}
