#![doc = include_str!("../Readme.md")]
#![warn(clippy::all, clippy::pedantic, clippy::cargo, clippy::nursery)]
// TODO: These lints
#![allow(clippy::cargo_common_metadata)]
#![allow(clippy::multiple_crate_versions)]
#![allow(clippy::module_name_repetitions)]

use crate::{certificates::Keys, engine::RaceEngine, store::SharedStore, util::parse_url};
use axum::{
    extract::connect_info::IntoMakeServiceWithConnectInfo,
    routing::get,
    Extension, Router, Server,
};
use clap::Parser;
use cli_batteries::await_shutdown;
use eyre::Result as EyreResult;
use hyper::server::conn::AddrIncoming;
use std::{net::SocketAddr, sync::Arc};
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::info;
use url::Url;
use uuid::Uuid;

mod api;
pub mod anticheat;
pub mod bots;
pub mod certificates;
pub mod engine;
pub mod identity;
pub mod messages;
pub mod progress;
pub mod race;
pub mod rate_limit;
pub mod ratings;
pub mod registry;
pub mod room;
pub mod storage;
pub mod store;
pub mod timers;
pub mod util;

#[derive(Clone, Debug, PartialEq, Eq, Parser)]
pub struct Options {
    /// API Server url to bind
    #[clap(long, env, default_value = "http://127.0.0.1:3000/")]
    pub server: Url,

    #[clap(flatten)]
    pub keys: certificates::Options,

    #[clap(flatten)]
    pub storage: storage::Options,

    #[clap(flatten)]
    pub store: store::Options,

    #[clap(flatten)]
    pub engine: engine::Options,
}

#[allow(clippy::missing_errors_doc)]
pub async fn async_main(options: Options) -> EyreResult<()> {
    let addr = options.server.clone();
    let (server, engine) = start_server(options).await?;
    info!("Listening on http://{}{}", server.local_addr(), addr.path());
    server.with_graceful_shutdown(await_shutdown()).await?;
    engine.shutdown().await;
    Ok(())
}

type AppServer = Server<AddrIncoming, IntoMakeServiceWithConnectInfo<Router, SocketAddr>>;

#[allow(clippy::missing_errors_doc)]
pub async fn start_server(options: Options) -> EyreResult<(AppServer, Arc<RaceEngine>)> {
    let server_id = Uuid::new_v4().to_string();
    info!(server_id, "Starting typing race server");

    let keys = Arc::new(Keys::new(&options.keys)?);
    let storage = storage::storage_client(&options.storage).await?;
    let store = SharedStore::new(&options.store, server_id)?;

    let engine = RaceEngine::new(options.engine.clone(), storage.clone(), store, keys);

    // Crash recovery for racing timed races before traffic arrives.
    engine.restore_timed_races().await;

    // Background tasks: progress flusher, heartbeat sweep, fleet listener.
    // All hang their shutdown arm on the engine's cancellation token.
    tokio::spawn(progress::flush_on_interval(
        Arc::clone(engine.progress_cache()),
        storage,
        Arc::clone(engine.db_health()),
        engine.shutdown_token(),
    ));
    tokio::spawn(engine::heartbeat_on_interval(Arc::clone(&engine)));
    tokio::spawn(engine::run_store_listener(Arc::clone(&engine)));

    let app = Router::new()
        .layer(TraceLayer::new_for_http())
        .route("/ws/race", get(api::v1::ws::race_ws))
        .route("/info/status", get(api::v1::info::status))
        .layer(CorsLayer::permissive())
        .layer(Extension(Arc::clone(&engine)));

    // Run the server
    let (addr, prefix) = parse_url(&options.server)?;
    let app = Router::new().nest(prefix, app);
    let server = Server::try_bind(&addr)?
        .serve(app.into_make_service_with_connect_info::<SocketAddr>());
    Ok((server, engine))
}
