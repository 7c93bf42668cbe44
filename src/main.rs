//! Walktest - session orchestration and sensor fusion for the six-minute walk test.
//!
//! # Overview
//!
//! The service runs one test session at a time. A pulse oximeter supplies SpO2
//! and heart rate, a wrist wearable supplies a cumulative step count. The
//! engine times the test, converts steps to distance, records stops and
//! minute snapshots, and captures recovery values after the test ends.
//!
//! # API Endpoints
//!
//! - `POST /session/configure` - Supply preparation data
//! - `POST /session/start` - Start the test
//! - `POST /devices/:role/samples` - Hand a decoded sensor sample to the engine
//! - `GET /session` - Current session projection
//! - `POST /session/summary/archive` - Store the finished session
//! - `GET /health` - Health check
//!
//! # Configuration
//!
//! - `WALKTEST_PORT` (default 3000)
//! - `WALKTEST_DATABASE_URL` (default `sqlite:walktest.db?mode=rwc`)
//! - `WALKTEST_SIMULATE` - drive the engine with simulated devices

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use walktest::api::{AppState, CommandQueues, router};
use walktest::config::{AppConfig, SharedThresholds};
use walktest::connection::ConnectionSupervisor;
use walktest::link::ChannelLink;
use walktest::model::DeviceRole;
use walktest::session::SessionEngine;
use walktest::simulator::{Simulator, SimulatorConfig};
use walktest::storage::Storage;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Patient data is never logged above debug level
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env().add_directive("walktest=info".parse()?))
        .init();

    let config = AppConfig::from_env();
    info!(
        port = config.port,
        db_url = %config.database_url,
        simulate = config.simulate,
        "Starting walktest server"
    );

    let storage = Storage::new(&config.database_url).await?;
    info!("Database initialized");

    let thresholds = SharedThresholds::default();

    let (oximeter_link, oximeter_rx) = ChannelLink::new(DeviceRole::Oximeter);
    let (wearable_link, wearable_rx) = ChannelLink::new(DeviceRole::Wearable);
    let oximeter = Arc::new(ConnectionSupervisor::new(
        DeviceRole::Oximeter,
        Arc::new(oximeter_link),
        config.engine.reconnect_settle,
    ));
    let wearable = Arc::new(ConnectionSupervisor::new(
        DeviceRole::Wearable,
        Arc::new(wearable_link),
        config.engine.reconnect_settle,
    ));

    let session = SessionEngine::spawn(
        config.engine.clone(),
        Arc::new(thresholds.clone()),
        oximeter,
        wearable,
    );

    // Simulated devices consume the link commands; otherwise a transport
    // bridge drains them over HTTP.
    let (_simulator, commands) = if config.simulate {
        let simulator = Simulator::spawn(
            SimulatorConfig::default(),
            session.clone(),
            oximeter_rx,
            wearable_rx,
        );
        (Some(simulator), CommandQueues::new(None, None))
    } else {
        (None, CommandQueues::new(Some(oximeter_rx), Some(wearable_rx)))
    };

    let state = AppState {
        session,
        storage,
        thresholds,
        commands: Arc::new(commands),
    };
    let app = router(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    let listener = TcpListener::bind(addr).await?;

    info!(%addr, "Walktest is listening");

    axum::serve(listener, app).await?;

    Ok(())
}
