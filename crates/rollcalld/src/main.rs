use anyhow::Result;
use rollcall_core::{BusKind, Config, Database, OperatorRegistry, SqliteAttendanceService};
use tracing_subscriber::EnvFilter;

mod dbus_interface;

use dbus_interface::{RollcallService, BUS_NAME, OBJECT_PATH};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!("rollcalld starting");

    let config = Config::load(None)?;
    let db = Database::open(&config.db_path)?;
    tracing::info!(path = %config.db_path.display(), "database opened");

    let service = SqliteAttendanceService::from_config(db.clone(), &config)?;
    let iface = RollcallService::new(
        service,
        OperatorRegistry::new(db),
        config.request_timeout(),
    );

    let builder = match config.bus {
        BusKind::System => zbus::connection::Builder::system()?,
        BusKind::Session => zbus::connection::Builder::session()?,
    };
    let _conn = builder
        .name(BUS_NAME)?
        .serve_at(OBJECT_PATH, iface)?
        .build()
        .await?;

    tracing::info!(bus = ?config.bus, name = BUS_NAME, "rollcalld ready");

    // Keep running until signaled
    tokio::signal::ctrl_c().await?;
    tracing::info!("rollcalld shutting down");

    Ok(())
}
