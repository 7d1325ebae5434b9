use clap::{App, Arg};
use elixys_hal::{
    build_schema, link, spawn_status_updater, Codec, ServerConfig, ServerEvent, StateAccess,
    StateStore, SystemConfig, TransportServer,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let matches = App::new("hwserver")
        .version("0.1.0")
        .about("🧪 Elixys hardware server - websocket link to the synthesizer controller")
        .arg(
            Arg::with_name("config")
                .short("c")
                .long("config")
                .value_name("FILE")
                .help("Device description (JSON); defaults to $ELIXYS_HAL_CONFIG or the bundled layout")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("bind")
                .short("b")
                .long("bind")
                .value_name("ADDR")
                .help("Listen address, overrides the config")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("period")
                .short("p")
                .long("period")
                .value_name("MS")
                .help("Outbound drain period in milliseconds")
                .takes_value(true)
                .validator(|v| match v.parse::<u64>() {
                    Ok(ms) if ms > 0 => Ok(()),
                    _ => Err("Period must be a positive number of milliseconds".into()),
                }),
        )
        .get_matches();

    let config = match SystemConfig::resolve(matches.value_of("config")) {
        Ok(config) => config,
        Err(e) => {
            error!("❌ {}", e);
            std::process::exit(1);
        }
    };
    let schema = match build_schema(&config) {
        Ok(schema) => schema,
        Err(e) => {
            error!("❌ {}", e);
            std::process::exit(1);
        }
    };

    let mut server_config = ServerConfig::from(&config.server);
    if let Some(bind) = matches.value_of("bind") {
        server_config.bind = bind.to_string();
    }
    if let Some(ms) = matches.value_of("period").and_then(|v| v.parse::<u64>().ok()) {
        server_config.send_period = Duration::from_millis(ms);
    }

    println!("🧪 Elixys Hardware Server");
    println!("=========================");

    let codec = Codec::new(schema);
    println!("📦 Status frame: {} bytes", codec.frame_len());

    let (app, queues) = link();
    let store = Arc::new(StateStore::new(codec));
    let (stop_tx, stop_rx) = watch::channel(false);
    let updater = spawn_status_updater(Arc::clone(&store), app.status, stop_rx);

    let mut handle = TransportServer::new(server_config, queues).spawn().await?;
    println!("🌐 Listening on ws://{}/ws", handle.local_addr());

    // Keep the command queue open for the lifetime of the server
    let _commands = app.commands;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("shutdown requested");
                break;
            }
            event = handle.events().recv() => match event {
                Ok(ServerEvent::ClientConnected(peer)) => info!("🔗 Hardware connected: {}", peer),
                Ok(ServerEvent::ClientRejected(peer)) => warn!("🚫 Rejected extra client: {}", peer),
                Ok(ServerEvent::ClientDisconnected(peer)) => {
                    info!(
                        "🔌 Hardware disconnected: {} ({} status updates so far)",
                        peer,
                        store.update_count()
                    );
                    if let Some(packet_id) = store.get("Header", "packet_id") {
                        info!("last packet id {}", packet_id);
                    }
                }
                Ok(ServerEvent::SendFailed { peer, error }) => warn!("❌ Send to {} failed: {}", peer, error),
                Ok(ServerEvent::Listening(_)) => {}
                Err(broadcast::error::RecvError::Lagged(skipped)) => warn!(skipped, "server events lagged"),
                Err(broadcast::error::RecvError::Closed) => break,
            },
        }
    }

    let _ = stop_tx.send(true);
    handle.shutdown().await?;
    let _ = updater.await;
    println!("🧪 Elixys Hardware Server stopped");

    Ok(())
}
