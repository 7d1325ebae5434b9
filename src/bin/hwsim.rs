use clap::{App, Arg};
use elixys_hal::simulator::{run_simulator, ClientConfig};
use elixys_hal::{Simulator, SystemConfig};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let matches = App::new("hwsim")
        .version("0.1.0")
        .about("🤖 Elixys hardware simulator - acts like the synthesizer controller")
        .arg(
            Arg::with_name("config")
                .short("c")
                .long("config")
                .value_name("FILE")
                .help("Device description (JSON); defaults to $ELIXYS_HAL_CONFIG or the bundled layout")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("url")
                .short("u")
                .long("url")
                .value_name("URL")
                .help("Hardware server websocket URL, overrides the config")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("period")
                .short("p")
                .long("period")
                .value_name("MS")
                .help("Status frame period in milliseconds")
                .takes_value(true)
                .validator(|v| match v.parse::<u64>() {
                    Ok(ms) if ms > 0 => Ok(()),
                    _ => Err("Period must be a positive number of milliseconds".into()),
                }),
        )
        .get_matches();

    let config = SystemConfig::resolve(matches.value_of("config"))?;
    let simulator = match Simulator::new(&config) {
        Ok(simulator) => Arc::new(simulator),
        Err(e) => {
            error!("❌ {}", e);
            std::process::exit(1);
        }
    };

    let mut client = ClientConfig::from(&config.simulator);
    if let Some(url) = matches.value_of("url") {
        client.url = url.to_string();
    }
    if let Some(ms) = matches.value_of("period").and_then(|v| v.parse::<u64>().ok()) {
        client.status_period = Duration::from_millis(ms);
    }

    println!("🤖 Elixys Hardware Simulator");
    println!("============================");
    println!("🔗 Connecting to {}", client.url);

    let (stop_tx, stop_rx) = watch::channel(false);
    let drift = simulator.spawn_drift(stop_rx.clone());
    let mut session = tokio::spawn(run_simulator(Arc::clone(&simulator), client, stop_rx));

    let result = tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("shutdown requested");
            let _ = stop_tx.send(true);
            (&mut session).await
        }
        finished = &mut session => finished,
    };
    let _ = stop_tx.send(true);
    let _ = drift.await;

    match result {
        Ok(Ok(())) => {
            println!("🤖 Elixys Hardware Simulator stopped");
            Ok(())
        }
        Ok(Err(e)) => {
            error!("❌ {}", e);
            std::process::exit(1);
        }
        Err(e) => Err(e.into()),
    }
}
