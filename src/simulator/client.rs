use super::Simulator;
use crate::config::SimulatorSection;
use crate::error::{HalError, HalResult};
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{self, MissedTickBehavior};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub url: String,
    pub status_period: Duration,
}

impl From<&SimulatorSection> for ClientConfig {
    fn from(section: &SimulatorSection) -> Self {
        Self {
            url: section.url.clone(),
            status_period: section.status_period(),
        }
    }
}

/// Connect to the hardware server and behave like the instrument until
/// `stop` flips.
///
/// A status frame goes out every `status_period`; binary messages are
/// applied as commands and text messages are logged. Returns an error when
/// the connection fails or closes, or when a command is not understood.
pub async fn run_simulator(
    simulator: Arc<Simulator>,
    config: ClientConfig,
    mut stop: watch::Receiver<bool>,
) -> HalResult<()> {
    if config.status_period.is_zero() {
        return Err(HalError::Config("status_period must be greater than zero".to_string()));
    }
    let (ws, _response) = connect_async(config.url.as_str()).await?;
    info!(url = %config.url, "connected to hardware server");
    let (mut write, mut read) = ws.split();

    let mut ticker = time::interval(config.status_period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut sent: u64 = 0;

    loop {
        if *stop.borrow() {
            break;
        }
        tokio::select! {
            changed = stop.changed() => {
                if changed.is_err() {
                    break;
                }
            }
            _ = ticker.tick() => {
                let frame = simulator.generate_frame()?;
                write.send(Message::Binary(frame)).await?;
                sent += 1;
                if sent % 50 == 0 {
                    debug!(sent, "status frames sent");
                }
            }
            message = read.next() => match message {
                Some(Ok(Message::Binary(bytes))) => match simulator.handle_frame(&bytes) {
                    Ok(()) => {}
                    Err(e) if e.is_fatal() => {
                        error!(error = %e, "unrecognised command, stopping");
                        let _ = write.close().await;
                        return Err(e);
                    }
                    Err(e) => warn!(error = %e, "command ignored"),
                },
                Some(Ok(Message::Text(text))) => warn!(message = %text, "server says"),
                Some(Ok(Message::Close(_))) | None => {
                    return Err(HalError::Transport("server closed the connection".to_string()));
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => return Err(e.into()),
            },
        }
    }

    let _ = write.close().await;
    info!(sent, "simulator disconnected");
    Ok(())
}
