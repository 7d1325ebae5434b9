//! Websocket transport between the hardware controller and the queues.
//!
//! One server task owns the listener, the connection registry and both queue
//! ends. At most one client is ACTIVE; later clients are told so and closed.

use crate::config::ServerSection;
use crate::error::{HalError, HalResult};
use crate::queue::{InboundSender, OutboundReceiver, TransportQueues};
use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, info, warn};

pub const REJECT_MESSAGE: &str = "Too many connections! Closing yours.";

const EVENT_BUFFER_SIZE: usize = 64;
const CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind: String,
    /// Only handshakes for this request path are accepted.
    pub path: String,
    pub send_period: Duration,
    /// A single write blocked longer than this counts as failed.
    pub send_timeout: Duration,
    pub handshake_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self::from(&ServerSection::default())
    }
}

impl From<&ServerSection> for ServerConfig {
    fn from(section: &ServerSection) -> Self {
        Self {
            bind: section.bind.clone(),
            path: section.path.clone(),
            send_period: section.send_period(),
            send_timeout: section.send_timeout(),
            handshake_timeout: section.handshake_timeout(),
        }
    }
}

/// Connection lifecycle as seen by the server task.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerEvent {
    Listening(SocketAddr),
    ClientConnected(SocketAddr),
    ClientRejected(SocketAddr),
    ClientDisconnected(SocketAddr),
    SendFailed { peer: SocketAddr, error: String },
}

type Handshake = (SocketAddr, HalResult<WebSocketStream<TcpStream>>);

struct ActiveClient {
    peer: SocketAddr,
    ws: WebSocketStream<TcpStream>,
}

pub struct TransportServer {
    config: ServerConfig,
    queues: TransportQueues,
}

impl TransportServer {
    pub fn new(config: ServerConfig, queues: TransportQueues) -> Self {
        Self { config, queues }
    }

    /// Bind the listener and start serving. The handle's event receiver
    /// already holds the `Listening` event.
    pub async fn spawn(self) -> HalResult<ServerHandle> {
        for (name, period) in [
            ("send_period", self.config.send_period),
            ("send_timeout", self.config.send_timeout),
            ("handshake_timeout", self.config.handshake_timeout),
        ] {
            if period.is_zero() {
                return Err(HalError::Config(format!("{} must be greater than zero", name)));
            }
        }

        let listener = TcpListener::bind(self.config.bind.as_str()).await?;
        let address = listener.local_addr()?;
        info!(address = %address, path = %self.config.path, "websocket server listening");

        let (events_tx, events_rx) = broadcast::channel(EVENT_BUFFER_SIZE);
        let (stop_tx, stop_rx) = watch::channel(false);
        let _ = events_tx.send(ServerEvent::Listening(address));

        let TransportQueues { outbound, inbound } = self.queues;
        let server_loop = ServerLoop {
            listener,
            path: self.config.path,
            send_period: self.config.send_period,
            send_timeout: self.config.send_timeout,
            handshake_timeout: self.config.handshake_timeout,
            outbound,
            inbound,
            events: events_tx.clone(),
            stop: stop_rx,
        };
        let task = tokio::spawn(server_loop.run());

        Ok(ServerHandle {
            address,
            stop: stop_tx,
            events_tx,
            events: events_rx,
            task,
        })
    }
}

/// Handle for a running [`TransportServer`].
pub struct ServerHandle {
    address: SocketAddr,
    stop: watch::Sender<bool>,
    events_tx: broadcast::Sender<ServerEvent>,
    events: broadcast::Receiver<ServerEvent>,
    task: JoinHandle<()>,
}

impl ServerHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.address
    }

    /// Events since the server started.
    pub fn events(&mut self) -> &mut broadcast::Receiver<ServerEvent> {
        &mut self.events
    }

    /// Events from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<ServerEvent> {
        self.events_tx.subscribe()
    }

    /// Ask the server loop to exit on its next wakeup. Queued frames stay queued.
    pub fn stop(&self) {
        let _ = self.stop.send(true);
    }

    pub async fn join(self) -> HalResult<()> {
        self.task
            .await
            .map_err(|e| HalError::Transport(format!("server task failed: {}", e)))
    }

    pub async fn shutdown(self) -> HalResult<()> {
        self.stop();
        self.join().await
    }
}

struct ServerLoop {
    listener: TcpListener,
    path: String,
    send_period: Duration,
    send_timeout: Duration,
    handshake_timeout: Duration,
    outbound: OutboundReceiver,
    inbound: InboundSender,
    events: broadcast::Sender<ServerEvent>,
    stop: watch::Receiver<bool>,
}

impl ServerLoop {
    async fn run(mut self) {
        let (handshake_tx, mut handshake_rx) = mpsc::unbounded_channel::<Handshake>();
        let mut active: Option<ActiveClient> = None;
        let mut ticker = time::interval(self.send_period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            if *self.stop.borrow() {
                break;
            }

            tokio::select! {
                changed = self.stop.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        debug!(peer = %peer, "tcp connection accepted");
                        let tx = handshake_tx.clone();
                        let path = self.path.clone();
                        let limit = self.handshake_timeout;
                        tokio::spawn(async move {
                            let result = handshake(stream, path, limit).await;
                            let _ = tx.send((peer, result));
                        });
                    }
                    Err(e) => warn!(error = %e, "failed to accept connection"),
                },
                Some((peer, result)) = handshake_rx.recv() => match result {
                    Ok(ws) if active.is_some() => {
                        warn!(peer = %peer, "rejecting client, another one is active");
                        tokio::spawn(reject(ws));
                        self.publish(ServerEvent::ClientRejected(peer));
                    }
                    Ok(ws) => {
                        info!(peer = %peer, "client active");
                        active = Some(ActiveClient { peer, ws });
                        self.publish(ServerEvent::ClientConnected(peer));
                    }
                    Err(e) => warn!(peer = %peer, error = %e, "websocket handshake failed"),
                },
                message = next_message(&mut active) => {
                    if !self.forward(message, &active) {
                        if let Some(client) = active.take() {
                            info!(peer = %client.peer, "client disconnected");
                            self.publish(ServerEvent::ClientDisconnected(client.peer));
                        }
                    }
                },
                _ = ticker.tick() => {
                    if let Some(client) = active.as_mut() {
                        // a client that stops reading must not hold off stop
                        let drained = tokio::select! {
                            sent = drain_to(&mut self.outbound, client, self.send_timeout) => sent,
                            _ = self.stop.changed() => break,
                        };
                        if let Err(e) = drained {
                            let peer = client.peer;
                            warn!(peer = %peer, error = %e, "send failed, dropping client");
                            active = None;
                            self.publish(ServerEvent::SendFailed { peer, error: e.to_string() });
                            self.publish(ServerEvent::ClientDisconnected(peer));
                        }
                    }
                },
            }
        }

        if let Some(mut client) = active.take() {
            let _ = time::timeout(CLOSE_TIMEOUT, client.ws.close(None)).await;
            self.publish(ServerEvent::ClientDisconnected(client.peer));
        }
        info!("websocket server stopped");
    }

    /// Push one received message onto the inbound queue. Returns false when
    /// the connection is gone.
    fn forward(
        &self,
        message: Option<Result<Message, tungstenite::Error>>,
        active: &Option<ActiveClient>,
    ) -> bool {
        let peer = active.as_ref().map(|c| c.peer);
        match message {
            Some(Ok(Message::Binary(bytes))) => {
                debug!(peer = ?peer, len = bytes.len(), "status frame received");
                self.push(bytes);
                true
            }
            Some(Ok(Message::Text(text))) => {
                debug!(peer = ?peer, len = text.len(), "text frame received");
                self.push(text.into_bytes());
                true
            }
            Some(Ok(Message::Close(_))) | None => false,
            Some(Ok(_)) => true,
            Some(Err(e)) => {
                warn!(peer = ?peer, error = %e, "websocket read failed");
                false
            }
        }
    }

    fn push(&self, bytes: Vec<u8>) {
        if let Err(e) = self.inbound.push_frame(bytes) {
            warn!(error = %e, "dropping inbound frame");
        }
    }

    fn publish(&self, event: ServerEvent) {
        let _ = self.events.send(event);
    }
}

/// Write everything queued right now, oldest first. Stops at the first
/// failed or timed out write; that frame is lost, the rest stay queued.
async fn drain_to(
    outbound: &mut OutboundReceiver,
    client: &mut ActiveClient,
    limit: Duration,
) -> HalResult<()> {
    let mut sent = 0usize;
    while let Some(frame) = outbound.try_recv() {
        time::timeout(limit, client.ws.send(Message::Binary(frame)))
            .await
            .map_err(|_| {
                HalError::Transport(format!("send blocked for more than {} ms", limit.as_millis()))
            })??;
        sent += 1;
    }
    if sent > 0 {
        debug!(peer = %client.peer, frames = sent, "drained outbound queue");
    }
    Ok(())
}

/// Websocket handshake on `path` only, bounded by `limit`.
async fn handshake(
    stream: TcpStream,
    path: String,
    limit: Duration,
) -> HalResult<WebSocketStream<TcpStream>> {
    let check_path = move |request: &Request, response: Response| {
        if request.uri().path() == path {
            Ok(response)
        } else {
            let body = format!("no websocket at {}", request.uri().path());
            let mut refusal = ErrorResponse::new(Some(body));
            *refusal.status_mut() = StatusCode::NOT_FOUND;
            Err(refusal)
        }
    };
    match time::timeout(limit, tokio_tungstenite::accept_hdr_async(stream, check_path)).await {
        Ok(result) => Ok(result?),
        Err(_) => Err(HalError::Transport(format!(
            "no websocket handshake within {} ms",
            limit.as_millis()
        ))),
    }
}

async fn next_message(
    active: &mut Option<ActiveClient>,
) -> Option<Result<Message, tungstenite::Error>> {
    match active {
        Some(client) => client.ws.next().await,
        None => std::future::pending().await,
    }
}

async fn reject(mut ws: WebSocketStream<TcpStream>) {
    if ws.send(Message::Text(REJECT_MESSAGE.to_string())).await.is_err() {
        return;
    }
    let _ = time::timeout(CLOSE_TIMEOUT, ws.close(None)).await;
    let _ = time::timeout(CLOSE_TIMEOUT, async {
        while let Some(Ok(_)) = ws.next().await {}
    })
    .await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::link;

    #[test]
    fn test_config_from_section() {
        let config = ServerConfig::default();
        assert_eq!(config.bind, "0.0.0.0:8888");
        assert_eq!(config.path, "/ws");
        assert_eq!(config.send_period, Duration::from_millis(100));
        assert_eq!(config.send_timeout, Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_zero_period_is_config_error() {
        let (_app, queues) = link();
        let config = ServerConfig {
            bind: "127.0.0.1:0".to_string(),
            send_period: Duration::ZERO,
            ..ServerConfig::default()
        };
        let result = TransportServer::new(config, queues).spawn().await;
        assert!(matches!(result, Err(HalError::Config(_))));
    }

    #[tokio::test]
    async fn test_spawn_reports_listening() {
        let (_app, queues) = link();
        let config = ServerConfig {
            bind: "127.0.0.1:0".to_string(),
            ..ServerConfig::default()
        };
        let mut handle = TransportServer::new(config, queues).spawn().await.unwrap();
        let addr = handle.local_addr();
        assert_eq!(handle.events().recv().await.unwrap(), ServerEvent::Listening(addr));
        handle.shutdown().await.unwrap();
    }
}
