//! Websocket market data client
//!
//! Connects, sends the subscription message, and forwards every binary frame
//! to a channel. Dropped connections are retried with capped exponential
//! backoff until shutdown is signalled or the receiver goes away.

use std::time::Duration;

use anyhow::{bail, Context, Result};
use futures::{SinkExt, StreamExt};
use tokio::sync::{mpsc, watch};
use tokio::time;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use super::subscription::{subscribe_message, SubscriptionPreference};

/// Live feed client configuration
#[derive(Debug, Clone)]
pub struct FeedClient {
    /// Websocket endpoint without the token query
    pub url: String,
    /// Public access token appended as `x_jwt_token`
    pub access_token: String,
    pub preferences: Vec<SubscriptionPreference>,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub ping_interval: Duration,
    pub channel_buffer: usize,
}

impl FeedClient {
    pub fn new(url: String, access_token: String, preferences: Vec<SubscriptionPreference>) -> Self {
        Self {
            url,
            access_token,
            preferences,
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(30),
            ping_interval: Duration::from_secs(20),
            channel_buffer: 4096,
        }
    }

    fn connect_url(&self) -> String {
        format!("{}?x_jwt_token={}", self.url, self.access_token)
    }

    /// Spawn the connection loop and return the frame receiver.
    pub fn spawn(self, mut shutdown: watch::Receiver<bool>) -> mpsc::Receiver<Vec<u8>> {
        let (tx, rx) = mpsc::channel(self.channel_buffer);

        tokio::spawn(async move {
            let mut backoff = self.initial_backoff;

            loop {
                if tx.is_closed() || *shutdown.borrow() {
                    break;
                }

                match self.run_session(&tx, &mut shutdown).await {
                    Ok(()) => {
                        info!("Feed session ended");
                        backoff = self.initial_backoff;
                    }
                    Err(e) => warn!("Feed session failed: {:#}", e),
                }

                if tx.is_closed() || *shutdown.borrow() {
                    break;
                }

                debug!("Reconnecting feed in {:?}", backoff);
                tokio::select! {
                    _ = time::sleep(backoff) => {}
                    _ = shutdown.changed() => break,
                }
                backoff = (backoff * 2).min(self.max_backoff);
            }

            info!("Feed client stopped");
        });

        rx
    }

    async fn run_session(
        &self,
        tx: &mpsc::Sender<Vec<u8>>,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<()> {
        let (mut socket, _) = connect_async(self.connect_url())
            .await
            .context("Failed to connect to market data feed")?;
        info!("Connected to market data feed at {}", self.url);

        let subscribe = subscribe_message(&self.preferences)?;
        socket
            .send(Message::Text(subscribe))
            .await
            .context("Failed to send subscription")?;
        info!("Subscribed to {} instruments", self.preferences.len());

        let mut ping = time::interval(self.ping_interval);
        ping.set_missed_tick_behavior(time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    let _ = socket.close(None).await;
                    return Ok(());
                }
                _ = ping.tick() => {
                    socket.send(Message::Ping(Vec::new())).await.context("Failed to ping feed")?;
                }
                msg = socket.next() => {
                    let Some(msg) = msg else {
                        bail!("Feed stream closed");
                    };
                    match msg.context("Feed read error")? {
                        Message::Binary(frame) => {
                            if tx.send(frame).await.is_err() {
                                return Ok(());
                            }
                        }
                        Message::Ping(payload) => {
                            socket.send(Message::Pong(payload)).await.context("Failed to answer ping")?;
                        }
                        Message::Text(text) => debug!("Feed text message: {}", text),
                        Message::Close(frame) => bail!("Feed closed by server: {:?}", frame),
                        _ => {}
                    }
                }
            }
        }
    }
}
