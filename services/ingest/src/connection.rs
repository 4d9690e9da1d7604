//! WebSocket connection plumbing.
//!
//! One [`WsConnection`] wraps one live socket. Lifecycle (reconnects,
//! rotation, heartbeat policing) belongs to the supervisor; this layer
//! only connects with a deadline, tracks age and idle time, and moves
//! frames.

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::time::{timeout, Instant};
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tracing::info;
use types::venue::Exchange;

use crate::error::{IngestError, Result};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// A live venue WebSocket.
pub struct WsConnection {
    exchange: Exchange,
    stream: WsStream,
    opened_at: Instant,
    last_message_at: Instant,
}

impl WsConnection {
    /// Connect with a handshake deadline.
    pub async fn open(exchange: Exchange, url: &str, connect_timeout: Duration) -> Result<Self> {
        let connect = connect_async(url);
        match timeout(connect_timeout, connect).await {
            Ok(Ok((stream, response))) => {
                info!(%exchange, status = %response.status(), "websocket connected");
                let now = Instant::now();
                Ok(Self {
                    exchange,
                    stream,
                    opened_at: now,
                    last_message_at: now,
                })
            }
            Ok(Err(e)) => Err(IngestError::ConnectionFailed {
                exchange,
                reason: e.to_string(),
            }),
            Err(_) => Err(IngestError::ConnectionTimeout {
                exchange,
                timeout_ms: connect_timeout.as_millis() as u64,
            }),
        }
    }

    pub async fn send(&mut self, message: Message) -> Result<()> {
        self.stream.send(message).await?;
        Ok(())
    }

    /// Next frame; `Ok(None)` means the peer closed the stream cleanly.
    pub async fn recv(&mut self) -> Result<Option<Message>> {
        match self.stream.next().await {
            Some(Ok(message)) => {
                self.last_message_at = Instant::now();
                Ok(Some(message))
            }
            Some(Err(e)) => Err(IngestError::WebSocket(e)),
            None => Ok(None),
        }
    }

    /// Time since the socket was opened. Drives proactive rotation.
    pub fn age(&self) -> Duration {
        self.opened_at.elapsed()
    }

    /// Time since the last received frame. Drives stall detection.
    pub fn idle(&self) -> Duration {
        self.last_message_at.elapsed()
    }

    pub fn exchange(&self) -> Exchange {
        self.exchange
    }

    pub async fn close(&mut self) {
        let _ = self.stream.close(None).await;
    }
}

/// Exponential reconnect backoff: 1 s initial, x2 per failure, capped.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    cap: Duration,
    current: Option<Duration>,
}

impl Backoff {
    pub fn new(initial: Duration, cap: Duration) -> Self {
        Self {
            initial,
            cap,
            current: None,
        }
    }

    /// Reconnect policy delay: 1 s doubling to 300 s.
    pub fn reconnect() -> Self {
        Self::new(Duration::from_secs(1), Duration::from_secs(300))
    }

    /// Delay to sleep before the next attempt, doubling for the one after.
    pub fn next_delay(&mut self) -> Duration {
        let delay = match self.current {
            Some(current) => (current * 2).min(self.cap),
            None => self.initial,
        };
        self.current = Some(delay);
        delay
    }

    /// A successful attempt restarts the schedule.
    pub fn reset(&mut self) {
        self.current = None;
    }
}

/// Apply +/-10% jitter so fleets of reconnecting workers do not thunder.
pub fn jittered(duration: Duration) -> Duration {
    use rand::Rng;
    let millis = duration.as_millis() as u64;
    if millis == 0 {
        return duration;
    }
    let spread = millis / 10;
    let low = millis.saturating_sub(spread);
    let high = millis + spread;
    Duration::from_millis(rand::thread_rng().gen_range(low..=high))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_to_cap() {
        let mut backoff = Backoff::reconnect();
        assert_eq!(backoff.next_delay(), Duration::from_secs(1));
        assert_eq!(backoff.next_delay(), Duration::from_secs(2));
        assert_eq!(backoff.next_delay(), Duration::from_secs(4));
        for _ in 0..10 {
            backoff.next_delay();
        }
        assert_eq!(backoff.next_delay(), Duration::from_secs(300));
    }

    #[test]
    fn backoff_resets_after_success() {
        let mut backoff = Backoff::reconnect();
        backoff.next_delay();
        backoff.next_delay();
        backoff.reset();
        assert_eq!(backoff.next_delay(), Duration::from_secs(1));
    }

    #[test]
    fn jitter_stays_within_ten_percent() {
        let base = Duration::from_secs(30);
        for _ in 0..100 {
            let jittered = jittered(base);
            assert!(jittered >= Duration::from_secs(27));
            assert!(jittered <= Duration::from_secs(33));
        }
    }
}
