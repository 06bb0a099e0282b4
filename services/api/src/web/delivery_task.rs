//! services/api/src/web/delivery_task.rs
//!
//! The asynchronous "worker" that drains one subscriber's queue into its connection.
//!
//! Every write is bounded by the write deadline. A zero-length ping goes out once per
//! deadline period, whether or not updates flowed in between, so dead peers are noticed.

use crate::error::ApiError;
use crate::hub::SharedUpdate;
use async_trait::async_trait;
use axum::extract::ws::{Message, WebSocket};
use bytes::Bytes;
use futures::{stream::SplitSink, SinkExt, Stream, StreamExt};
use std::future::Future;
use std::time::Duration;
use tinyquiz_core::state::StateUpdate;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// The write half of a live connection.
#[async_trait]
pub trait LiveConnection: Send {
    async fn send_update(&mut self, update: &StateUpdate) -> Result<(), ApiError>;

    /// Sends an empty liveness probe.
    async fn probe(&mut self) -> Result<(), ApiError>;
}

#[async_trait]
impl LiveConnection for SplitSink<WebSocket, Message> {
    async fn send_update(&mut self, update: &StateUpdate) -> Result<(), ApiError> {
        let json = serde_json::to_string(update)
            .map_err(|e| ApiError::Internal(format!("Failed to encode state update: {}", e)))?;
        self.send(Message::Text(json.into())).await?;
        Ok(())
    }

    async fn probe(&mut self) -> Result<(), ApiError> {
        self.send(Message::Ping(Bytes::new())).await?;
        Ok(())
    }
}

/// Why a delivery loop stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryEnd {
    /// The peer went away or the server is shutting down.
    Cancelled,
    /// The hub dropped the subscription.
    Unsubscribed,
    WriteFailed,
    WriteTimedOut,
}

/// Forwards updates to the connection until one of the ends in [`DeliveryEnd`] occurs.
pub async fn delivery_process<C, S>(
    connection: &mut C,
    mut updates: S,
    write_deadline: Duration,
    cancellation_token: CancellationToken,
) -> DeliveryEnd
where
    C: LiveConnection,
    S: Stream<Item = SharedUpdate> + Unpin,
{
    info!("Delivery process started.");
    let mut ticker = tokio::time::interval_at(Instant::now() + write_deadline, write_deadline);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        let end = tokio::select! {
            _ = cancellation_token.cancelled() => Some(DeliveryEnd::Cancelled),
            next = updates.next() => match next {
                Some(update) => write_within(write_deadline, connection.send_update(&update)).await,
                None => Some(DeliveryEnd::Unsubscribed),
            },
            _ = ticker.tick() => {
                debug!("Probing connection.");
                write_within(write_deadline, connection.probe()).await
            }
        };
        if let Some(end) = end {
            info!(?end, "Delivery process finished.");
            return end;
        }
    }
}

async fn write_within<F>(deadline: Duration, write: F) -> Option<DeliveryEnd>
where
    F: Future<Output = Result<(), ApiError>>,
{
    match tokio::time::timeout(deadline, write).await {
        Ok(Ok(())) => None,
        Ok(Err(e)) => {
            warn!("Failed to write to the connection: {}", e);
            Some(DeliveryEnd::WriteFailed)
        }
        Err(_) => {
            warn!("Write missed its deadline of {:?}.", deadline);
            Some(DeliveryEnd::WriteTimedOut)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::stream;
    use std::sync::Arc;

    #[derive(Default)]
    struct FakeConnection {
        updates: Vec<StateUpdate>,
        probes: usize,
        fail: bool,
        stall: bool,
    }

    #[async_trait]
    impl LiveConnection for FakeConnection {
        async fn send_update(&mut self, update: &StateUpdate) -> Result<(), ApiError> {
            if self.stall {
                std::future::pending::<()>().await;
            }
            if self.fail {
                return Err(ApiError::Internal("broken pipe".to_string()));
            }
            self.updates.push(update.clone());
            Ok(())
        }

        async fn probe(&mut self) -> Result<(), ApiError> {
            self.probes += 1;
            Ok(())
        }
    }

    const DEADLINE: Duration = Duration::from_secs(10);

    #[tokio::test]
    async fn forwards_updates_until_unsubscribed() {
        let mut conn = FakeConnection::default();
        let updates = stream::iter(vec![
            Arc::new(StateUpdate::results_ready()),
            Arc::new(StateUpdate::default()),
        ]);
        let end = delivery_process(&mut conn, updates, DEADLINE, CancellationToken::new()).await;
        assert_eq!(end, DeliveryEnd::Unsubscribed);
        assert_eq!(conn.updates, vec![StateUpdate::results_ready(), StateUpdate::default()]);
    }

    #[tokio::test(start_paused = true)]
    async fn idle_connections_are_probed_each_period() {
        let mut conn = FakeConnection::default();
        let token = CancellationToken::new();
        let stopper = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(DEADLINE * 3 + Duration::from_secs(1)).await;
            stopper.cancel();
        });
        let end = delivery_process(&mut conn, stream::pending(), DEADLINE, token).await;
        assert_eq!(end, DeliveryEnd::Cancelled);
        assert_eq!(conn.probes, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn probes_keep_their_period_while_updates_flow() {
        let mut conn = FakeConnection::default();
        // One update every four seconds for 24 seconds, then silence.
        let updates = stream::unfold(0, |sent| async move {
            if sent == 6 {
                return None;
            }
            tokio::time::sleep(Duration::from_secs(4)).await;
            Some((Arc::new(StateUpdate::default()), sent + 1))
        })
        .chain(stream::pending());
        let token = CancellationToken::new();
        let stopper = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(25)).await;
            stopper.cancel();
        });
        let end = delivery_process(&mut conn, Box::pin(updates), DEADLINE, token).await;
        assert_eq!(end, DeliveryEnd::Cancelled);
        assert_eq!(conn.updates.len(), 6);
        assert_eq!(conn.probes, 2);
    }

    #[tokio::test]
    async fn failed_write_ends_delivery() {
        let mut conn = FakeConnection {
            fail: true,
            ..Default::default()
        };
        let updates = stream::iter(vec![Arc::new(StateUpdate::default())]).chain(stream::pending());
        let end = delivery_process(&mut conn, updates, DEADLINE, CancellationToken::new()).await;
        assert_eq!(end, DeliveryEnd::WriteFailed);
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_write_times_out() {
        let mut conn = FakeConnection {
            stall: true,
            ..Default::default()
        };
        let updates = stream::iter(vec![Arc::new(StateUpdate::default())]).chain(stream::pending());
        let end = delivery_process(&mut conn, updates, DEADLINE, CancellationToken::new()).await;
        assert_eq!(end, DeliveryEnd::WriteTimedOut);
        assert!(conn.updates.is_empty());
    }
}
