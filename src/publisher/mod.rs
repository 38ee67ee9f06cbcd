//! MQTT notification publisher
//!
//! Relays `{method, params}` notifications to an external broker with
//! exact-match method filtering and bounded waits: 5 s to connect, 2 s per
//! publish, 250 ms disconnect grace. A driving task owns the rumqttc event
//! loop and maintains the connected flag from `ConnAck` and error events;
//! reconnection is the loop's business, `publish` simply reports
//! not-connected until it succeeds.

use std::time::Duration;

use parking_lot::Mutex;
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::token::Notification;

const CLIENT_ID_PREFIX: &str = "zaparoo-publisher-";
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const PUBLISH_TIMEOUT: Duration = Duration::from_secs(2);
const DISCONNECT_GRACE: Duration = Duration::from_millis(250);

/// Publisher errors
#[derive(Debug, Error)]
pub enum PublishError {
    /// Client handle missing or the broker connection is down
    #[error("publisher not connected")]
    NotConnected,

    /// Broker did not accept the connection within the bound
    #[error("broker connect timed out")]
    ConnectTimeout,

    /// Broker did not take the message within the bound
    #[error("publish timed out")]
    Timeout,

    /// Broker or client reported a failure
    #[error("broker error: {0}")]
    Broker(String),

    #[error("JSON encoding error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Publisher configuration
#[derive(Debug, Clone)]
pub struct PublisherOptions {
    pub host: String,
    pub port: u16,
    /// Single topic all notifications are published to
    pub topic: String,
    /// Exact-match method filter; empty accepts everything
    pub filter: Vec<String>,
}

struct Inner {
    client: AsyncClient,
    connected: watch::Receiver<bool>,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

/// MQTT publisher with a process-unique client ID.
///
/// Safe for concurrent `publish` callers; the client handle lives behind a
/// mutex and is cloned out for the actual send.
pub struct MqttPublisher {
    options: PublisherOptions,
    inner: Mutex<Option<Inner>>,
}

impl MqttPublisher {
    pub fn new(options: PublisherOptions) -> Self {
        Self {
            options,
            inner: Mutex::new(None),
        }
    }

    /// Connect to the broker, waiting up to 5 s for the acknowledgment.
    /// On failure the client handle is torn down before returning.
    pub async fn start(&self) -> Result<(), PublishError> {
        if self.inner.lock().is_some() {
            return Ok(());
        }

        let client_id = format!("{CLIENT_ID_PREFIX}{:08x}", std::process::id());
        let mut mqtt_options =
            MqttOptions::new(client_id, self.options.host.as_str(), self.options.port);
        mqtt_options.set_keep_alive(Duration::from_secs(30));

        let (client, mut event_loop) = AsyncClient::new(mqtt_options, 10);
        let (conn_tx, mut conn_rx) = watch::channel(false);
        let cancel = CancellationToken::new();

        let loop_cancel = cancel.clone();
        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;

                    _ = loop_cancel.cancelled() => break,

                    event = event_loop.poll() => match event {
                        Ok(Event::Incoming(Packet::ConnAck(_))) => {
                            debug!("broker connection established");
                            let _ = conn_tx.send(true);
                        }
                        Ok(Event::Incoming(Packet::Disconnect)) => {
                            warn!("broker sent disconnect");
                            let _ = conn_tx.send(false);
                        }
                        Ok(_) => {}
                        Err(err) => {
                            warn!(error = %err, "broker connection lost");
                            let _ = conn_tx.send(false);
                            // Back off before the event loop retries.
                            tokio::select! {
                                _ = loop_cancel.cancelled() => break,
                                _ = tokio::time::sleep(Duration::from_secs(1)) => {}
                            }
                        }
                    }
                }
            }
        });

        let connected =
            tokio::time::timeout(CONNECT_TIMEOUT, conn_rx.wait_for(|up| *up)).await;
        let connect_ok = matches!(connected, Ok(Ok(_)));
        drop(connected);
        if !connect_ok {
            cancel.cancel();
            let _ = client.disconnect().await;
            task.abort();
            return Err(PublishError::ConnectTimeout);
        }

        info!(
            host = %self.options.host,
            port = self.options.port,
            topic = %self.options.topic,
            "MQTT publisher started"
        );
        *self.inner.lock() = Some(Inner {
            client,
            connected: conn_rx,
            cancel,
            task,
        });
        Ok(())
    }

    /// Disconnect with a short grace period. Idempotent.
    pub async fn stop(&self) {
        let Some(inner) = self.inner.lock().take() else {
            return;
        };
        if *inner.connected.borrow() {
            let _ = inner.client.disconnect().await;
            tokio::time::sleep(DISCONNECT_GRACE).await;
        }
        inner.cancel.cancel();
        let _ = inner.task.await;
        info!("MQTT publisher stopped");
    }

    /// Relay one notification.
    ///
    /// Returns `Ok(true)` when published, `Ok(false)` when the filter
    /// dropped it. A failed publish surfaces the error and leaves the
    /// client connected.
    pub async fn publish(&self, notification: &Notification) -> Result<bool, PublishError> {
        let (client, connected) = {
            let guard = self.inner.lock();
            let Some(inner) = guard.as_ref() else {
                return Err(PublishError::NotConnected);
            };
            let connected = *inner.connected.borrow();
            (inner.client.clone(), connected)
        };
        if !connected {
            return Err(PublishError::NotConnected);
        }

        if !method_allowed(&self.options.filter, &notification.method) {
            debug!(method = %notification.method, "notification dropped by filter");
            return Ok(false);
        }

        let payload = serde_json::to_vec(notification)?;
        let send = client.publish(
            self.options.topic.as_str(),
            QoS::AtLeastOnce,
            false,
            payload,
        );
        match tokio::time::timeout(PUBLISH_TIMEOUT, send).await {
            Ok(Ok(())) => {
                debug!(method = %notification.method, "notification published");
                Ok(true)
            }
            Ok(Err(err)) => Err(PublishError::Broker(err.to_string())),
            Err(_) => Err(PublishError::Timeout),
        }
    }
}

/// Empty filter accepts everything; otherwise the method must match an
/// entry exactly (case-sensitive)
pub fn method_allowed(filter: &[String], method: &str) -> bool {
    filter.is_empty() || filter.iter().any(|entry| entry == method)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn options(filter: Vec<String>) -> PublisherOptions {
        PublisherOptions {
            host: "localhost".to_string(),
            port: 1883,
            topic: "zaparoo/events".to_string(),
            filter,
        }
    }

    #[test]
    fn test_empty_filter_accepts_all() {
        assert!(method_allowed(&[], "media.started"));
        assert!(method_allowed(&[], ""));
    }

    #[test]
    fn test_filter_exact_match_only() {
        let filter = vec!["tokens.added".to_string()];
        assert!(method_allowed(&filter, "tokens.added"));
        assert!(!method_allowed(&filter, "media.started"));
        assert!(!method_allowed(&filter, "tokens.adde"));
        assert!(!method_allowed(&filter, "tokens.added "));
    }

    #[test]
    fn test_filter_is_case_sensitive() {
        let filter = vec!["tokens.added".to_string()];
        assert!(!method_allowed(&filter, "Tokens.Added"));
        assert!(!method_allowed(&filter, "TOKENS.ADDED"));
    }

    #[tokio::test]
    async fn test_publish_before_start_is_not_connected() {
        let publisher = MqttPublisher::new(options(vec![]));
        let notification = Notification::new("tokens.added", serde_json::json!({}));
        let err = publisher.publish(&notification).await.unwrap_err();
        assert!(matches!(err, PublishError::NotConnected));
    }

    #[tokio::test]
    async fn test_stop_without_start_is_safe() {
        let publisher = MqttPublisher::new(options(vec![]));
        publisher.stop().await;
        publisher.stop().await;
    }
}
