//! Alert dispatch channels.
//!
//! The alert manager persists every alert to the database (which is what
//! the dashboard banner reads), then fans it out here. Dispatch is
//! non-blocking: channels consume from a bounded broadcast queue, and a
//! slow channel loses the oldest items rather than stalling the monitor.

use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use crate::config::AlertSettings;
use crate::storage::AlertRecord;

/// Bounded dispatch queue size; lagging consumers drop the oldest entries.
const DISPATCH_QUEUE_SIZE: usize = 100;

/// Fan-out hub for raised alerts.
#[derive(Clone)]
pub struct AlertDispatcher {
    tx: broadcast::Sender<AlertRecord>,
}

impl AlertDispatcher {
    /// Build the dispatcher and spawn a worker per enabled channel.
    pub fn new(
        settings: &AlertSettings,
        client: reqwest::Client,
        shutdown: CancellationToken,
    ) -> Self {
        let (tx, _) = broadcast::channel(DISPATCH_QUEUE_SIZE);

        if let Some(url) = settings.webhook_url.clone() {
            let rx = tx.subscribe();
            let client = client.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                webhook_worker(rx, client, url, shutdown).await;
            });
        }

        if settings.desktop_notify {
            let rx = tx.subscribe();
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                desktop_worker(rx, shutdown).await;
            });
        }

        Self { tx }
    }

    /// Queue an alert for every channel. Never blocks; with no subscribers
    /// this is a no-op.
    pub fn dispatch(&self, alert: AlertRecord) {
        let _ = self.tx.send(alert);
    }

    /// Subscribe to the raw alert stream (used by tests and any future
    /// push surface).
    pub fn subscribe(&self) -> broadcast::Receiver<AlertRecord> {
        self.tx.subscribe()
    }
}

async fn webhook_worker(
    mut rx: broadcast::Receiver<AlertRecord>,
    client: reqwest::Client,
    url: String,
    shutdown: CancellationToken,
) {
    loop {
        let alert = tokio::select! {
            _ = shutdown.cancelled() => break,
            received = rx.recv() => match received {
                Ok(alert) => alert,
                Err(broadcast::error::RecvError::Lagged(dropped)) => {
                    tracing::warn!(dropped, "Webhook channel lagged; oldest alerts dropped");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
        };

        let result = client
            .post(&url)
            .json(&alert)
            .timeout(std::time::Duration::from_secs(10))
            .send()
            .await;
        match result {
            Ok(response) if response.status().is_success() => {
                tracing::debug!(alert_id = alert.id, "Alert webhook delivered");
            }
            Ok(response) => {
                tracing::warn!(
                    alert_id = alert.id,
                    status = response.status().as_u16(),
                    "Alert webhook rejected"
                );
            }
            Err(e) => {
                tracing::warn!(alert_id = alert.id, error = %e, "Alert webhook failed");
            }
        }
    }
}

async fn desktop_worker(mut rx: broadcast::Receiver<AlertRecord>, shutdown: CancellationToken) {
    loop {
        let alert = tokio::select! {
            _ = shutdown.cancelled() => break,
            received = rx.recv() => match received {
                Ok(alert) => alert,
                Err(broadcast::error::RecvError::Lagged(dropped)) => {
                    tracing::warn!(dropped, "Desktop channel lagged; oldest alerts dropped");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
        };

        let summary = format!("llm-hub: {} ({})", alert.kind, alert.severity.as_str());
        let result = tokio::process::Command::new("notify-send")
            .arg(summary)
            .arg(&alert.message)
            .status()
            .await;
        if let Err(e) = result {
            tracing::warn!(alert_id = alert.id, error = %e, "Desktop notification failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{AlertKind, AlertSeverity};
    use chrono::Utc;

    fn alert(id: i64) -> AlertRecord {
        AlertRecord {
            id,
            created_at: Utc::now(),
            resolved_at: None,
            dismissed_at: None,
            dedup_key: format!("1:{}", AlertKind::ConsecutiveErrors),
            kind: AlertKind::ConsecutiveErrors,
            severity: AlertSeverity::Error,
            message: "3 consecutive failures".to_string(),
            metadata: serde_json::json!({}),
        }
    }

    fn dispatcher() -> AlertDispatcher {
        AlertDispatcher::new(
            &AlertSettings::default(),
            reqwest::Client::new(),
            CancellationToken::new(),
        )
    }

    #[tokio::test]
    async fn dispatch_without_subscribers_is_a_noop() {
        dispatcher().dispatch(alert(1));
    }

    #[tokio::test]
    async fn subscribers_receive_alerts() {
        let dispatcher = dispatcher();
        let mut rx = dispatcher.subscribe();
        dispatcher.dispatch(alert(7));
        let received = rx.recv().await.unwrap();
        assert_eq!(received.id, 7);
    }

    #[tokio::test]
    async fn slow_subscriber_drops_oldest() {
        let dispatcher = dispatcher();
        let mut rx = dispatcher.subscribe();

        // Overflow the bounded queue without consuming
        for id in 0..150 {
            dispatcher.dispatch(alert(id));
        }

        // First receive reports the lag; the retained window starts at the
        // oldest surviving alert. (The queue capacity is rounded up to a
        // power of two internally, so only the drop-oldest shape is fixed.)
        let dropped = match rx.recv().await {
            Err(broadcast::error::RecvError::Lagged(dropped)) => dropped,
            other => panic!("expected lag, got {:?}", other),
        };
        assert!(dropped > 0);
        let first_retained = rx.recv().await.unwrap();
        assert_eq!(first_retained.id, dropped as i64);
    }
}
