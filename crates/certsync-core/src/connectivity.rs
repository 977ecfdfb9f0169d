//! Connectivity oracle.
//!
//! Tracks whether the device can currently reach the certsync API and fans
//! transitions out to interested tasks. Platform shells feed it from their
//! own network callbacks; the CLI feeds it from [`ConnectivityMonitor::probe`].

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;

const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Shared online/offline flag with change notification.
#[derive(Debug, Clone)]
pub struct ConnectivityMonitor {
    state: Arc<watch::Sender<bool>>,
}

impl ConnectivityMonitor {
    pub fn new(initially_online: bool) -> Self {
        let (state, _) = watch::channel(initially_online);
        Self {
            state: Arc::new(state),
        }
    }

    pub fn is_online(&self) -> bool {
        *self.state.borrow()
    }

    /// Record the current status; returns `true` when it actually changed.
    pub fn set_online(&self, online: bool) -> bool {
        let changed = self.state.send_if_modified(|current| {
            if *current == online {
                false
            } else {
                *current = online;
                true
            }
        });
        if changed {
            tracing::info!("Connectivity changed: {}", if online { "online" } else { "offline" });
        }
        changed
    }

    /// Receiver observing every transition.
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.state.subscribe()
    }

    /// Invoke `callback` with the new status on every transition until the
    /// returned subscription is dropped or unsubscribed.
    pub fn on_change<F>(&self, mut callback: F) -> ConnectivitySubscription
    where
        F: FnMut(bool) + Send + 'static,
    {
        let mut receiver = self.subscribe();
        receiver.mark_unchanged();
        let task = tokio::spawn(async move {
            while receiver.changed().await.is_ok() {
                let online = *receiver.borrow_and_update();
                callback(online);
            }
        });
        ConnectivitySubscription { task: Some(task) }
    }

    /// Resolve once the device is online.
    pub async fn wait_for_online(&self) {
        let mut receiver = self.subscribe();
        // The sender lives as long as `self`, so this only fails on shutdown.
        let _ = receiver.wait_for(|online| *online).await;
    }

    /// Probe `url` with a GET and record the outcome.
    ///
    /// Any HTTP response counts as reachable; transport failures count as
    /// offline.
    pub async fn probe(&self, client: &reqwest::Client, url: &str) -> bool {
        let online = match client.get(url).timeout(PROBE_TIMEOUT).send().await {
            Ok(_) => true,
            Err(error) => {
                tracing::debug!("Connectivity probe to {url} failed: {error}");
                false
            }
        };
        self.set_online(online);
        online
    }
}

impl Default for ConnectivityMonitor {
    fn default() -> Self {
        Self::new(true)
    }
}

/// Handle returned by [`ConnectivityMonitor::on_change`].
#[derive(Debug)]
pub struct ConnectivitySubscription {
    task: Option<JoinHandle<()>>,
}

impl ConnectivitySubscription {
    pub fn unsubscribe(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

impl Drop for ConnectivitySubscription {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use tokio::time::timeout;

    #[test]
    fn set_online_reports_transitions_only() {
        let monitor = ConnectivityMonitor::new(false);
        assert!(!monitor.is_online());
        assert!(monitor.set_online(true));
        assert!(!monitor.set_online(true));
        assert!(monitor.is_online());
    }

    #[tokio::test]
    async fn callbacks_observe_transitions_until_unsubscribed() {
        let monitor = ConnectivityMonitor::new(true);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();

        let sink = Arc::clone(&seen);
        let subscription = monitor.on_change(move |online| {
            sink.lock().unwrap().push(online);
            let _ = tx.send(());
        });

        monitor.set_online(false);
        timeout(Duration::from_secs(1), rx.recv()).await.unwrap();
        monitor.set_online(true);
        timeout(Duration::from_secs(1), rx.recv()).await.unwrap();
        assert_eq!(*seen.lock().unwrap(), vec![false, true]);

        subscription.unsubscribe();
        tokio::task::yield_now().await;
        monitor.set_online(false);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(seen.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn wait_for_online_resolves_after_reconnect() {
        let monitor = ConnectivityMonitor::new(false);
        let waiter = monitor.clone();
        let handle = tokio::spawn(async move { waiter.wait_for_online().await });

        tokio::task::yield_now().await;
        monitor.set_online(true);
        timeout(Duration::from_secs(1), handle).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn probe_marks_unreachable_host_offline() {
        let monitor = ConnectivityMonitor::new(true);
        let client = reqwest::Client::new();
        assert!(!monitor.probe(&client, "http://127.0.0.1:9/healthz").await);
        assert!(!monitor.is_online());
    }
}
