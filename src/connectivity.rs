// Connectivity signal.
// Tracks whether the network is reachable so reads and writes can degrade offline.

use std::sync::Arc;

use tokio::sync::watch;

/// Shared online/offline flag. Cloning yields another handle to the same flag.
#[derive(Debug, Clone)]
pub struct Connectivity {
    tx: Arc<watch::Sender<bool>>,
}

impl Default for Connectivity {
    fn default() -> Self {
        Self::new(true)
    }
}

impl Connectivity {
    pub fn new(online: bool) -> Self {
        let (tx, _rx) = watch::channel(online);
        Self { tx: Arc::new(tx) }
    }

    pub fn is_online(&self) -> bool {
        *self.tx.borrow()
    }

    /// Record a connectivity change. Returns true if the state flipped.
    pub fn set_online(&self, online: bool) -> bool {
        let changed = self.tx.send_if_modified(|current| {
            if *current == online {
                false
            } else {
                *current = online;
                true
            }
        });
        if changed {
            tracing::info!(online, "Connectivity changed");
        }
        changed
    }

    /// Resolve once the network is reachable (immediately if it already is).
    pub async fn wait_online(&self) {
        let mut rx = self.tx.subscribe();
        // The sender lives as long as `self`, so this cannot fail.
        let _ = rx.wait_for(|online| *online).await;
    }

    /// Resolve once the network is lost (immediately if it already is).
    pub async fn wait_offline(&self) {
        let mut rx = self.tx.subscribe();
        let _ = rx.wait_for(|online| !*online).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_set_online_reports_flips_only() {
        let connectivity = Connectivity::new(true);
        assert!(!connectivity.set_online(true));
        assert!(connectivity.set_online(false));
        assert!(!connectivity.is_online());
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_online_resumes_after_reconnect() {
        let connectivity = Connectivity::new(false);
        let waiter = {
            let connectivity = connectivity.clone();
            tokio::spawn(async move { connectivity.wait_online().await })
        };

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!waiter.is_finished());

        connectivity.set_online(true);
        waiter.await.unwrap();
    }
}
