use crate::types::LoadManagerError;
use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

/// Admin surface of a peer broker, as far as this controller needs it: tell
/// it to release a bundle, or to split one.
#[async_trait]
pub trait BrokerAdminApi: Send + Sync {
    async fn unload_bundle(
        &self,
        broker_web_url: &str,
        namespace: &str,
        range: &str,
    ) -> Result<(), LoadManagerError>;

    async fn split_bundle(
        &self,
        broker_web_url: &str,
        namespace: &str,
        range: &str,
    ) -> Result<(), LoadManagerError>;
}

/// Idle expiry of a cached per-broker HTTP client.
const CLIENT_IDLE_EXPIRY: Duration = Duration::from_secs(24 * 60 * 60);

/// REST implementation over each broker's web address. One client is kept
/// per address and dropped after a day without use.
pub struct HttpBrokerAdmin {
    clients: DashMap<String, (reqwest::Client, Instant)>,
    request_timeout: Duration,
}

impl HttpBrokerAdmin {
    pub fn new() -> Self {
        Self {
            clients: DashMap::new(),
            request_timeout: Duration::from_secs(30),
        }
    }

    fn client_for(&self, broker_web_url: &str) -> reqwest::Client {
        let mut entry = self
            .clients
            .entry(broker_web_url.to_string())
            .or_insert_with(|| {
                let client = reqwest::Client::builder()
                    .timeout(self.request_timeout)
                    .build()
                    .unwrap_or_default();
                (client, Instant::now())
            });
        entry.1 = Instant::now();
        entry.0.clone()
    }

    /// Drop clients idle past the expiry.
    pub fn purge_idle(&self) {
        self.clients
            .retain(|_, (_, last_used)| last_used.elapsed() < CLIENT_IDLE_EXPIRY);
    }

    async fn put(&self, broker_web_url: &str, path: String) -> Result<(), LoadManagerError> {
        let client = self.client_for(broker_web_url);
        let url = format!("{}{}", broker_web_url.trim_end_matches('/'), path);
        let response = client
            .put(&url)
            .send()
            .await
            .map_err(|e| LoadManagerError::Admin(format!("PUT {url}: {e}")))?;

        if response.status().is_success() {
            debug!(url = %url, "admin call ok");
            Ok(())
        } else {
            Err(LoadManagerError::Admin(format!(
                "PUT {url}: HTTP {}",
                response.status()
            )))
        }
    }
}

impl Default for HttpBrokerAdmin {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BrokerAdminApi for HttpBrokerAdmin {
    async fn unload_bundle(
        &self,
        broker_web_url: &str,
        namespace: &str,
        range: &str,
    ) -> Result<(), LoadManagerError> {
        let path = format!("/admin/v2/namespaces/{namespace}/{range}/unload");
        self.put(broker_web_url, path).await
    }

    async fn split_bundle(
        &self,
        broker_web_url: &str,
        namespace: &str,
        range: &str,
    ) -> Result<(), LoadManagerError> {
        let path = format!("/admin/v2/namespaces/{namespace}/{range}/split");
        self.put(broker_web_url, path).await
    }
}

/// Recording stub for tests and dry runs.
#[derive(Default)]
pub struct RecordingAdmin {
    pub unloads: parking_lot::Mutex<Vec<(String, String, String)>>,
    pub splits: parking_lot::Mutex<Vec<(String, String, String)>>,
    pub fail_unloads: std::sync::atomic::AtomicBool,
}

impl RecordingAdmin {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

#[async_trait]
impl BrokerAdminApi for RecordingAdmin {
    async fn unload_bundle(
        &self,
        broker_web_url: &str,
        namespace: &str,
        range: &str,
    ) -> Result<(), LoadManagerError> {
        if self.fail_unloads.load(std::sync::atomic::Ordering::Relaxed) {
            return Err(LoadManagerError::Admin("injected failure".to_string()));
        }
        self.unloads.lock().push((
            broker_web_url.to_string(),
            namespace.to_string(),
            range.to_string(),
        ));
        Ok(())
    }

    async fn split_bundle(
        &self,
        broker_web_url: &str,
        namespace: &str,
        range: &str,
    ) -> Result<(), LoadManagerError> {
        self.splits.lock().push((
            broker_web_url.to_string(),
            namespace.to_string(),
            range.to_string(),
        ));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_reuse_and_purge() {
        let admin = HttpBrokerAdmin::new();
        admin.client_for("http://b1:8080");
        admin.client_for("http://b1:8080");
        admin.client_for("http://b2:8080");
        assert_eq!(admin.clients.len(), 2);

        // Nothing is a day old yet
        admin.purge_idle();
        assert_eq!(admin.clients.len(), 2);
    }

    #[tokio::test]
    async fn test_recording_admin() {
        let admin = RecordingAdmin::new();
        admin
            .unload_bundle("http://b1:8080", "acme/east/ns", "0x00000000_0x80000000")
            .await
            .unwrap();
        assert_eq!(admin.unloads.lock().len(), 1);

        admin
            .fail_unloads
            .store(true, std::sync::atomic::Ordering::Relaxed);
        assert!(admin
            .unload_bundle("http://b1:8080", "acme/east/ns", "0x00000000_0x80000000")
            .await
            .is_err());
        assert_eq!(admin.unloads.lock().len(), 1);
    }
}
