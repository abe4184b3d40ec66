use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, RwLock};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::debug;

/// User-facing HTTP credential: bearer + refresh token + expiry.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct HttpCredential {
    pub user_id: String,
    pub access_token: String,
    pub refresh_token: String,
    pub expires_at: Option<DateTime<Utc>>,
}

impl HttpCredential {
    pub fn expires_within(&self, window: std::time::Duration) -> bool {
        match self.expires_at {
            Some(expires_at) => {
                let window = ChronoDuration::from_std(window).unwrap_or(ChronoDuration::zero());
                Utc::now() + window >= expires_at
            }
            None => false,
        }
    }
}

/// Telemetry broker credential issued per user client.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MqttCredential {
    pub broker_url: String,
    pub client_id: String,
    pub username: String,
    pub password: String,
    pub topic_scope: String,
}

/// Realtime-messaging credential.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AgoraCredential {
    pub rtm_user_id: String,
    pub rtm_token: String,
    pub app_user_id: String,
}

/// Cache of the three cloud credentials. Each slot holds an immutable
/// snapshot behind an `Arc`; readers clone the handle, writers publish a
/// new one under the write lock.
#[derive(Default)]
pub struct CredentialStore {
    http: RwLock<Option<Arc<HttpCredential>>>,
    mqtt: RwLock<Option<Arc<MqttCredential>>>,
    agora: RwLock<Option<Arc<AgoraCredential>>>,
    refresh_guard: Arc<AsyncMutex<()>>,
}

impl CredentialStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_http(&self, credential: HttpCredential) {
        *self.http.write().unwrap() = Some(Arc::new(credential));
    }

    pub fn http(&self) -> Option<Arc<HttpCredential>> {
        self.http.read().unwrap().clone()
    }

    pub fn clear_http(&self) {
        *self.http.write().unwrap() = None;
    }

    pub fn set_mqtt(&self, credential: MqttCredential) {
        *self.mqtt.write().unwrap() = Some(Arc::new(credential));
    }

    pub fn mqtt(&self) -> Option<Arc<MqttCredential>> {
        self.mqtt.read().unwrap().clone()
    }

    pub fn set_agora(&self, credential: AgoraCredential) {
        *self.agora.write().unwrap() = Some(Arc::new(credential));
    }

    pub fn agora(&self) -> Option<Arc<AgoraCredential>> {
        self.agora.read().unwrap().clone()
    }

    pub fn clear_all(&self) {
        *self.http.write().unwrap() = None;
        *self.mqtt.write().unwrap() = None;
        *self.agora.write().unwrap() = None;
    }

    /// Single-flight guard for credential refresh: returns `None` when a
    /// refresh is already running, so callers skip instead of stacking up.
    pub fn try_begin_refresh(&self) -> Option<OwnedMutexGuard<()>> {
        match self.refresh_guard.clone().try_lock_owned() {
            Ok(guard) => Some(guard),
            Err(_) => {
                debug!("credential refresh already in flight, skipping");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn expiry_window_check() {
        let credential = HttpCredential {
            expires_at: Some(Utc::now() + ChronoDuration::minutes(5)),
            ..Default::default()
        };
        assert!(credential.expires_within(Duration::from_secs(600)));
        assert!(!credential.expires_within(Duration::from_secs(60)));

        let no_expiry = HttpCredential::default();
        assert!(!no_expiry.expires_within(Duration::from_secs(600)));
    }

    #[test]
    fn refresh_guard_is_single_flight() {
        let store = CredentialStore::new();
        let first = store.try_begin_refresh();
        assert!(first.is_some());
        assert!(store.try_begin_refresh().is_none());
        drop(first);
        assert!(store.try_begin_refresh().is_some());
    }

    #[test]
    fn readers_see_the_published_snapshot() {
        let store = CredentialStore::new();
        assert!(store.http().is_none());

        store.set_http(HttpCredential {
            user_id: "u1".to_string(),
            access_token: "tok".to_string(),
            ..Default::default()
        });
        let snapshot = store.http().unwrap();
        assert_eq!(snapshot.user_id, "u1");

        store.set_http(HttpCredential {
            user_id: "u2".to_string(),
            ..Default::default()
        });
        // The earlier snapshot is unaffected by the swap.
        assert_eq!(snapshot.user_id, "u1");
        assert_eq!(store.http().unwrap().user_id, "u2");
    }
}
