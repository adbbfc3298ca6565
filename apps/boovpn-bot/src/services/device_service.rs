use std::sync::Arc;

use boovpn_db::{StoreError, Subscriber, SubscriberRepository, device_credential_name};
use thiserror::Error;
use tracing::{error, info, warn};

use crate::api_client::{AuthSession, PanelApi, ProvisioningError};

#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("subscription is not active")]
    Inactive,

    #[error("device slot {0} does not exist")]
    NoSuchSlot(usize),

    #[error("device slot {0} is already in use")]
    SlotTaken(usize),

    #[error(transparent)]
    Provisioning(#[from] ProvisioningError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Remote credential lifecycle for device slots. Every panel call gets one
/// re-authentication and one retry before the error is returned.
#[derive(Clone)]
pub struct DeviceService {
    api: Arc<dyn PanelApi>,
    session: AuthSession,
    repo: SubscriberRepository,
}

impl DeviceService {
    pub fn new(api: Arc<dyn PanelApi>, session: AuthSession, repo: SubscriberRepository) -> Self {
        Self { api, session, repo }
    }

    /// Creates the remote credential for a slot and returns its URI.
    pub async fn provision(
        &self,
        subscriber_id: i64,
        slot_index: usize,
    ) -> Result<String, ProvisioningError> {
        let name = device_credential_name(subscriber_id, slot_index);
        let token = self.session.token().await;

        match self.api.create_credential(&token, &name).await {
            Ok(uri) => Ok(uri),
            Err(first) => {
                warn!(credential = %name, "Create failed, re-authenticating: {}", first);
                let token = self.session.refresh(self.api.as_ref()).await?;
                self.api.create_credential(&token, &name).await
            }
        }
    }

    /// Deletes the remote credential for a slot. A credential the panel does
    /// not know counts as deleted.
    pub async fn revoke(&self, subscriber_id: i64, slot_index: usize) -> Result<(), ProvisioningError> {
        let name = device_credential_name(subscriber_id, slot_index);
        let token = self.session.token().await;

        let first = match self.api.delete_credential(&token, &name).await {
            Ok(()) => return Ok(()),
            Err(e) if e.is_not_found() => {
                info!(credential = %name, "Credential already absent on panel");
                return Ok(());
            }
            Err(e) => e,
        };

        warn!(credential = %name, "Delete failed, re-authenticating: {}", first);
        let token = self.session.refresh(self.api.as_ref()).await?;
        match self.api.delete_credential(&token, &name).await {
            Err(e) if e.is_not_found() => Ok(()),
            other => other,
        }
    }

    /// Provisions a new device for a subscriber and records it in the slot.
    pub async fn add_device(&self, sub: &Subscriber, slot_index: usize) -> Result<String, DeviceError> {
        if !sub.is_active {
            return Err(DeviceError::Inactive);
        }
        if slot_index == 0 || slot_index > self.repo.slot_count() {
            return Err(DeviceError::NoSuchSlot(slot_index));
        }
        if sub.device_slots.get(slot_index).is_some() {
            return Err(DeviceError::SlotTaken(slot_index));
        }

        let uri = self.provision(sub.id, slot_index).await?;

        if let Err(e) = self.repo.store_device_credential(sub.id, slot_index, &uri).await {
            error!(
                subscriber = sub.id,
                slot = slot_index,
                "Credential created but not stored, rolling back: {}",
                e
            );
            if let Err(rollback) = self.revoke(sub.id, slot_index).await {
                error!(
                    credential = %device_credential_name(sub.id, slot_index),
                    "Orphaned panel credential: {}",
                    rollback
                );
            }
            return Err(match e {
                StoreError::Inactive(_) => DeviceError::Inactive,
                other => other.into(),
            });
        }

        info!(subscriber = sub.id, slot = slot_index, "Device provisioned");
        Ok(uri)
    }

    /// Revokes a device remotely, then clears its slot.
    pub async fn remove_device(&self, sub: &Subscriber, slot_index: usize) -> Result<(), DeviceError> {
        if slot_index == 0 || slot_index > self.repo.slot_count() {
            return Err(DeviceError::NoSuchSlot(slot_index));
        }
        if sub.device_slots.get(slot_index).is_some() {
            self.revoke(sub.id, slot_index).await?;
        }
        self.repo.set_device_slot(sub.id, slot_index, None).await?;
        info!(subscriber = sub.id, slot = slot_index, "Device removed");
        Ok(())
    }
}

#[cfg(test)]
pub mod testing {
    use super::*;
    use crate::config::TokenStore;
    use async_trait::async_trait;
    use std::collections::{HashMap, VecDeque};
    use std::sync::Mutex;

    /// In-memory panel. Queued failures are consumed one per call before the
    /// call itself is served.
    #[derive(Default)]
    pub struct FakePanel {
        pub credentials: Mutex<HashMap<String, String>>,
        pub delete_failures: Mutex<VecDeque<ProvisioningError>>,
        pub create_failures: Mutex<VecDeque<ProvisioningError>>,
        pub deletes: Mutex<Vec<(String, String)>>,
        pub auth_calls: Mutex<u32>,
        pub auth_fails: bool,
    }

    impl FakePanel {
        pub fn with_credentials(names: &[&str]) -> Self {
            let panel = Self::default();
            for name in names {
                panel
                    .credentials
                    .lock()
                    .unwrap()
                    .insert(name.to_string(), format!("ss://{}", name));
            }
            panel
        }

        pub fn fail_deletes(&self, count: usize) {
            let mut queue = self.delete_failures.lock().unwrap();
            for _ in 0..count {
                queue.push_back(ProvisioningError::Remote {
                    status: 401,
                    body: "Could not validate credentials".into(),
                });
            }
        }

        pub fn fail_creates(&self, count: usize) {
            let mut queue = self.create_failures.lock().unwrap();
            for _ in 0..count {
                queue.push_back(ProvisioningError::Remote {
                    status: 401,
                    body: "Could not validate credentials".into(),
                });
            }
        }

        pub fn has(&self, name: &str) -> bool {
            self.credentials.lock().unwrap().contains_key(name)
        }

        pub fn delete_count(&self) -> usize {
            self.deletes.lock().unwrap().len()
        }

        pub fn auth_count(&self) -> u32 {
            *self.auth_calls.lock().unwrap()
        }
    }

    #[async_trait]
    impl PanelApi for FakePanel {
        async fn authenticate(&self) -> Result<String, ProvisioningError> {
            let mut calls = self.auth_calls.lock().unwrap();
            *calls += 1;
            if self.auth_fails {
                return Err(ProvisioningError::Auth("401 Unauthorized".into()));
            }
            Ok(format!("token-{}", *calls))
        }

        async fn create_credential(&self, _token: &str, name: &str) -> Result<String, ProvisioningError> {
            if let Some(e) = self.create_failures.lock().unwrap().pop_front() {
                return Err(e);
            }
            let uri = format!("ss://{}", name);
            self.credentials
                .lock()
                .unwrap()
                .insert(name.to_string(), uri.clone());
            Ok(uri)
        }

        async fn delete_credential(&self, token: &str, name: &str) -> Result<(), ProvisioningError> {
            self.deletes
                .lock()
                .unwrap()
                .push((token.to_string(), name.to_string()));
            if let Some(e) = self.delete_failures.lock().unwrap().pop_front() {
                return Err(e);
            }
            match self.credentials.lock().unwrap().remove(name) {
                Some(_) => Ok(()),
                None => Err(ProvisioningError::Remote {
                    status: 404,
                    body: "User not found".into(),
                }),
            }
        }
    }

    #[derive(Default)]
    pub struct MemoryTokenStore {
        pub saved: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl TokenStore for MemoryTokenStore {
        async fn persist_token(&self, token: &str) -> anyhow::Result<()> {
            self.saved.lock().unwrap().push(token.to_string());
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::{FakePanel, MemoryTokenStore};
    use super::*;
    use boovpn_db::db::init_in_memory;
    use chrono::Utc;

    async fn setup(panel: FakePanel) -> (DeviceService, Arc<FakePanel>, Arc<MemoryTokenStore>, SubscriberRepository) {
        let repo = SubscriberRepository::new(init_in_memory().await.unwrap(), 3);
        let panel = Arc::new(panel);
        let tokens = Arc::new(MemoryTokenStore::default());
        let session = AuthSession::new("stale".into(), tokens.clone());
        let service = DeviceService::new(panel.clone(), session, repo.clone());
        (service, panel, tokens, repo)
    }

    #[tokio::test]
    async fn revoke_retries_once_with_a_fresh_token() {
        let (service, panel, tokens, _) = setup(FakePanel::with_credentials(&["5_device1"])).await;
        panel.fail_deletes(1);

        service.revoke(5, 1).await.unwrap();

        assert!(!panel.has("5_device1"));
        assert_eq!(panel.auth_count(), 1);
        let deletes = panel.deletes.lock().unwrap().clone();
        assert_eq!(deletes[0].0, "stale");
        assert_eq!(deletes[1].0, "token-1");
        assert_eq!(tokens.saved.lock().unwrap().clone(), vec!["token-1".to_string()]);
    }

    #[tokio::test]
    async fn revoke_gives_up_after_second_failure() {
        let (service, panel, _, _) = setup(FakePanel::with_credentials(&["5_device1"])).await;
        panel.fail_deletes(2);

        assert!(service.revoke(5, 1).await.is_err());
        assert!(panel.has("5_device1"));
        assert_eq!(panel.delete_count(), 2);
    }

    #[tokio::test]
    async fn revoke_treats_missing_credential_as_done() {
        let (service, panel, _, _) = setup(FakePanel::default()).await;
        service.revoke(5, 2).await.unwrap();
        assert_eq!(panel.auth_count(), 0);
    }

    #[tokio::test]
    async fn failed_reauth_aborts_without_retry() {
        let (service, panel, _, _) = setup(FakePanel {
            auth_fails: true,
            ..FakePanel::with_credentials(&["5_device1"])
        })
        .await;
        panel.fail_deletes(1);

        assert!(matches!(
            service.revoke(5, 1).await,
            Err(ProvisioningError::Auth(_))
        ));
        assert_eq!(panel.delete_count(), 1);
    }

    #[tokio::test]
    async fn add_device_stores_the_new_uri() {
        let (service, panel, _, repo) = setup(FakePanel::default()).await;
        let sub = repo.create(42, 7, Utc::now()).await.unwrap();
        panel.fail_creates(1);

        let uri = service.add_device(&sub, 1).await.unwrap();

        assert_eq!(uri, "ss://42_device1");
        let stored = repo.get_by_id(42).await.unwrap().unwrap();
        assert_eq!(stored.device_slots.get(1), Some("ss://42_device1"));
        assert_eq!(panel.auth_count(), 1);
    }

    #[tokio::test]
    async fn add_device_checks_slot_and_status() {
        let (service, _, _, repo) = setup(FakePanel::default()).await;
        let mut sub = repo.create(42, 7, Utc::now()).await.unwrap();

        assert!(matches!(service.add_device(&sub, 4).await, Err(DeviceError::NoSuchSlot(4))));

        sub.device_slots.set(2, Some("ss://existing".into()));
        assert!(matches!(service.add_device(&sub, 2).await, Err(DeviceError::SlotTaken(2))));

        sub.is_active = false;
        assert!(matches!(service.add_device(&sub, 1).await, Err(DeviceError::Inactive)));
    }

    #[tokio::test]
    async fn remove_device_keeps_slot_when_panel_refuses() {
        let (service, panel, _, repo) = setup(FakePanel::default()).await;
        let sub = repo.create(42, 7, Utc::now()).await.unwrap();
        service.add_device(&sub, 1).await.unwrap();
        let sub = repo.get_by_id(42).await.unwrap().unwrap();

        panel.fail_deletes(2);
        assert!(service.remove_device(&sub, 1).await.is_err());
        assert!(repo.get_by_id(42).await.unwrap().unwrap().device_slots.get(1).is_some());

        service.remove_device(&sub, 1).await.unwrap();
        assert!(repo.get_by_id(42).await.unwrap().unwrap().device_slots.is_empty());
        assert!(!panel.has("42_device1"));
    }

    #[tokio::test]
    async fn add_device_rolls_back_when_subscriber_expired_meanwhile() {
        let (service, panel, _, repo) = setup(FakePanel::default()).await;
        let sub = repo.create(42, 7, Utc::now()).await.unwrap();
        repo.set_active(42, false).await.unwrap();

        assert!(matches!(service.add_device(&sub, 1).await, Err(DeviceError::Inactive)));
        assert!(!panel.has("42_device1"));
        assert!(repo.get_by_id(42).await.unwrap().unwrap().device_slots.is_empty());
    }
}
