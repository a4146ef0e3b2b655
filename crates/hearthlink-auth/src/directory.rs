//! In-memory identity directory with persisted admin edits
//!
//! Admin mutations run under the write lock: the list is cloned, edited,
//! saved through the [`DirectoryStore`], and only then installed. Saving and
//! installing run together on the blocking pool and finish even if the
//! caller stops waiting. A failed save leaves the in-memory list untouched.

use crate::engine::{self, AuthOutcome};
use crate::identity::{is_valid_pin, Identity};
use crate::storage::{DirectoryStore, StorageError, StorageResult};
use hearthlink_core::protocol::{NewUser, Role, UserSummary, UserUpdates};
use hearthlink_core::{Error, MacAddress, Result};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{error, info};

const USER: &str = "User";

/// The configured users and where they are saved
pub struct IdentityDirectory {
    identities: Arc<RwLock<Vec<Identity>>>,
    store: Arc<dyn DirectoryStore>,
}

impl IdentityDirectory {
    /// Create a directory from an already-loaded list
    pub fn new(identities: Vec<Identity>, store: Arc<dyn DirectoryStore>) -> Self {
        Self {
            identities: Arc::new(RwLock::new(
                identities.into_iter().map(Identity::normalized).collect(),
            )),
            store,
        }
    }

    /// Load the directory from `store`
    pub fn load(store: Arc<dyn DirectoryStore>) -> StorageResult<Self> {
        let identities = store.load()?;
        Ok(Self::new(identities, store))
    }

    /// Run the auth engine against the current list
    pub async fn authenticate(&self, pin: &str, hardware_address: Option<&MacAddress>) -> AuthOutcome {
        let identities = self.identities.read().await;
        engine::authenticate(&identities, pin, hardware_address)
    }

    pub async fn get(&self, id: &str) -> Option<Identity> {
        let identities = self.identities.read().await;
        identities.iter().find(|i| i.id == id).cloned()
    }

    pub async fn len(&self) -> usize {
        self.identities.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.identities.read().await.is_empty()
    }

    /// Admin view of every identity, without secrets
    pub async fn summaries(&self) -> Vec<UserSummary> {
        let identities = self.identities.read().await;
        identities.iter().map(Identity::summary).collect()
    }

    /// Change the PIN, passphrase or device enforcement of an identity
    pub async fn update_user(&self, id: &str, updates: UserUpdates) -> Result<Vec<UserSummary>> {
        self.mutate(|identities| {
            let target = find_mut(identities, id)?;

            if let Some(pin) = updates.pin {
                if !is_valid_pin(&pin) {
                    return Err(Error::validation("PIN must be exactly 4 digits."));
                }
                target.pin = pin;
            }

            if let Some(passphrase) = updates.passphrase {
                if !target.role.is_privileged() {
                    return Err(Error::validation(
                        "Passphrases are only for parent/admin users.",
                    ));
                }
                target.passphrase = Some(passphrase).filter(|p| !p.is_empty());
            }

            if let Some(required) = updates.mac_required {
                target.mac_required = required;
            }

            Ok(true)
        })
        .await
    }

    /// Register a device for an identity
    pub async fn add_mac(&self, id: &str, raw_mac: &str) -> Result<Vec<UserSummary>> {
        let mac = MacAddress::parse(raw_mac)
            .map_err(|_| Error::validation("Invalid MAC address format."))?;
        self.mutate(|identities| Ok(find_mut(identities, id)?.add_mac(mac)))
            .await
    }

    /// Forget a device; unknown addresses are not an error
    pub async fn remove_mac(&self, id: &str, raw_mac: &str) -> Result<Vec<UserSummary>> {
        let mac = MacAddress::normalize(raw_mac);
        self.mutate(|identities| Ok(find_mut(identities, id)?.remove_mac(&mac)))
            .await
    }

    /// Register the device the admin is connected from
    pub async fn add_current_device(
        &self,
        id: &str,
        current: Option<&MacAddress>,
    ) -> Result<Vec<UserSummary>> {
        self.mutate(|identities| {
            let target = find_mut(identities, id)?;
            let mac = current.ok_or_else(|| {
                Error::validation("Could not detect this device's MAC address.")
            })?;
            Ok(target.add_mac(mac.clone()))
        })
        .await
    }

    /// Create a new identity with no devices
    pub async fn add_user(&self, user: NewUser) -> Result<Vec<UserSummary>> {
        let identity = new_identity(user)?;
        let (name, id) = (identity.name.clone(), identity.id.clone());

        let users = self
            .mutate(|identities| {
                if identities.iter().any(|i| i.id == identity.id) {
                    return Err(Error::validation("A user with that ID already exists."));
                }
                identities.push(identity);
                Ok(true)
            })
            .await?;

        info!("User added: {} ({})", name, id);
        Ok(users)
    }

    /// Delete an identity; `acting_id` may not remove itself
    pub async fn remove_user(&self, id: &str, acting_id: &str) -> Result<Vec<UserSummary>> {
        if id.is_empty() {
            return Err(Error::validation("Missing userId."));
        }
        if id == acting_id {
            return Err(Error::validation("Cannot remove your own account."));
        }

        let users = self
            .mutate(|identities| {
                let index = identities
                    .iter()
                    .position(|i| i.id == id)
                    .ok_or_else(|| Error::NotFound(USER.to_string()))?;
                identities.remove(index);
                Ok(true)
            })
            .await?;

        info!("User removed: {}", id);
        Ok(users)
    }

    /// Apply `edit` to a copy of the list, persist it if changed, then install it
    async fn mutate<F>(&self, edit: F) -> Result<Vec<UserSummary>>
    where
        F: FnOnce(&mut Vec<Identity>) -> Result<bool>,
    {
        let mut identities = self.identities.clone().write_owned().await;
        let mut draft = identities.clone();

        if !edit(&mut draft)? {
            return Ok(identities.iter().map(Identity::summary).collect());
        }

        let store = self.store.clone();
        let saved = tokio::task::spawn_blocking(move || {
            store.save(&draft)?;
            *identities = draft;
            Ok::<Vec<UserSummary>, StorageError>(identities.iter().map(Identity::summary).collect())
        })
        .await;

        match saved {
            Ok(Ok(users)) => Ok(users),
            Ok(Err(e)) => {
                error!("Failed to save user directory: {}", e);
                Err(Error::PersistFailure(e.to_string()))
            }
            Err(e) => {
                error!("User directory save task failed: {}", e);
                Err(Error::PersistFailure(e.to_string()))
            }
        }
    }
}

fn find_mut<'a>(identities: &'a mut [Identity], id: &str) -> Result<&'a mut Identity> {
    identities
        .iter_mut()
        .find(|i| i.id == id)
        .ok_or_else(|| Error::NotFound(USER.to_string()))
}

fn new_identity(user: NewUser) -> Result<Identity> {
    let missing = || Error::validation("Missing required fields: id, name, pin, agent, role.");
    let present = |field: Option<String>| field.filter(|v| !v.is_empty());

    let id = present(user.id).ok_or_else(missing)?;
    let name = present(user.name).ok_or_else(missing)?;
    let pin = present(user.pin).ok_or_else(missing)?;
    let agent = present(user.agent).ok_or_else(missing)?;
    let role = present(user.role).ok_or_else(missing)?;

    if !is_valid_pin(&pin) {
        return Err(Error::validation("PIN must be exactly 4 digits."));
    }
    let role: Role = role.parse()?;

    let mut identity = Identity::new(id, name, pin, agent, role);
    if role.is_privileged() {
        identity.passphrase = user.passphrase.filter(|p| !p.is_empty());
    }
    Ok(identity)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::AuthReason;
    use crate::storage::{FileStore, MemoryStore};
    use std::time::Duration;
    use tempfile::tempdir;

    fn household() -> Vec<Identity> {
        vec![
            Identity::new("home:dad", "Dad", "1111", "main", Role::Admin).with_passphrase("kettle"),
            Identity::new("home:kid", "Kid", "2222", "tutor", Role::Child),
        ]
    }

    fn directory() -> (IdentityDirectory, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new(household()));
        let dir = IdentityDirectory::load(store.clone()).unwrap();
        (dir, store)
    }

    fn new_user(id: &str, role: &str) -> NewUser {
        NewUser {
            id: Some(id.to_string()),
            name: Some("Gran".to_string()),
            pin: Some("4321".to_string()),
            agent: Some("main".to_string()),
            role: Some(role.to_string()),
            passphrase: Some("scones".to_string()),
        }
    }

    #[tokio::test]
    async fn test_authenticate_uses_current_list() {
        let (dir, _) = directory();
        let outcome = dir.authenticate("2222", None).await;
        assert_eq!(outcome.reason, AuthReason::PinOnly);

        dir.update_user(
            "home:kid",
            UserUpdates {
                pin: Some("3333".into()),
                ..Default::default()
            },
        )
        .await
        .unwrap();
        assert_eq!(dir.authenticate("2222", None).await.reason, AuthReason::InvalidPin);
        assert_eq!(dir.authenticate("3333", None).await.reason, AuthReason::PinOnly);
    }

    #[tokio::test]
    async fn test_update_user_validation() {
        let (dir, store) = directory();

        let err = dir
            .update_user(
                "home:kid",
                UserUpdates {
                    pin: Some("12".into()),
                    ..Default::default()
                },
            )
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "PIN must be exactly 4 digits.");

        let err = dir
            .update_user(
                "home:kid",
                UserUpdates {
                    passphrase: Some("nope".into()),
                    ..Default::default()
                },
            )
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "Passphrases are only for parent/admin users.");

        let err = dir
            .update_user("home:nobody", UserUpdates::default())
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "User not found.");
        assert_eq!(store.save_count(), 0);
    }

    #[tokio::test]
    async fn test_empty_passphrase_clears() {
        let (dir, store) = directory();
        let users = dir
            .update_user(
                "home:dad",
                UserUpdates {
                    passphrase: Some(String::new()),
                    mac_required: Some(true),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let dad = users.iter().find(|u| u.id == "home:dad").unwrap();
        assert!(!dad.has_passphrase);
        assert!(dad.mac_required);
        assert!(store.stored()[0].passphrase.is_none());
    }

    #[tokio::test]
    async fn test_add_and_remove_mac() {
        let (dir, store) = directory();

        let err = dir.add_mac("home:kid", "not-a-mac").await.unwrap_err();
        assert_eq!(err.to_string(), "Invalid MAC address format.");

        let users = dir.add_mac("home:kid", "AA-BB-CC-DD-EE-FF").await.unwrap();
        assert_eq!(users[1].macs[0].as_str(), "aa:bb:cc:dd:ee:ff");
        assert_eq!(store.save_count(), 1);

        // Already present: success without another save
        dir.add_mac("home:kid", "aa:bb:cc:dd:ee:ff").await.unwrap();
        assert_eq!(store.save_count(), 1);

        // Absent: success without a save
        dir.remove_mac("home:kid", "11:22:33:44:55:66").await.unwrap();
        assert_eq!(store.save_count(), 1);

        let users = dir.remove_mac("home:kid", "AA:BB:CC:DD:EE:FF").await.unwrap();
        assert!(users[1].macs.is_empty());
        assert_eq!(store.save_count(), 2);
    }

    #[tokio::test]
    async fn test_add_current_device() {
        let (dir, _) = directory();
        let err = dir.add_current_device("home:kid", None).await.unwrap_err();
        assert_eq!(err.to_string(), "Could not detect this device's MAC address.");

        let mac = MacAddress::parse("aa:bb:cc:dd:ee:01").unwrap();
        let users = dir.add_current_device("home:kid", Some(&mac)).await.unwrap();
        assert_eq!(users[1].macs, vec![mac]);
    }

    #[tokio::test]
    async fn test_add_user() {
        let (dir, store) = directory();

        let users = dir.add_user(new_user("home:gran", "parent")).await.unwrap();
        assert_eq!(users.len(), 3);
        assert!(users[2].has_passphrase);
        assert!(users[2].macs.is_empty());
        assert!(!users[2].mac_required);

        // Passphrase dropped for children
        dir.add_user(new_user("home:kid2", "child")).await.unwrap();
        assert!(store.stored()[3].passphrase.is_none());

        let err = dir.add_user(new_user("home:gran", "parent")).await.unwrap_err();
        assert_eq!(err.to_string(), "A user with that ID already exists.");

        let err = dir.add_user(new_user("home:x", "owner")).await.unwrap_err();
        assert_eq!(err.to_string(), "Role must be admin, parent, or child.");

        let mut incomplete = new_user("home:y", "child");
        incomplete.agent = None;
        let err = dir.add_user(incomplete).await.unwrap_err();
        assert_eq!(err.code(), "validation_error");

        let mut bad_pin = new_user("home:z", "child");
        bad_pin.pin = Some("12345".into());
        assert!(dir.add_user(bad_pin).await.is_err());

        assert_eq!(dir.len().await, 4);
    }

    #[tokio::test]
    async fn test_remove_user() {
        let (dir, _) = directory();

        let err = dir.remove_user("home:dad", "home:dad").await.unwrap_err();
        assert_eq!(err.to_string(), "Cannot remove your own account.");

        let err = dir.remove_user("", "home:dad").await.unwrap_err();
        assert_eq!(err.to_string(), "Missing userId.");

        let err = dir.remove_user("home:ghost", "home:dad").await.unwrap_err();
        assert_eq!(err.code(), "not_found");

        let users = dir.remove_user("home:kid", "home:dad").await.unwrap();
        assert_eq!(users.len(), 1);
        assert!(dir.get("home:kid").await.is_none());
    }

    #[tokio::test]
    async fn test_persist_failure_keeps_memory_unchanged() {
        let (dir, store) = directory();
        store.set_fail_saves(true);

        let err = dir.add_mac("home:kid", "aa:bb:cc:dd:ee:ff").await.unwrap_err();
        assert_eq!(err.code(), "persist_failure");
        assert_eq!(err.to_string(), "Failed to save changes.");

        let kid = dir.get("home:kid").await.unwrap();
        assert!(kid.mac.is_empty());
        assert!(store.stored()[1].mac.is_empty());
    }

    /// Store whose saves take a while, like a slow disk
    struct SlowStore(MemoryStore);

    impl DirectoryStore for SlowStore {
        fn load(&self) -> StorageResult<Vec<Identity>> {
            self.0.load()
        }

        fn save(&self, identities: &[Identity]) -> StorageResult<()> {
            std::thread::sleep(Duration::from_millis(300));
            self.0.save(identities)
        }
    }

    #[tokio::test]
    async fn test_slow_save_does_not_stall_the_runtime() {
        let dir = IdentityDirectory::load(Arc::new(SlowStore(MemoryStore::new(household())))).unwrap();

        let save = dir.add_mac("home:kid", "aa:bb:cc:dd:ee:ff");
        tokio::pin!(save);
        tokio::select! {
            biased;
            _ = &mut save => panic!("save finished before the timer"),
            _ = tokio::time::sleep(Duration::from_millis(20)) => {}
        }

        let users = save.await.unwrap();
        assert_eq!(users[1].macs.len(), 1);
        assert_eq!(dir.get("home:kid").await.unwrap().mac.len(), 1);
    }

    #[tokio::test]
    async fn test_file_backed_mutation_survives_reload() {
        let tmp = tempdir().unwrap();
        let path = tmp.path().join("users.yaml");
        let store = Arc::new(FileStore::with_path(&path));
        store.save(&household()).unwrap();

        let dir = IdentityDirectory::load(store).unwrap();
        dir.add_mac("home:kid", "aa:bb:cc:dd:ee:ff").await.unwrap();

        let reloaded = IdentityDirectory::load(Arc::new(FileStore::with_path(&path))).unwrap();
        let kid = reloaded.get("home:kid").await.unwrap();
        assert_eq!(kid.mac[0].as_str(), "aa:bb:cc:dd:ee:ff");
    }
}
