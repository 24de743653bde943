//! Proxy-owned state: connected clients, per-client subscription sets, the
//! global reference-counted subscription table, and the per-user adapter
//! map.
//!
//! Lock hierarchy (strict order, never inverted):
//! `subscription_lock` → `user_lock` → `adapter_lock`. No lock is held
//! across a broker call or a client socket send; callers mutate under the
//! subscription lock, release it across I/O, and re-acquire to commit or
//! roll back.

use parking_lot::Mutex;
use std::{
    collections::{HashMap, HashSet},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use crate::feed::FeedAdapter;
use crate::models::SubKey;
use crate::proxy::outbox::Outbox;

pub type ClientId = u64;

/// Global subscription key: one broker subscription per (user, key).
pub type UserKey = (String, SubKey);

pub struct ClientHandle {
    pub user_id: String,
    pub broker: String,
    pub outbox: Arc<Outbox>,
}

#[derive(Default)]
pub struct SubscriptionTables {
    pub clients: HashMap<ClientId, ClientHandle>,
    client_subs: HashMap<ClientId, HashSet<SubKey>>,
    global_subs: HashMap<UserKey, HashSet<ClientId>>,
    ref_count: HashMap<UserKey, usize>,
    /// Keys whose first-subscriber broker call is in flight.
    pending: HashSet<UserKey>,
}

/// Outcome of the pre-registration step of the subscribe algorithm.
#[derive(Debug, PartialEq, Eq)]
pub enum PreRegister {
    /// (client, key) already present: warn, change nothing.
    AlreadySubscribed,
    /// Key unknown: the caller is the first subscriber. The client is
    /// pre-registered and the key marked pending; the caller must issue the
    /// broker subscribe and then commit or roll back.
    First,
    /// Key established by someone else: registered and committed, no broker
    /// call required.
    Shared,
    /// Another client's first-subscribe is in flight; retry shortly.
    Wait,
}

impl SubscriptionTables {
    pub fn register_client(&mut self, id: ClientId, handle: ClientHandle) {
        self.clients.insert(id, handle);
        self.client_subs.entry(id).or_default();
    }

    pub fn client_user(&self, id: ClientId) -> Option<&str> {
        self.clients.get(&id).map(|h| h.user_id.as_str())
    }

    pub fn ref_count(&self, user_key: &UserKey) -> usize {
        self.ref_count.get(user_key).copied().unwrap_or(0)
    }

    pub fn has_key(&self, user_key: &UserKey) -> bool {
        self.global_subs.contains_key(user_key)
    }

    pub fn client_sub_count(&self, id: ClientId) -> usize {
        self.client_subs.get(&id).map(|s| s.len()).unwrap_or(0)
    }

    /// Steps 1–3 of the subscribe algorithm, atomic under the caller's lock.
    pub fn pre_register(&mut self, client: ClientId, user_key: &UserKey) -> PreRegister {
        if self
            .client_subs
            .get(&client)
            .map(|s| s.contains(&user_key.1))
            .unwrap_or(false)
        {
            return PreRegister::AlreadySubscribed;
        }
        if self.pending.contains(user_key) {
            return PreRegister::Wait;
        }

        let is_first = !self.global_subs.contains_key(user_key);
        self.global_subs
            .entry(user_key.clone())
            .or_default()
            .insert(client);
        *self.ref_count.entry(user_key.clone()).or_insert(0) += 1;

        if is_first {
            self.pending.insert(user_key.clone());
            PreRegister::First
        } else {
            self.client_subs
                .entry(client)
                .or_default()
                .insert(user_key.1.clone());
            PreRegister::Shared
        }
    }

    /// Broker subscribe succeeded: clear pending, record on the client.
    pub fn commit_first(&mut self, client: ClientId, user_key: &UserKey) {
        self.pending.remove(user_key);
        self.client_subs
            .entry(client)
            .or_default()
            .insert(user_key.1.clone());
    }

    /// Broker subscribe failed: revert the pre-registration.
    pub fn rollback_first(&mut self, client: ClientId, user_key: &UserKey) {
        self.pending.remove(user_key);
        if let Some(set) = self.global_subs.get_mut(user_key) {
            set.remove(&client);
            if set.is_empty() {
                self.global_subs.remove(user_key);
            }
        }
        if let Some(count) = self.ref_count.get_mut(user_key) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                self.ref_count.remove(user_key);
            }
        }
    }

    /// Unsubscribe steps 1–2. `Ok(true)` means the reference count reached
    /// zero and the caller must issue the broker unsubscribe (outside the
    /// lock).
    pub fn remove_subscription(
        &mut self,
        client: ClientId,
        user_key: &UserKey,
    ) -> Result<bool, ()> {
        let had = self
            .client_subs
            .get_mut(&client)
            .map(|s| s.remove(&user_key.1))
            .unwrap_or(false);
        if !had {
            return Err(());
        }

        if let Some(set) = self.global_subs.get_mut(user_key) {
            set.remove(&client);
            if set.is_empty() {
                self.global_subs.remove(user_key);
            }
        }
        let last = match self.ref_count.get_mut(user_key) {
            Some(count) => {
                *count = count.saturating_sub(1);
                if *count == 0 {
                    self.ref_count.remove(user_key);
                    true
                } else {
                    false
                }
            }
            None => false,
        };
        Ok(last)
    }

    /// Copy of the client's subscription set.
    pub fn client_keys(&self, id: ClientId) -> Vec<SubKey> {
        self.client_subs
            .get(&id)
            .map(|s| s.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Disconnect cleanup step 1: drop every subscription the client holds
    /// (iterating a copy) and report which keys hit zero references.
    pub fn remove_client(&mut self, client: ClientId) -> Vec<SubKey> {
        let user = match self.clients.get(&client) {
            Some(h) => h.user_id.clone(),
            None => return Vec::new(),
        };
        let keys: Vec<SubKey> = self
            .client_subs
            .get(&client)
            .map(|s| s.iter().cloned().collect())
            .unwrap_or_default();

        let mut last_keys = Vec::new();
        for key in keys {
            let user_key = (user.clone(), key.clone());
            if matches!(self.remove_subscription(client, &user_key), Ok(true)) {
                last_keys.push(key);
            }
        }
        self.client_subs.remove(&client);
        self.clients.remove(&client);
        last_keys
    }

    /// Snapshot of outbox handles for clients of `user` subscribed to `key`.
    /// Taken under the lock; sends happen after release.
    pub fn fanout_targets(&self, user: &str, key: &SubKey) -> Vec<Arc<Outbox>> {
        let user_key = (user.to_string(), key.clone());
        let Some(clients) = self.global_subs.get(&user_key) else {
            return Vec::new();
        };
        clients
            .iter()
            .filter_map(|id| self.clients.get(id).map(|h| h.outbox.clone()))
            .collect()
    }

    /// Internal consistency: `ref_count[k] == |global_subs[k]|` and
    /// membership symmetry between the per-client and global tables.
    #[cfg(test)]
    pub fn validate(&self) {
        for (user_key, set) in &self.global_subs {
            assert_eq!(
                self.ref_count.get(user_key).copied().unwrap_or(0),
                set.len(),
                "ref_count mismatch for {user_key:?}"
            );
            for client in set {
                // Pending first-subscribers are in global_subs but not yet
                // in client_subs.
                if self.pending.contains(user_key) {
                    continue;
                }
                assert!(
                    self.client_subs
                        .get(client)
                        .map(|s| s.contains(&user_key.1))
                        .unwrap_or(false),
                    "client {client} missing key {user_key:?}"
                );
            }
        }
        for (client, keys) in &self.client_subs {
            let Some(handle) = self.clients.get(client) else {
                assert!(keys.is_empty());
                continue;
            };
            for key in keys {
                let user_key = (handle.user_id.clone(), key.clone());
                assert!(
                    self.global_subs
                        .get(&user_key)
                        .map(|s| s.contains(client))
                        .unwrap_or(false),
                    "global table missing client {client} for {user_key:?}"
                );
            }
        }
    }
}

/// All proxy state behind the three named locks.
pub struct ProxyState {
    /// `subscription_lock`.
    pub subs: Mutex<SubscriptionTables>,
    /// `user_lock`: user_id → connected client ids.
    pub users: Mutex<HashMap<String, HashSet<ClientId>>>,
    /// `adapter_lock`: user_id → live adapter. tokio Mutex because adapter
    /// creation awaits broker setup.
    pub adapters: tokio::sync::Mutex<HashMap<String, Arc<FeedAdapter>>>,
    next_client_id: AtomicU64,
}

impl ProxyState {
    pub fn new() -> Self {
        Self {
            subs: Mutex::new(SubscriptionTables::default()),
            users: Mutex::new(HashMap::new()),
            adapters: tokio::sync::Mutex::new(HashMap::new()),
            next_client_id: AtomicU64::new(1),
        }
    }

    pub fn next_client_id(&self) -> ClientId {
        self.next_client_id.fetch_add(1, Ordering::Relaxed)
    }
}

impl Default for ProxyState {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Mode;

    fn key(symbol: &str) -> SubKey {
        SubKey {
            symbol: symbol.into(),
            exchange: "NSE".into(),
            mode: Mode::Ltp,
        }
    }

    fn user_key(symbol: &str) -> UserKey {
        ("u1".to_string(), key(symbol))
    }

    fn register(tables: &mut SubscriptionTables, id: ClientId) {
        tables.register_client(
            id,
            ClientHandle {
                user_id: "u1".into(),
                broker: "mock".into(),
                outbox: Arc::new(Outbox::new()),
            },
        );
    }

    #[test]
    fn first_then_shared_then_already() {
        let mut t = SubscriptionTables::default();
        register(&mut t, 1);
        register(&mut t, 2);
        let uk = user_key("SBIN");

        assert_eq!(t.pre_register(1, &uk), PreRegister::First);
        // Concurrent subscriber waits while the broker call is in flight.
        assert_eq!(t.pre_register(2, &uk), PreRegister::Wait);
        t.commit_first(1, &uk);
        t.validate();

        assert_eq!(t.pre_register(2, &uk), PreRegister::Shared);
        assert_eq!(t.ref_count(&uk), 2);
        t.validate();

        assert_eq!(t.pre_register(2, &uk), PreRegister::AlreadySubscribed);
        assert_eq!(t.ref_count(&uk), 2);
        t.validate();
    }

    #[test]
    fn rollback_restores_pre_state() {
        let mut t = SubscriptionTables::default();
        register(&mut t, 1);
        let uk = user_key("XYZ");

        assert_eq!(t.pre_register(1, &uk), PreRegister::First);
        assert_eq!(t.ref_count(&uk), 1);
        t.rollback_first(1, &uk);

        assert!(!t.has_key(&uk));
        assert_eq!(t.ref_count(&uk), 0);
        // The next subscriber is first again.
        assert_eq!(t.pre_register(1, &uk), PreRegister::First);
        t.validate();
    }

    #[test]
    fn unsubscribe_reports_last_reference() {
        let mut t = SubscriptionTables::default();
        register(&mut t, 1);
        register(&mut t, 2);
        let uk = user_key("SBIN");

        assert_eq!(t.pre_register(1, &uk), PreRegister::First);
        t.commit_first(1, &uk);
        assert_eq!(t.pre_register(2, &uk), PreRegister::Shared);

        assert_eq!(t.remove_subscription(1, &uk), Ok(false));
        assert_eq!(t.remove_subscription(2, &uk), Ok(true));
        assert!(!t.has_key(&uk));
        t.validate();
    }

    #[test]
    fn unsubscribe_unknown_key_errors() {
        let mut t = SubscriptionTables::default();
        register(&mut t, 1);
        assert!(t.remove_subscription(1, &user_key("SBIN")).is_err());
    }

    #[test]
    fn subscribe_then_unsubscribe_roundtrips_tables() {
        let mut t = SubscriptionTables::default();
        register(&mut t, 1);
        let uk = user_key("SBIN");

        t.pre_register(1, &uk);
        t.commit_first(1, &uk);
        assert_eq!(t.remove_subscription(1, &uk), Ok(true));

        assert!(!t.has_key(&uk));
        assert_eq!(t.ref_count(&uk), 0);
        assert_eq!(t.client_sub_count(1), 0);
        t.validate();
    }

    #[test]
    fn remove_client_decrements_shared_keys() {
        let mut t = SubscriptionTables::default();
        register(&mut t, 1);
        register(&mut t, 2);
        let uk = user_key("SBIN");
        let uk2 = user_key("INFY");

        t.pre_register(1, &uk);
        t.commit_first(1, &uk);
        t.pre_register(2, &uk);
        t.pre_register(2, &uk2);
        t.commit_first(2, &uk2);

        // Client 2 leaves: SBIN is still referenced by client 1, INFY hits 0.
        let last = t.remove_client(2);
        assert_eq!(last, vec![key("INFY")]);
        assert_eq!(t.ref_count(&uk), 1);
        t.validate();
    }

    #[test]
    fn fanout_targets_only_matching_user_and_key() {
        let mut t = SubscriptionTables::default();
        register(&mut t, 1);
        t.register_client(
            2,
            ClientHandle {
                user_id: "u2".into(),
                broker: "mock".into(),
                outbox: Arc::new(Outbox::new()),
            },
        );
        let uk = user_key("SBIN");
        t.pre_register(1, &uk);
        t.commit_first(1, &uk);

        assert_eq!(t.fanout_targets("u1", &key("SBIN")).len(), 1);
        assert_eq!(t.fanout_targets("u2", &key("SBIN")).len(), 0);
        assert_eq!(t.fanout_targets("u1", &key("INFY")).len(), 0);
    }
}
