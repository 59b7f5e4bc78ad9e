//! Command registry — (namespace, trigger) → prioritised registrations.
//!
//! Every registration is bound to the [`ExtensionHandle`] that serves it. The
//! registry keeps three indexes under one `RwLock`:
//!
//! - `entries`  — id → registration,
//! - `by_key`   — (namespace, trigger) → ids, in registration order,
//! - `by_owner` — handle uid → ids, for bulk revocation.
//!
//! Mutations take the write lock; [`CommandRegistry::resolve`] takes the read
//! lock only for the lookup and returns an owned clone, so handler invocation
//! never runs under the lock.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use thiserror::Error;
use tracing::{debug, info};

use super::model::{
    CommandMetadata, CommandSource, Namespace, Registration, RegistrationId, normalize_trigger,
};
use crate::extensions::handle::{ExtensionHandle, ExtensionState, InvalidTransition};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("trigger /{trigger} is already registered by {owner} in {namespace}")]
    DuplicateTrigger {
        namespace: Namespace,
        trigger: String,
        owner: CommandSource,
    },

    #[error("invalid trigger: {0:?}")]
    InvalidTrigger(String),

    #[error("extension {id} cannot register commands while {state}")]
    ExtensionUnavailable { id: String, state: ExtensionState },

    #[error("extension {id} does not serve commands")]
    MissingCapability { id: String },
}

#[derive(Default)]
struct Inner {
    next_seq: u64,
    entries: HashMap<RegistrationId, Registration>,
    by_key: HashMap<(Namespace, String), Vec<RegistrationId>>,
    by_owner: HashMap<u64, BTreeSet<RegistrationId>>,
}

impl Inner {
    fn bucket<'a>(
        &'a self,
        namespace: &Namespace,
        trigger: &str,
    ) -> impl Iterator<Item = &'a Registration> + use<'a> {
        self.by_key
            .get(&(namespace.clone(), trigger.to_string()))
            .into_iter()
            .flatten()
            .filter_map(|id| self.entries.get(id))
    }

    /// Registrations reachable from `namespace`: its own plus the global ones.
    fn reachable<'a>(&'a self, namespace: &Namespace) -> Vec<&'a Registration> {
        self.entries
            .values()
            .filter(|r| r.namespace == *namespace || r.namespace.is_global())
            .collect()
    }

    fn remove(&mut self, id: RegistrationId) -> Option<Registration> {
        let reg = self.entries.remove(&id)?;
        let key = (reg.namespace.clone(), reg.trigger.clone());
        if let Some(ids) = self.by_key.get_mut(&key) {
            ids.retain(|i| *i != id);
            if ids.is_empty() {
                self.by_key.remove(&key);
            }
        }
        let uid = reg.owner.uid();
        if let Some(ids) = self.by_owner.get_mut(&uid) {
            ids.remove(&id);
            if ids.is_empty() {
                self.by_owner.remove(&uid);
            }
        }
        Some(reg)
    }
}

/// In-memory command registry. Shared as `Arc<CommandRegistry>`.
#[derive(Default)]
pub struct CommandRegistry {
    inner: RwLock<Inner>,
}

impl CommandRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, Inner> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Inner> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register `trigger` in `namespace`, served by `owner`.
    ///
    /// The source (and therefore the tier) comes from the owner. Fails with
    /// `DuplicateTrigger` only when the same source already holds the key;
    /// registrations from other sources are shadowed or shadow this one by
    /// precedence.
    pub fn register(
        &self,
        owner: &Arc<ExtensionHandle>,
        namespace: Namespace,
        trigger: &str,
        metadata: CommandMetadata,
    ) -> Result<RegistrationId, RegistryError> {
        let trigger =
            normalize_trigger(trigger).ok_or_else(|| RegistryError::InvalidTrigger(trigger.into()))?;
        if !owner.capabilities().execute_command {
            return Err(RegistryError::MissingCapability { id: owner.id().into() });
        }
        let source = owner.source();

        let mut inner = self.write();

        // Checked under the write lock so revocation cannot interleave.
        let state = owner.state();
        if !state.accepts_registrations() {
            return Err(RegistryError::ExtensionUnavailable { id: owner.id().into(), state });
        }
        if inner.bucket(&namespace, &trigger).any(|r| r.source == source) {
            return Err(RegistryError::DuplicateTrigger { namespace, trigger, owner: source });
        }

        inner.next_seq += 1;
        let seq = inner.next_seq;
        let id = RegistrationId(seq);
        inner
            .by_key
            .entry((namespace.clone(), trigger.clone()))
            .or_default()
            .push(id);
        inner.by_owner.entry(owner.uid()).or_default().insert(id);
        inner.entries.insert(
            id,
            Registration {
                id,
                namespace: namespace.clone(),
                trigger: trigger.clone(),
                source: source.clone(),
                metadata,
                seq,
                owner: owner.clone(),
            },
        );
        drop(inner);

        debug!(%id, %namespace, %trigger, %source, "command registered");
        Ok(id)
    }

    /// Remove one registration. Unknown ids are ignored.
    pub fn unregister(&self, id: RegistrationId) -> Option<Registration> {
        let removed = self.write().remove(id);
        if let Some(reg) = &removed {
            debug!(%id, namespace = %reg.namespace, trigger = %reg.trigger, "command unregistered");
        }
        removed
    }

    /// Remove the registration `source` holds for (namespace, trigger), if any.
    pub fn unregister_trigger(
        &self,
        source: &CommandSource,
        namespace: &Namespace,
        trigger: &str,
    ) -> Option<RegistrationId> {
        let trigger = normalize_trigger(trigger)?;
        let mut inner = self.write();
        let id = inner
            .bucket(namespace, &trigger)
            .find(|r| r.source == *source)
            .map(|r| r.id)?;
        inner.remove(id);
        drop(inner);
        debug!(%id, %namespace, %trigger, %source, "command unregistered by key");
        Some(id)
    }

    /// The registration a dispatch of `trigger` from `namespace` reaches.
    pub fn resolve(&self, namespace: &Namespace, trigger: &str) -> Option<Registration> {
        let trigger = normalize_trigger(trigger)?;
        let inner = self.read();
        let own = inner.bucket(namespace, &trigger);
        let global = if namespace.is_global() {
            None
        } else {
            Some(inner.bucket(&Namespace::Global, &trigger))
        };
        own.chain(global.into_iter().flatten())
            .max_by_key(|r| r.precedence())
            .cloned()
    }

    /// Every registration reachable from `namespace` (own plus global),
    /// ordered by trigger, then tier (highest first), then newest first.
    pub fn list_for_namespace(&self, namespace: &Namespace) -> Vec<Registration> {
        let inner = self.read();
        let mut regs: Vec<Registration> = inner.reachable(namespace).into_iter().cloned().collect();
        drop(inner);
        regs.sort_by(|a, b| {
            a.trigger
                .cmp(&b.trigger)
                .then_with(|| b.precedence().cmp(&a.precedence()))
        });
        regs
    }

    /// The winning registration of every trigger reachable from `namespace`.
    pub fn visible_for_namespace(&self, namespace: &Namespace) -> Vec<Registration> {
        let mut all = self.list_for_namespace(namespace);
        all.dedup_by(|later, first| later.trigger == first.trigger);
        all
    }

    /// Move `handle` to `next` and drop everything it registered, atomically
    /// with respect to other registry operations.
    pub fn revoke(
        &self,
        handle: &ExtensionHandle,
        next: ExtensionState,
    ) -> Result<usize, InvalidTransition> {
        let mut inner = self.write();
        handle.transition(next)?;
        let ids = inner.by_owner.remove(&handle.uid()).unwrap_or_default();
        let count = ids.len();
        for id in ids {
            inner.remove(id);
        }
        drop(inner);

        if count > 0 {
            info!(extension = %handle.id(), state = %next, removed = count, "extension registrations revoked");
        }
        Ok(count)
    }

    /// Registrations owned by any handle of the extension `id`.
    pub fn owned_by(&self, id: &str) -> Vec<Registration> {
        let inner = self.read();
        let mut regs: Vec<Registration> = inner
            .entries
            .values()
            .filter(|r| r.owner.id() == id)
            .cloned()
            .collect();
        regs.sort_by_key(|r| r.id);
        regs
    }

    /// Number of registrations held by one handle.
    pub fn count_for_handle(&self, handle: &ExtensionHandle) -> usize {
        self.read().by_owner.get(&handle.uid()).map_or(0, BTreeSet::len)
    }

    pub fn len(&self) -> usize {
        self.read().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every registration.
    pub fn clear(&self) {
        let mut inner = self.write();
        let n = inner.entries.len();
        *inner = Inner { next_seq: inner.next_seq, ..Inner::default() };
        drop(inner);
        debug!(removed = n, "registry cleared");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extensions::{Capabilities, Extension, ExtensionKind};

    struct Stub(&'static str, Capabilities);

    impl Extension for Stub {
        fn id(&self) -> &str {
            self.0
        }
        fn capabilities(&self) -> Capabilities {
            self.1
        }
    }

    fn active(kind: ExtensionKind, id: &'static str) -> Arc<ExtensionHandle> {
        let h = ExtensionHandle::new(kind, Arc::new(Stub(id, Capabilities::all())));
        h.transition(ExtensionState::Active).unwrap();
        h
    }

    fn team(id: &str) -> Namespace {
        Namespace::Team(id.into())
    }

    fn winner(reg: &CommandRegistry, ns: &Namespace, trigger: &str) -> Option<CommandSource> {
        reg.resolve(ns, trigger).map(|r| r.source)
    }

    #[test]
    fn registered_trigger_resolves_case_insensitively() {
        let reg = CommandRegistry::new();
        let p = active(ExtensionKind::Plugin, "p1");
        reg.register(&p, team("t1"), "/Plugin", CommandMetadata::default()).unwrap();

        let r = reg.resolve(&team("t1"), "PLUGIN").unwrap();
        assert_eq!(r.trigger, "plugin");
        assert_eq!(r.owner().id(), "p1");
        assert!(reg.resolve(&team("t2"), "plugin").is_none());
    }

    #[test]
    fn plugin_beats_product_in_either_order() {
        for plugin_first in [true, false] {
            let reg = CommandRegistry::new();
            let plugin = active(ExtensionKind::Plugin, "plug");
            let product = active(ExtensionKind::Product, "prod");
            let order = if plugin_first { [&plugin, &product] } else { [&product, &plugin] };
            for h in order {
                reg.register(h, team("t1"), "plugin", CommandMetadata::default()).unwrap();
            }
            assert_eq!(
                winner(&reg, &team("t1"), "plugin"),
                Some(CommandSource::Plugin("plug".into()))
            );
        }
    }

    #[test]
    fn unregister_reveals_shadowed_lifo_then_lower_tier() {
        let reg = CommandRegistry::new();
        let core = active(ExtensionKind::Core, "core");
        let a = active(ExtensionKind::Plugin, "a");
        let b = active(ExtensionKind::Plugin, "b");
        reg.register(&core, Namespace::Global, "away", CommandMetadata::default()).unwrap();
        let ra = reg.register(&a, team("t1"), "away", CommandMetadata::default()).unwrap();
        let rb = reg.register(&b, team("t1"), "away", CommandMetadata::default()).unwrap();

        assert_eq!(winner(&reg, &team("t1"), "away"), Some(CommandSource::Plugin("b".into())));
        reg.unregister(rb);
        assert_eq!(winner(&reg, &team("t1"), "away"), Some(CommandSource::Plugin("a".into())));
        reg.unregister(ra);
        assert_eq!(winner(&reg, &team("t1"), "away"), Some(CommandSource::BuiltIn));
    }

    #[test]
    fn unregister_is_idempotent() {
        let reg = CommandRegistry::new();
        let p = active(ExtensionKind::Plugin, "p1");
        let id = reg.register(&p, team("t1"), "x", CommandMetadata::default()).unwrap();
        assert!(reg.unregister(id).is_some());
        assert!(reg.unregister(id).is_none());
        assert!(reg.resolve(&team("t1"), "x").is_none());
        assert!(reg.is_empty());
    }

    #[test]
    fn same_source_duplicate_rejected_other_source_accepted() {
        let reg = CommandRegistry::new();
        let p = active(ExtensionKind::Plugin, "p1");
        let q = active(ExtensionKind::Plugin, "p2");
        reg.register(&p, team("t1"), "dup", CommandMetadata::default()).unwrap();
        let err = reg.register(&p, team("t1"), "DUP", CommandMetadata::default()).unwrap_err();
        assert!(matches!(err, RegistryError::DuplicateTrigger { .. }));
        reg.register(&q, team("t1"), "dup", CommandMetadata::default()).unwrap();
        // Same source in another namespace is a different key.
        reg.register(&p, team("t2"), "dup", CommandMetadata::default()).unwrap();
        assert_eq!(reg.len(), 3);
    }

    #[test]
    fn invalid_trigger_rejected() {
        let reg = CommandRegistry::new();
        let p = active(ExtensionKind::Plugin, "p1");
        for bad in ["", "/", "two words"] {
            let err = reg.register(&p, team("t1"), bad, CommandMetadata::default()).unwrap_err();
            assert!(matches!(err, RegistryError::InvalidTrigger(_)));
        }
    }

    #[test]
    fn removed_handle_cannot_register() {
        let reg = CommandRegistry::new();
        let p = active(ExtensionKind::Plugin, "p1");
        reg.revoke(&p, ExtensionState::Removed).unwrap();
        let err = reg.register(&p, team("t1"), "late", CommandMetadata::default()).unwrap_err();
        assert!(matches!(
            err,
            RegistryError::ExtensionUnavailable { state: ExtensionState::Removed, .. }
        ));
    }

    #[test]
    fn handle_without_command_capability_rejected() {
        let reg = CommandRegistry::new();
        let caps = Capabilities { execute_command: false, ..Capabilities::all() };
        let h = ExtensionHandle::new(ExtensionKind::Plugin, Arc::new(Stub("hooks", caps)));
        let err = reg.register(&h, team("t1"), "x", CommandMetadata::default()).unwrap_err();
        assert_eq!(err, RegistryError::MissingCapability { id: "hooks".into() });
    }

    #[test]
    fn revoke_drops_all_owned_and_reveals_others() {
        let reg = CommandRegistry::new();
        let core = active(ExtensionKind::Core, "core");
        let p = active(ExtensionKind::Plugin, "p1");
        reg.register(&core, Namespace::Global, "away", CommandMetadata::default()).unwrap();
        reg.register(&p, team("t1"), "away", CommandMetadata::default()).unwrap();
        reg.register(&p, Namespace::Global, "other", CommandMetadata::default()).unwrap();
        assert_eq!(reg.count_for_handle(&p), 2);

        let removed = reg.revoke(&p, ExtensionState::Crashed).unwrap();
        assert_eq!(removed, 2);
        assert_eq!(p.state(), ExtensionState::Crashed);
        assert_eq!(reg.count_for_handle(&p), 0);
        assert!(reg.owned_by("p1").is_empty());
        assert_eq!(winner(&reg, &team("t1"), "away"), Some(CommandSource::BuiltIn));
        assert!(reg.resolve(&team("t1"), "other").is_none());
    }

    #[test]
    fn list_orders_by_trigger_tier_recency() {
        let reg = CommandRegistry::new();
        let core = active(ExtensionKind::Core, "core");
        let prod = active(ExtensionKind::Product, "prod");
        let a = active(ExtensionKind::Plugin, "a");
        let b = active(ExtensionKind::Plugin, "b");
        reg.register(&core, Namespace::Global, "zeta", CommandMetadata::default()).unwrap();
        reg.register(&core, Namespace::Global, "away", CommandMetadata::default()).unwrap();
        reg.register(&a, team("t1"), "away", CommandMetadata::default()).unwrap();
        reg.register(&prod, team("t1"), "away", CommandMetadata::default()).unwrap();
        reg.register(&b, team("t1"), "away", CommandMetadata::default()).unwrap();
        reg.register(&b, team("t2"), "hidden", CommandMetadata::default()).unwrap();

        let listed: Vec<String> = reg
            .list_for_namespace(&team("t1"))
            .iter()
            .map(|r| format!("{}:{}", r.trigger, r.source))
            .collect();
        assert_eq!(
            listed,
            [
                "away:plugin:b",
                "away:plugin:a",
                "away:product:prod",
                "away:builtin",
                "zeta:builtin",
            ]
        );

        let visible: Vec<String> = reg
            .visible_for_namespace(&team("t1"))
            .iter()
            .map(|r| format!("{}:{}", r.trigger, r.source))
            .collect();
        assert_eq!(visible, ["away:plugin:b", "zeta:builtin"]);
    }

    #[test]
    fn unregister_trigger_only_touches_own_source() {
        let reg = CommandRegistry::new();
        let a = active(ExtensionKind::Plugin, "a");
        let b = active(ExtensionKind::Plugin, "b");
        reg.register(&a, team("t1"), "x", CommandMetadata::default()).unwrap();
        reg.register(&b, team("t1"), "x", CommandMetadata::default()).unwrap();

        let src_a = CommandSource::Plugin("a".into());
        assert!(reg.unregister_trigger(&src_a, &team("t1"), "/X").is_some());
        assert!(reg.unregister_trigger(&src_a, &team("t1"), "x").is_none());
        assert_eq!(winner(&reg, &team("t1"), "x"), Some(CommandSource::Plugin("b".into())));
    }

    #[test]
    fn clear_empties_registry() {
        let reg = CommandRegistry::new();
        let p = active(ExtensionKind::Plugin, "p1");
        reg.register(&p, team("t1"), "a", CommandMetadata::default()).unwrap();
        reg.clear();
        assert!(reg.is_empty());
        let id = reg.register(&p, team("t1"), "a", CommandMetadata::default()).unwrap();
        assert_eq!(id, RegistrationId(2));
    }
}
