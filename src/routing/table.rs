// Routing table
// This file implements the per-visor store of routing rules keyed by route id,
// together with the reservation counter that hands out fresh ids
//
// Numan Thabit 2025 Nov

use crate::errors::TableError;
use crate::routing::rule::Rule;
use crate::routing::types::RouteId;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::Instant;

/// Usable ids are 1..=u32::MAX; 0 never names a rule.
const ID_SPACE: usize = u32::MAX as usize;

#[derive(Debug, Clone)]
struct Entry {
    rule: Rule,
    /// None when the keep-alive does not fit in an `Instant`.
    expires_at: Option<Instant>,
}

#[derive(Debug)]
struct TableInner {
    rules: HashMap<RouteId, Entry>,
    /// Keys handed out by reservation that have no rule yet.
    reserved: HashMap<RouteId, Instant>,
    next: u32,
}

impl TableInner {
    fn in_use(&self, id: RouteId) -> bool {
        id.0 == 0 || self.rules.contains_key(&id) || self.reserved.contains_key(&id)
    }

    fn insert(&mut self, rule: Rule, now: Instant) {
        let id = rule.key();
        let expires_at = now.checked_add(rule.keep_alive());
        self.reserved.remove(&id);
        self.rules.insert(id, Entry { rule, expires_at });
    }
}

/// Keyed rule store guarded by a single lock; the reservation counter shares it
/// so batch reservations never interleave with single ones.
#[derive(Debug)]
pub struct RoutingTable {
    inner: Mutex<TableInner>,
}

impl Default for RoutingTable {
    fn default() -> Self {
        Self::new()
    }
}

impl RoutingTable {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(TableInner {
                rules: HashMap::new(),
                reserved: HashMap::new(),
                next: 1,
            }),
        }
    }

    /// Allocate one currently-unused route id.
    pub fn reserve_key(&self) -> Result<RouteId, TableError> {
        self.reserve_keys(1)?
            .pop()
            .ok_or(TableError::NoAvailableRoutes)
    }

    /// Allocate `n` unused route ids atomically: either all or none.
    pub fn reserve_keys(&self, n: usize) -> Result<Vec<RouteId>, TableError> {
        let mut inner = self.inner.lock();
        let taken = inner.rules.len() + inner.reserved.len();
        if ID_SPACE.saturating_sub(taken) < n {
            return Err(TableError::NoAvailableRoutes);
        }

        let now = Instant::now();
        let mut ids = Vec::with_capacity(n);
        while ids.len() < n {
            let candidate = RouteId(inner.next);
            inner.next = inner.next.wrapping_add(1).max(1);
            if !inner.in_use(candidate) {
                inner.reserved.insert(candidate, now);
                ids.push(candidate);
            }
        }
        Ok(ids)
    }

    /// Store a rule under its own key, replacing whatever was there.
    pub fn save_rule(&self, rule: Rule) -> Result<(), TableError> {
        if rule.key().0 == 0 {
            return Err(TableError::CorruptedRule("rule key 0 is reserved".into()));
        }
        self.inner.lock().insert(rule, Instant::now());
        Ok(())
    }

    /// Reserve a fresh key, rewrite the rule to use it and store it.
    pub fn add_rule(&self, rule: Rule) -> Result<RouteId, TableError> {
        let id = self.reserve_key()?;
        self.inner.lock().insert(rule.with_key(id), Instant::now());
        Ok(id)
    }

    pub fn rule(&self, id: RouteId) -> Result<Rule, TableError> {
        self.entry(id).map(|(rule, _)| rule)
    }

    pub(crate) fn entry(&self, id: RouteId) -> Result<(Rule, Option<Instant>), TableError> {
        self.inner
            .lock()
            .rules
            .get(&id)
            .map(|e| (e.rule.clone(), e.expires_at))
            .ok_or(TableError::UnknownRouteId(id))
    }

    /// Overwrite the rule stored under `id`; the rule's own key must agree.
    pub fn set_rule(&self, id: RouteId, rule: Rule) -> Result<(), TableError> {
        if rule.key() != id {
            return Err(TableError::CorruptedRule(format!(
                "rule key {} does not match table key {id}",
                rule.key()
            )));
        }
        self.save_rule(rule)
    }

    /// Remove rules (and pending reservations) regardless of expiry.
    /// Returns the ids that held a rule.
    pub fn delete_rules(&self, ids: &[RouteId]) -> Vec<RouteId> {
        let mut inner = self.inner.lock();
        ids.iter()
            .filter(|id| {
                inner.reserved.remove(*id);
                inner.rules.remove(*id).is_some()
            })
            .copied()
            .collect()
    }

    pub fn all_rules(&self) -> Vec<Rule> {
        self.inner
            .lock()
            .rules
            .values()
            .map(|e| e.rule.clone())
            .collect()
    }

    pub fn count(&self) -> usize {
        self.inner.lock().rules.len()
    }

    /// Ids whose expiry is at or before `now`.
    pub(crate) fn expired_ids(&self, now: Instant) -> Vec<RouteId> {
        self.inner
            .lock()
            .rules
            .iter()
            .filter(|(_, e)| matches!(e.expires_at, Some(at) if at <= now))
            .map(|(id, _)| *id)
            .collect()
    }

    /// Remove the listed rules that are still expired at `now`; a rule
    /// replaced since the ids were collected is kept.
    pub(crate) fn delete_expired(&self, ids: &[RouteId], now: Instant) -> Vec<RouteId> {
        let mut inner = self.inner.lock();
        ids.iter()
            .filter(|id| {
                let expired = matches!(
                    inner.rules.get(*id),
                    Some(Entry { expires_at: Some(at), .. }) if *at <= now
                );
                expired && inner.rules.remove(*id).is_some()
            })
            .copied()
            .collect()
    }

    /// Forget reservations made before `cutoff` that never received a rule.
    pub(crate) fn release_reservations_before(&self, cutoff: Instant) -> usize {
        let mut inner = self.inner.lock();
        let before = inner.reserved.len();
        inner.reserved.retain(|_, at| *at > cutoff);
        before - inner.reserved.len()
    }
}
