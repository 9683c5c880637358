// Routing table manager
// Wraps the routing table with per-rule activity tracking and the cleanup
// pass that keeps expired-but-busy rules alive for a grace window
//
// Numan Thabit 2025 Nov

use crate::errors::TableError;
use crate::metrics::ROUTING_RULES;
use crate::routing::rule::Rule;
use crate::routing::table::RoutingTable;
use crate::routing::types::{RouteDescriptor, RouteId};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tracing::debug;

pub const DEFAULT_KEEP_ALIVE_WINDOW: Duration = Duration::from_secs(10 * 60);
pub const DEFAULT_GC_INTERVAL: Duration = Duration::from_secs(10 * 60);

pub struct RoutingTableManager {
    table: RoutingTable,
    activity: Mutex<HashMap<RouteId, Instant>>,
    keep_alive: Duration,
    gc_interval: Duration,
}

impl Default for RoutingTableManager {
    fn default() -> Self {
        Self::new(DEFAULT_KEEP_ALIVE_WINDOW, DEFAULT_GC_INTERVAL)
    }
}

impl RoutingTableManager {
    pub fn new(keep_alive: Duration, gc_interval: Duration) -> Self {
        Self {
            table: RoutingTable::new(),
            activity: Mutex::new(HashMap::new()),
            keep_alive,
            gc_interval,
        }
    }

    pub fn table(&self) -> &RoutingTable {
        &self.table
    }

    pub fn keep_alive(&self) -> Duration {
        self.keep_alive
    }

    pub fn gc_interval(&self) -> Duration {
        self.gc_interval
    }

    pub fn reserve_key(&self) -> Result<RouteId, TableError> {
        self.table.reserve_key()
    }

    pub fn reserve_keys(&self, n: usize) -> Result<Vec<RouteId>, TableError> {
        self.table.reserve_keys(n)
    }

    pub fn save_rule(&self, rule: Rule) -> Result<(), TableError> {
        let id = rule.key();
        self.table.save_rule(rule)?;
        self.activity.lock().insert(id, Instant::now());
        Ok(())
    }

    pub fn add_rule(&self, rule: Rule) -> Result<RouteId, TableError> {
        let id = self.table.add_rule(rule)?;
        self.activity.lock().insert(id, Instant::now());
        Ok(id)
    }

    pub fn set_rule(&self, id: RouteId, rule: Rule) -> Result<(), TableError> {
        self.table.set_rule(id, rule)?;
        self.activity.lock().insert(id, Instant::now());
        Ok(())
    }

    /// Look up a rule and record the access.
    pub fn rule(&self, id: RouteId) -> Result<Rule, TableError> {
        self.rule_at(id, Instant::now())
    }

    pub(crate) fn rule_at(&self, id: RouteId, now: Instant) -> Result<Rule, TableError> {
        let (rule, expires_at) = self.table.entry(id)?;
        let mut activity = self.activity.lock();
        if is_expired(expires_at, now) && !self.recently_active(activity.get(&id), now) {
            return Err(TableError::ExpiredRule(id));
        }
        activity.insert(id, now);
        Ok(rule)
    }

    pub fn delete_rules(&self, ids: &[RouteId]) -> Vec<RouteId> {
        let removed = self.table.delete_rules(ids);
        let mut activity = self.activity.lock();
        for id in ids {
            activity.remove(id);
        }
        removed
    }

    /// Delete every rule whose descriptor matches `desc`.
    pub fn remove_route_descriptor(&self, desc: &RouteDescriptor) -> Vec<RouteId> {
        let ids: Vec<RouteId> = self
            .table
            .all_rules()
            .into_iter()
            .filter(|rule| rule.descriptor() == Some(desc))
            .map(|rule| rule.key())
            .collect();
        self.delete_rules(&ids)
    }

    pub fn all_rules(&self) -> Vec<Rule> {
        self.table.all_rules()
    }

    pub fn count(&self) -> usize {
        self.table.count()
    }

    /// Delete expired rules that saw no access within the keep-alive window.
    pub fn cleanup(&self) -> Vec<RouteId> {
        self.cleanup_at(Instant::now())
    }

    pub(crate) fn cleanup_at(&self, now: Instant) -> Vec<RouteId> {
        // Activity stays locked until the delete so no access slips in between.
        let removed = {
            let mut activity = self.activity.lock();
            let stale: Vec<RouteId> = self
                .table
                .expired_ids(now)
                .into_iter()
                .filter(|id| !self.recently_active(activity.get(id), now))
                .collect();
            let removed = self.table.delete_expired(&stale, now);
            for id in &removed {
                activity.remove(id);
            }
            removed
        };

        if let Some(cutoff) = now.checked_sub(self.keep_alive) {
            let released = self.table.release_reservations_before(cutoff);
            if released > 0 {
                debug!(released, "released unused route id reservations");
            }
        }
        ROUTING_RULES.set(self.table.count() as i64);
        removed
    }

    // An access exactly `keep_alive` ago no longer counts.
    fn recently_active(&self, last: Option<&Instant>, now: Instant) -> bool {
        matches!(last, Some(at) if now.saturating_duration_since(*at) < self.keep_alive)
    }
}

fn is_expired(expires_at: Option<Instant>, now: Instant) -> bool {
    matches!(expires_at, Some(at) if at <= now)
}
