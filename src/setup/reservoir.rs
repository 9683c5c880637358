// Route id reservoir
// Per-request bookkeeping for the ids a setup node reserves on every visor
// of a route, plus the rule generation that consumes them
//
// Numan Thabit 2025 Nov

use crate::errors::{RpcError, SetupError};
use crate::keys::PubKey;
use crate::routing::{Path, RouteDescriptor, RouteId, Rule, RulesMap};
use futures::future::join_all;
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::time::Duration;

#[derive(Debug, Default)]
pub struct IdReservoir {
    counts: HashMap<PubKey, u8>,
    ids: HashMap<PubKey, VecDeque<RouteId>>,
}

impl IdReservoir {
    /// Tally the ids each visor must reserve: one for the first hop's origin
    /// of every path and one per hop destination.
    pub fn new(paths: &[&Path]) -> Result<Self, SetupError> {
        let mut counts: HashMap<PubKey, u8> = HashMap::new();
        for path in paths {
            let Some(first) = path.first() else {
                return Err(SetupError::InvalidRoute("empty path".into()));
            };
            for pk in std::iter::once(first.from).chain(path.iter().map(|hop| hop.to)) {
                let n = counts.entry(pk).or_default();
                *n = n.checked_add(1).ok_or_else(|| {
                    SetupError::InvalidRoute(format!("visor {pk} appears more than 255 times"))
                })?;
            }
        }
        Ok(Self {
            counts,
            ids: HashMap::new(),
        })
    }

    pub fn counts(&self) -> &HashMap<PubKey, u8> {
        &self.counts
    }

    /// Reserve every tallied id in parallel, one call per visor. Nothing is
    /// committed unless all calls succeed.
    pub async fn reserve_ids<F, Fut>(&mut self, reserve: F) -> Result<(), SetupError>
    where
        F: Fn(PubKey, u8) -> Fut,
        Fut: Future<Output = Result<Vec<RouteId>, RpcError>>,
    {
        let calls = self.counts.iter().map(|(&pk, &n)| {
            let call = reserve(pk, n);
            async move { (pk, n, call.await) }
        });
        let results = join_all(calls).await;

        let mut reserved = HashMap::with_capacity(results.len());
        let mut failure = None;
        for (pk, n, res) in results {
            match res {
                Ok(ids) if ids.len() == n as usize => {
                    reserved.insert(pk, VecDeque::from(ids));
                }
                Ok(ids) => {
                    failure.get_or_insert(SetupError::GenerateRules(format!(
                        "visor {pk} reserved {} of {n} route ids",
                        ids.len()
                    )));
                }
                Err(source) => {
                    failure.get_or_insert(SetupError::Reserve { pk, source });
                }
            }
        }
        if let Some(err) = failure {
            return Err(err);
        }
        self.ids = reserved;
        Ok(())
    }

    /// Take the next reserved id of `pk`, in reservation order.
    pub fn pop_id(&mut self, pk: &PubKey) -> Option<RouteId> {
        self.ids.get_mut(pk)?.pop_front()
    }
}

/// Rules for one bidirectional route, keyed by the visor that installs them.
#[derive(Debug, Default)]
pub struct GeneratedRules {
    pub forward: HashMap<PubKey, Rule>,
    pub consume: HashMap<PubKey, Rule>,
    pub intermediary: RulesMap,
}

/// Walk each (descriptor, path) pair in order, popping reserved ids hop by hop.
pub fn generate_rules(
    routes: &[(RouteDescriptor, &Path)],
    keep_alive: Duration,
    reservoir: &mut IdReservoir,
) -> Result<GeneratedRules, SetupError> {
    let mut out = GeneratedRules::default();
    for (desc, path) in routes {
        let first = path
            .first()
            .ok_or_else(|| SetupError::GenerateRules(format!("empty path for {desc}")))?;
        let mut pop = |pk: PubKey| {
            reservoir
                .pop_id(&pk)
                .ok_or_else(|| SetupError::GenerateRules(format!("no route id left for {pk}")))
        };

        let mut route_id = pop(first.from)?;
        for (i, hop) in path.iter().enumerate() {
            let next_id = pop(hop.to)?;
            if i == 0 {
                out.forward.insert(
                    hop.from,
                    Rule::forward(keep_alive, route_id, next_id, hop.tp_id, *desc),
                );
            } else {
                out.intermediary
                    .entry(hop.from)
                    .or_default()
                    .push(Rule::intermediary_forward(keep_alive, route_id, next_id, hop.tp_id));
            }
            route_id = next_id;
        }
        out.consume
            .insert(desc.dst_pk, Rule::consume(keep_alive, route_id, *desc));
    }
    Ok(out)
}
