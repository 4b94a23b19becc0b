// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Replication tree planning.
//!
//! A replication tree maps route identifiers to [`TreeNode`]s. A node's
//! `ancestor` names the route whose transfer must finish first, so a staged
//! copy A→B→C appears as two nodes with the second one pointing at the first.
//!
//! Strategies:
//! - [`Strategy::Simple`]: one source, one direct edge per target.
//! - [`Strategy::Swarm`]: one target, the best of many sources.
//! - [`Strategy::MinimiseTotalWait`]: greedy cheapest edge first, filled
//!   targets become sources for the rest.
//! - [`Strategy::DynamicThroughput`]: like MinimiseTotalWait, costed by
//!   accumulated arrival time.

use std::collections::{BTreeMap, HashSet};
use std::str::FromStr;
use std::sync::atomic::{AtomicUsize, Ordering};

use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display, EnumString};
use thiserror::Error;
use tracing::{debug, warn};

use crate::graph::{FtsGraph, SchedulingType, SharedGraph};

/// Planning strategy.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString, AsRefStr,
)]
#[strum(ascii_case_insensitive)]
pub enum Strategy {
    Simple,
    Swarm,
    MinimiseTotalWait,
    DynamicThroughput,
}

/// One planned transfer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TreeNode {
    /// Route that must complete before this one starts.
    pub ancestor: Option<String>,
    pub source_se: String,
    pub target_se: String,
    pub strategy: Strategy,
}

/// Planned transfers keyed by route identifier.
pub type ReplicationTree = BTreeMap<String, TreeNode>;

/// Planning failures.
#[derive(Debug, Clone, PartialEq, Error)]
#[non_exhaustive]
pub enum SchedulerError {
    /// The topology has no edge between a source and a target.
    #[error("no route from {source_se} to {target_se}")]
    NoRoute { source_se: String, target_se: String },

    /// Edges exist but every one of them is disabled.
    #[error("all routes to {0} are inactive")]
    AllRoutesInactive(String),

    /// A required endpoint lacks the needed access flag.
    #[error("storage element {0} is banned")]
    BannedEndpoint(String),

    /// A strategy precondition does not hold.
    #[error("replication tree infeasible: {0}")]
    TreeInfeasible(String),

    #[error("unknown strategy '{0}'")]
    UnknownStrategy(String),
}

/// Scheduler configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct SchedulerConfig {
    /// Strategies rotated through across calls.
    pub active_strategies: Vec<Strategy>,
    /// Seconds added when the source is not one of the original sources.
    pub hop_sigma: f64,
    pub scheduling_type: SchedulingType,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            active_strategies: vec![Strategy::MinimiseTotalWait],
            hop_sigma: 5.0,
            scheduling_type: SchedulingType::File,
        }
    }
}

/// Plans replication trees over a shared graph.
pub struct Scheduler {
    graph: SharedGraph,
    config: SchedulerConfig,
    next: AtomicUsize,
}

impl Scheduler {
    pub fn new(graph: SharedGraph, config: SchedulerConfig) -> Self {
        Self {
            graph,
            config,
            next: AtomicUsize::new(0),
        }
    }

    pub fn graph(&self) -> &SharedGraph {
        &self.graph
    }

    fn next_strategy(&self) -> Result<Strategy, SchedulerError> {
        let strategies = &self.config.active_strategies;
        if strategies.is_empty() {
            return Err(SchedulerError::TreeInfeasible(
                "no active strategies configured".to_string(),
            ));
        }
        let index = self.next.fetch_add(1, Ordering::Relaxed) % strategies.len();
        Ok(strategies[index])
    }

    /// Plan the transfers of one file.
    ///
    /// `strategy` overrides the rotation. After a successful plan every
    /// selected route gets one more waiting file of `size` bytes.
    pub async fn replication_tree(
        &self,
        sources: &[String],
        targets: &[String],
        size: u64,
        strategy: Option<&str>,
    ) -> Result<ReplicationTree, SchedulerError> {
        let strategy = match strategy {
            Some(name) => Strategy::from_str(name)
                .map_err(|_| SchedulerError::UnknownStrategy(name.to_string()))?,
            None => self.next_strategy()?,
        };

        let tree = {
            let graph = self.graph.read().await;
            plan(
                &graph,
                strategy,
                sources,
                targets,
                self.config.scheduling_type,
                self.config.hop_sigma,
            )?
        };

        let mut graph = self.graph.write().await;
        for route in tree.keys() {
            if !graph.add_waiting(route, size) {
                warn!(route = %route, "Route vanished before its waiting counters were updated");
            }
        }
        debug!(strategy = %strategy, routes = tree.len(), "Replication tree planned");
        Ok(tree)
    }
}

/// Plan with one strategy against a graph snapshot.
pub fn plan(
    graph: &FtsGraph,
    strategy: Strategy,
    sources: &[String],
    targets: &[String],
    mode: SchedulingType,
    hop_sigma: f64,
) -> Result<ReplicationTree, SchedulerError> {
    if sources.is_empty() {
        return Err(SchedulerError::TreeInfeasible("no source replicas".to_string()));
    }
    if targets.is_empty() {
        return Err(SchedulerError::TreeInfeasible("no targets".to_string()));
    }
    match strategy {
        Strategy::Simple => simple(graph, sources, targets),
        Strategy::Swarm => swarm(graph, sources, targets, mode),
        Strategy::MinimiseTotalWait => greedy(graph, sources, targets, mode, hop_sigma, false),
        Strategy::DynamicThroughput => greedy(graph, sources, targets, mode, hop_sigma, true),
    }
}

fn readable(graph: &FtsGraph, se: &str) -> bool {
    graph.se_access(se).is_some_and(|a| a.read)
}

fn writable(graph: &FtsGraph, se: &str) -> bool {
    graph.se_access(se).is_some_and(|a| a.write)
}

fn simple(
    graph: &FtsGraph,
    sources: &[String],
    targets: &[String],
) -> Result<ReplicationTree, SchedulerError> {
    let [source] = sources else {
        return Err(SchedulerError::TreeInfeasible(format!(
            "Simple strategy needs exactly one source, got {}",
            sources.len()
        )));
    };
    let no_route = |target: &str| SchedulerError::NoRoute {
        source_se: source.clone(),
        target_se: target.to_string(),
    };
    if graph.site_of(source).is_none() {
        return Err(no_route(&targets[0]));
    }
    if !readable(graph, source) {
        return Err(SchedulerError::BannedEndpoint(source.clone()));
    }

    let mut tree = ReplicationTree::new();
    for target in targets {
        let route = graph.route_between(source, target).ok_or_else(|| no_route(target))?;
        if !writable(graph, target) {
            return Err(SchedulerError::BannedEndpoint(target.clone()));
        }
        let id = route.id();
        if tree.contains_key(&id) {
            return Err(SchedulerError::TreeInfeasible(format!(
                "route {id} would be used twice"
            )));
        }
        tree.insert(
            id,
            TreeNode {
                ancestor: None,
                source_se: source.clone(),
                target_se: target.clone(),
                strategy: Strategy::Simple,
            },
        );
    }
    Ok(tree)
}

/// Why no candidate edge was found.
#[derive(Default)]
struct Rejections {
    no_route: Option<(String, String)>,
    banned: Option<String>,
    inactive: Option<String>,
}

impl Rejections {
    fn into_error(self, fallback_source: &str, fallback_target: &str) -> SchedulerError {
        if let Some(target) = self.inactive {
            return SchedulerError::AllRoutesInactive(target);
        }
        if let Some(se) = self.banned {
            return SchedulerError::BannedEndpoint(se);
        }
        let (source_se, target_se) = self
            .no_route
            .unwrap_or_else(|| (fallback_source.to_string(), fallback_target.to_string()));
        SchedulerError::NoRoute {
            source_se,
            target_se,
        }
    }
}

/// Pick one of the cheapest candidates, shuffling ties.
fn cheapest<T>(mut candidates: Vec<(f64, T)>) -> Option<T> {
    candidates.shuffle(&mut rand::thread_rng());
    let min = candidates
        .iter()
        .map(|(cost, _)| *cost)
        .fold(f64::INFINITY, f64::min);
    candidates
        .into_iter()
        .find(|(cost, _)| *cost == min)
        .map(|(_, candidate)| candidate)
}

fn swarm(
    graph: &FtsGraph,
    sources: &[String],
    targets: &[String],
    mode: SchedulingType,
) -> Result<ReplicationTree, SchedulerError> {
    let [target] = targets else {
        return Err(SchedulerError::TreeInfeasible(format!(
            "Swarm strategy needs exactly one target, got {}",
            targets.len()
        )));
    };
    if graph.site_of(target).is_some() && !writable(graph, target) {
        return Err(SchedulerError::BannedEndpoint(target.clone()));
    }

    let mut rejections = Rejections::default();
    let mut candidates = Vec::new();
    for source in sources {
        let Some(route) = graph.route_between(source, target) else {
            rejections.no_route = Some((source.clone(), target.clone()));
            continue;
        };
        if !readable(graph, source) {
            rejections.banned = Some(source.clone());
            continue;
        }
        let cost = route.time_to_start(mode);
        if cost.is_infinite() {
            rejections.inactive = Some(target.clone());
            continue;
        }
        candidates.push((cost, (route.id(), source.clone())));
    }

    let (id, source) =
        cheapest(candidates).ok_or_else(|| rejections.into_error(&sources[0], target))?;
    let mut tree = ReplicationTree::new();
    tree.insert(
        id,
        TreeNode {
            ancestor: None,
            source_se: source,
            target_se: target.clone(),
            strategy: Strategy::Swarm,
        },
    );
    Ok(tree)
}

/// A storage element that holds (or will hold) the file.
struct Holder {
    se: String,
    /// Route that fills this holder; `None` for original sources.
    filled_by: Option<String>,
    /// Accumulated seconds until the file is there.
    arrival: f64,
}

struct Edge {
    route: String,
    source: usize,
    target: String,
    arrival: f64,
}

fn greedy(
    graph: &FtsGraph,
    sources: &[String],
    targets: &[String],
    mode: SchedulingType,
    hop_sigma: f64,
    dynamic: bool,
) -> Result<ReplicationTree, SchedulerError> {
    let strategy = if dynamic {
        Strategy::DynamicThroughput
    } else {
        Strategy::MinimiseTotalWait
    };
    let primary: HashSet<&str> = sources.iter().map(String::as_str).collect();
    let mut holders: Vec<Holder> = sources
        .iter()
        .map(|se| Holder {
            se: se.clone(),
            filled_by: None,
            arrival: 0.0,
        })
        .collect();
    let mut pending: Vec<String> = targets
        .iter()
        .filter(|t| !primary.contains(t.as_str()))
        .cloned()
        .collect();
    let mut tree = ReplicationTree::new();

    while !pending.is_empty() {
        let mut rejections = Rejections::default();
        let mut candidates: Vec<(f64, Edge)> = Vec::new();

        for target in &pending {
            if graph.site_of(target).is_some() && !writable(graph, target) {
                rejections.banned = Some(target.clone());
                continue;
            }
            for (index, holder) in holders.iter().enumerate() {
                let Some(route) = graph.route_between(&holder.se, target) else {
                    rejections.no_route = Some((holder.se.clone(), target.clone()));
                    continue;
                };
                if !readable(graph, &holder.se) {
                    rejections.banned = Some(holder.se.clone());
                    continue;
                }
                let id = route.id();
                if tree.contains_key(&id) {
                    continue;
                }
                let wait = route.time_to_start(mode);
                if wait.is_infinite() {
                    rejections.inactive = Some(target.clone());
                    continue;
                }
                let cost = if route.is_local() {
                    // Loopback copies go first.
                    f64::NEG_INFINITY
                } else {
                    let hop = if primary.contains(holder.se.as_str()) {
                        0.0
                    } else {
                        hop_sigma
                    };
                    let carried = if dynamic { holder.arrival } else { 0.0 };
                    wait + hop + carried
                };
                candidates.push((
                    cost,
                    Edge {
                        route: id,
                        source: index,
                        target: target.clone(),
                        arrival: holder.arrival + wait,
                    },
                ));
            }
        }

        let Some(edge) = cheapest(candidates) else {
            return Err(rejections.into_error(&sources[0], &pending[0]));
        };

        let holder = &holders[edge.source];
        tree.insert(
            edge.route.clone(),
            TreeNode {
                ancestor: holder.filled_by.clone(),
                source_se: holder.se.clone(),
                target_se: edge.target.clone(),
                strategy,
            },
        );
        pending.retain(|t| t != &edge.target);
        holders.push(Holder {
            se: edge.target,
            filled_by: Some(edge.route),
            arrival: edge.arrival,
        });
    }
    Ok(tree)
}
