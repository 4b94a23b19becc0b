// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! In-memory transfer topology.
//!
//! Nodes are sites, each with its storage endpoints and their read/write
//! flags. Edges are routes, one per ordered site pair including the loopback
//! pair. Route counters come from the FTS history view of the last window.
//!
//! The graph is process-local and guarded by one readers/writer lock
//! ([`SharedGraph`]). Rebuilds replace it wholesale; the scheduler takes the
//! write lock only to bump waiting counters.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use gridmover_core::{FtsFile, FtsFileStatus, FtsJobStatus, FtsSite, SeAccess};
use gridmover_core::model::{FtsHistory, route_id};
use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display, EnumString};
use tokio::sync::RwLock;
use tracing::debug;

/// Queue metric used by `time_to_start`.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, Display, EnumString, AsRefStr,
)]
#[strum(ascii_case_insensitive)]
pub enum SchedulingType {
    /// Queue length in files over files per second.
    #[default]
    File,
    /// Queue length in bytes over bytes per second.
    Throughput,
}

/// Graph-wide settings.
#[derive(Debug, Clone, PartialEq)]
pub struct GraphSettings {
    /// Length of the history window the counters cover.
    pub history_window: Duration,
    /// Minimum success rate before a route is disabled.
    pub acceptable_failure_rate: f64,
    /// Failed files tolerated before the success rate is enforced.
    pub acceptable_failed_files: u64,
}

impl Default for GraphSettings {
    fn default() -> Self {
        Self {
            history_window: Duration::from_secs(3600),
            acceptable_failure_rate: 0.75,
            acceptable_failed_files: 5,
        }
    }
}

/// One directed site-to-site edge.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Route {
    pub from_site: String,
    pub to_site: String,
    /// Files queued on this route, in-flight partials weighted by completeness.
    pub waiting_files: f64,
    /// Bytes queued on this route, in-flight partials weighted by completeness.
    pub waiting_size: f64,
    pub successful_files: u64,
    pub successful_size: u64,
    pub failed_files: u64,
    pub failed_size: u64,
    /// Files per second over the history window.
    pub fileput: f64,
    /// Bytes per second over the history window.
    pub throughput: f64,
    pub acceptable_failure_rate: f64,
    pub acceptable_failed_files: u64,
}

impl Route {
    fn new(from_site: &str, to_site: &str, settings: &GraphSettings) -> Self {
        Self {
            from_site: from_site.to_string(),
            to_site: to_site.to_string(),
            waiting_files: 0.0,
            waiting_size: 0.0,
            successful_files: 0,
            successful_size: 0,
            failed_files: 0,
            failed_size: 0,
            fileput: 0.0,
            throughput: 0.0,
            acceptable_failure_rate: settings.acceptable_failure_rate,
            acceptable_failed_files: settings.acceptable_failed_files,
        }
    }

    /// Route identifier `fromSite#toSite`.
    pub fn id(&self) -> String {
        route_id(&self.from_site, &self.to_site)
    }

    /// Whether this is the loopback route of one site.
    pub fn is_local(&self) -> bool {
        self.from_site == self.to_site
    }

    /// Successful fraction of the finished transfers; 1.0 without samples.
    pub fn success_rate(&self) -> f64 {
        let total = self.successful_files + self.failed_files;
        if total == 0 {
            1.0
        } else {
            self.successful_files as f64 / total as f64
        }
    }

    /// Whether the route is usable.
    ///
    /// A route is disabled once it has failed more files than it tolerates and
    /// its success rate is below the acceptable rate.
    pub fn is_active(&self) -> bool {
        !(self.failed_files > self.acceptable_failed_files
            && self.success_rate() < self.acceptable_failure_rate)
    }

    /// Expected seconds before a new transfer on this route starts.
    ///
    /// `+∞` when the route is disabled, 0 when nothing has been measured yet.
    pub fn time_to_start(&self, mode: SchedulingType) -> f64 {
        if !self.is_active() {
            return f64::INFINITY;
        }
        let (speed, queue) = match mode {
            SchedulingType::File => (self.fileput, self.waiting_files),
            SchedulingType::Throughput => (self.throughput, self.waiting_size),
        };
        if speed > 0.0 { queue / speed } else { 0.0 }
    }

    fn add_history(&mut self, row: &FtsHistory) {
        match row.status {
            FtsJobStatus::Finished | FtsJobStatus::FinishedDirty => {
                self.successful_files += row.successful_files();
                self.successful_size += row.successful_size();
                self.failed_files += row.failed_files;
                self.failed_size += row.failed_size;
            }
            // Expired or rejected by the server: nothing got through.
            FtsJobStatus::Failed => {
                self.failed_files += row.files;
                self.failed_size += row.size;
            }
            FtsJobStatus::Submitted | FtsJobStatus::Executing => {
                let remaining = (1.0 - row.completeness).clamp(0.0, 1.0);
                self.waiting_files += row.files as f64 * remaining;
                self.waiting_size += row.size as f64 * remaining;
            }
            FtsJobStatus::Cancelled => {}
        }
    }

    fn derive_rates(&mut self, window: Duration) {
        let secs = window.as_secs_f64().max(1.0);
        let files = self.successful_files as f64 - self.failed_files as f64;
        let size = self.successful_size as f64 - self.failed_size as f64;
        self.fileput = files.max(0.0) / secs;
        self.throughput = size.max(0.0) / secs;
    }
}

/// Sites and routes of the transfer topology.
#[derive(Debug, Clone, Default)]
pub struct FtsGraph {
    sites: BTreeMap<String, FtsSite>,
    /// Storage endpoint name to site name.
    se_sites: HashMap<String, String>,
    /// Routes keyed by route identifier.
    routes: BTreeMap<String, Route>,
}

impl FtsGraph {
    /// Build a full mesh over `sites` and load counters from `history`.
    pub fn build(sites: &[FtsSite], history: &[FtsHistory], settings: &GraphSettings) -> Self {
        let mut graph = Self::default();
        for site in sites {
            for se in site.endpoints.keys() {
                graph.se_sites.insert(se.clone(), site.name.clone());
            }
            graph.sites.insert(site.name.clone(), site.clone());
        }

        for from in graph.sites.keys() {
            for to in graph.sites.keys() {
                let route = Route::new(from, to, settings);
                graph.routes.insert(route.id(), route);
            }
        }

        for row in history {
            let (Some(from), Some(to)) = (
                graph.se_sites.get(&row.source_se),
                graph.se_sites.get(&row.target_se),
            ) else {
                debug!(
                    source_se = %row.source_se,
                    target_se = %row.target_se,
                    "Skipping history row for unknown storage element"
                );
                continue;
            };
            if let Some(route) = graph.routes.get_mut(&route_id(from, to)) {
                route.add_history(row);
            }
        }

        for route in graph.routes.values_mut() {
            route.derive_rates(settings.history_window);
        }
        graph
    }

    pub fn sites(&self) -> impl Iterator<Item = &FtsSite> {
        self.sites.values()
    }

    pub fn site(&self, name: &str) -> Option<&FtsSite> {
        self.sites.get(name)
    }

    /// Site hosting a storage endpoint.
    pub fn site_of(&self, se: &str) -> Option<&FtsSite> {
        self.se_sites.get(se).and_then(|site| self.sites.get(site))
    }

    /// All storage endpoint names in the topology.
    pub fn storage_elements(&self) -> Vec<String> {
        let mut names: Vec<String> = self.se_sites.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn se_access(&self, se: &str) -> Option<SeAccess> {
        self.site_of(se)
            .and_then(|site| site.endpoints.get(se))
            .copied()
    }

    /// Replace the access flags of one endpoint. Returns false if it is unknown.
    pub fn set_se_access(&mut self, se: &str, access: SeAccess) -> bool {
        let Some(site_name) = self.se_sites.get(se) else {
            return false;
        };
        match self
            .sites
            .get_mut(site_name)
            .and_then(|site| site.endpoints.get_mut(se))
        {
            Some(current) => {
                *current = access;
                true
            }
            None => false,
        }
    }

    pub fn routes(&self) -> impl Iterator<Item = &Route> {
        self.routes.values()
    }

    pub fn route(&self, id: &str) -> Option<&Route> {
        self.routes.get(id)
    }

    /// Route between the sites hosting two storage endpoints.
    pub fn route_between(&self, source_se: &str, target_se: &str) -> Option<&Route> {
        let from = self.se_sites.get(source_se)?;
        let to = self.se_sites.get(target_se)?;
        self.routes.get(&route_id(from, to))
    }

    /// `time_to_start` between two endpoints, `+∞` when the source cannot be
    /// read or the target cannot be written. `None` without a route.
    pub fn time_to_start(&self, source_se: &str, target_se: &str, mode: SchedulingType) -> Option<f64> {
        let route = self.route_between(source_se, target_se)?;
        let readable = self.se_access(source_se).is_some_and(|a| a.read);
        let writable = self.se_access(target_se).is_some_and(|a| a.write);
        if !readable || !writable {
            return Some(f64::INFINITY);
        }
        Some(route.time_to_start(mode))
    }

    /// Account one more queued file of `size` bytes on a route.
    pub fn add_waiting(&mut self, route_id: &str, size: u64) -> bool {
        match self.routes.get_mut(route_id) {
            Some(route) => {
                route.waiting_files += 1.0;
                route.waiting_size += size as f64;
                true
            }
            None => false,
        }
    }

    /// Count planned transfers not yet handed to FTS into their routes'
    /// queues. Returns how many were placed.
    pub fn add_pending(&mut self, pending: &[FtsFile]) -> usize {
        pending
            .iter()
            .filter(|file| file.status == FtsFileStatus::Waiting)
            .filter(|file| self.add_waiting(&file.route, file.size))
            .count()
    }
}

/// The graph shared between scheduler, refresher and job manager.
pub type SharedGraph = Arc<RwLock<FtsGraph>>;

/// Wrap a graph for sharing.
pub fn shared(graph: FtsGraph) -> SharedGraph {
    Arc::new(RwLock::new(graph))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sites() -> Vec<FtsSite> {
        vec![
            FtsSite::new("CERN", "https://fts.cern:8446").with_endpoint("CERN-DISK"),
            FtsSite::new("RAL", "https://fts.ral:8446")
                .with_endpoint("RAL-DISK")
                .with_endpoint_access("RAL-TAPE", true, false),
        ]
    }

    fn history(status: FtsJobStatus, files: u64, failed: u64) -> FtsHistory {
        FtsHistory {
            source_se: "CERN-DISK".into(),
            target_se: "RAL-DISK".into(),
            status,
            jobs: 1,
            files,
            failed_files: failed,
            size: files * 100,
            failed_size: failed * 100,
            completeness: 0.0,
        }
    }

    #[test]
    fn test_full_mesh_with_loopback() {
        let graph = FtsGraph::build(&sites(), &[], &GraphSettings::default());
        let ids: Vec<String> = graph.routes().map(Route::id).collect();
        assert_eq!(ids, vec!["CERN#CERN", "CERN#RAL", "RAL#CERN", "RAL#RAL"]);
        assert!(graph.route("RAL#RAL").unwrap().is_local());
        assert_eq!(graph.site_of("RAL-TAPE").unwrap().name, "RAL");
        assert_eq!(graph.storage_elements(), vec!["CERN-DISK", "RAL-DISK", "RAL-TAPE"]);
    }

    #[test]
    fn test_rates_from_history() {
        let settings = GraphSettings {
            history_window: Duration::from_secs(10),
            ..Default::default()
        };
        let graph = FtsGraph::build(
            &sites(),
            &[history(FtsJobStatus::Finished, 30, 0), history(FtsJobStatus::FinishedDirty, 10, 2)],
            &settings,
        );
        let route = graph.route("CERN#RAL").unwrap();
        assert_eq!(route.successful_files, 38);
        assert_eq!(route.failed_files, 2);
        assert!((route.fileput - 3.6).abs() < 1e-9);
        assert!((route.throughput - 360.0).abs() < 1e-9);
    }

    #[test]
    fn test_in_flight_jobs_count_as_waiting() {
        let mut row = history(FtsJobStatus::Executing, 10, 0);
        row.completeness = 0.25;
        let graph = FtsGraph::build(&sites(), &[row], &GraphSettings::default());
        let route = graph.route("CERN#RAL").unwrap();
        assert!((route.waiting_files - 7.5).abs() < 1e-9);
        assert!((route.waiting_size - 750.0).abs() < 1e-9);
    }

    #[test]
    fn test_time_to_start() {
        let settings = GraphSettings {
            history_window: Duration::from_secs(10),
            ..Default::default()
        };
        let mut graph = FtsGraph::build(&sites(), &[history(FtsJobStatus::Finished, 20, 0)], &settings);
        // No queue yet.
        assert_eq!(graph.time_to_start("CERN-DISK", "RAL-DISK", SchedulingType::File), Some(0.0));

        for _ in 0..4 {
            assert!(graph.add_waiting("CERN#RAL", 100));
        }
        // 4 files at 2 files/s, 400 bytes at 200 bytes/s.
        assert_eq!(graph.time_to_start("CERN-DISK", "RAL-DISK", SchedulingType::File), Some(2.0));
        assert_eq!(
            graph.time_to_start("CERN-DISK", "RAL-DISK", SchedulingType::Throughput),
            Some(2.0)
        );
        // Unmeasured route without throughput starts immediately.
        assert_eq!(graph.time_to_start("RAL-DISK", "CERN-DISK", SchedulingType::File), Some(0.0));
        assert_eq!(graph.time_to_start("CERN-DISK", "PIC-DISK", SchedulingType::File), None);
    }

    #[test]
    fn test_access_flags_disable_routes() {
        let mut graph = FtsGraph::build(&sites(), &[], &GraphSettings::default());
        assert_eq!(
            graph.time_to_start("CERN-DISK", "RAL-TAPE", SchedulingType::File),
            Some(f64::INFINITY)
        );

        assert!(graph.set_se_access("CERN-DISK", SeAccess { read: false, write: true }));
        assert_eq!(
            graph.time_to_start("CERN-DISK", "RAL-DISK", SchedulingType::File),
            Some(f64::INFINITY)
        );
        assert!(!graph.set_se_access("PIC-DISK", SeAccess::default()));
    }

    #[test]
    fn test_failing_route_is_disabled() {
        // 4 of 10 succeeded: rate 0.4 with 6 failures, over both thresholds.
        let graph = FtsGraph::build(
            &sites(),
            &[history(FtsJobStatus::FinishedDirty, 10, 6)],
            &GraphSettings::default(),
        );
        let route = graph.route("CERN#RAL").unwrap();
        assert!(!route.is_active());
        assert_eq!(route.time_to_start(SchedulingType::File), f64::INFINITY);

        // Same rate but few failures: still tolerated.
        let graph = FtsGraph::build(
            &sites(),
            &[history(FtsJobStatus::FinishedDirty, 5, 3)],
            &GraphSettings::default(),
        );
        assert!(graph.route("CERN#RAL").unwrap().is_active());
    }

    #[test]
    fn test_expired_jobs_count_as_failures() {
        let graph = FtsGraph::build(
            &sites(),
            &[history(FtsJobStatus::Failed, 8, 0)],
            &GraphSettings::default(),
        );
        let route = graph.route("CERN#RAL").unwrap();
        assert_eq!(route.failed_files, 8);
        assert_eq!(route.fileput, 0.0);
    }
}
