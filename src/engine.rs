use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;

use futures_util::stream::{self, StreamExt};
use serde::Serialize;
use serde_json::json;
use tracing::{info, warn};

use crate::allocator::{allocate, RoleFill};
use crate::config::AppConfig;
use crate::errors::AppResult;
use crate::geocode::GeocodeResolver;
use crate::model::{Coordinates, SiteStatus};
use crate::store::{EntityStore, FailedWrite};
use crate::telemetry::TelemetryLog;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RunOutcome {
    Complete,
    Partial,
}

#[derive(Debug, Clone, Serialize)]
pub struct UnresolvedEntity {
    pub kind: &'static str,
    pub id: String,
    pub address: String,
}

/// Summary of one full-recompute run.
#[derive(Debug, Serialize)]
pub struct RunReport {
    pub outcome: RunOutcome,
    pub employees_loaded: usize,
    pub sites_active: usize,
    pub assignments_written: usize,
    pub fills: Vec<RoleFill>,
    pub unresolved: Vec<UnresolvedEntity>,
    pub failed_writes: Vec<FailedWrite>,
    pub elapsed_ms: u128,
}

impl RunReport {
    pub fn is_complete(&self) -> bool {
        self.outcome == RunOutcome::Complete
    }
}

/// Run controller. Each run recomputes the entire assignment set from the
/// current employee and job-site snapshot; nothing is read from the previous
/// set, so repeated runs against unchanged input land on the same result.
pub struct AssignmentEngine {
    config: AppConfig,
    store: EntityStore,
    resolver: Arc<GeocodeResolver>,
    telemetry: TelemetryLog,
}

impl AssignmentEngine {
    pub fn new(
        config: AppConfig,
        store: EntityStore,
        resolver: Arc<GeocodeResolver>,
        telemetry: TelemetryLog,
    ) -> Self {
        Self {
            config,
            store,
            resolver,
            telemetry,
        }
    }

    pub async fn run(&self) -> AppResult<RunReport> {
        let started = Instant::now();

        // Load everything up front; nothing destructive happens until the
        // snapshot is fully in memory.
        let mut employees = self.store.load_employees()?;
        let mut sites = self.store.load_job_sites()?;
        sites.retain(|site| site.status == SiteStatus::Active);

        self.record(
            "run_started",
            json!({
                "employees": employees.len(),
                "active_sites": sites.len(),
            }),
        );

        let mut unresolved = Vec::new();

        // Geocode whatever lacks cached coordinates, workers and sites in one
        // bounded-concurrency pass.
        let pending_employees: Vec<(usize, String)> = employees
            .iter()
            .enumerate()
            .filter(|(_, e)| e.coordinates().is_none())
            .map(|(idx, e)| (idx, e.home_address.clone()))
            .collect();
        for (idx, coords) in self.resolve_batch(pending_employees).await {
            let employee = &mut employees[idx];
            match coords {
                Some(coords) => {
                    employee.latitude = Some(coords.latitude);
                    employee.longitude = Some(coords.longitude);
                    self.store
                        .cache_employee_coordinates(&employee.worker_id, coords)?;
                }
                None => unresolved.push(UnresolvedEntity {
                    kind: "employee",
                    id: employee.worker_id.clone(),
                    address: employee.home_address.clone(),
                }),
            }
        }

        let pending_sites: Vec<(usize, String)> = sites
            .iter()
            .enumerate()
            .filter(|(_, s)| s.coordinates().is_none())
            .map(|(idx, s)| (idx, s.location.clone()))
            .collect();
        for (idx, coords) in self.resolve_batch(pending_sites).await {
            let site = &mut sites[idx];
            match coords {
                Some(coords) => {
                    site.latitude = Some(coords.latitude);
                    site.longitude = Some(coords.longitude);
                    self.store.cache_site_coordinates(&site.site_id, coords)?;
                }
                None => unresolved.push(UnresolvedEntity {
                    kind: "job_site",
                    id: site.site_id.clone(),
                    address: site.location.clone(),
                }),
            }
        }

        for entity in &unresolved {
            self.record(
                "entity_unresolved",
                json!({ "kind": entity.kind, "id": entity.id }),
            );
        }

        // Unresolved entities sit this run out; they stay in their
        // collections and get another chance next run.
        let employees_loaded = employees.len();
        employees.retain(|e| e.coordinates().is_some());
        sites.retain(|s| s.coordinates().is_some());

        let mut assigned = HashSet::new();
        let allocation = allocate(
            &sites,
            &employees,
            &mut assigned,
            self.config.proximity_threshold_km,
        );

        let persist = self
            .store
            .replace_assignments(&allocation.assignments, self.config.persist_retry_limit)?;

        let outcome = if unresolved.is_empty() && persist.failed.is_empty() {
            RunOutcome::Complete
        } else {
            RunOutcome::Partial
        };

        let report = RunReport {
            outcome,
            employees_loaded,
            sites_active: sites.len(),
            assignments_written: persist.inserted,
            fills: allocation.fills,
            unresolved,
            failed_writes: persist.failed,
            elapsed_ms: started.elapsed().as_millis(),
        };

        self.record(
            "run_completed",
            json!({
                "outcome": report.outcome,
                "assignments": report.assignments_written,
                "unresolved": report.unresolved.len(),
                "failed_writes": report.failed_writes.len(),
                "elapsed_ms": report.elapsed_ms,
            }),
        );
        if let Err(err) = self.telemetry.flush() {
            warn!(%err, "unable to flush run events");
        }

        info!(
            outcome = ?report.outcome,
            assignments = report.assignments_written,
            unresolved = report.unresolved.len(),
            elapsed_ms = report.elapsed_ms,
            "assignment run finished"
        );
        Ok(report)
    }

    async fn resolve_batch(
        &self,
        pending: Vec<(usize, String)>,
    ) -> Vec<(usize, Option<Coordinates>)> {
        stream::iter(pending)
            .map(|(idx, address)| {
                let resolver = Arc::clone(&self.resolver);
                async move { (idx, resolver.resolve(&address).await) }
            })
            .buffer_unordered(self.config.geocode_concurrency)
            .collect()
            .await
    }

    // Telemetry must never fail a run.
    fn record(&self, name: &str, payload: serde_json::Value) {
        if let Err(err) = self.telemetry.record(name, payload) {
            warn!(event = name, %err, "unable to record run event");
        }
    }
}
