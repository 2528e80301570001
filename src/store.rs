use std::sync::Arc;

use parking_lot::Mutex;
use rusqlite::{params, Connection};
use serde::Serialize;
use tracing::{trace, warn};

use crate::db;
use crate::errors::{AppError, AppResult};
use crate::model::{Assignment, Coordinates, Employee, JobSite};

/// Read side of the employee and job-site collections plus the derived
/// assignment sink. Entity documents are stored as JSON and parsed through
/// the strict boundary in `model`; cached coordinates live in dedicated
/// columns and take precedence over whatever the document carries.
#[derive(Clone)]
pub struct EntityStore {
    db: Arc<Mutex<Connection>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct FailedWrite {
    pub employee_id: String,
    pub job_site_id: String,
    pub role: String,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct PersistReport {
    pub purged: usize,
    pub inserted: usize,
    pub failed: Vec<FailedWrite>,
}

impl EntityStore {
    pub fn new(db: Arc<Mutex<Connection>>) -> Self {
        Self { db }
    }

    pub fn load_employees(&self) -> AppResult<Vec<Employee>> {
        let conn = self.db.lock();
        let mut stmt = conn.prepare("SELECT worker_id, doc, lat, lng FROM employees ORDER BY worker_id ASC")?;
        let rows = stmt
            .query_map([], |row| {
                let worker_id: String = row.get(0)?;
                let doc: String = row.get(1)?;
                let lat: Option<f64> = row.get(2)?;
                let lng: Option<f64> = row.get(3)?;
                Ok((worker_id, doc, lat, lng))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        drop(stmt);
        drop(conn);

        let mut employees = Vec::with_capacity(rows.len());
        for (worker_id, doc, lat, lng) in rows {
            match serde_json::from_str::<Employee>(&doc) {
                Ok(mut employee) => {
                    if lat.is_some() && lng.is_some() {
                        employee.latitude = lat;
                        employee.longitude = lng;
                    }
                    employees.push(employee);
                }
                Err(err) => {
                    warn!(worker_id, %err, "skipping malformed employee document");
                }
            }
        }
        Ok(employees)
    }

    pub fn load_job_sites(&self) -> AppResult<Vec<JobSite>> {
        let conn = self.db.lock();
        let mut stmt =
            conn.prepare("SELECT site_id, doc, lat, lng FROM job_sites ORDER BY site_id ASC")?;
        let rows = stmt
            .query_map([], |row| {
                let site_id: String = row.get(0)?;
                let doc: String = row.get(1)?;
                let lat: Option<f64> = row.get(2)?;
                let lng: Option<f64> = row.get(3)?;
                Ok((site_id, doc, lat, lng))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        drop(stmt);
        drop(conn);

        let mut sites = Vec::with_capacity(rows.len());
        for (site_id, doc, lat, lng) in rows {
            match serde_json::from_str::<JobSite>(&doc) {
                Ok(mut site) => {
                    if lat.is_some() && lng.is_some() {
                        site.latitude = lat;
                        site.longitude = lng;
                    }
                    sites.push(site);
                }
                Err(err) => {
                    warn!(site_id, %err, "skipping malformed job site document");
                }
            }
        }
        Ok(sites)
    }

    /// Writes resolved coordinates back to the entity row so later runs skip
    /// geocoding for it.
    pub fn cache_employee_coordinates(
        &self,
        worker_id: &str,
        coords: Coordinates,
    ) -> AppResult<()> {
        let conn = self.db.lock();
        conn.execute(
            "UPDATE employees SET lat = ?1, lng = ?2, updated_at = DATETIME('now') WHERE worker_id = ?3",
            params![coords.latitude, coords.longitude, worker_id],
        )?;
        trace!(worker_id, "cached employee coordinates");
        Ok(())
    }

    pub fn cache_site_coordinates(&self, site_id: &str, coords: Coordinates) -> AppResult<()> {
        let conn = self.db.lock();
        conn.execute(
            "UPDATE job_sites SET lat = ?1, lng = ?2, updated_at = DATETIME('now') WHERE site_id = ?3",
            params![coords.latitude, coords.longitude, site_id],
        )?;
        trace!(site_id, "cached job site coordinates");
        Ok(())
    }

    /// Purges the prior assignment set and writes the new one in a single
    /// transaction, so a reader observes either the old set or the new set,
    /// never a torn mix. Individual inserts are retried up to `retry_limit`
    /// times; records that still fail are reported and the rest of the batch
    /// proceeds.
    pub fn replace_assignments(
        &self,
        assignments: &[Assignment],
        retry_limit: u32,
    ) -> AppResult<PersistReport> {
        let mut conn = self.db.lock();
        let tx = conn.transaction()?;
        let purged = tx.execute("DELETE FROM assignments", [])?;

        let mut inserted = 0;
        let mut failed = Vec::new();
        {
            let mut stmt = tx.prepare(
                "INSERT INTO assignments (employee_id, job_site_id, role, distance_km, assigned_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
            )?;
            for assignment in assignments {
                match insert_with_retry(&mut stmt, assignment, retry_limit) {
                    Ok(()) => inserted += 1,
                    Err(err) => {
                        warn!(
                            employee_id = assignment.employee_id,
                            job_site_id = assignment.job_site_id,
                            %err,
                            "assignment write failed after retries"
                        );
                        failed.push(FailedWrite {
                            employee_id: assignment.employee_id.clone(),
                            job_site_id: assignment.job_site_id.clone(),
                            role: assignment.role.clone(),
                            reason: err.to_string(),
                        });
                    }
                }
            }
        }
        tx.commit()?;

        Ok(PersistReport {
            purged,
            inserted,
            failed,
        })
    }

    pub fn load_assignments(&self) -> AppResult<Vec<Assignment>> {
        let conn = self.db.lock();
        let mut stmt = conn.prepare(
            "SELECT employee_id, job_site_id, role, distance_km, assigned_at
             FROM assignments ORDER BY id ASC",
        )?;
        let rows = stmt
            .query_map([], |row| {
                Ok(Assignment {
                    employee_id: row.get(0)?,
                    job_site_id: row.get(1)?,
                    role: row.get(2)?,
                    distance_km: row.get(3)?,
                    assigned_at: row.get(4)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Admin-side document write. The engine itself never calls this during a
    /// run; it exists for the entry wrappers and tests that seed collections.
    pub fn upsert_employee_doc(&self, worker_id: &str, doc: &serde_json::Value) -> AppResult<()> {
        let payload = serde_json::to_string(doc)?;
        let conn = self.db.lock();
        conn.execute(
            "INSERT INTO employees (worker_id, doc, updated_at)
             VALUES (?1, ?2, DATETIME('now'))
             ON CONFLICT(worker_id) DO UPDATE SET
                 doc = excluded.doc,
                 updated_at = DATETIME('now')",
            params![worker_id, payload],
        )?;
        Ok(())
    }

    pub fn upsert_job_site_doc(&self, site_id: &str, doc: &serde_json::Value) -> AppResult<()> {
        let payload = serde_json::to_string(doc)?;
        let conn = self.db.lock();
        conn.execute(
            "INSERT INTO job_sites (site_id, doc, updated_at)
             VALUES (?1, ?2, DATETIME('now'))
             ON CONFLICT(site_id) DO UPDATE SET
                 doc = excluded.doc,
                 updated_at = DATETIME('now')",
            params![site_id, payload],
        )?;
        Ok(())
    }

    pub fn employee_count(&self) -> AppResult<usize> {
        let conn = self.db.lock();
        conn.query_row("SELECT COUNT(*) FROM employees", [], |row| {
            row.get::<_, i64>(0)
        })
        .map(|count| count as usize)
        .map_err(AppError::from)
    }
}

fn insert_with_retry(
    stmt: &mut rusqlite::Statement<'_>,
    assignment: &Assignment,
    retry_limit: u32,
) -> AppResult<()> {
    let mut attempt = 0;
    loop {
        attempt += 1;
        match stmt.execute(params![
            assignment.employee_id,
            assignment.job_site_id,
            assignment.role,
            assignment.distance_km,
            assignment.assigned_at,
        ]) {
            Ok(_) => return Ok(()),
            Err(err) if attempt < retry_limit => {
                warn!(attempt, %err, "retrying assignment insert");
            }
            Err(err) => return Err(AppError::from(err)),
        }
    }
}

pub fn make_assignment(
    employee_id: &str,
    job_site_id: &str,
    role: &str,
    distance_km: f64,
) -> Assignment {
    Assignment {
        employee_id: employee_id.to_string(),
        job_site_id: job_site_id.to_string(),
        role: role.to_string(),
        distance_km,
        assigned_at: db::now_timestamp(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    use crate::db::bootstrap;

    fn store_in(dir: &std::path::Path) -> EntityStore {
        let ctx = bootstrap(dir, "store.db").unwrap();
        EntityStore::new(Arc::new(Mutex::new(ctx.connection)))
    }

    #[test]
    fn loads_typed_employees_and_skips_malformed_docs() {
        let dir = tempdir().unwrap();
        let store = store_in(dir.path());
        store
            .upsert_employee_doc(
                "W1",
                &json!({
                    "worker_id": "W1",
                    "home_address": "10 Bay Street, Toronto",
                    "role": ["Cleaner"],
                    "have_car": "Yes"
                }),
            )
            .unwrap();
        store
            .upsert_employee_doc("W2", &json!({ "rating": "not an employee" }))
            .unwrap();

        let employees = store.load_employees().unwrap();
        assert_eq!(employees.len(), 1);
        assert_eq!(employees[0].worker_id, "W1");
        assert!(employees[0].have_car);
    }

    #[test]
    fn cached_coordinates_override_document_fields() {
        let dir = tempdir().unwrap();
        let store = store_in(dir.path());
        store
            .upsert_employee_doc(
                "W1",
                &json!({ "worker_id": "W1", "latitude": 1.0, "longitude": 1.0 }),
            )
            .unwrap();
        store
            .cache_employee_coordinates("W1", Coordinates::new(43.65, -79.38))
            .unwrap();

        let employees = store.load_employees().unwrap();
        let coords = employees[0].coordinates().unwrap();
        assert_eq!(coords.latitude, 43.65);
        assert_eq!(coords.longitude, -79.38);
    }

    #[test]
    fn replace_assignments_purges_then_inserts_atomically() {
        let dir = tempdir().unwrap();
        let store = store_in(dir.path());
        store
            .upsert_employee_doc("W1", &json!({ "worker_id": "W1" }))
            .unwrap();
        store
            .upsert_employee_doc("W2", &json!({ "worker_id": "W2" }))
            .unwrap();
        store
            .upsert_job_site_doc("S1", &json!({ "site_id": "S1" }))
            .unwrap();

        let first = vec![make_assignment("W1", "S1", "Cleaner", 12.0)];
        let report = store.replace_assignments(&first, 3).unwrap();
        assert_eq!(report.inserted, 1);
        assert_eq!(report.purged, 0);

        let second = vec![
            make_assignment("W1", "S1", "Cleaner", 12.0),
            make_assignment("W2", "S1", "Labour", 3.5),
        ];
        let report = store.replace_assignments(&second, 3).unwrap();
        assert_eq!(report.purged, 1);
        assert_eq!(report.inserted, 2);
        assert!(report.failed.is_empty());

        let persisted = store.load_assignments().unwrap();
        assert_eq!(persisted.len(), 2);
    }

    #[test]
    fn failed_record_is_reported_without_aborting_batch() {
        let dir = tempdir().unwrap();
        let store = store_in(dir.path());
        store
            .upsert_employee_doc("W1", &json!({ "worker_id": "W1" }))
            .unwrap();
        store
            .upsert_job_site_doc("S1", &json!({ "site_id": "S1" }))
            .unwrap();

        // Second record violates the foreign key on employee_id.
        let batch = vec![
            make_assignment("W1", "S1", "Cleaner", 1.0),
            make_assignment("GHOST", "S1", "Cleaner", 2.0),
        ];
        let report = store.replace_assignments(&batch, 2).unwrap();
        assert_eq!(report.inserted, 1);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].employee_id, "GHOST");

        let persisted = store.load_assignments().unwrap();
        assert_eq!(persisted.len(), 1);
    }
}
