use std::env;
use std::path::PathBuf;

use anyhow::Context;

use optishift::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let data_dir = env::var("OPTISHIFT_DATA_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("data"));

    let state = AppState::initialize(&data_dir)
        .with_context(|| format!("initializing in {}", data_dir.display()))?;

    let report = state
        .engine()
        .run()
        .await
        .context("assignment run failed")?;

    println!(
        "run {:?}: {} assignments across {} active sites ({} employees considered) in {} ms",
        report.outcome,
        report.assignments_written,
        report.sites_active,
        report.employees_loaded,
        report.elapsed_ms
    );
    for fill in &report.fills {
        println!(
            "  {} / {}: {}/{}{}",
            fill.site_id,
            fill.role,
            fill.assigned,
            fill.required,
            if fill.is_filled() { "" } else { "  (short)" }
        );
    }
    if !report.unresolved.is_empty() {
        println!("unresolved entities:");
        for entity in &report.unresolved {
            println!("  {} {} ({})", entity.kind, entity.id, entity.address);
        }
    }
    if !report.failed_writes.is_empty() {
        println!("failed writes:");
        for failure in &report.failed_writes {
            println!(
                "  {} -> {} as {}: {}",
                failure.employee_id, failure.job_site_id, failure.role, failure.reason
            );
        }
    }

    Ok(())
}
