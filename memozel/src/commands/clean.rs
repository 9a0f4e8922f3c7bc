//! `clean`

use convenient_memo::{Driver, MemoResult};

/// Delete recorded outputs and clear the store. Returns `false` when some
/// outputs could not be deleted.
pub fn execute(driver: &mut Driver) -> MemoResult<bool> {
    let report = driver.clean()?;

    for path in &report.removed {
        println!("  removed  {}", path.display());
    }
    for (path, error) in &report.failures {
        eprintln!("  FAILED   {}: {error}", path.display());
    }
    println!(
        "Removed {} files ({} already gone), cleared {} records",
        report.removed.len(),
        report.missing.len(),
        report.records_cleared
    );
    Ok(report.failures.is_empty())
}
