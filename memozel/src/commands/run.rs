//! `run` and `batch`

use convenient_memo::{CommandRequest, Driver, MemoError, Outcome};
use std::fs;
use std::path::Path;

/// Run one request. Returns `false` when it failed.
pub fn execute(driver: &mut Driver, request: &CommandRequest) -> bool {
    let outcome = driver.run(request);
    report(&driver.identity(request).to_string(), &outcome);
    !outcome.is_failed()
}

/// Run every request in `file` as one batch. Returns `false` when any failed.
pub fn execute_batch(driver: &mut Driver, file: &Path) -> Result<bool, MemoError> {
    let data = fs::read_to_string(file)
        .map_err(|e| MemoError::Config(format!("cannot read {}: {e}", file.display())))?;
    let requests: Vec<CommandRequest> = serde_json::from_str(&data)
        .map_err(|e| MemoError::Config(format!("{}: {e}", file.display())))?;
    tracing::info!("Running batch of {} commands from {}", requests.len(), file.display());

    let outcomes = driver.run_batch(&requests);
    for (request, outcome) in requests.iter().zip(&outcomes) {
        report(&driver.identity(request).to_string(), outcome);
    }

    println!();
    println!("{}", driver.stats());
    Ok(outcomes.iter().all(|outcome| !outcome.is_failed()))
}

fn report(command: &str, outcome: &Outcome) {
    match outcome {
        Outcome::Skipped => println!("  up to date  {command}"),
        Outcome::Succeeded(report) => {
            println!("  ran         {command}  [{}ms, {}]", report.duration_ms, report.reason)
        }
        Outcome::Failed(e) => eprintln!("  FAILED      {command}: {e}"),
    }
}
