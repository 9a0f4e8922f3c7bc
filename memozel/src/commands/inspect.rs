//! `status` and `list`

use convenient_memo::{CommandRequest, Decision, Driver, MemoResult};

/// Print the decision for `request`. Returns `true` when it is up to date.
pub fn status(driver: &Driver, request: &CommandRequest) -> bool {
    let identity = driver.identity(request);
    let decision = driver.status(request);
    println!("{identity}: {decision}");
    matches!(decision, Decision::MaySkip)
}

/// Print every record in the store
pub fn list(driver: &Driver, json: bool) -> MemoResult<()> {
    let store = driver.store();
    if json {
        let records: Vec<_> = store.records().collect();
        println!("{}", serde_json::to_string_pretty(&records)?);
        return Ok(());
    }

    println!("{} records in {}", store.len(), store.path().display());
    for record in store.records() {
        println!();
        println!("{}", record.command);
        for input in &record.inputs {
            println!("  < {}", input.path.display());
        }
        for output in &record.outputs {
            println!("  > {}", output.path.display());
        }
    }
    Ok(())
}
