//! Batched execution.
//!
//! One statement applied to many parameter sets inside a single transaction.
//! The first failing set aborts the batch; nothing from earlier sets survives.

use crate::db::executor::StatementExecutor;
use crate::db::pool::Lease;
use crate::db::transaction::{self, TransactionScope};
use crate::error::DbResult;
use crate::models::{ExecuteResult, Params};
use tracing::{debug, warn};

/// Execute `sql` once per parameter set, in order, aggregating the results.
pub(crate) async fn apply(
    scope: &mut TransactionScope<'_>,
    sql: &str,
    parameter_sets: &[Params],
) -> DbResult<ExecuteResult> {
    let mut total = ExecuteResult::default();

    for (index, params) in parameter_sets.iter().enumerate() {
        match scope.execute_params(sql, params).await {
            Ok(result) => total.absorb(result),
            Err(e) => {
                warn!(
                    index,
                    total = parameter_sets.len(),
                    error = %e,
                    "Batch parameter set failed, rolling back"
                );
                return Err(e);
            }
        }
    }

    Ok(total)
}

/// Run a whole batch on `lease`: begin, apply every set, commit or roll back.
pub(crate) async fn run(
    lease: &mut Lease,
    executor: StatementExecutor,
    sql: &str,
    parameter_sets: &[Params],
) -> DbResult<ExecuteResult> {
    let mut scope = transaction::begin(lease, executor).await?;
    let outcome = apply(&mut scope, sql, parameter_sets).await;
    let result = transaction::finish(scope, outcome).await;

    if let Ok(total) = &result {
        debug!(
            sets = parameter_sets.len(),
            row_count = total.row_count,
            "Batch committed"
        );
    }
    result
}
