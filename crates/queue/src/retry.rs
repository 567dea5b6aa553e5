//! Nested-transaction retry helper.

use futures::future::BoxFuture;
use tracing::warn;

use davq_core::{QueueError, QueueResult};

use crate::transaction::Transaction;

/// Run `operation` inside a savepoint of `txn`, retrying up to `retries`
/// additional times.
///
/// Each failed attempt is rolled back to its savepoint before the next one
/// starts, so the outer transaction only ever sees the effects of the
/// successful attempt. After `retries + 1` failures the last error is
/// returned wrapped in [`QueueError::AllRetriesFailed`]; the outer
/// transaction is left as it was before the call.
///
/// Savepoint failures themselves are not retried.
///
/// ```ignore
/// let value = subtransaction(txn, 3, |sub| {
///     Box::pin(async move { sub.named_value("counter").await })
/// })
/// .await?;
/// ```
pub async fn subtransaction<T, F>(
    txn: &mut dyn Transaction,
    retries: u32,
    mut operation: F,
) -> QueueResult<T>
where
    T: Send,
    F: for<'t> FnMut(&'t mut dyn Transaction) -> BoxFuture<'t, QueueResult<T>> + Send,
{
    let mut attempt = 0;
    loop {
        let savepoint = format!("subtxn_{attempt}");
        txn.savepoint(&savepoint).await?;

        match operation(&mut *txn).await {
            Ok(value) => {
                txn.release_savepoint(&savepoint).await?;
                return Ok(value);
            }
            Err(error) => {
                txn.rollback_to_savepoint(&savepoint).await?;
                if attempt >= retries {
                    return Err(QueueError::AllRetriesFailed {
                        attempts: attempt + 1,
                        last: Box::new(error),
                    });
                }
                warn!(attempt = attempt + 1, retries, error = %error, "subtransaction failed, retrying");
                attempt += 1;
            }
        }
    }
}
