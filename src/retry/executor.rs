use super::classify::{Classification, Classifier, SqlStateClassifier};
use super::context::TxContext;
use super::error::{TxError, TxOp};
use super::policy::RetryPolicy;
use crate::connection::{ConnectionSource, TransactionHandle};
use futures::future::BoxFuture;
use log::{debug, error, warn};
use std::fmt;
use std::future::Future;
use std::time::Instant;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AttemptOutcome {
    Committed,
    Retryable,
    Fatal,
}

/// One run of the work function. Lives only while its outcome is unknown.
#[derive(Debug)]
struct Attempt {
    seq: u32,
    started_at: Instant,
}

impl Attempt {
    fn first() -> Self {
        Self {
            seq: 0,
            started_at: Instant::now(),
        }
    }

    fn next(&self) -> Self {
        Self {
            seq: self.seq.saturating_add(1),
            started_at: Instant::now(),
        }
    }

    /// Attempts made so far, this one included.
    fn count(&self) -> u32 {
        self.seq.saturating_add(1)
    }

    fn finish(&self, outcome: AttemptOutcome) {
        debug!(
            "Transaction attempt {} ended {:?} after {:?}",
            self.seq,
            outcome,
            self.started_at.elapsed()
        );
    }
}

/// Runs a unit of work inside a transaction and replays it on serialization
/// conflicts.
///
/// Protocol per call: `SAVEPOINT` as retry boundary, run the work, then
/// `RELEASE SAVEPOINT` + `COMMIT`. A retryable failure anywhere in that
/// sequence rolls back to the boundary and runs the work again on the same
/// transaction; a fatal failure rolls back the whole transaction.
///
/// The executor holds no mutable state and can be shared between tasks.
///
/// # Examples
///
/// ```
/// use txretry::memory::{MemoryDatabase, MemoryPool};
/// use txretry::{ConnectionConfig, ConnectionSource, DbError, RetryExecutor, Value};
/// use tokio_util::sync::CancellationToken;
///
/// # #[tokio::main]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let pool = MemoryPool::new(MemoryDatabase::new(), ConnectionConfig::memory("events"))?;
/// let executor = RetryExecutor::new();
/// let cancel = CancellationToken::new();
///
/// let tx = pool.begin().await?;
/// executor
///     .execute(&cancel, tx, |tx| {
///         Box::pin(async move {
///             tx.execute("CREATE TABLE repodefault (owner TEXT, repo TEXT)", &[]).await?;
///             tx.execute(
///                 "INSERT INTO repodefault VALUES ($1, $2)",
///                 &[Value::from("seankhliao"), Value::from("saver")],
///             )
///             .await?;
///             Ok::<_, DbError>(())
///         })
///     })
///     .await?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct RetryExecutor<C = SqlStateClassifier> {
    policy: RetryPolicy<C>,
}

impl RetryExecutor {
    pub fn new() -> Self {
        Self {
            policy: RetryPolicy::new(),
        }
    }
}

impl Default for RetryExecutor {
    fn default() -> Self {
        Self::new()
    }
}

struct Failure<E> {
    /// `None` when the work itself failed.
    op: Option<TxOp>,
    err: E,
}

impl<C> RetryExecutor<C> {
    pub fn with_policy(policy: RetryPolicy<C>) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &RetryPolicy<C> {
        &self.policy
    }

    /// Run `work` on `handle` until it commits, fails fatally, exhausts the
    /// retry budget, or `cancel` fires.
    ///
    /// `work` may be invoked several times. On any error return the
    /// transaction has been rolled back.
    pub async fn execute<H, T, E, F>(
        &self,
        cancel: &CancellationToken,
        handle: H,
        mut work: F,
    ) -> Result<T, TxError<E>>
    where
        H: TransactionHandle,
        E: From<H::Error> + fmt::Display + Send,
        C: Classifier<E>,
        F: for<'a> FnMut(&'a mut TxContext<H>) -> BoxFuture<'a, Result<T, E>> + Send,
        T: Send,
    {
        let started = Instant::now();
        let savepoint = self.policy.savepoint.as_str();
        let mut ctx = TxContext::new(handle);

        let boundary = cancellable(cancel, ctx.handle_mut().savepoint(savepoint)).await;
        match boundary {
            None => return Err(abort(&mut ctx, TxError::Cancelled { attempts: 0 }).await),
            Some(Err(err)) => {
                let err = TxError::Infrastructure {
                    op: TxOp::Savepoint,
                    source: E::from(err),
                };
                return Err(abort(&mut ctx, err).await);
            }
            Some(Ok(())) => {}
        }

        let mut attempt = Attempt::first();
        loop {
            ctx.start_attempt(attempt.seq);
            debug!("Transaction attempt {} started", attempt.seq);

            let outcome = cancellable(cancel, work(&mut ctx)).await;
            let failure = match outcome {
                None => {
                    let err = TxError::Cancelled {
                        attempts: attempt.count(),
                    };
                    return Err(abort(&mut ctx, err).await);
                }
                Some(Err(err)) => Failure { op: None, err },
                Some(Ok(value)) => {
                    if cancel.is_cancelled() {
                        let err = TxError::Cancelled {
                            attempts: attempt.count(),
                        };
                        return Err(abort(&mut ctx, err).await);
                    }

                    match finalize(&mut ctx, savepoint).await {
                        Ok(()) => {
                            debug!(
                                "Transaction committed on attempt {} ({:?} total)",
                                attempt.seq,
                                started.elapsed()
                            );
                            attempt.finish(AttemptOutcome::Committed);
                            for hook in ctx.take_commit_hooks() {
                                hook();
                            }
                            return Ok(value);
                        }
                        Err((op, err)) => Failure {
                            op: Some(op),
                            err: E::from(err),
                        },
                    }
                }
            };

            if self.policy.classifier.classify(&failure.err) == Classification::Fatal {
                attempt.finish(AttemptOutcome::Fatal);
                let err = match failure.op {
                    None => TxError::Work(failure.err),
                    Some(op) => TxError::Infrastructure {
                        op,
                        source: failure.err,
                    },
                };
                return Err(abort(&mut ctx, err).await);
            }
            attempt.finish(AttemptOutcome::Retryable);

            let attempts = attempt.count();
            let elapsed = started.elapsed();
            if self.policy.is_exhausted(attempts, elapsed) {
                warn!(
                    "Transaction giving up after {} attempts in {:?}: {}",
                    attempts, elapsed, failure.err
                );
                let err = TxError::RetryLimitExceeded {
                    attempts,
                    elapsed,
                    last: failure.err,
                };
                return Err(abort(&mut ctx, err).await);
            }

            let delay = self.policy.backoff.delay(attempts);
            warn!(
                "Transaction retry on conflict (attempt {} of {}): {} (backoff={}ms)",
                attempts,
                self.budget_label(),
                failure.err,
                delay.as_millis()
            );
            if !delay.is_zero() && cancellable(cancel, tokio::time::sleep(delay)).await.is_none() {
                return Err(abort(&mut ctx, TxError::Cancelled { attempts }).await);
            }

            let restart = cancellable(cancel, ctx.handle_mut().rollback_to_savepoint(savepoint)).await;
            match restart {
                None => return Err(abort(&mut ctx, TxError::Cancelled { attempts }).await),
                Some(Err(err)) => {
                    error!(
                        "Transaction restart failed: {} (restarting after: {})",
                        err, failure.err
                    );
                    let err = TxError::Infrastructure {
                        op: TxOp::RollbackToSavepoint,
                        source: E::from(err),
                    };
                    return Err(abort(&mut ctx, err).await);
                }
                Some(Ok(())) => {}
            }

            attempt = attempt.next();
        }
    }

    /// Begin a transaction on `source` and [`execute`](Self::execute) `work` on it.
    pub async fn execute_in<S, T, E, F>(
        &self,
        cancel: &CancellationToken,
        source: &S,
        work: F,
    ) -> Result<T, TxError<E>>
    where
        S: ConnectionSource + ?Sized,
        E: From<<S::Transaction as TransactionHandle>::Error> + fmt::Display + Send,
        C: Classifier<E>,
        F: for<'a> FnMut(&'a mut TxContext<S::Transaction>) -> BoxFuture<'a, Result<T, E>>
            + Send,
        T: Send,
    {
        let handle = match cancellable(cancel, source.begin()).await {
            None => return Err(TxError::Cancelled { attempts: 0 }),
            Some(Err(err)) => {
                return Err(TxError::Infrastructure {
                    op: TxOp::Begin,
                    source: E::from(err),
                });
            }
            Some(Ok(handle)) => handle,
        };
        self.execute(cancel, handle, work).await
    }

    fn budget_label(&self) -> String {
        match (self.policy.max_attempts, self.policy.max_elapsed) {
            (Some(max), _) => max.to_string(),
            (None, Some(elapsed)) => format!("{elapsed:?} budget"),
            (None, None) => "unbounded".to_string(),
        }
    }
}

/// Resolve `fut`, or `None` if `cancel` fires first.
async fn cancellable<F: Future>(cancel: &CancellationToken, fut: F) -> Option<F::Output> {
    tokio::select! {
        biased;
        () = cancel.cancelled() => None,
        out = fut => Some(out),
    }
}

/// Release the retry boundary and commit. Not interruptible: once release is
/// issued the outcome must be observed.
async fn finalize<H: TransactionHandle>(
    ctx: &mut TxContext<H>,
    savepoint: &str,
) -> Result<(), (TxOp, H::Error)> {
    ctx.handle_mut()
        .release_savepoint(savepoint)
        .await
        .map_err(|err| (TxOp::ReleaseSavepoint, err))?;
    ctx.handle_mut()
        .commit()
        .await
        .map_err(|err| (TxOp::Commit, err))
}

/// Roll the whole transaction back and hand `err` back to the caller.
async fn abort<H, E>(ctx: &mut TxContext<H>, err: TxError<E>) -> TxError<E>
where
    H: TransactionHandle,
    E: fmt::Display,
{
    if let Err(rollback_err) = ctx.handle_mut().rollback().await {
        error!(
            "Rollback failed: {} (while returning: {})",
            rollback_err, err
        );
    }
    err
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{DbError, Value};
    use crate::result::QueryResult;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::{Arc, Mutex};

    /// Handle that records every call and fails the ones it is told to.
    #[derive(Clone, Default)]
    struct ScriptedHandle {
        log: Arc<Mutex<Vec<String>>>,
        release_failures: Arc<Mutex<VecDeque<DbError>>>,
        commit_failures: Arc<Mutex<VecDeque<DbError>>>,
        restart_failures: Arc<Mutex<VecDeque<DbError>>>,
    }

    impl ScriptedHandle {
        fn record(&self, entry: impl Into<String>) {
            self.log.lock().unwrap().push(entry.into());
        }

        fn calls(&self) -> Vec<String> {
            self.log.lock().unwrap().clone()
        }

        fn pop(queue: &Arc<Mutex<VecDeque<DbError>>>) -> Result<(), DbError> {
            match queue.lock().unwrap().pop_front() {
                Some(err) => Err(err),
                None => Ok(()),
            }
        }
    }

    #[async_trait]
    impl TransactionHandle for ScriptedHandle {
        type Error = DbError;

        async fn execute(&mut self, sql: &str, _params: &[Value]) -> Result<u64, DbError> {
            self.record(sql);
            Ok(1)
        }

        async fn query(&mut self, sql: &str, _params: &[Value]) -> Result<QueryResult, DbError> {
            self.record(sql);
            Ok(QueryResult::empty())
        }

        async fn savepoint(&mut self, name: &str) -> Result<(), DbError> {
            self.record(format!("SAVEPOINT {name}"));
            Ok(())
        }

        async fn release_savepoint(&mut self, name: &str) -> Result<(), DbError> {
            self.record(format!("RELEASE SAVEPOINT {name}"));
            Self::pop(&self.release_failures)
        }

        async fn rollback_to_savepoint(&mut self, name: &str) -> Result<(), DbError> {
            self.record(format!("ROLLBACK TO SAVEPOINT {name}"));
            Self::pop(&self.restart_failures)
        }

        async fn commit(&mut self) -> Result<(), DbError> {
            self.record("COMMIT");
            Self::pop(&self.commit_failures)
        }

        async fn rollback(&mut self) -> Result<(), DbError> {
            self.record("ROLLBACK");
            Ok(())
        }
    }

    fn conflict() -> DbError {
        DbError::SerializationFailure("table 'http' changed".into())
    }

    #[test]
    fn test_attempt_counter_saturates() {
        let last = Attempt {
            seq: u32::MAX,
            started_at: Instant::now(),
        };
        assert_eq!(last.count(), u32::MAX);
        assert_eq!(last.next().seq, u32::MAX);
        assert_eq!(Attempt::first().next().count(), 2);
    }

    #[tokio::test]
    async fn test_success_runs_savepoint_protocol() {
        let handle = ScriptedHandle::default();
        let cancel = CancellationToken::new();

        let value = RetryExecutor::new()
            .execute(&cancel, handle.clone(), |tx| {
                Box::pin(async move {
                    tx.execute("INSERT INTO http VALUES ($1)", &[]).await?;
                    Ok::<_, DbError>(7)
                })
            })
            .await
            .unwrap();

        assert_eq!(value, 7);
        assert_eq!(
            handle.calls(),
            vec![
                "SAVEPOINT retry_boundary",
                "INSERT INTO http VALUES ($1)",
                "RELEASE SAVEPOINT retry_boundary",
                "COMMIT",
            ]
        );
    }

    #[tokio::test]
    async fn test_conflict_in_work_restarts_from_boundary() {
        let handle = ScriptedHandle::default();
        let cancel = CancellationToken::new();
        let invocations = Arc::new(AtomicU32::new(0));

        RetryExecutor::new()
            .execute(&cancel, handle.clone(), |tx| {
                let invocations = invocations.clone();
                Box::pin(async move {
                    tx.execute("INSERT", &[]).await?;
                    if invocations.fetch_add(1, Ordering::SeqCst) == 0 {
                        return Err(conflict());
                    }
                    Ok(())
                })
            })
            .await
            .unwrap();

        assert_eq!(invocations.load(Ordering::SeqCst), 2);
        assert_eq!(
            handle.calls(),
            vec![
                "SAVEPOINT retry_boundary",
                "INSERT",
                "ROLLBACK TO SAVEPOINT retry_boundary",
                "INSERT",
                "RELEASE SAVEPOINT retry_boundary",
                "COMMIT",
            ]
        );
    }

    #[tokio::test]
    async fn test_conflict_at_release_is_retried() {
        let handle = ScriptedHandle::default();
        handle.release_failures.lock().unwrap().push_back(conflict());
        let cancel = CancellationToken::new();

        let attempts = RetryExecutor::new()
            .execute(&cancel, handle.clone(), |tx| {
                Box::pin(async move { Ok::<_, DbError>(tx.attempt()) })
            })
            .await
            .unwrap();

        assert_eq!(attempts, 1);
        assert_eq!(
            handle.calls(),
            vec![
                "SAVEPOINT retry_boundary",
                "RELEASE SAVEPOINT retry_boundary",
                "ROLLBACK TO SAVEPOINT retry_boundary",
                "RELEASE SAVEPOINT retry_boundary",
                "COMMIT",
            ]
        );
    }

    #[tokio::test]
    async fn test_fatal_work_error_rolls_back_once() {
        let handle = ScriptedHandle::default();
        let cancel = CancellationToken::new();
        let invocations = Arc::new(AtomicU32::new(0));

        let err = RetryExecutor::new()
            .execute(&cancel, handle.clone(), |_tx| {
                let invocations = invocations.clone();
                Box::pin(async move {
                    invocations.fetch_add(1, Ordering::SeqCst);
                    Err::<(), _>(DbError::NotNullViolation("remote".into()))
                })
            })
            .await
            .unwrap_err();

        assert_eq!(invocations.load(Ordering::SeqCst), 1);
        assert!(matches!(err, TxError::Work(DbError::NotNullViolation(_))));
        assert_eq!(handle.calls(), vec!["SAVEPOINT retry_boundary", "ROLLBACK"]);
    }

    #[tokio::test]
    async fn test_fatal_commit_error_is_infrastructure() {
        let handle = ScriptedHandle::default();
        handle
            .commit_failures
            .lock()
            .unwrap()
            .push_back(DbError::ConnectionClosed);
        let cancel = CancellationToken::new();

        let err = RetryExecutor::new()
            .execute(&cancel, handle.clone(), |_tx| {
                Box::pin(async move { Ok::<_, DbError>(()) })
            })
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            TxError::Infrastructure {
                op: TxOp::Commit,
                source: DbError::ConnectionClosed
            }
        ));
        assert!(err.is_ambiguous());
        assert_eq!(handle.calls().last().map(String::as_str), Some("ROLLBACK"));
    }

    #[tokio::test]
    async fn test_failed_restart_surfaces_rollback_to_savepoint() {
        let handle = ScriptedHandle::default();
        handle
            .restart_failures
            .lock()
            .unwrap()
            .push_back(DbError::InFailedTransaction);
        let cancel = CancellationToken::new();

        let err = RetryExecutor::new()
            .execute(&cancel, handle.clone(), |_tx| {
                Box::pin(async move { Err::<(), _>(conflict()) })
            })
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            TxError::Infrastructure {
                op: TxOp::RollbackToSavepoint,
                ..
            }
        ));
        assert_eq!(handle.calls().last().map(String::as_str), Some("ROLLBACK"));
    }

    #[tokio::test]
    async fn test_attempt_budget_exhausted() {
        let handle = ScriptedHandle::default();
        let cancel = CancellationToken::new();
        let invocations = Arc::new(AtomicU32::new(0));
        let executor = RetryExecutor::with_policy(RetryPolicy::new().max_attempts(3));

        let err = executor
            .execute(&cancel, handle.clone(), |_tx| {
                let invocations = invocations.clone();
                Box::pin(async move {
                    invocations.fetch_add(1, Ordering::SeqCst);
                    Err::<(), _>(conflict())
                })
            })
            .await
            .unwrap_err();

        assert_eq!(invocations.load(Ordering::SeqCst), 3);
        match err {
            TxError::RetryLimitExceeded { attempts, last, .. } => {
                assert_eq!(attempts, 3);
                assert!(last.is_serialization_failure());
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(!handle.calls().iter().any(|call| call == "COMMIT"));
        assert_eq!(handle.calls().last().map(String::as_str), Some("ROLLBACK"));
    }

    #[tokio::test]
    async fn test_cancelled_before_start() {
        let handle = ScriptedHandle::default();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = RetryExecutor::new()
            .execute(&cancel, handle.clone(), |_tx| {
                Box::pin(async move { Ok::<_, DbError>(()) })
            })
            .await
            .unwrap_err();

        assert!(matches!(err, TxError::Cancelled { attempts: 0 }));
        assert_eq!(handle.calls(), vec!["ROLLBACK"]);
    }

    #[tokio::test]
    async fn test_commit_hooks_run_once_after_commit() {
        let handle = ScriptedHandle::default();
        let cancel = CancellationToken::new();
        let fired = Arc::new(Mutex::new(Vec::new()));

        RetryExecutor::new()
            .execute(&cancel, handle, |tx| {
                let fired = fired.clone();
                let attempt = tx.attempt();
                tx.on_commit(move || fired.lock().unwrap().push(attempt));
                Box::pin(async move {
                    if attempt < 2 {
                        return Err(conflict());
                    }
                    Ok(())
                })
            })
            .await
            .unwrap();

        assert_eq!(*fired.lock().unwrap(), vec![2]);
    }

    #[tokio::test]
    async fn test_custom_classifier() {
        let handle = ScriptedHandle::default();
        let cancel = CancellationToken::new();
        let never_retry = |_: &DbError| Classification::Fatal;
        let executor = RetryExecutor::with_policy(RetryPolicy::with_classifier(never_retry));

        let err = executor
            .execute(&cancel, handle.clone(), |_tx| {
                Box::pin(async move { Err::<(), _>(conflict()) })
            })
            .await
            .unwrap_err();

        assert!(matches!(err, TxError::Work(DbError::SerializationFailure(_))));
        assert_eq!(handle.calls(), vec!["SAVEPOINT retry_boundary", "ROLLBACK"]);
    }
}
