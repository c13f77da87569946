use crate::connection::TransactionHandle;
use crate::core::Value;
use crate::result::QueryResult;

type CommitHook = Box<dyn FnOnce() + Send>;

/// The transaction as seen by one attempt of the work function.
///
/// The work function receives `&mut TxContext` and cannot keep it past its
/// own invocation. Everything it runs may be replayed: statements are undone
/// by the executor on retry, but side effects outside the database are not.
/// Effects that must happen exactly once belong in [`TxContext::on_commit`].
pub struct TxContext<H> {
    handle: H,
    attempt: u32,
    on_commit: Vec<CommitHook>,
}

impl<H: TransactionHandle> TxContext<H> {
    pub(crate) fn new(handle: H) -> Self {
        Self {
            handle,
            attempt: 0,
            on_commit: Vec::new(),
        }
    }

    pub async fn execute(&mut self, sql: &str, params: &[Value]) -> Result<u64, H::Error> {
        self.handle.execute(sql, params).await
    }

    pub async fn query(&mut self, sql: &str, params: &[Value]) -> Result<QueryResult, H::Error> {
        self.handle.query(sql, params).await
    }

    /// 0-based sequence number of the running attempt.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn is_retry(&self) -> bool {
        self.attempt > 0
    }

    /// Run `hook` once the transaction has committed.
    ///
    /// Hooks registered by an attempt that is later rolled back are dropped
    /// without running; hooks run in registration order.
    pub fn on_commit<F>(&mut self, hook: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.on_commit.push(Box::new(hook));
    }

    pub(crate) fn handle_mut(&mut self) -> &mut H {
        &mut self.handle
    }

    /// Prepare for attempt `attempt`, forgetting hooks of the previous one.
    pub(crate) fn start_attempt(&mut self, attempt: u32) {
        self.attempt = attempt;
        self.on_commit.clear();
    }

    pub(crate) fn take_commit_hooks(&mut self) -> Vec<CommitHook> {
        std::mem::take(&mut self.on_commit)
    }
}
