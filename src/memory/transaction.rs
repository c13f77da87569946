use super::database::{MemoryDatabase, Snapshot, Table, Tables};
use super::statement::{self, Condition, Operand, Statement};
use crate::connection::TransactionHandle;
use crate::core::{Column, DbError, Result, Row, Schema, Value};
use crate::result::QueryResult;
use async_trait::async_trait;
use log::{debug, warn};
use tokio::sync::OwnedSemaphorePermit;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TxState {
    Active,
    /// A statement failed; only rollback (to a savepoint) is accepted.
    Aborted,
    /// The restart boundary was released and the changes are committed.
    Released,
    Finished,
}

#[derive(Debug, Clone, Default)]
struct WorkState {
    tables: Tables,
    written: im::HashSet<String>,
}

#[derive(Debug)]
struct Savepoint {
    name: String,
    state: WorkState,
    /// Created before any statement ran.
    restart: bool,
}

enum Outcome {
    Affected(u64),
    Rows(QueryResult),
}

/// A transaction on a [`MemoryDatabase`].
///
/// Reads see the snapshot taken at `begin` plus the transaction's own
/// writes. Releasing a savepoint that was created before any statement
/// commits the transaction on the spot, so a conflict detected there can
/// still be handled with `ROLLBACK TO SAVEPOINT`.
#[derive(Debug)]
pub struct MemoryTransaction {
    id: u64,
    db: MemoryDatabase,
    snapshot_version: u64,
    work: WorkState,
    savepoints: Vec<Savepoint>,
    state: TxState,
    /// Statements run since begin or the last restart.
    statements: usize,
    /// A serialization failure was raised against the current snapshot.
    conflicted: bool,
    permit: Option<OwnedSemaphorePermit>,
}

impl MemoryTransaction {
    pub(crate) fn new(
        id: u64,
        db: MemoryDatabase,
        snapshot: Snapshot,
        permit: Option<OwnedSemaphorePermit>,
    ) -> Self {
        Self {
            id,
            db,
            snapshot_version: snapshot.version,
            work: WorkState {
                tables: snapshot.tables,
                written: im::HashSet::new(),
            },
            savepoints: Vec::new(),
            state: TxState::Active,
            statements: 0,
            conflicted: false,
            permit,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// True until the transaction commits or rolls back.
    pub fn is_open(&self) -> bool {
        matches!(self.state, TxState::Active | TxState::Aborted)
    }

    pub fn is_aborted(&self) -> bool {
        self.state == TxState::Aborted
    }

    fn ensure_usable(&self) -> Result<()> {
        match self.state {
            TxState::Active => Ok(()),
            TxState::Aborted => Err(DbError::InFailedTransaction),
            TxState::Released | TxState::Finished => Err(DbError::NoActiveTransaction),
        }
    }

    fn fail(&mut self, err: DbError) -> DbError {
        if err.is_serialization_failure() {
            self.conflicted = true;
        }
        if self.state == TxState::Active {
            self.state = TxState::Aborted;
        }
        err
    }

    fn finish(&mut self) {
        self.state = TxState::Finished;
        self.work = WorkState::default();
        self.savepoints.clear();
        self.permit = None;
    }

    async fn run(&mut self, sql: &str, params: &[Value]) -> Result<Outcome> {
        self.ensure_usable()?;
        self.statements += 1;

        match self.apply(sql, params).await {
            Ok(outcome) => Ok(outcome),
            Err(err) => Err(self.fail(err)),
        }
    }

    async fn apply(&mut self, sql: &str, params: &[Value]) -> Result<Outcome> {
        match statement::parse(sql)? {
            Statement::CreateTable {
                name,
                columns,
                if_not_exists,
            } => self.create_table(name, columns, if_not_exists).await,
            Statement::Insert {
                table,
                columns,
                rows,
            } => self.insert(&table, columns, rows, params).await,
            Statement::Select {
                table,
                projection,
                filter,
            } => self.select(&table, projection, &filter, params),
            Statement::Update {
                table,
                assignments,
                filter,
            } => self.update(&table, assignments, &filter, params).await,
            Statement::Delete { table, filter } => self.delete(&table, &filter, params).await,
        }
    }

    fn table(&self, name: &str) -> Result<&Table> {
        self.work
            .tables
            .get(name)
            .ok_or_else(|| DbError::TableNotFound(name.to_string()))
    }

    async fn mark_written(&mut self, name: &str) -> Result<()> {
        if !self.work.written.contains(name) {
            self.db.check_write(name, self.snapshot_version).await?;
            self.work.written.insert(name.to_string());
        }
        Ok(())
    }

    async fn create_table(
        &mut self,
        name: String,
        columns: Vec<Column>,
        if_not_exists: bool,
    ) -> Result<Outcome> {
        if self.work.tables.contains_key(&name) {
            if if_not_exists {
                return Ok(Outcome::Affected(0));
            }
            return Err(DbError::TableExists(name));
        }

        self.mark_written(&name).await?;
        self.work
            .tables
            .insert(name, Table::new(Schema::new(columns)));
        Ok(Outcome::Affected(0))
    }

    async fn insert(
        &mut self,
        name: &str,
        columns: Option<Vec<String>>,
        rows: Vec<Vec<Operand>>,
        params: &[Value],
    ) -> Result<Outcome> {
        let schema = self.table(name)?.schema.clone();

        let targets = match columns {
            Some(columns) => columns
                .iter()
                .map(|col| {
                    schema
                        .find_column_index(col)
                        .ok_or_else(|| DbError::ColumnNotFound(col.clone(), name.to_string()))
                })
                .collect::<Result<Vec<_>>>()?,
            None => (0..schema.column_count()).collect(),
        };

        let mut new_rows = Vec::with_capacity(rows.len());
        for operands in rows {
            if operands.len() != targets.len() {
                return Err(DbError::ExecutionError(format!(
                    "INSERT has {} expressions for {} target columns",
                    operands.len(),
                    targets.len()
                )));
            }

            let mut row: Row = vec![Value::Null; schema.column_count()];
            for (idx, operand) in targets.iter().zip(operands.iter()) {
                row[*idx] = operand.resolve(params)?;
            }
            let row = schema
                .columns()
                .iter()
                .zip(row)
                .map(|(col, value)| col.coerce(value))
                .collect::<Result<Row>>()?;
            new_rows.push(row);
        }

        self.mark_written(name).await?;
        let count = new_rows.len() as u64;
        if let Some(table) = self.work.tables.get_mut(name) {
            table.rows.extend(new_rows);
        }
        Ok(Outcome::Affected(count))
    }

    fn select(
        &self,
        name: &str,
        projection: Option<Vec<String>>,
        filter: &[Condition],
        params: &[Value],
    ) -> Result<Outcome> {
        let table = self.table(name)?;
        let filter = resolve_filter(name, &table.schema, filter, params)?;

        let (columns, indices) = match projection {
            None => (
                table.schema.column_names(),
                (0..table.schema.column_count()).collect::<Vec<_>>(),
            ),
            Some(columns) => {
                let indices = columns
                    .iter()
                    .map(|col| {
                        table.schema.find_column_index(col).ok_or_else(|| {
                            DbError::ColumnNotFound(col.clone(), name.to_string())
                        })
                    })
                    .collect::<Result<Vec<_>>>()?;
                (columns, indices)
            }
        };

        let rows = table
            .rows
            .iter()
            .filter(|row| matches(row, &filter))
            .map(|row| indices.iter().map(|idx| row[*idx].clone()).collect())
            .collect();

        Ok(Outcome::Rows(QueryResult::new(columns, rows)))
    }

    async fn update(
        &mut self,
        name: &str,
        assignments: Vec<(String, Operand)>,
        filter: &[Condition],
        params: &[Value],
    ) -> Result<Outcome> {
        let table = self.table(name)?;
        let filter = resolve_filter(name, &table.schema, filter, params)?;
        let assignments = assignments
            .into_iter()
            .map(|(col, operand)| {
                let idx = table
                    .schema
                    .find_column_index(&col)
                    .ok_or_else(|| DbError::ColumnNotFound(col.clone(), name.to_string()))?;
                let value = table.schema.columns()[idx].coerce(operand.resolve(params)?)?;
                Ok((idx, value))
            })
            .collect::<Result<Vec<_>>>()?;

        self.mark_written(name).await?;

        let mut count = 0u64;
        if let Some(table) = self.work.tables.get_mut(name) {
            table.rows = table
                .rows
                .iter()
                .map(|row| {
                    if !matches(row, &filter) {
                        return row.clone();
                    }
                    count += 1;
                    let mut row = row.clone();
                    for (idx, value) in &assignments {
                        row[*idx] = value.clone();
                    }
                    row
                })
                .collect();
        }
        Ok(Outcome::Affected(count))
    }

    async fn delete(
        &mut self,
        name: &str,
        filter: &[Condition],
        params: &[Value],
    ) -> Result<Outcome> {
        let table = self.table(name)?;
        let filter = resolve_filter(name, &table.schema, filter, params)?;

        self.mark_written(name).await?;

        let mut count = 0u64;
        if let Some(table) = self.work.tables.get_mut(name) {
            let before = table.rows.len();
            table.rows = table
                .rows
                .iter()
                .filter(|row| !matches(row, &filter))
                .cloned()
                .collect();
            count = (before - table.rows.len()) as u64;
        }
        Ok(Outcome::Affected(count))
    }

    async fn refresh_snapshot(&mut self) {
        let snapshot = self.db.snapshot().await;
        debug!(
            "Transaction {} restarting at version {} (was {})",
            self.id, snapshot.version, self.snapshot_version
        );
        self.snapshot_version = snapshot.version;
        self.work = WorkState {
            tables: snapshot.tables,
            written: im::HashSet::new(),
        };
        self.statements = 0;
        self.conflicted = false;
    }

    async fn commit_work(&mut self) -> Result<()> {
        self.db
            .publish(
                self.id,
                self.snapshot_version,
                &self.work.tables,
                &self.work.written,
            )
            .await
            .map(|_| ())
    }
}

/// Bind parameters and column positions; `(column index, value)` pairs.
fn resolve_filter(
    table: &str,
    schema: &Schema,
    filter: &[Condition],
    params: &[Value],
) -> Result<Vec<(usize, Value)>> {
    filter
        .iter()
        .map(|cond| {
            let idx = schema
                .find_column_index(&cond.column)
                .ok_or_else(|| DbError::ColumnNotFound(cond.column.clone(), table.to_string()))?;
            Ok((idx, cond.value.resolve(params)?))
        })
        .collect()
}

/// `NULL` never compares equal.
fn matches(row: &Row, filter: &[(usize, Value)]) -> bool {
    filter
        .iter()
        .all(|(idx, value)| !value.is_null() && row[*idx] == *value)
}

#[async_trait]
impl TransactionHandle for MemoryTransaction {
    type Error = DbError;

    async fn execute(&mut self, sql: &str, params: &[Value]) -> Result<u64> {
        match self.run(sql, params).await? {
            Outcome::Affected(count) => Ok(count),
            Outcome::Rows(result) => Ok(result.row_count() as u64),
        }
    }

    async fn query(&mut self, sql: &str, params: &[Value]) -> Result<QueryResult> {
        match self.run(sql, params).await? {
            Outcome::Rows(result) => Ok(result),
            Outcome::Affected(_) => Ok(QueryResult::empty()),
        }
    }

    async fn savepoint(&mut self, name: &str) -> Result<()> {
        self.ensure_usable()?;
        let restart = self.savepoints.is_empty() && self.statements == 0;
        self.savepoints.push(Savepoint {
            name: name.to_string(),
            state: self.work.clone(),
            restart,
        });
        Ok(())
    }

    async fn release_savepoint(&mut self, name: &str) -> Result<()> {
        self.ensure_usable()?;
        let Some(idx) = self.savepoints.iter().rposition(|sp| sp.name == name) else {
            return Err(self.fail(DbError::SavepointNotFound(name.to_string())));
        };

        if idx == 0 && self.savepoints[0].restart {
            return match self.commit_work().await {
                Ok(()) => {
                    self.state = TxState::Released;
                    self.savepoints.clear();
                    Ok(())
                }
                // the savepoint stays so the caller can restart from it
                Err(err) => Err(self.fail(err)),
            };
        }

        self.savepoints.truncate(idx);
        Ok(())
    }

    async fn rollback_to_savepoint(&mut self, name: &str) -> Result<()> {
        if !self.is_open() {
            return Err(DbError::NoActiveTransaction);
        }
        let Some(idx) = self.savepoints.iter().rposition(|sp| sp.name == name) else {
            return Err(self.fail(DbError::SavepointNotFound(name.to_string())));
        };
        if self.conflicted && !self.savepoints[idx].restart {
            // replaying from here would hit the same conflict on the old snapshot
            return Err(DbError::StaleSavepoint(name.to_string()));
        }
        self.savepoints.truncate(idx + 1);

        if self.savepoints[idx].restart {
            self.refresh_snapshot().await;
            self.savepoints[idx].state = self.work.clone();
        } else {
            self.work = self.savepoints[idx].state.clone();
        }
        self.state = TxState::Active;
        Ok(())
    }

    async fn commit(&mut self) -> Result<()> {
        let result = match self.state {
            TxState::Finished => return Err(DbError::NoActiveTransaction),
            TxState::Released => Ok(()),
            TxState::Aborted => Err(DbError::InFailedTransaction),
            TxState::Active => self.commit_work().await,
        };
        self.finish();
        result
    }

    async fn rollback(&mut self) -> Result<()> {
        if self.is_open() {
            debug!("Transaction {} rolled back", self.id);
        }
        self.finish();
        Ok(())
    }
}

impl Drop for MemoryTransaction {
    fn drop(&mut self) {
        if self.is_open() && !self.work.written.is_empty() {
            warn!(
                "Transaction {} dropped without commit or rollback; discarding its changes",
                self.id
            );
        }
    }
}
