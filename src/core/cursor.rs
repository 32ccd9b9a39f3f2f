// src/core/cursor.rs

//! The accumulated server replies for one request.

use serde::{Deserialize, Serialize};
use std::fmt;

/// A row in text format. `None` is SQL NULL.
pub type Row = Vec<Option<String>>;

/// Describes one column of a result set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Column {
    pub name: String,
    pub type_oid: u32,
}

/// One complete result set, from the row description up to the command completion tag.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResultSet {
    pub columns: Vec<Column>,
    pub rows: Vec<Row>,
    /// The command tag, e.g. `SELECT 3` or `INSERT 0 1`. Empty for an empty query.
    pub tag: String,
}

impl ResultSet {
    /// The row count reported in the command tag, if the command reports one.
    pub fn affected_rows(&self) -> Option<u64> {
        self.tag.rsplit(' ').next()?.parse().ok()
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.name == name)
    }

    /// Looks up a value by row index and column name.
    pub fn get(&self, row: usize, column: &str) -> Option<&str> {
        let idx = self.column_index(column)?;
        self.rows.get(row)?.get(idx)?.as_deref()
    }

    /// The first word of the command tag (`SELECT`, `BEGIN`, ...).
    pub fn command(&self) -> &str {
        self.tag.split(' ').next().unwrap_or("")
    }
}

/// A server-reported error, as carried by an `ErrorResponse` message.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerError {
    pub severity: String,
    /// The SQLSTATE code.
    pub code: String,
    pub message: String,
    pub detail: Option<String>,
    pub hint: Option<String>,
}

impl fmt::Display for ServerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}: {}", self.severity, self.code, self.message)?;
        if let Some(detail) = &self.detail {
            write!(f, " ({detail})")?;
        }
        Ok(())
    }
}

/// The result of one completed request: every result set the server returned, in order,
/// plus the first server error if one occurred.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Cursor {
    results: Vec<ResultSet>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<ServerError>,
    #[serde(skip_serializing_if = "Option::is_none")]
    command: Option<String>,
}

impl Cursor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn results(&self) -> &[ResultSet] {
        &self.results
    }

    pub fn into_results(self) -> Vec<ResultSet> {
        self.results
    }

    /// The first result set, which is all most single-statement queries produce.
    pub fn first(&self) -> Option<&ResultSet> {
        self.results.first()
    }

    /// Iterates over the rows of every result set in order.
    pub fn rows(&self) -> impl Iterator<Item = &Row> {
        self.results.iter().flat_map(|r| r.rows.iter())
    }

    pub fn len(&self) -> usize {
        self.results.len()
    }

    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }

    pub fn error(&self) -> Option<&ServerError> {
        self.error.as_ref()
    }

    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }

    /// The command text that produced this cursor, kept only for `REUSE_ARGUMENTS` requests.
    pub fn command(&self) -> Option<&str> {
        self.command.as_deref()
    }

    pub(crate) fn push(&mut self, result: ResultSet) {
        self.results.push(result);
    }

    /// Records a server error. The first error wins; later ones are follow-ups of it.
    pub(crate) fn set_error(&mut self, error: ServerError) {
        if self.error.is_none() {
            self.error = Some(error);
        }
    }

    pub(crate) fn set_command(&mut self, command: String) {
        self.command = Some(command);
    }

    /// Removes the `BEGIN` / `COMMIT` result sets that wrap an implicit transaction.
    pub(crate) fn strip_transaction_wrapper(&mut self) {
        if self.results.first().is_some_and(|r| r.command() == "BEGIN") {
            self.results.remove(0);
        }
        if self
            .results
            .last()
            .is_some_and(|r| matches!(r.command(), "COMMIT" | "ROLLBACK"))
        {
            self.results.pop();
        }
    }
}
