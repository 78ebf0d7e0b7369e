//! Query execution seam.
//!
//! The session engine does not run SQL itself. It hands each simple query to
//! a [`QueryExecutor`] and encodes whatever [`QueryResult`] comes back.

use crate::network::message::{type_oids, ColumnDescriptor};
use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum ExecutorError {
    #[error("Syntax error: {0}")]
    Syntax(String),

    #[error("Execution error: {0}")]
    Execution(String),
}

impl ExecutorError {
    /// SQLSTATE code reported to the client.
    pub fn sqlstate(&self) -> &'static str {
        match self {
            ExecutorError::Syntax(_) => "42601",
            ExecutorError::Execution(_) => "XX000",
        }
    }
}

/// Outcome of one statement, with rows already rendered in text format.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryResult {
    pub columns: Vec<ColumnDescriptor>,
    pub rows: Vec<Vec<Option<String>>>,
    pub command_tag: String,
}

impl QueryResult {
    pub fn rows(columns: Vec<ColumnDescriptor>, rows: Vec<Vec<Option<String>>>) -> Self {
        let command_tag = format!("SELECT {}", rows.len());
        Self {
            columns,
            rows,
            command_tag,
        }
    }

    /// A result without a row set, e.g. for DDL.
    pub fn command(tag: impl Into<String>) -> Self {
        Self {
            columns: Vec::new(),
            rows: Vec::new(),
            command_tag: tag.into(),
        }
    }

    pub fn has_row_set(&self) -> bool {
        !self.columns.is_empty()
    }
}

pub trait QueryExecutor: Send + Sync {
    fn execute(&self, query: &str) -> Result<QueryResult, ExecutorError>;
}

/// Answers every query with the same mock user table.
pub struct SampleExecutor {
    row_count: usize,
}

impl SampleExecutor {
    pub fn new(row_count: usize) -> Self {
        Self { row_count }
    }
}

impl Default for SampleExecutor {
    fn default() -> Self {
        Self::new(50)
    }
}

impl QueryExecutor for SampleExecutor {
    fn execute(&self, _query: &str) -> Result<QueryResult, ExecutorError> {
        let mut columns = vec![
            ColumnDescriptor::text("id", type_oids::UUID, 16),
            ColumnDescriptor::text("username", type_oids::TEXT, -1),
            ColumnDescriptor::text("age", type_oids::INT4, 4),
        ];
        for (i, column) in columns.iter_mut().enumerate() {
            column.column_number = (i + 1) as i16;
        }

        let rows = (1..=self.row_count)
            .map(|n| {
                vec![
                    Some(Uuid::new_v4().to_string()),
                    Some(format!("test-{}", n)),
                    Some(n.to_string()),
                ]
            })
            .collect();

        Ok(QueryResult::rows(columns, rows))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sample_executor_result_shape() {
        let result = SampleExecutor::default().execute("SELECT * FROM users").unwrap();

        assert!(result.has_row_set());
        let names: Vec<_> = result.columns.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["id", "username", "age"]);
        assert_eq!(result.columns[2].column_number, 3);
        assert_eq!(result.rows.len(), 50);
        assert_eq!(result.rows[0][1].as_deref(), Some("test-1"));
        assert_eq!(result.rows[49][2].as_deref(), Some("50"));
        assert_eq!(result.command_tag, "SELECT 50");
    }

    #[test]
    fn test_sample_ids_are_v4_uuids() {
        let result = SampleExecutor::new(2).execute("SELECT 1").unwrap();
        let ids: Vec<Uuid> = result
            .rows
            .iter()
            .map(|row| Uuid::parse_str(row[0].as_deref().unwrap()).unwrap())
            .collect();
        assert_eq!(ids[0].get_version_num(), 4);
        assert_ne!(ids[0], ids[1]);
    }

    #[test]
    fn test_command_result() {
        let result = QueryResult::command("CREATE TABLE");
        assert!(!result.has_row_set());
        assert_eq!(result.command_tag, "CREATE TABLE");
    }

    #[test]
    fn test_sqlstate_codes() {
        assert_eq!(ExecutorError::Syntax("x".into()).sqlstate(), "42601");
        assert_eq!(ExecutorError::Execution("x".into()).sqlstate(), "XX000");
    }
}
