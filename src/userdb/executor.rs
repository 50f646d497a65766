//! Facade the rest of the system runs tenant SQL through. The trait seam
//! lets the chat pipeline and job handlers take a runner without caring
//! about pooling.

use super::pool::ConnectionPool;
use super::{Credentials, QueryOutcome};
use crate::error::AppError;
use async_trait::async_trait;
use std::sync::Arc;

#[async_trait]
pub trait QueryRunner: Send + Sync {
    async fn execute_query(
        &self,
        connection_id: &str,
        sql: &str,
        credentials: Option<&Credentials>,
    ) -> Result<QueryOutcome, AppError>;
}

pub struct QueryExecutor {
    pool: Arc<ConnectionPool>,
}

impl QueryExecutor {
    pub fn new(pool: Arc<ConnectionPool>) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl QueryRunner for QueryExecutor {
    async fn execute_query(
        &self,
        connection_id: &str,
        sql: &str,
        credentials: Option<&Credentials>,
    ) -> Result<QueryOutcome, AppError> {
        self.pool.execute(connection_id, sql, credentials).await
    }
}
