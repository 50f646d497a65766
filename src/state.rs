//! Dependency graph shared by the HTTP layer, the chat pipeline and the
//! job queue. Everything is constructed once at boot and injected; the
//! trait seams (`QueryRunner`, `SqlGeneration`) let tests swap pieces out.

use crate::chat::ChatTurn;
use crate::config::Config;
use crate::queue::{JobContext, JobQueue, RedisJobQueue};
use crate::sqlgen::{SqlGeneration, SqlGenerator};
use crate::storage::{build_storage, StorageBackend};
use crate::userdb::{ConnectionPool, QueryExecutor, QueryRunner};
use anyhow::Result;
use std::sync::Arc;

pub struct AppState {
    pub config: Config,
    pub storage: Arc<dyn StorageBackend>,
    pub pool: Arc<ConnectionPool>,
    pub runner: Arc<dyn QueryRunner>,
    pub generator: Arc<dyn SqlGeneration>,
    pub queue: Arc<dyn JobQueue>,
    pub chat: Arc<ChatTurn>,
}

impl AppState {
    pub fn new(config: Config) -> Result<Self> {
        let storage = build_storage(&config.storage)?;
        let pool = Arc::new(ConnectionPool::new(&config.userdb));
        let runner: Arc<dyn QueryRunner> = Arc::new(QueryExecutor::new(pool.clone()));
        let generator: Arc<dyn SqlGeneration> =
            Arc::new(SqlGenerator::new(config.generator.clone(), &config.userdb)?);
        let queue: Arc<dyn JobQueue> = Arc::new(RedisJobQueue::new(
            config.queue.clone(),
            JobContext {
                storage: storage.clone(),
                runner: runner.clone(),
            },
        ));
        let chat = Arc::new(ChatTurn::new(
            storage.clone(),
            runner.clone(),
            generator.clone(),
        ));
        let _ = pool.start_sweeper();
        Ok(Self {
            config,
            storage,
            pool,
            runner,
            generator,
            queue,
            chat,
        })
    }
}
