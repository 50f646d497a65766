use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use dbchat_server::chat::{ChatTurn, ChatTurnRequest, StreamEvent, TurnEmitter};
use dbchat_server::config::RetrySettings;
use dbchat_server::error::AppError;
use dbchat_server::llm::{ChatMessage, ToolCallOutcome};
use dbchat_server::sqlgen::{GeneratedSql, SqlGeneration};
use dbchat_server::storage::{NewConnection, SqliteStorage, StorageBackend};
use dbchat_server::userdb::{Credentials, QueryOutcome, QueryRunner};
use parking_lot::Mutex;
use serde_json::{json, Value};
use tempfile::TempDir;
use tokio::sync::mpsc;

struct FakeGenerator {
    replies: Mutex<VecDeque<Result<GeneratedSql, AppError>>>,
    charts: Mutex<VecDeque<Result<ToolCallOutcome, AppError>>>,
}

impl FakeGenerator {
    fn scripted(replies: Vec<Result<GeneratedSql, AppError>>) -> Self {
        Self {
            replies: Mutex::new(replies.into_iter().collect()),
            charts: Mutex::new(VecDeque::new()),
        }
    }

    fn with_chart(self, chart: Result<ToolCallOutcome, AppError>) -> Self {
        self.charts.lock().push_back(chart);
        self
    }
}

#[async_trait]
impl SqlGeneration for FakeGenerator {
    async fn generate(
        &self,
        _question: &str,
        _engine: &str,
        _credentials: &Value,
        _retry: Option<RetrySettings>,
    ) -> Result<GeneratedSql, AppError> {
        self.replies
            .lock()
            .pop_front()
            .unwrap_or_else(|| Err(AppError::generation("generator script exhausted")))
    }

    async fn chart_for(
        &self,
        _messages: &[ChatMessage],
        _rows: &[Value],
    ) -> Result<ToolCallOutcome, AppError> {
        self.charts
            .lock()
            .pop_front()
            .unwrap_or_else(|| Err(AppError::generation("chart script exhausted")))
    }
}

struct FakeRunner {
    outcomes: Mutex<VecDeque<Result<QueryOutcome, AppError>>>,
    seen_sql: Mutex<Vec<String>>,
}

impl FakeRunner {
    fn scripted(outcomes: Vec<Result<QueryOutcome, AppError>>) -> Self {
        Self {
            outcomes: Mutex::new(outcomes.into_iter().collect()),
            seen_sql: Mutex::new(Vec::new()),
        }
    }

    fn seen_sql(&self) -> Vec<String> {
        self.seen_sql.lock().clone()
    }
}

#[async_trait]
impl QueryRunner for FakeRunner {
    async fn execute_query(
        &self,
        _connection_id: &str,
        sql: &str,
        _credentials: Option<&Credentials>,
    ) -> Result<QueryOutcome, AppError> {
        self.seen_sql.lock().push(sql.to_string());
        self.outcomes
            .lock()
            .pop_front()
            .unwrap_or_else(|| Err(AppError::execution("runner script exhausted")))
    }
}

fn temp_storage(label: &str) -> (Arc<SqliteStorage>, TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let db_path = dir.path().join(format!("dbchat_{label}.db"));
    let storage = SqliteStorage::new(db_path.to_string_lossy().to_string());
    storage.ensure_initialized().unwrap();
    (Arc::new(storage), dir)
}

fn seed_connection(storage: &SqliteStorage, owner: &str) -> String {
    storage
        .insert_connection(NewConnection {
            name: "analytics".to_string(),
            engine: "postgres".to_string(),
            credentials: json!({
                "host": "127.0.0.1",
                "port": 5432,
                "database": "analytics",
                "username": "reporting",
                "password": "hunter2",
                "type": "postgres",
            }),
            owner_id: owner.to_string(),
            description: None,
        })
        .unwrap()
        .id
}

fn sql(query: &str, explanation: &str, visualization: &str) -> GeneratedSql {
    GeneratedSql {
        query: query.to_string(),
        explanation: explanation.to_string(),
        visualization: visualization.to_string(),
    }
}

fn request(content: &str, chat_id: Option<&str>, connection_id: Option<&str>) -> ChatTurnRequest {
    ChatTurnRequest {
        messages: vec![ChatMessage::new("user", content)],
        chat_id: chat_id.map(str::to_string),
        db_connection_id: connection_id.map(str::to_string),
    }
}

async fn run_turn(turn: &ChatTurn, user_id: &str, request: ChatTurnRequest) -> Vec<StreamEvent> {
    let (tx, mut rx) = mpsc::channel(32);
    let emitter = TurnEmitter::new(tx);
    turn.run(user_id, request, &emitter).await;
    drop(emitter);
    let mut events = Vec::new();
    while let Some(event) = rx.recv().await {
        events.push(event);
    }
    events
}

fn kinds(events: &[StreamEvent]) -> Vec<&str> {
    events.iter().map(|event| event.kind.as_str()).collect()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn table_turn_streams_results_and_completes() {
    let (storage, _db) = temp_storage("turn_table");
    let connection_id = seed_connection(&storage, "u-1");
    let generator = Arc::new(FakeGenerator::scripted(vec![Ok(sql(
        "SELECT region, total FROM sales",
        "Totals by region",
        "table",
    ))]));
    let runner = Arc::new(FakeRunner::scripted(vec![Ok(QueryOutcome::from_rows(
        vec![json!({"region": "EMEA", "total": 42})],
    ))]));
    let turn = ChatTurn::new(storage.clone(), runner.clone(), generator);

    let events = run_turn(
        &turn,
        "u-1",
        request("total sales by region", None, Some(&connection_id)),
    )
    .await;
    assert_eq!(kinds(&events), ["sql-query", "sql-results", "complete"]);
    assert_eq!(events[0].data["query"], "SELECT region, total FROM sales");
    assert_eq!(events[0].data["content"], "Totals by region");
    assert_eq!(
        events[1].data["results"],
        json!([{"region": "EMEA", "total": 42}])
    );
    assert!(events[1].data["executionTime"].is_number());

    let chats = storage.list_chats("u-1").unwrap();
    assert_eq!(chats.len(), 1);
    assert_eq!(chats[0].name, "total sales by region...");
    assert_eq!(chats[0].connection_id, connection_id);
    assert_eq!(events[2].data["chatId"], chats[0].id);
    assert_eq!(events[2].data["dbId"], connection_id);

    let messages = storage.list_messages(&chats[0].id).unwrap();
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[0].role, "user");
    assert_eq!(messages[1].role, "assistant");
    assert_eq!(
        messages[1].sql_query.as_deref(),
        Some("SELECT region, total FROM sales")
    );
    assert!(messages[1].query_result.is_some());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn declined_generation_renames_chat_and_errors() {
    let (storage, _db) = temp_storage("turn_declined");
    let connection_id = seed_connection(&storage, "u-1");
    let generator = Arc::new(FakeGenerator::scripted(vec![Ok(sql(
        "",
        "I cannot answer that with the available tables",
        "table",
    ))]));
    let runner = Arc::new(FakeRunner::scripted(vec![]));
    let turn = ChatTurn::new(storage.clone(), runner.clone(), generator);

    let events = run_turn(
        &turn,
        "u-1",
        request("what is the meaning of life", None, Some(&connection_id)),
    )
    .await;
    assert_eq!(kinds(&events), ["sql-query", "error"]);
    assert_eq!(events[0].data["query"], "");
    assert_eq!(
        events[1].data["message"],
        "I cannot answer that with the available tables"
    );
    assert_eq!(events[1].data["code"], 400);
    assert!(runner.seen_sql().is_empty());

    let chats = storage.list_chats("u-1").unwrap();
    assert_eq!(chats[0].name, "New Chat");
    let messages = storage.list_messages(&chats[0].id).unwrap();
    assert_eq!(messages.len(), 2);
    assert_eq!(
        messages[1].content,
        "I cannot answer that with the available tables"
    );
    assert!(messages[1].sql_query.is_none());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn failed_execution_regenerates_and_reruns() {
    let (storage, _db) = temp_storage("turn_regen");
    let connection_id = seed_connection(&storage, "u-1");
    let generator = Arc::new(FakeGenerator::scripted(vec![
        Ok(sql("SELECT bad", "first try", "table")),
        Ok(sql("SELECT good", "fixed", "table")),
    ]));
    let runner = Arc::new(FakeRunner::scripted(vec![
        Err(AppError::execution("relation \"bad\" does not exist")),
        Ok(QueryOutcome::from_rows(vec![json!({"n": 1})])),
    ]));
    let turn = ChatTurn::new(storage.clone(), runner.clone(), generator);

    let events = run_turn(
        &turn,
        "u-1",
        request("count the rows", None, Some(&connection_id)),
    )
    .await;
    assert_eq!(kinds(&events), ["sql-query", "sql-results", "complete"]);
    assert_eq!(runner.seen_sql(), ["SELECT bad", "SELECT good"]);

    let chats = storage.list_chats("u-1").unwrap();
    let messages = storage.list_messages(&chats[0].id).unwrap();
    assert_eq!(messages[1].sql_query.as_deref(), Some("SELECT good"));
    assert!(messages[1].query_result.is_some());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn exhausted_execution_fails_the_turn() {
    let (storage, _db) = temp_storage("turn_exhausted");
    let connection_id = seed_connection(&storage, "u-1");
    // The regeneration declines, so the second attempt reruns the same SQL.
    let generator = Arc::new(FakeGenerator::scripted(vec![
        Ok(sql("SELECT bad", "first try", "table")),
        Ok(sql("", "", "table")),
    ]));
    let runner = Arc::new(FakeRunner::scripted(vec![
        Err(AppError::execution("timeout")),
        Err(AppError::execution("timeout again")),
    ]));
    let turn = ChatTurn::new(storage.clone(), runner.clone(), generator);

    let events = run_turn(
        &turn,
        "u-1",
        request("count the rows", None, Some(&connection_id)),
    )
    .await;
    assert_eq!(kinds(&events), ["sql-query", "error"]);
    assert_eq!(events[1].data["message"], "timeout again");
    assert_eq!(events[1].data["phase"], "query-execution");
    assert_eq!(events[1].data["code"], 500);
    assert_eq!(runner.seen_sql(), ["SELECT bad", "SELECT bad"]);

    let chats = storage.list_chats("u-1").unwrap();
    let messages = storage.list_messages(&chats[0].id).unwrap();
    assert_eq!(messages[1].sql_query.as_deref(), Some("SELECT bad"));
    assert!(messages[1].query_result.is_none());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn bar_chart_turn_persists_chart_and_renames_chat() {
    let (storage, _db) = temp_storage("turn_chart");
    let connection_id = seed_connection(&storage, "u-1");
    let generator = Arc::new(
        FakeGenerator::scripted(vec![Ok(sql(
            "SELECT region, total FROM sales",
            "Totals by region",
            "bar",
        ))])
        .with_chart(Ok(ToolCallOutcome {
            arguments: Some(json!({
                "chartType": "bar",
                "config": {"title": "Sales by region", "description": "totals"},
                "data": [{"region": "EMEA", "total": 42}],
                "chartConfig": {"total": {"label": "Total"}},
            })),
            content: Some("Here is the breakdown".to_string()),
        })),
    );
    let runner = Arc::new(FakeRunner::scripted(vec![Ok(QueryOutcome::from_rows(
        vec![json!({"region": "EMEA", "total": 42})],
    ))]));
    let turn = ChatTurn::new(storage.clone(), runner.clone(), generator);

    let events = run_turn(
        &turn,
        "u-1",
        request("chart sales by region", None, Some(&connection_id)),
    )
    .await;
    assert_eq!(
        kinds(&events),
        ["sql-query", "sql-results", "visualization", "complete"]
    );
    let chart = &events[2].data["chartData"];
    assert_eq!(chart["chartType"], "bar");
    assert_eq!(
        chart["chartConfig"]["total"]["color"],
        "hsl(var(--chart-1))"
    );
    assert_eq!(events[2].data["content"], "Here is the breakdown");

    let chats = storage.list_chats("u-1").unwrap();
    assert_eq!(chats[0].name, "Sales by region");
    let messages = storage.list_messages(&chats[0].id).unwrap();
    let chart_data = messages[1].chart_data.clone().unwrap();
    assert_eq!(chart_data["config"]["title"], "Sales by region");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unknown_chat_is_reported_on_stream() {
    let (storage, _db) = temp_storage("turn_no_chat");
    let generator = Arc::new(FakeGenerator::scripted(vec![]));
    let runner = Arc::new(FakeRunner::scripted(vec![]));
    let turn = ChatTurn::new(storage.clone(), runner, generator);

    let events = run_turn(&turn, "u-1", request("hello", Some("missing"), None)).await;
    assert_eq!(kinds(&events), ["error"]);
    assert_eq!(events[0].data["message"], "Chat not found");
    assert_eq!(events[0].data["code"], 404);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn foreign_chat_is_rejected() {
    let (storage, _db) = temp_storage("turn_foreign_chat");
    let connection_id = seed_connection(&storage, "u-2");
    let chat = storage.insert_chat("u-2", &connection_id, "theirs").unwrap();
    let generator = Arc::new(FakeGenerator::scripted(vec![]));
    let runner = Arc::new(FakeRunner::scripted(vec![]));
    let turn = ChatTurn::new(storage.clone(), runner, generator);

    let events = run_turn(&turn, "u-1", request("hello", Some(&chat.id), None)).await;
    assert_eq!(kinds(&events), ["error"]);
    assert_eq!(events[0].data["message"], "Unauthorized access to chat");
    assert_eq!(events[0].data["code"], 403);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn dangling_chat_connection_is_rejected() {
    let (storage, _db) = temp_storage("turn_dangling");
    let chat = storage.insert_chat("u-1", "gone", "orphaned").unwrap();
    let generator = Arc::new(FakeGenerator::scripted(vec![]));
    let runner = Arc::new(FakeRunner::scripted(vec![]));
    let turn = ChatTurn::new(storage.clone(), runner, generator);

    let events = run_turn(&turn, "u-1", request("hello", Some(&chat.id), None)).await;
    assert_eq!(kinds(&events), ["error"]);
    assert_eq!(
        events[0].data["message"],
        "Unauthorized access to database connection"
    );
    assert_eq!(events[0].data["code"], 403);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unknown_connection_id_is_rejected() {
    let (storage, _db) = temp_storage("turn_bad_conn");
    let generator = Arc::new(FakeGenerator::scripted(vec![]));
    let runner = Arc::new(FakeRunner::scripted(vec![]));
    let turn = ChatTurn::new(storage.clone(), runner, generator);

    let events = run_turn(&turn, "u-1", request("hello", None, Some("missing"))).await;
    assert_eq!(kinds(&events), ["error"]);
    assert_eq!(events[0].data["message"], "Invalid database connection ID");
    assert_eq!(events[0].data["code"], 400);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn new_chat_without_default_requires_connection_id() {
    let (storage, _db) = temp_storage("turn_no_default");
    let generator = Arc::new(FakeGenerator::scripted(vec![]));
    let runner = Arc::new(FakeRunner::scripted(vec![]));
    let turn = ChatTurn::new(storage.clone(), runner, generator);

    let events = run_turn(&turn, "u-1", request("hello", None, None)).await;
    assert_eq!(kinds(&events), ["error"]);
    assert_eq!(
        events[0].data["message"],
        "Database connection ID is required for new chat"
    );
    assert_eq!(events[0].data["code"], 400);
    assert!(storage.list_chats("u-1").unwrap().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn default_connection_backfills_new_chats() {
    let (storage, _db) = temp_storage("turn_default");
    let connection_id = seed_connection(&storage, "u-1");
    storage
        .set_default_connection("u-1", &connection_id)
        .unwrap();
    let generator = Arc::new(FakeGenerator::scripted(vec![Ok(sql(
        "SELECT 1",
        "one",
        "table",
    ))]));
    let runner = Arc::new(FakeRunner::scripted(vec![Ok(QueryOutcome::from_rows(
        vec![json!({"n": 1})],
    ))]));
    let turn = ChatTurn::new(storage.clone(), runner, generator);

    let events = run_turn(&turn, "u-1", request("count", None, None)).await;
    assert_eq!(kinds(&events), ["sql-query", "sql-results", "complete"]);
    let chats = storage.list_chats("u-1").unwrap();
    assert_eq!(chats[0].connection_id, connection_id);
    assert_eq!(events[2].data["dbId"], connection_id);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn empty_message_list_is_a_validation_error() {
    let (storage, _db) = temp_storage("turn_empty");
    let generator = Arc::new(FakeGenerator::scripted(vec![]));
    let runner = Arc::new(FakeRunner::scripted(vec![]));
    let turn = ChatTurn::new(storage.clone(), runner, generator);

    let events = run_turn(
        &turn,
        "u-1",
        ChatTurnRequest {
            messages: vec![],
            chat_id: None,
            db_connection_id: None,
        },
    )
    .await;
    assert_eq!(kinds(&events), ["error"]);
    assert_eq!(events[0].data["type"], "validation_error");
    assert_eq!(events[0].data["code"], 422);
    assert_eq!(
        events[0].data["errors"],
        json!(["At least one message is required"])
    );
}
