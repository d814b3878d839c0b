// crates/query-orchestrator-core/tests/support/mod.rs
// ============================================================================
// Module: Test Support
// Description: Scripted drivers and orchestrator builders for integration tests.
// ============================================================================
//! ## Overview
//! [`MockDriver`] keeps tables per schema in memory, answers queries from a
//! script, and records every call so tests can assert on side effects.

#![allow(
    dead_code,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::missing_docs_in_private_items,
    reason = "Shared across test binaries; not every binary uses every helper."
)]

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use query_orchestrator_core::ColumnRef;
use query_orchestrator_core::DownloadOptions;
use query_orchestrator_core::DownloadedTable;
use query_orchestrator_core::Driver;
use query_orchestrator_core::DriverCapabilities;
use query_orchestrator_core::DriverError;
use query_orchestrator_core::DriverFactory;
use query_orchestrator_core::IndexDescription;
use query_orchestrator_core::InMemoryBackingStore;
use query_orchestrator_core::MemoryEventSink;
use query_orchestrator_core::OrchestratorOptions;
use query_orchestrator_core::OrchestratorSetup;
use query_orchestrator_core::PreAggregationDescription;
use query_orchestrator_core::QueryMeta;
use query_orchestrator_core::QueryOrchestrator;
use query_orchestrator_core::QueryWithParams;
use query_orchestrator_core::Rows;
use query_orchestrator_core::StoreRetention;
use query_orchestrator_core::StreamOffset;
use query_orchestrator_core::StreamSink;
use query_orchestrator_core::TableColumn;
use query_orchestrator_core::TableRef;
use query_orchestrator_core::UploadOptions;
use serde_json::Map;
use serde_json::Value;
use serde_json::json;
use tokio_util::sync::CancellationToken;

// ============================================================================
// SECTION: Mock Driver
// ============================================================================

#[derive(Default)]
pub struct MockState {
    pub tables: BTreeMap<String, Vec<String>>,
    pub results: HashMap<String, Rows>,
    pub failures: HashMap<String, String>,
    pub executed: Vec<String>,
    pub loads: Vec<(String, String)>,
    pub dropped: Vec<String>,
    pub uploads: Vec<(String, Vec<TableColumn>, Vec<String>)>,
    pub downloads: Vec<String>,
    pub download_offsets: Vec<Option<StreamOffset>>,
    pub upload_seals: Vec<Option<String>>,
    pub unloads: Vec<String>,
    pub schema_listings: usize,
    pub query_delay: Option<Duration>,
}

pub struct MockDriver {
    pub state: Mutex<MockState>,
    pub capabilities: DriverCapabilities,
    pub read_only: bool,
}

impl MockDriver {
    pub fn new() -> Arc<Self> {
        Self::with_capabilities(DriverCapabilities::default(), false)
    }

    pub fn with_capabilities(capabilities: DriverCapabilities, read_only: bool) -> Arc<Self> {
        Arc::new(Self { state: Mutex::new(MockState::default()), capabilities, read_only })
    }

    /// Scripts the rows returned for `sql`.
    pub fn respond(&self, sql: &str, rows: Value) {
        let rows = rows
            .as_array()
            .unwrap()
            .iter()
            .map(|row| row.as_object().unwrap().clone())
            .collect::<Rows>();
        self.state.lock().unwrap().results.insert(sql.to_string(), rows);
    }

    pub fn fail(&self, sql: &str, message: &str) {
        self.state.lock().unwrap().failures.insert(sql.to_string(), message.to_string());
    }

    pub fn set_delay(&self, delay: Duration) {
        self.state.lock().unwrap().query_delay = Some(delay);
    }

    pub fn add_table(&self, schema: &str, table: &str) {
        self.state.lock().unwrap().tables.entry(schema.to_string()).or_default().push(table.to_string());
    }

    pub fn tables(&self, schema: &str) -> Vec<String> {
        self.state.lock().unwrap().tables.get(schema).cloned().unwrap_or_default()
    }

    pub fn executed(&self) -> Vec<String> {
        self.state.lock().unwrap().executed.clone()
    }

    pub fn executed_count(&self, sql: &str) -> usize {
        self.executed().iter().filter(|executed| executed.as_str() == sql).count()
    }

    pub fn loads(&self) -> Vec<(String, String)> {
        self.state.lock().unwrap().loads.clone()
    }

    pub fn dropped(&self) -> Vec<String> {
        self.state.lock().unwrap().dropped.clone()
    }

    pub fn uploads(&self) -> Vec<(String, Vec<TableColumn>, Vec<String>)> {
        self.state.lock().unwrap().uploads.clone()
    }

    pub fn download_offsets(&self) -> Vec<Option<StreamOffset>> {
        self.state.lock().unwrap().download_offsets.clone()
    }

    pub fn upload_seals(&self) -> Vec<Option<String>> {
        self.state.lock().unwrap().upload_seals.clone()
    }

    pub fn schema_listings(&self) -> usize {
        self.state.lock().unwrap().schema_listings
    }

    fn insert_table(&self, qualified: &str) {
        let (schema, table) = split_table(qualified);
        let mut state = self.state.lock().unwrap();
        let tables = state.tables.entry(schema).or_default();
        if !tables.contains(&table) {
            tables.push(table);
        }
    }

    fn scripted(&self, sql: &str) -> Result<Rows, DriverError> {
        let mut state = self.state.lock().unwrap();
        state.executed.push(sql.to_string());
        if let Some(message) = state.failures.get(sql) {
            return Err(DriverError::Query(message.clone()));
        }
        Ok(state.results.get(sql).cloned().unwrap_or_default())
    }
}

fn split_table(qualified: &str) -> (String, String) {
    match qualified.split_once('.') {
        Some((schema, table)) => (schema.to_string(), table.to_string()),
        None => (String::new(), qualified.to_string()),
    }
}

#[async_trait]
impl Driver for MockDriver {
    async fn query(
        &self,
        query: &QueryWithParams,
        _meta: &QueryMeta,
        cancel: &CancellationToken,
    ) -> Result<Rows, DriverError> {
        let delay = self.state.lock().unwrap().query_delay;
        if let Some(delay) = delay {
            tokio::select! {
                () = tokio::time::sleep(delay) => {}
                () = cancel.cancelled() => return Err(DriverError::Cancelled),
            }
        }
        self.scripted(&query.sql)
    }

    async fn stream_query(
        &self,
        query: &QueryWithParams,
        sink: &StreamSink,
        _cancel: &CancellationToken,
    ) -> Result<(), DriverError> {
        let rows = self.scripted(&query.sql)?;
        for row in rows {
            sink.send(Value::Object(row)).await.map_err(|err| DriverError::Query(err.to_string()))?;
        }
        Ok(())
    }

    async fn create_schema_if_not_exists(&self, schema: &str) -> Result<(), DriverError> {
        self.state.lock().unwrap().tables.entry(schema.to_string()).or_default();
        Ok(())
    }

    async fn get_tables_query(&self, schema: &str) -> Result<Vec<String>, DriverError> {
        Ok(self.tables(schema))
    }

    async fn drop_table(&self, table: &str) -> Result<(), DriverError> {
        let (schema, name) = split_table(table);
        let mut state = self.state.lock().unwrap();
        if let Some(tables) = state.tables.get_mut(&schema) {
            tables.retain(|existing| *existing != name);
        }
        state.dropped.push(table.to_string());
        Ok(())
    }

    async fn load_pre_aggregation_into_table(
        &self,
        target_table: &str,
        load_sql: &QueryWithParams,
        _cancel: &CancellationToken,
    ) -> Result<(), DriverError> {
        let failure = self.state.lock().unwrap().failures.get(&load_sql.sql).cloned();
        if let Some(message) = failure {
            return Err(DriverError::Query(message));
        }
        self.state.lock().unwrap().loads.push((target_table.to_string(), load_sql.sql.clone()));
        self.insert_table(target_table);
        Ok(())
    }

    async fn download_table(
        &self,
        table: &str,
        options: &DownloadOptions,
        _cancel: &CancellationToken,
    ) -> Result<DownloadedTable, DriverError> {
        let mut state = self.state.lock().unwrap();
        state.downloads.push(table.to_string());
        state.download_offsets.push(options.stream_offset);
        drop(state);
        Ok(DownloadedTable::Rows { rows: vec![row(json!({ "id": 1 }))], types: None })
    }

    async fn unload(
        &self,
        table: &str,
        _query: Option<&QueryWithParams>,
        _options: &DownloadOptions,
        _cancel: &CancellationToken,
    ) -> Result<DownloadedTable, DriverError> {
        if !self.capabilities.unload {
            return Err(DriverError::Unsupported("unload".to_string()));
        }
        self.state.lock().unwrap().unloads.push(table.to_string());
        Ok(DownloadedTable::Csv {
            files: vec![format!("s3://bucket/{table}.csv.gz")],
            types: Some(vec![column("id", "int")]),
        })
    }

    async fn table_column_types(&self, _table: &str) -> Result<Vec<TableColumn>, DriverError> {
        Ok(vec![column("id", "int")])
    }

    async fn upload_table_with_indexes(
        &self,
        table: &str,
        columns: &[TableColumn],
        _data: DownloadedTable,
        indexes: &[IndexDescription],
        options: &UploadOptions,
        _cancel: &CancellationToken,
    ) -> Result<(), DriverError> {
        let index_names = indexes.iter().map(|index| index.index_name.clone()).collect();
        let mut state = self.state.lock().unwrap();
        state.uploads.push((table.to_string(), columns.to_vec(), index_names));
        state.upload_seals.push(options.seal_at.clone());
        drop(state);
        self.insert_table(table);
        Ok(())
    }

    fn capabilities(&self) -> DriverCapabilities {
        self.capabilities
    }

    fn read_only(&self) -> bool {
        self.read_only
    }

    async fn get_schemas(&self) -> Result<Vec<String>, DriverError> {
        let mut state = self.state.lock().unwrap();
        state.schema_listings += 1;
        Ok(state.tables.keys().cloned().collect())
    }

    async fn get_tables_for_schemas(&self, schemas: &[String]) -> Result<Vec<TableRef>, DriverError> {
        let state = self.state.lock().unwrap();
        Ok(schemas
            .iter()
            .flat_map(|schema| {
                state
                    .tables
                    .get(schema)
                    .into_iter()
                    .flatten()
                    .map(|table| TableRef { schema: schema.clone(), table: table.clone() })
            })
            .collect())
    }

    async fn get_columns_for_tables(&self, tables: &[TableRef]) -> Result<Vec<ColumnRef>, DriverError> {
        Ok(tables
            .iter()
            .map(|table| ColumnRef {
                schema: table.schema.clone(),
                table: table.table.clone(),
                column: "id".to_string(),
                data_type: "integer".to_string(),
            })
            .collect())
    }
}

// ============================================================================
// SECTION: Factory
// ============================================================================

pub struct MockFactory {
    pub drivers: HashMap<String, Arc<MockDriver>>,
    pub fallback: Arc<MockDriver>,
}

impl MockFactory {
    pub fn single(driver: &Arc<MockDriver>) -> Arc<Self> {
        Arc::new(Self { drivers: HashMap::new(), fallback: Arc::clone(driver) })
    }
}

#[async_trait]
impl DriverFactory for MockFactory {
    async fn driver(&self, data_source: &str) -> Result<Arc<dyn Driver>, DriverError> {
        let driver = self.drivers.get(data_source).unwrap_or(&self.fallback);
        Ok(Arc::clone(driver) as Arc<dyn Driver>)
    }
}

// ============================================================================
// SECTION: Builders
// ============================================================================

pub struct Harness {
    pub orchestrator: QueryOrchestrator,
    pub events: Arc<MemoryEventSink>,
    pub store: Arc<InMemoryBackingStore>,
}

pub fn harness(
    source: &Arc<MockDriver>,
    external: Option<&Arc<MockDriver>>,
    options: OrchestratorOptions,
) -> Harness {
    let events = Arc::new(MemoryEventSink::default());
    let store = Arc::new(InMemoryBackingStore::new(StoreRetention::default()));
    let orchestrator = QueryOrchestrator::new(OrchestratorSetup {
        prefix: "TEST".to_string(),
        driver_factory: MockFactory::single(source),
        external_driver_factory: external.map(|driver| MockFactory::single(driver) as Arc<dyn DriverFactory>),
        backing_store: Arc::clone(&store) as Arc<dyn query_orchestrator_core::BackingStore>,
        messenger: None,
        events: Arc::clone(&events) as Arc<dyn query_orchestrator_core::OrchestratorEventSink>,
        options,
    });
    Harness { orchestrator, events, store }
}

pub fn row(value: Value) -> Map<String, Value> {
    value.as_object().unwrap().clone()
}

pub fn column(name: &str, column_type: &str) -> TableColumn {
    TableColumn { name: name.to_string(), column_type: column_type.to_string() }
}

/// Builds a description from JSON with the load SQL and table name filled in.
pub fn description(table_name: &str, load_sql: &str, extra: Value) -> PreAggregationDescription {
    let mut base = json!({
        "pre_aggregations_schema": table_name.split_once('.').map_or("", |(schema, _)| schema),
        "table_name": table_name,
        "load_sql": { "sql": load_sql },
    });
    if let (Some(target), Some(extra)) = (base.as_object_mut(), extra.as_object()) {
        for (key, value) in extra {
            target.insert(key.clone(), value.clone());
        }
    }
    serde_json::from_value(base).unwrap()
}
