//! Shared fixtures for pipeline integration tests
//!
//! Everything runs against the in-memory source and stores inside a
//! temporary output directory.

#![allow(dead_code, clippy::unwrap_used, clippy::expect_used)]

use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempDir;

use bif_extract::checkpoint::{CheckpointStore, InMemoryCheckpointStore};
use bif_extract::interface::InterfaceConfig;
use bif_extract::job::{InMemoryJobStore, JobRecord, JobStore, NewJob};
use bif_extract::orchestrator::PipelineOrchestrator;
use bif_extract::source::RecordSource;
use bif_extract::{Record, StatusMachine, Value};

pub const ACCOUNTS_XML: &str = r#"
interface_type = "ACCOUNTS"
file_name = "ACCOUNTS.xml"

[source]
table = "accounts"
key_column = "id"
page_size = 1000

[source.retry]
max_attempts = 3
initial_backoff_ms = 1
max_backoff_ms = 2

[processing]
chunk_size = 100
skip_limit = 10

[output.encoding]
format = "xml"
root = "Accounts"
record = "Account"

[validation]
content = true
"#;

pub struct Harness {
    pub dir: TempDir,
    pub jobs: Arc<InMemoryJobStore>,
    pub checkpoints: Arc<InMemoryCheckpointStore>,
    pub machine: StatusMachine,
}

impl Harness {
    pub fn new() -> Self {
        let jobs = Arc::new(InMemoryJobStore::new());
        let machine = StatusMachine::new(jobs.clone(), 3);
        Self {
            dir: TempDir::new().unwrap(),
            jobs,
            checkpoints: Arc::new(InMemoryCheckpointStore::new()),
            machine,
        }
    }

    pub fn output_dir(&self) -> PathBuf {
        self.dir.path().join("out")
    }

    pub fn orchestrator(
        &self,
        interface: &InterfaceConfig,
        source: Arc<dyn RecordSource>,
    ) -> PipelineOrchestrator {
        self.orchestrator_with(interface, source, self.checkpoints.clone())
    }

    pub fn orchestrator_with(
        &self,
        interface: &InterfaceConfig,
        source: Arc<dyn RecordSource>,
        checkpoints: Arc<dyn CheckpointStore>,
    ) -> PipelineOrchestrator {
        PipelineOrchestrator::new(
            Arc::new(interface.clone()),
            source,
            self.machine.clone(),
            checkpoints,
            self.output_dir(),
        )
    }

    /// Create a `PENDING` job the way the launcher does
    pub async fn create_job(&self, interface: &InterfaceConfig) -> JobRecord {
        self.jobs
            .create(NewJob {
                interface_type: interface.interface_type.clone(),
                file_name: interface.file_name.clone(),
                output_path: self.output_dir().join(&interface.file_name),
                owner: "test".to_string(),
            })
            .await
            .unwrap()
    }
}

pub fn interface(toml: &str) -> InterfaceConfig {
    InterfaceConfig::from_toml_str(toml).unwrap()
}

pub fn account(id: i64) -> Record {
    Record::from_pairs([
        ("id", Value::from(id)),
        ("iban", Value::from(format!("DE{id:020}"))),
        ("holder", Value::from(format!("Holder {id}"))),
        ("balance", Value::decimal(&format!("{id}.50")).unwrap()),
    ])
    .unwrap()
}

pub fn accounts(n: i64) -> Vec<Record> {
    (1..=n).map(account).collect()
}

pub fn read(path: &Path) -> String {
    std::fs::read_to_string(path).unwrap()
}

pub fn count_records(xml: &str, element: &str) -> usize {
    xml.matches(&format!("<{element}>")).count()
}
