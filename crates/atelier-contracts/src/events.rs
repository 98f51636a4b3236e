use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{SecondsFormat, Utc};
use serde_json::{Map, Value};

pub type EventPayload = Map<String, Value>;

/// JSONL journal shared by every invocation of one gateway.
#[derive(Debug)]
struct Journal {
    path: PathBuf,
    lock: Mutex<()>,
}

impl Journal {
    fn append(&self, event: &Map<String, Value>) -> anyhow::Result<()> {
        let mut line = serde_json::to_vec(event)?;
        line.push(b'\n');
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let _guard = self
            .lock
            .lock()
            .map_err(|_| anyhow::anyhow!("event journal lock poisoned"))?;
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?
            .write_all(&line)?;
        Ok(())
    }
}

/// Run-scoped handle on the journal. Every line carries `type`, `run_id`,
/// a per-run `seq` and `ts`; the payload is merged over them.
#[derive(Debug, Clone)]
pub struct EventWriter {
    journal: Arc<Journal>,
    run_id: String,
    seq: Arc<AtomicU64>,
}

impl EventWriter {
    pub fn new(path: impl Into<PathBuf>, run_id: impl Into<String>) -> Self {
        Self {
            journal: Arc::new(Journal {
                path: path.into(),
                lock: Mutex::new(()),
            }),
            run_id: run_id.into(),
            seq: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Same journal, fresh run id and sequence.
    pub fn for_run(&self, run_id: impl Into<String>) -> Self {
        Self {
            journal: Arc::clone(&self.journal),
            run_id: run_id.into(),
            seq: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn path(&self) -> &Path {
        &self.journal.path
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn emit(&self, event_type: &str, payload: EventPayload) -> anyhow::Result<Value> {
        let mut event = Map::new();
        event.insert("type".into(), event_type.into());
        event.insert("run_id".into(), self.run_id.as_str().into());
        event.insert("seq".into(), self.seq.fetch_add(1, Ordering::SeqCst).into());
        event.insert(
            "ts".into(),
            Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true).into(),
        );
        event.extend(payload);
        self.journal.append(&event)?;
        Ok(Value::Object(event))
    }
}
