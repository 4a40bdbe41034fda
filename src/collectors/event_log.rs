//! Event-log harvesting and the error-summary artifact
//!
//! Records of Critical or Error severity from the trailing window are drained from
//! each configured source in order, deduplicated at flush time and, when there
//! are enough of them, rendered into an HTML fragment written next to the agent's
//! other logs.

use crate::error::ObserverError;
use crate::events::{EventLevel, EventRecord, Timestamp};
use chrono::Utc;
use log::{debug, error, info, warn};
use serde::Deserialize;
use std::collections::HashSet;
use std::fs::{self, File};
use std::io::{self, BufRead, BufReader};
use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;

/// File name of the error-summary artifact under the log root
pub const ARTIFACT_FILE_NAME: &str = "EventVwrErrors.txt";

/// Filter applied by event-log readers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventQuery {
    /// Least severe level included
    pub max_level: EventLevel,
    /// Earliest creation time included
    pub since: Timestamp,
}

impl EventQuery {
    /// Critical and Error records created within `window` of now
    pub fn trailing(window: chrono::Duration) -> Self {
        Self {
            max_level: EventLevel::Error,
            since: Utc::now() - window,
        }
    }

    /// Event-log XPath form of this query
    pub fn to_xpath(&self) -> String {
        format!(
            "*[System/Level <= {}] and *[System/TimeCreated/@SystemTime >='{}']",
            self.max_level.value(),
            self.since.format("%Y-%m-%dT%H:%M:%S%.3fZ")
        )
    }

    /// Whether a record passes this filter; records without a creation time never do
    pub fn matches(&self, record: &EventRecord) -> bool {
        record.level <= self.max_level && record.time_created.is_some_and(|t| t >= self.since)
    }
}

/// Lazily read records of one source
pub type EventStream<'a> = Box<dyn Iterator<Item = io::Result<EventRecord>> + 'a>;

/// Reader over named event-log sources
pub trait EventLogReader: Send + Sync {
    /// Open `source` filtered by `query`; the stream is finite and read once
    fn open<'a>(&'a self, source: &str, query: &EventQuery) -> io::Result<EventStream<'a>>;
}

/// Event log stored as one JSON-lines file per source
///
/// `Microsoft-ServiceFabric/Admin` is read from
/// `<directory>/Microsoft-ServiceFabric-Admin.jsonl`. A missing file is an empty
/// source. Lines that fail to parse are skipped.
pub struct JsonLinesEventLog {
    directory: PathBuf,
}

/// On-disk record layout; the log name comes from the source
#[derive(Debug, Deserialize)]
struct StoredRecord {
    level: EventLevel,
    #[serde(default)]
    time_created: Option<Timestamp>,
    #[serde(default)]
    properties: Vec<serde_json::Value>,
}

impl JsonLinesEventLog {
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: directory.into(),
        }
    }

    /// File holding the records of `source`
    pub fn source_path(&self, source: &str) -> PathBuf {
        let file_name: String = source
            .chars()
            .map(|c| if matches!(c, '/' | '\\' | ':') { '-' } else { c })
            .collect();
        self.directory.join(format!("{}.jsonl", file_name))
    }

    fn decode(source: &str, line: &str) -> Option<EventRecord> {
        if line.trim().is_empty() {
            return None;
        }
        let stored: StoredRecord = match serde_json::from_str(line) {
            Ok(stored) => stored,
            Err(e) => {
                warn!("Skipping malformed record in {}: {}", source, e);
                return None;
            }
        };
        Some(EventRecord {
            log_name: source.to_string(),
            level: stored.level,
            time_created: stored.time_created,
            properties: stored.properties.into_iter().map(property_text).collect(),
        })
    }
}

fn property_text(value: serde_json::Value) -> Option<String> {
    match value {
        serde_json::Value::Null => None,
        serde_json::Value::String(s) => Some(s),
        other => Some(other.to_string()),
    }
}

impl EventLogReader for JsonLinesEventLog {
    fn open<'a>(&'a self, source: &str, query: &EventQuery) -> io::Result<EventStream<'a>> {
        let path = self.source_path(source);
        let file = match File::open(&path) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!("Event source {} not present at {}", source, path.display());
                return Ok(Box::new(std::iter::empty()));
            }
            Err(e) => return Err(e),
        };

        let source = source.to_string();
        let query = *query;
        let records = BufReader::new(file)
            .lines()
            .filter_map(move |line| match line {
                Ok(line) => Self::decode(&source, &line)
                    .filter(|record| query.matches(record))
                    .map(Ok),
                Err(e) => Some(Err(e)),
            });
        Ok(Box::new(records))
    }
}

/// Summary of one harvest flush
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HarvestSummary {
    /// Records left after deduplication
    pub distinct: usize,
    /// Whether the artifact was written
    pub artifact_written: bool,
}

/// Accumulates error events across sources and writes the summary artifact
pub struct EventLogHarvester {
    sources: Vec<String>,
    window: chrono::Duration,
    display_threshold: usize,
    artifact_path: PathBuf,
    records: Vec<EventRecord>,
}

impl EventLogHarvester {
    pub fn new(
        sources: Vec<String>,
        window: chrono::Duration,
        display_threshold: usize,
        log_root: &Path,
    ) -> Self {
        Self {
            sources,
            window,
            display_threshold,
            artifact_path: log_root.join(ARTIFACT_FILE_NAME),
            records: Vec::new(),
        }
    }

    pub fn artifact_path(&self) -> &Path {
        &self.artifact_path
    }

    /// Records gathered since the last flush, duplicates included
    pub fn pending(&self) -> &[EventRecord] {
        &self.records
    }

    /// Drain every source, in declared order, into the pending list
    ///
    /// Returns the number of records read.
    pub fn harvest(
        &mut self,
        reader: &dyn EventLogReader,
        cancel: &CancellationToken,
    ) -> Result<usize, ObserverError> {
        let query = EventQuery::trailing(self.window);
        let mut read = 0;
        for source in &self.sources {
            let stream = reader.open(source, &query).map_err(|e| {
                ObserverError::Fatal(format!("opening event source {}: {}", source, e))
            })?;
            for record in stream {
                if cancel.is_cancelled() {
                    return Err(ObserverError::Cancelled);
                }
                let record = record.map_err(|e| {
                    ObserverError::Fatal(format!("reading event source {}: {}", source, e))
                })?;
                self.records.push(record);
                read += 1;
            }
        }
        debug!("Harvested {} event record(s)", read);
        Ok(read)
    }

    /// Deduplicate, rewrite the artifact and clear the pending list
    ///
    /// Any previous artifact is removed first. A new one is written only when the
    /// distinct count reaches the display threshold.
    pub fn flush(&mut self, cancel: &CancellationToken) -> Result<HarvestSummary, ObserverError> {
        let records = dedup(std::mem::take(&mut self.records));
        let distinct = records.len();

        match fs::remove_file(&self.artifact_path) {
            Ok(()) => debug!("Removed previous {}", self.artifact_path.display()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => warn!(
                "Failed to remove {}: {}",
                self.artifact_path.display(),
                e
            ),
        }

        if distinct < self.display_threshold {
            debug!(
                "{} distinct error event(s), below display threshold {}",
                distinct, self.display_threshold
            );
            return Ok(HarvestSummary {
                distinct,
                artifact_written: false,
            });
        }
        if cancel.is_cancelled() {
            return Err(ObserverError::Cancelled);
        }

        let artifact_written = match write_artifact(&self.artifact_path, &render_html(&records)) {
            Ok(()) => {
                info!(
                    "{} error events written to {}",
                    distinct,
                    self.artifact_path.display()
                );
                true
            }
            Err(e) => {
                error!(
                    "Failed to write {}: {}",
                    self.artifact_path.display(),
                    e
                );
                false
            }
        };
        Ok(HarvestSummary {
            distinct,
            artifact_written,
        })
    }

    /// Drop pending records without writing anything
    pub fn discard(&mut self) {
        self.records.clear();
    }
}

/// Remove repeated records, keeping first occurrences in order
fn dedup(records: Vec<EventRecord>) -> Vec<EventRecord> {
    let mut seen = HashSet::new();
    records
        .into_iter()
        .filter(|record| seen.insert(record.clone()))
        .collect()
}

fn write_artifact(path: &Path, content: &str) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, content)
}

/// Collapsible HTML fragment listing `records`
pub fn render_html(records: &[EventRecord]) -> String {
    let mut html = format!(
        "<br/><div><strong><a href='javascript:toggle(\"evtContainer\")'>\
         <div id=\"plus\" style=\"display: inline; font-size: 25px;\">+</div> \
         {} Error Events in ServiceFabric and System</a> Event logs</strong>.<br/></div>\n",
        records.len()
    );
    html.push_str("<div id='evtContainer' style=\"display: none;\">\n");
    for record in records {
        html.push_str("<div class=\"evt\">\n");
        html.push_str(&format!("<div>{}</div>\n", escape_html(&record.log_name)));
        html.push_str(&format!("<div>{}</div>\n", record.level.label()));
        if let Some(created) = record.time_created {
            html.push_str(&format!("<div>{}</div>\n", created.format("%Y-%m-%d")));
        }
        for property in record.properties.iter().flatten().filter(|p| !p.is_empty()) {
            html.push_str(&format!("<div>{}</div>\n", escape_html(property)));
        }
        html.push_str("</div>\n");
    }
    html.push_str("</div>\n");
    html
}

fn escape_html(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&#39;"),
            _ => escaped.push(c),
        }
    }
    escaped
}
