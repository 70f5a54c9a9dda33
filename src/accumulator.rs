use std::sync::RwLock;

use anyhow::{anyhow, bail, Result};

use crate::types::Timestamp;

/// One appended row: frame timestamp plus the chain's field values.
#[derive(Debug, Clone, PartialEq)]
pub struct Entry {
    pub t: Timestamp,
    pub values: Vec<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendOutcome {
    Appended,
    /// Timestamp not strictly greater than the previous row: the entry was
    /// rejected to keep the series strictly ordered.
    RejectedOutOfOrder,
}

struct Inner {
    headers: Vec<String>,
    entries: Vec<Entry>,
    rejected: u64,
}

/// Append-only, timestamp-indexed store of chain outputs.
///
/// Written only from the dispatcher's processing thread; read concurrently
/// by live-feedback consumers through `latest`/`snapshot`. A single RwLock
/// is enough since there is exactly one writer.
pub struct DataAccumulator {
    inner: RwLock<Inner>,
}

impl DataAccumulator {
    pub fn new(headers: Vec<String>) -> Self {
        Self {
            inner: RwLock::new(Inner {
                headers,
                entries: Vec::new(),
                rejected: 0,
            }),
        }
    }

    /// Append a row. Rows must be the current schema width (anything else
    /// is an internal invariant violation, reported as a hard error) and
    /// strictly increasing in timestamp (violations are rejected, counted,
    /// and reported through the outcome).
    pub fn append(&self, t: Timestamp, values: Vec<f64>) -> Result<AppendOutcome> {
        let mut inner = self
            .inner
            .write()
            .map_err(|_| anyhow!("accumulator lock poisoned"))?;
        if values.len() != inner.headers.len() {
            bail!(
                "row width {} does not match schema width {}",
                values.len(),
                inner.headers.len()
            );
        }
        let last_t = inner.entries.last().map(|e| e.t);
        if last_t.is_some_and(|last| t <= last) {
            inner.rejected += 1;
            return Ok(AppendOutcome::RejectedOutOfOrder);
        }
        inner.entries.push(Entry { t, values });
        Ok(AppendOutcome::Appended)
    }

    /// Last `n` rows, oldest first; fewer during warm-up. Never blocks on
    /// the writer for longer than one append.
    pub fn latest(&self, n: usize) -> Vec<Entry> {
        match self.inner.read() {
            Ok(inner) => {
                let start = inner.entries.len().saturating_sub(n);
                inner.entries[start..].to_vec()
            }
            Err(_) => Vec::new(),
        }
    }

    /// Full export view: schema plus every stored row, for the logging /
    /// analysis collaborator.
    pub fn snapshot(&self) -> (Vec<String>, Vec<Entry>) {
        match self.inner.read() {
            Ok(inner) => (inner.headers.clone(), inner.entries.clone()),
            Err(_) => (Vec::new(), Vec::new()),
        }
    }

    pub fn headers(&self) -> Vec<String> {
        self.inner.read().map(|i| i.headers.clone()).unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.inner.read().map(|i| i.entries.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Out-of-order rows rejected since the last reset.
    pub fn rejected(&self) -> u64 {
        self.inner.read().map(|i| i.rejected).unwrap_or(0)
    }

    /// Drop all rows and adopt a new schema. Called whenever the chain
    /// configuration changes shape.
    pub fn reset(&self, headers: Vec<String>) {
        if let Ok(mut inner) = self.inner.write() {
            inner.headers = headers;
            inner.entries.clear();
            inner.rejected = 0;
        }
    }
}
