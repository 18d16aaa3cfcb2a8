// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Loki push payload model.
//!
//! ```text
//! StreamBatch ──> [LogStream { labels, entries: [LogEntry, ..] }, ..]
//! ```
//!
//! A [`StreamBatch`] serializes to the body of one push request:
//!
//! ```json
//! {"streams":[{"stream":{"k":"v"},"values":[["1700000000000000000","level=info ..."]]}]}
//! ```
//!
//! Every shipped line starts with a `level=<info|error> ` prefix followed by
//! the entry text, so the level reaches Loki inside the log line and not as a
//! stream label. Queries that only want the text have to drop everything up
//! to the first space, or pull the level out with a logfmt stage, e.g.
//! `{jmeter_plugin="loki-log"} | logfmt | level="error"`. [`LogEntry::text`]
//! is the text without the prefix; [`LogEntry::line`] is the shipped form.

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::labels::LabelSet;

static LAST_TIMESTAMP: AtomicU64 = AtomicU64::new(0);

/// Current wall-clock time in nanoseconds since the UNIX epoch.
///
/// Strictly increasing across calls in this process, so two entries created
/// back-to-back never share a timestamp.
pub fn now_nanos() -> u64 {
    #[allow(clippy::cast_possible_truncation)]
    let wall = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or_default();
    let mut last = LAST_TIMESTAMP.load(Ordering::Relaxed);
    loop {
        let next = wall.max(last + 1);
        match LAST_TIMESTAMP.compare_exchange_weak(last, next, Ordering::AcqRel, Ordering::Relaxed)
        {
            Ok(_) => return next,
            Err(current) => last = current,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LogLevel {
    Info,
    Error,
}

impl LogLevel {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            LogLevel::Info => "info",
            LogLevel::Error => "error",
        }
    }

    fn parse(value: &str) -> Option<Self> {
        match value {
            "info" => Some(LogLevel::Info),
            "error" => Some(LogLevel::Error),
            _ => None,
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            LogLevel::Info => "INFO",
            LogLevel::Error => "ERROR",
        })
    }
}

/// One timestamped log line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    timestamp_nanos: u64,
    level: LogLevel,
    text: String,
}

impl LogEntry {
    pub fn new(level: LogLevel, text: impl Into<String>) -> Self {
        Self::with_timestamp(now_nanos(), level, text)
    }

    pub fn with_timestamp(timestamp_nanos: u64, level: LogLevel, text: impl Into<String>) -> Self {
        Self {
            timestamp_nanos,
            level,
            text: text.into(),
        }
    }

    #[must_use]
    pub fn timestamp_nanos(&self) -> u64 {
        self.timestamp_nanos
    }

    #[must_use]
    pub fn level(&self) -> LogLevel {
        self.level
    }

    #[must_use]
    pub fn text(&self) -> &str {
        &self.text
    }

    /// The line as shipped: `level=<level> <text>`.
    #[must_use]
    pub fn line(&self) -> String {
        format!("level={} {}", self.level.as_str(), self.text)
    }
}

impl Serialize for LogEntry {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        (self.timestamp_nanos.to_string(), self.line()).serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for LogEntry {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let (timestamp, line) = <(String, String)>::deserialize(deserializer)?;
        let timestamp_nanos = timestamp
            .parse::<u64>()
            .map_err(|e| D::Error::custom(format!("invalid timestamp {timestamp:?}: {e}")))?;
        let (level, text) = line
            .strip_prefix("level=")
            .and_then(|rest| rest.split_once(' '))
            .and_then(|(level, text)| LogLevel::parse(level).map(|level| (level, text)))
            .ok_or_else(|| D::Error::custom(format!("line has no level prefix: {line:?}")))?;
        Ok(LogEntry::with_timestamp(timestamp_nanos, level, text))
    }
}

/// A label set and its entries, in insertion order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogStream {
    #[serde(rename = "stream")]
    labels: LabelSet,
    #[serde(rename = "values")]
    entries: Vec<LogEntry>,
}

impl LogStream {
    #[must_use]
    pub fn new(labels: LabelSet) -> Self {
        Self {
            labels,
            entries: Vec::new(),
        }
    }

    pub fn push(&mut self, entry: LogEntry) {
        self.entries.push(entry);
    }

    #[must_use]
    pub fn labels(&self) -> &LabelSet {
        &self.labels
    }

    #[must_use]
    pub fn entries(&self) -> &[LogEntry] {
        &self.entries
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// One push payload.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamBatch {
    streams: Vec<LogStream>,
}

impl StreamBatch {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A batch holding a single stream with a single entry.
    #[must_use]
    pub fn single(labels: LabelSet, entry: LogEntry) -> Self {
        let mut stream = LogStream::new(labels);
        stream.push(entry);
        Self {
            streams: vec![stream],
        }
    }

    pub fn push_stream(&mut self, stream: LogStream) {
        self.streams.push(stream);
    }

    #[must_use]
    pub fn streams(&self) -> &[LogStream] {
        &self.streams
    }

    #[must_use]
    pub fn entry_count(&self) -> usize {
        self.streams.iter().map(LogStream::len).sum()
    }
}
