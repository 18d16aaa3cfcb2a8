// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Label sets attached to every Loki stream.
//!
//! A [`LabelSet`] is an ordered string map. Every stream carries the base
//! plugin-identity label plus the externally configured labels, merged on top
//! of a stream-specific label that tells the streams apart in the backend.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::warn;

pub const PLUGIN_LABEL: &str = "jmeter_plugin";
pub const PLUGIN_LABEL_VALUE: &str = "loki-log";

pub const DATA_LABEL: &str = "jmeter_data";
pub const RESPONSE_HEADER: &str = "response-header";
pub const RESPONSE_BODY: &str = "response-body";

pub const METRICS_LABEL: &str = "jmeter_plugin_metrics";
pub const THREAD_METRICS: &str = "thread-metrics";
pub const SAMPLER_METRICS: &str = "sampler-metrics";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LabelSet(BTreeMap<String, String>);

impl LabelSet {
    #[must_use]
    pub fn new() -> Self {
        Self(BTreeMap::new())
    }

    pub fn from_pairs<K, V, I>(pairs: I) -> Self
    where
        K: Into<String>,
        V: Into<String>,
        I: IntoIterator<Item = (K, V)>,
    {
        Self(
            pairs
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }

    /// Returns a copy of `self` with every entry of `other` applied on top.
    /// Entries of `other` win on key collision.
    #[must_use]
    pub fn merge(&self, other: &LabelSet) -> Self {
        let mut labels = self.0.clone();
        labels.extend(other.0.iter().map(|(k, v)| (k.clone(), v.clone())));
        Self(labels)
    }

    #[must_use]
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

/// Labels shared by every stream: the plugin identity overridden by any
/// externally configured labels.
#[must_use]
pub fn base_labels(external: &LabelSet) -> LabelSet {
    LabelSet::from_pairs([(PLUGIN_LABEL, PLUGIN_LABEL_VALUE)]).merge(external)
}

#[must_use]
pub fn response_header_labels(base: &LabelSet) -> LabelSet {
    LabelSet::from_pairs([(DATA_LABEL, RESPONSE_HEADER)]).merge(base)
}

#[must_use]
pub fn response_body_labels(base: &LabelSet) -> LabelSet {
    LabelSet::from_pairs([(DATA_LABEL, RESPONSE_BODY)]).merge(base)
}

#[must_use]
pub fn thread_metrics_labels(base: &LabelSet) -> LabelSet {
    LabelSet::from_pairs([(METRICS_LABEL, THREAD_METRICS)]).merge(base)
}

#[must_use]
pub fn sampler_metrics_labels(base: &LabelSet) -> LabelSet {
    LabelSet::from_pairs([(METRICS_LABEL, SAMPLER_METRICS)]).merge(base)
}

/// Parses `key=value` pairs separated by commas and/or whitespace.
///
/// Pairs without `=` or with an empty key are skipped with a warning. Later
/// duplicates override earlier ones.
#[must_use]
pub fn parse_external_labels(raw: &str) -> LabelSet {
    let normalized = raw.replace(',', " ");
    let mut labels = BTreeMap::new();
    for pair in normalized.split_whitespace() {
        match pair.split_once('=') {
            Some((key, value)) if !key.trim().is_empty() => {
                labels.insert(key.trim().to_string(), value.trim().to_string());
            }
            _ => warn!("LOKI | Ignoring malformed external label '{pair}', expected key=value"),
        }
    }
    LabelSet(labels)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merge_prefers_later_entries() {
        let first = LabelSet::from_pairs([("a", "1"), ("b", "2")]);
        let second = LabelSet::from_pairs([("b", "3"), ("c", "4")]);
        let merged = first.merge(&second);
        assert_eq!(merged.get("a"), Some("1"));
        assert_eq!(merged.get("b"), Some("3"));
        assert_eq!(merged.get("c"), Some("4"));
        // inputs are untouched
        assert_eq!(first.get("b"), Some("2"));
    }

    #[test]
    fn stream_labels_carry_base_labels() {
        let base = base_labels(&LabelSet::from_pairs([("env", "staging")]));
        let header = response_header_labels(&base);
        assert_eq!(header.get(DATA_LABEL), Some(RESPONSE_HEADER));
        assert_eq!(header.get(PLUGIN_LABEL), Some(PLUGIN_LABEL_VALUE));
        assert_eq!(header.get("env"), Some("staging"));

        let body = response_body_labels(&base);
        assert_eq!(body.get(DATA_LABEL), Some(RESPONSE_BODY));

        assert_eq!(
            thread_metrics_labels(&base).get(METRICS_LABEL),
            Some(THREAD_METRICS)
        );
        assert_eq!(
            sampler_metrics_labels(&base).get(METRICS_LABEL),
            Some(SAMPLER_METRICS)
        );
    }

    #[test]
    fn external_labels_override_plugin_identity() {
        let base = base_labels(&LabelSet::from_pairs([(PLUGIN_LABEL, "custom")]));
        assert_eq!(base.get(PLUGIN_LABEL), Some("custom"));
    }

    #[test]
    fn base_labels_win_over_stream_label() {
        let base = base_labels(&LabelSet::from_pairs([(DATA_LABEL, "forced")]));
        assert_eq!(response_body_labels(&base).get(DATA_LABEL), Some("forced"));
    }

    #[test]
    fn parse_external_labels_accepts_commas_and_spaces() {
        let labels = parse_external_labels("env=prod, team=perf region=eu");
        assert_eq!(labels.len(), 3);
        assert_eq!(labels.get("env"), Some("prod"));
        assert_eq!(labels.get("team"), Some("perf"));
        assert_eq!(labels.get("region"), Some("eu"));
    }

    #[test]
    fn parse_external_labels_skips_malformed_pairs() {
        let labels = parse_external_labels("novalue,=empty,ok=1");
        assert_eq!(labels.len(), 1);
        assert_eq!(labels.get("ok"), Some("1"));
    }

    #[test]
    fn parse_external_labels_empty() {
        assert!(parse_external_labels("").is_empty());
        assert!(parse_external_labels("   ").is_empty());
    }
}
