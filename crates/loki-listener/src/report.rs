// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Text of the log lines shipped to Loki.

use std::fmt::Write as _;

use crate::metrics::{SamplerMetric, ThreadCounts, UserMetrics, SUMMARY_PERCENTILES};
use crate::sample::SampleResult;

#[must_use]
pub fn response_header_line(result: &SampleResult) -> String {
    format!(
        "Sampler [{}]: \nResponse Header: {} \nRequest Duration: {} ms",
        result.label, result.response_headers, result.elapsed_ms
    )
}

#[must_use]
pub fn response_body_line(result: &SampleResult) -> String {
    let mut assertions = String::new();
    for assertion in &result.assertions {
        let _ = writeln!(
            assertions,
            "Assertion Name [{}] - Is Error [{}] - Is Failure [{}] \nFailure Message: {}",
            assertion.name,
            assertion.error,
            assertion.failure,
            assertion.failure_message.as_deref().unwrap_or("null")
        );
    }
    format!(
        "Sampler [{}] \nStatus Code: [{}] \nAssertions Result: \n{} \nResponse Body: \n{} \n",
        result.label, result.response_code, assertions, result.response_body
    )
}

#[must_use]
pub fn thread_metrics_line(user: &UserMetrics, counts: ThreadCounts) -> String {
    format!(
        "minActiveThreads: {} \nmeanActiveThreads: {} \nmaxActiveThreads: {} \nstartedThreads: {} \nfinishedThreads: {}",
        user.min_active_threads(),
        user.mean_active_threads(),
        user.max_active_threads(),
        counts.started,
        counts.finished
    )
}

fn percentiles(out: &mut String, values: [f64; 4]) {
    let _ = write!(
        out,
        "50th: {:.6} \n70th {:.6} \n90th {:.6} \n95th {:.6}\n",
        values[0], values[1], values[2], values[3]
    );
}

/// Summary of one sample label: all, successful and failed requests.
pub fn sampler_summary_line(label: &str, metric: &SamplerMetric) -> String {
    let mut all = format!(
        "All Min Time: {:.6} \nAll Mean Time: {:.6} \nAll Max Time: {:.6} \nTotal Failures: {} \nTotal Hits: {} \nTotal Requests: {} \nTotal Successes Requests: {} \n",
        metric.all_min(),
        metric.all_mean(),
        metric.all_max(),
        metric.failures(),
        metric.hits(),
        metric.total(),
        metric.successes()
    );
    percentiles(&mut all, SUMMARY_PERCENTILES.map(|p| metric.all_percentile(p)));

    let mut ok = format!(
        "All Ok Min Time: {:.6} \nAll Ok Mean Time: {:.6} \nAll Ok Max Time: {:.6} \n",
        metric.ok_min(),
        metric.ok_mean(),
        metric.ok_max()
    );
    percentiles(&mut ok, SUMMARY_PERCENTILES.map(|p| metric.ok_percentile(p)));

    let mut ko = format!(
        "All Ko Min Time: {:.6} \nAll Ko Mean Time: {:.6} \nAll Ko Max Time: {:.6} \n",
        metric.ko_min(),
        metric.ko_mean(),
        metric.ko_max()
    );
    percentiles(&mut ko, SUMMARY_PERCENTILES.map(|p| metric.ko_percentile(p)));

    format!("Sample Name [{label}]: \n\n{all} \n{ok} \n{ko}")
}
