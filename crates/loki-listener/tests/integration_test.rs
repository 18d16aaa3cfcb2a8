// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use loki_listener::config::{
    KEY_BATCH_SIZE, KEY_EXTERNAL_LABELS, KEY_HOST, KEY_PORT, KEY_SEND_BATCH_INTERVAL_TIME,
};
use loki_listener::{LokiConfig, Pipeline, PipelineState, SampleResult, SharedThreadCounts};
use mockito::{Matcher, Server, ServerGuard};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::time::{timeout, Duration};

fn config_for(server: &ServerGuard, external_labels: &str) -> LokiConfig {
    let address = server.host_with_port();
    let (host, port) = address.rsplit_once(':').expect("address has a port");
    let parameters: HashMap<String, String> = [
        (KEY_HOST, host),
        (KEY_PORT, port),
        (KEY_BATCH_SIZE, "2"),
        (KEY_SEND_BATCH_INTERVAL_TIME, "50"),
        (KEY_EXTERNAL_LABELS, external_labels),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v.to_string()))
    .collect();
    LokiConfig {
        dispatch_initial_delay: Duration::from_millis(10),
        metrics_initial_delay: Duration::from_secs(3600),
        drain_poll_interval: Duration::from_millis(100),
        shutdown_grace: Duration::from_secs(2),
        ..LokiConfig::from_parameters(&parameters).expect("valid parameters")
    }
}

fn sample(label: &str, elapsed_ms: u64, error_count: u32) -> SampleResult {
    SampleResult {
        elapsed_ms,
        error_count,
        response_code: "200".to_string(),
        response_headers: "Content-Type: text/html".to_string(),
        response_body: "<html></html>".to_string(),
        all_threads: 1,
        ..SampleResult::new(label)
    }
}

#[cfg(test)]
#[tokio::test]
async fn pipeline_ships_results_and_summary() {
    let mut mock_server = Server::new_async().await;

    let results_mock = mock_server
        .mock("POST", "/loki/api/v1/push")
        .match_header("Content-Type", "application/json")
        .match_body(Matcher::AllOf(vec![
            Matcher::Regex("response-header".to_string()),
            Matcher::Regex(r#""env":"ci""#.to_string()),
        ]))
        .with_status(204)
        .expect(2)
        .create_async()
        .await;
    let summary_mock = mock_server
        .mock("POST", "/loki/api/v1/push")
        .match_body(Matcher::AllOf(vec![
            Matcher::Regex("sampler-metrics".to_string()),
            Matcher::Regex(r"Sample Name \[Request Login\]".to_string()),
            Matcher::Regex(r"Sample Name \[Transaction_Checkout\]".to_string()),
        ]))
        .with_status(204)
        .expect(1)
        .create_async()
        .await;

    let pipeline = Pipeline::new(config_for(&mock_server, "env=ci"));
    pipeline
        .start(Arc::new(SharedThreadCounts::new()))
        .expect("pipeline starts");
    assert_eq!(pipeline.state(), PipelineState::Running);

    pipeline.ingest(vec![sample("Login", 120, 0), sample("Logout", 30, 0)]);
    pipeline.ingest(vec![
        sample("Transaction_Checkout", 300, 1),
        sample("Login", 90, 0),
        sample("Search", 45, 0),
    ]);

    timeout(Duration::from_secs(10), pipeline.stop())
        .await
        .expect("stop finishes");

    assert_eq!(pipeline.state(), PipelineState::Stopped);
    assert_eq!(pipeline.pending(), 0);
    results_mock.assert_async().await;
    summary_mock.assert_async().await;
}

#[cfg(test)]
#[tokio::test]
async fn rejected_pushes_do_not_block_teardown() {
    let mut mock_server = Server::new_async().await;

    let mock = mock_server
        .mock("POST", "/loki/api/v1/push")
        .with_status(500)
        .with_body("internal error")
        .expect(3)
        .create_async()
        .await;

    let pipeline = Pipeline::new(config_for(&mock_server, ""));
    pipeline
        .start(Arc::new(SharedThreadCounts::new()))
        .expect("pipeline starts");
    pipeline.ingest(vec![sample("Login", 10, 0)]);
    pipeline.ingest(vec![sample("Login", 20, 1)]);

    timeout(Duration::from_secs(10), pipeline.stop())
        .await
        .expect("stop finishes");

    assert_eq!(pipeline.pending(), 0);
    mock.assert_async().await;
}

#[cfg(test)]
#[tokio::test]
async fn unreachable_backend_does_not_block_teardown() {
    let config = LokiConfig {
        host: "127.0.0.1".to_string(),
        port: 1,
        dispatch_initial_delay: Duration::from_millis(10),
        send_batch_interval: Duration::from_millis(50),
        drain_poll_interval: Duration::from_millis(100),
        ..LokiConfig::default()
    };
    let pipeline = Pipeline::new(config);
    pipeline
        .start(Arc::new(SharedThreadCounts::new()))
        .expect("pipeline starts");
    pipeline.ingest(vec![sample("Login", 10, 0)]);

    timeout(Duration::from_secs(10), pipeline.stop())
        .await
        .expect("stop finishes");

    assert_eq!(pipeline.state(), PipelineState::Stopped);
    assert_eq!(pipeline.pending(), 0);
}

#[cfg(test)]
#[test]
fn start_without_runtime_fails() {
    let pipeline = Pipeline::new(LokiConfig::default());
    let result = pipeline.start(Arc::new(SharedThreadCounts::new()));
    assert!(result.is_err());
    assert_eq!(pipeline.state(), PipelineState::Idle);
}
