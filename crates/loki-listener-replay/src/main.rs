// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

use std::{env, process, sync::Arc};
use tokio::io::{self, AsyncBufRead, AsyncBufReadExt, BufReader};
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use loki_listener::{LokiConfig, Pipeline, SampleResult, SharedThreadCounts, ThreadCountsSource};

#[tokio::main]
pub async fn main() {
    let log_level = env::var("LOKI_LOG_LEVEL")
        .map(|val| val.to_lowercase())
        .unwrap_or("info".to_string());

    let env_filter = format!("h2=off,hyper=off,rustls=off,{}", log_level);

    #[allow(clippy::expect_used)]
    let subscriber = tracing_subscriber::fmt::Subscriber::builder()
        .with_env_filter(
            EnvFilter::try_new(env_filter).expect("could not parse log level in configuration"),
        )
        .with_level(true)
        .with_thread_names(false)
        .with_thread_ids(false)
        .with_line_number(false)
        .with_file(false)
        .with_target(true)
        .without_time()
        .finish();

    #[allow(clippy::expect_used)]
    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");

    debug!("Logging subsystem enabled");

    let config = match LokiConfig::from_env() {
        Ok(c) => c,
        Err(e) => {
            error!("Error reading Loki listener configuration: {e}");
            process::exit(1);
        }
    };

    let thread_counts = Arc::new(SharedThreadCounts::new());
    let pipeline = Pipeline::new(config);
    if let Err(e) = pipeline.start(Arc::clone(&thread_counts) as Arc<dyn ThreadCountsSource>) {
        error!("Error starting Loki listener: {e}");
        process::exit(1);
    }

    let replayed = match env::args().nth(1) {
        Some(path) => match tokio::fs::File::open(&path).await {
            Ok(file) => replay(BufReader::new(file), &pipeline, &thread_counts).await,
            Err(e) => {
                error!("Unable to open {path}: {e}");
                Ok(0)
            }
        },
        None => replay(BufReader::new(io::stdin()), &pipeline, &thread_counts).await,
    };
    match replayed {
        Ok(lines) => info!("Replayed {lines} lines of sample results"),
        Err(e) => error!("Error reading sample results: {e}"),
    }

    for _ in 0..thread_counts.thread_counts().active {
        thread_counts.thread_finished();
    }
    pipeline.stop().await;
}

/// Feeds every line of `reader` to the pipeline as one `ingest` call.
///
/// Each line is a JSON array of sample results. Blank lines are skipped and
/// lines that do not parse are logged and skipped.
async fn replay<R>(
    reader: R,
    pipeline: &Pipeline,
    thread_counts: &SharedThreadCounts,
) -> io::Result<usize>
where
    R: AsyncBufRead + Unpin,
{
    let mut lines = reader.lines();
    let mut replayed = 0;
    let mut line_number = 0;
    while let Some(line) = lines.next_line().await? {
        line_number += 1;
        if line.trim().is_empty() {
            continue;
        }
        let results: Vec<SampleResult> = match serde_json::from_str(&line) {
            Ok(results) => results,
            Err(e) => {
                warn!("Skipping line {line_number}, not a list of sample results: {e}");
                continue;
            }
        };
        if let Some(peak) = results.iter().map(|r| r.all_threads).max() {
            thread_counts.observe_started(u64::from(peak));
        }
        pipeline.ingest(results);
        replayed += 1;
    }
    Ok(replayed)
}
