// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use bytes::Bytes;
use tracing::error;

use crate::errors::EncodeError;
use crate::labels::LabelSet;
use crate::streams::{LogEntry, LogLevel, StreamBatch};

/// Turns a stream batch into the body of a push request.
pub trait PayloadEncoder: Send + Sync {
    fn encode(&self, batch: &StreamBatch) -> Result<Bytes, EncodeError>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct JsonEncoder;

impl PayloadEncoder for JsonEncoder {
    fn encode(&self, batch: &StreamBatch) -> Result<Bytes, EncodeError> {
        Ok(Bytes::from(serde_json::to_vec(batch)?))
    }
}

/// Encodes `batch`, or a diagnostic describing why it could not be encoded.
///
/// The diagnostic is a single ERROR line under `labels`. If that cannot be
/// encoded either, the diagnostic text itself is the payload. The result is
/// never empty.
pub fn encode_or_diagnostic(
    encoder: &dyn PayloadEncoder,
    batch: &StreamBatch,
    labels: &LabelSet,
) -> Bytes {
    match encoder.encode(batch) {
        Ok(payload) => payload,
        Err(e) => {
            error!("LOKI | Error JSON Convert: {e}");
            let message = format!("[Error] Can't generate test metrics {e}");
            let diagnostic = StreamBatch::single(
                labels.clone(),
                LogEntry::new(LogLevel::Error, message.clone()),
            );
            match serde_json::to_vec(&diagnostic) {
                Ok(payload) => Bytes::from(payload),
                Err(_) => Bytes::from(message),
            }
        }
    }
}
