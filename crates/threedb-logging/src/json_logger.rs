// SPDX-License-Identifier: Apache-2.0
//! Newline-delimited JSON logger: the one concrete [`crate::Logger`] this
//! crate ships. Writes one JSON object per result to `details.log`.

use std::path::Path;

use async_trait::async_trait;
use serde::Serialize;
use threedb_buffer::ResultBuffer;
use threedb_proto::{ElementType, RenderArg};
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncWriteExt, BufWriter};

use crate::{LogEvent, Logger, LoggingError};

#[derive(Serialize)]
struct ChannelRecord {
    shape: Vec<usize>,
    dtype: ElementType,
    data: Vec<u8>,
}

#[derive(Serialize)]
struct DetailRecord {
    job_id: uuid::Uuid,
    order: usize,
    environment: String,
    model: String,
    render_args: Vec<RenderArg>,
    channels: std::collections::BTreeMap<String, ChannelRecord>,
}

/// Logs every result's descriptor fields and channel tensors as one JSON
/// line per result, appended to `<output_dir>/details.log`.
pub struct JsonLogger {
    regid: u8,
    writer: BufWriter<File>,
}

impl JsonLogger {
    /// Registers with `buffer` and opens `<output_dir>/details.log` for
    /// append.
    pub async fn create(output_dir: &Path, buffer: &ResultBuffer) -> Result<Self, LoggingError> {
        let regid = buffer.register()?;
        let path = output_dir.join("details.log");
        let file = OpenOptions::new().create(true).append(true).open(&path).await?;
        tracing::info!(path = %path.display(), regid, "logging results to JSON file");
        Ok(Self {
            regid,
            writer: BufWriter::new(file),
        })
    }
}

#[async_trait]
impl Logger for JsonLogger {
    async fn log(&mut self, buffer: &ResultBuffer, item: &LogEvent) -> Result<(), LoggingError> {
        let slot_data = buffer.read(item.result_ix)?;
        let channels = slot_data
            .into_iter()
            .map(|(name, view)| {
                (
                    name,
                    ChannelRecord {
                        shape: view.shape,
                        dtype: view.dtype,
                        data: view.bytes,
                    },
                )
            })
            .collect();

        let record = DetailRecord {
            job_id: item.job_id,
            order: item.order,
            environment: item.environment.clone(),
            model: item.model.clone(),
            render_args: item.render_args.clone(),
            channels,
        };

        let mut line = serde_json::to_vec(&record)?;
        line.push(b'\n');
        self.writer.write_all(&line).await?;

        buffer.free(item.result_ix, i16::from(self.regid))?;
        Ok(())
    }

    async fn end(&mut self) {
        if let Err(err) = self.writer.flush().await {
            tracing::warn!(error = %err, "failed to flush JSON logger on shutdown");
        }
    }
}

#[cfg(test)]
#[allow(clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use threedb_proto::{ChannelSchema, DeclaredOutputs};

    #[tokio::test]
    async fn writes_one_newline_delimited_json_record_per_logged_result() {
        let dir = tempfile::tempdir().expect("tempdir");
        let buffer = ResultBuffer::new(1);

        let mut schema = DeclaredOutputs::new();
        schema.insert(
            "rgb".to_string(),
            ChannelSchema {
                shape: vec![3],
                dtype: ElementType::U8,
            },
        );
        buffer.declare(&schema).expect("declare");

        let mut logger = JsonLogger::create(dir.path(), &buffer).await.expect("create logger");

        let mut data = BTreeMap::new();
        data.insert("rgb".to_string(), vec![9u8, 8, 7]);
        let slot = buffer.allocate(&data).expect("allocate");

        let event = LogEvent {
            job_id: uuid::Uuid::nil(),
            order: 0,
            environment: "env_a".into(),
            model: "model_a".into(),
            render_args: vec![],
            result_ix: slot,
        };
        logger.log(&buffer, &event).await.expect("log succeeds");
        logger.end().await;

        let contents = tokio::fs::read_to_string(dir.path().join("details.log"))
            .await
            .expect("read log file");
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 1);
        let parsed: serde_json::Value = serde_json::from_str(lines[0]).expect("valid json line");
        assert_eq!(parsed["environment"], "env_a");
        assert_eq!(parsed["channels"]["rgb"]["data"], serde_json::json!([9, 8, 7]));
    }
}
