use crate::{
    cli::OutputFormat,
    config::AppConfig,
    error::{CliError, Result},
    output::{OutputManager, write_line},
};
use anyhow::Context;
use danmaku_live::{
    DanmakuClient, DanmakuMerger, DisplayMessage, LiveEvent, MergeBatcher, MergeConfig,
    decode_with_limits,
};
use std::io::Read;
use std::path::Path;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub struct CommandExecutor {
    config: AppConfig,
}

impl CommandExecutor {
    pub fn new(config: AppConfig) -> Self {
        Self { config }
    }

    fn output(&self, format: OutputFormat) -> OutputManager {
        OutputManager::new(self.config.colored, format)
    }

    /// Follow a room until Ctrl-C.
    #[allow(clippy::too_many_arguments)]
    pub async fn watch(
        &self,
        url: &str,
        room_id: u64,
        token: &str,
        uid: u64,
        merge: bool,
        batch_window_ms: Option<i64>,
        format: OutputFormat,
    ) -> Result<()> {
        let output = self.output(format);
        let client = DanmakuClient::websocket(self.config.client.clone());
        let mut events = client.subscribe();
        client.connect(url, token, room_id, uid)?;
        info!(room_id, "Watching room, press Ctrl-C to stop");

        let cancel = CancellationToken::new();
        let ctrl_c = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                ctrl_c.cancel();
            }
        });

        let window = batch_window_ms.unwrap_or(self.config.batch_window_ms);
        let mut batcher = merge.then(|| MergeBatcher::new(self.config.merge.clone(), window));
        let mut flush_interval =
            tokio::time::interval(Duration::from_millis((window.max(4) / 4) as u64));
        flush_interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("Interrupted, disconnecting");
                    break;
                }

                event = events.recv() => {
                    let Some(event) = event else {
                        warn!("Event channel closed");
                        break;
                    };
                    match (&mut batcher, &event) {
                        (Some(batcher), LiveEvent::Danmu(msg)) => {
                            batcher.push(DisplayMessage::from_danmu(msg, now_ms()));
                        }
                        _ => write_line(&output.format_event(&event)?)?,
                    }
                }

                _ = flush_interval.tick(), if batcher.is_some() => {
                    if let Some(result) = batcher.as_mut().and_then(|b| b.poll(now_ms()))
                        && !result.is_empty()
                    {
                        write_line(&output.format_batch(&result)?)?;
                    }
                }
            }
        }

        client.disconnect().await;

        if let Some(mut batcher) = batcher {
            let result = batcher.flush(now_ms());
            if !result.is_empty() {
                write_line(&output.format_batch(&result)?)?;
            }
        }

        if events.dropped() > 0 {
            warn!(dropped = events.dropped(), "Output fell behind, events were dropped");
        }
        Ok(())
    }

    /// Decode a captured buffer and print its frames.
    pub fn decode(&self, file: Option<&Path>, hex: bool, format: OutputFormat) -> Result<()> {
        let raw = read_input(file)?;
        let data = if hex {
            let text: String = String::from_utf8_lossy(&raw)
                .chars()
                .filter(|c| !c.is_whitespace())
                .collect();
            ::hex::decode(text).map_err(|e| CliError::invalid_input(format!("bad hex: {e}")))?
        } else {
            raw
        };

        debug!(len = data.len(), "Decoding buffer");
        let frames = decode_with_limits(&data, &self.config.client.decode_limits())?;
        write_line(&self.output(format).format_frames(&frames)?)
    }

    /// Merge a JSON array of display messages.
    pub fn merge(
        &self,
        file: Option<&Path>,
        interval_ms: Option<i64>,
        format: OutputFormat,
    ) -> Result<()> {
        let raw = read_input(file)?;
        let mut batch: Vec<DisplayMessage> =
            serde_json::from_slice(&raw).context("input must be a JSON array of display messages")?;
        if !batch.is_sorted_by_key(|item| item.show_at) {
            warn!("Input is not ordered by show_at, sorting");
            batch.sort_by_key(|item| item.show_at);
        }

        let config = MergeConfig {
            window_ms: interval_ms.unwrap_or(self.config.merge.window_ms),
            ..self.config.merge.clone()
        };
        let result = DanmakuMerger::new(config).merge(&batch);
        info!(
            input = batch.len(),
            standard = result.standard_items.len(),
            highlights = result.highlight_items.len(),
            "Merged"
        );
        write_line(&self.output(format).format_batch(&result)?)
    }
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

fn read_input(file: Option<&Path>) -> Result<Vec<u8>> {
    match file {
        Some(path) => {
            Ok(std::fs::read(path).with_context(|| format!("reading {}", path.display()))?)
        }
        None => {
            let mut buffer = Vec::new();
            std::io::stdin().read_to_end(&mut buffer)?;
            Ok(buffer)
        }
    }
}
