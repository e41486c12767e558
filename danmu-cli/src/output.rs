use crate::{cli::OutputFormat, error::Result};
#[cfg(feature = "colored-output")]
use colored::*;
use danmaku_live::{DanmuControlEvent, DanmuType, Frame, LiveEvent, MergedBatchResult};
use serde::Serialize;
use std::io::Write;

pub struct OutputManager {
    colored: bool,
    format: OutputFormat,
}

impl OutputManager {
    pub fn new(colored: bool, format: OutputFormat) -> Self {
        Self { colored, format }
    }

    pub fn format_event(&self, event: &LiveEvent) -> Result<String> {
        if self.format.is_json() {
            return self.format_json(event);
        }

        let line = match event {
            LiveEvent::Danmu(msg) => {
                let name = self.colorize(&msg.username, &Color::Cyan, false);
                match msg.message_type {
                    DanmuType::Gift => {
                        format!("{} {}", self.colorize("[gift]", &Color::Yellow, true), msg.content)
                    }
                    DanmuType::SuperChat => {
                        format!(
                            "{} {}: {}",
                            self.colorize("[sc]", &Color::Yellow, true),
                            name,
                            msg.content
                        )
                    }
                    _ => format!("{}: {}", name, msg.content),
                }
            }
            LiveEvent::Popularity { value } => {
                format!("{} {}", self.colorize("popularity", &Color::Blue, false), value)
            }
            LiveEvent::Control(control) => {
                let text = match control {
                    DanmuControlEvent::StreamClosed { message } => {
                        format!("stream closed: {}", message.as_deref().unwrap_or("-"))
                    }
                    DanmuControlEvent::RoomInfoChanged {
                        title, category, ..
                    } => format!(
                        "room changed: {} [{}]",
                        title.as_deref().unwrap_or("-"),
                        category.as_deref().unwrap_or("-")
                    ),
                    DanmuControlEvent::Counter { kind, value } => format!("{kind}: {value}"),
                };
                self.colorize(&text, &Color::Green, true)
            }
            LiveEvent::Notification { cmd, .. } => {
                self.colorize(&format!("<{cmd}>"), &Color::Blue, false)
            }
        };
        Ok(line)
    }

    pub fn format_batch(&self, result: &MergedBatchResult) -> Result<String> {
        if self.format.is_json() {
            return self.format_json(result);
        }

        let mut output = String::new();
        for item in &result.standard_items {
            output.push_str(&format!("{:>8}  {}\n", item.show_at, item.content));
        }
        for event in &result.highlight_items {
            output.push_str(&format!(
                "{} {} x{} @{} for {}ms (counting {}ms)\n",
                self.colorize("★", &Color::Yellow, true),
                self.colorize(&event.content, &Color::Green, true),
                event.count,
                event.start_time,
                event.duration,
                event.accumulation_duration
            ));
        }
        Ok(output.trim_end().to_string())
    }

    pub fn format_frames(&self, frames: &[Frame]) -> Result<String> {
        #[derive(Serialize)]
        struct FrameView<'a> {
            version: u16,
            operation: u32,
            sequence: u32,
            body_len: usize,
            #[serde(skip_serializing_if = "Option::is_none")]
            event: Option<&'a LiveEvent>,
        }

        let events: Vec<Option<LiveEvent>> = frames.iter().map(frame_event).collect();

        if self.format.is_json() {
            let views: Vec<_> = frames
                .iter()
                .zip(&events)
                .map(|(frame, event)| FrameView {
                    version: frame.version.code(),
                    operation: frame.operation.code(),
                    sequence: frame.sequence,
                    body_len: frame.body.len(),
                    event: event.as_ref(),
                })
                .collect();
            return self.format_json(&views);
        }

        let mut output = format!(
            "{}\n",
            self.colorize(&format!("{} frame(s)", frames.len()), &Color::Green, true)
        );
        for (frame, event) in frames.iter().zip(&events) {
            output.push_str(&format!(
                "  {:?} v{} seq={} {} bytes\n",
                frame.operation,
                frame.version.code(),
                frame.sequence,
                frame.body.len()
            ));
            if let Some(event) = event {
                output.push_str(&format!("    {}\n", self.format_event(event)?));
            }
        }
        Ok(output.trim_end().to_string())
    }

    fn format_json<T: Serialize + ?Sized>(&self, value: &T) -> Result<String> {
        let text = match self.format {
            OutputFormat::JsonCompact => serde_json::to_string(value)?,
            _ => serde_json::to_string_pretty(value)?,
        };
        Ok(text)
    }

    fn colorize(&self, text: &str, color: &Color, bold: bool) -> String {
        #[cfg(feature = "colored-output")]
        {
            if self.colored {
                let colored_text = match color {
                    Color::Green => text.green(),
                    Color::Yellow => text.yellow(),
                    Color::Blue => text.blue(),
                    Color::Cyan => text.cyan(),
                };
                if bold {
                    colored_text.bold().to_string()
                } else {
                    colored_text.to_string()
                }
            } else {
                text.to_string()
            }
        }

        #[cfg(not(feature = "colored-output"))]
        {
            let _ = (color, bold, self.colored);
            text.to_string()
        }
    }
}

/// Decode the payload of frames that carry one.
fn frame_event(frame: &Frame) -> Option<LiveEvent> {
    use danmaku_live::Operation;
    use danmaku_live::protocol::parse_popularity;

    match frame.operation {
        Operation::Message => danmaku_live::parse_notification(&frame.body).ok(),
        Operation::HeartbeatReply => parse_popularity(&frame.body)
            .ok()
            .map(|value| LiveEvent::Popularity { value }),
        _ => None,
    }
}

enum Color {
    Green,
    Yellow,
    Blue,
    Cyan,
}

pub fn write_line(content: &str) -> Result<()> {
    let mut stdout = std::io::stdout().lock();
    writeln!(stdout, "{content}")?;
    stdout.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use danmaku_live::{DanmuMessage, DisplayMessage, Operation, merge};

    #[test]
    fn test_pretty_chat_line() {
        let output = OutputManager::new(false, OutputFormat::Pretty);
        let event = LiveEvent::Danmu(DanmuMessage::chat("1", "alice", "hi"));
        assert_eq!(output.format_event(&event).unwrap(), "alice: hi");
    }

    #[test]
    fn test_compact_json_event() {
        let output = OutputManager::new(false, OutputFormat::JsonCompact);
        let line = output
            .format_event(&LiveEvent::Popularity { value: 5 })
            .unwrap();
        assert!(!line.contains('\n'));
        let json: serde_json::Value = serde_json::from_str(&line).unwrap();
        assert_eq!(json["value"], 5);
    }

    #[test]
    fn test_pretty_batch() {
        let output = OutputManager::new(false, OutputFormat::Pretty);
        let batch = vec![
            DisplayMessage::text("a", 0),
            DisplayMessage::text("a", 100),
        ];
        let text = output.format_batch(&merge(&batch, 500)).unwrap();
        assert!(text.contains("a x2"));
    }

    #[test]
    fn test_frames_with_popularity() {
        let output = OutputManager::new(false, OutputFormat::Pretty);
        let frame = Frame::new(Operation::HeartbeatReply, 9u32.to_be_bytes().to_vec());
        let text = output.format_frames(&[frame]).unwrap();
        assert!(text.starts_with("1 frame(s)"));
        assert!(text.contains("popularity 9"));
    }
}
