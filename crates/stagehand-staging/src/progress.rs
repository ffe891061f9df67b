//! Decoder for the engine's JSON progress stream.
//!
//! Decoding is split in two: [`DecoderState::advance`] turns one
//! [`ProgressMessage`] into a [`Step`] and updates the region/status state,
//! and [`render`] turns a step into terminal text. Neither touches I/O;
//! [`decode_stream`] wires them to an engine stream and an [`OutputSink`].

use console::{Style, truncate_str};
use futures::StreamExt;
use serde_json::Value;
use tracing::{debug, info};

use crate::engine::{JsonMessage, MessageStream};
use crate::error::{EngineError, StagingError};
use crate::output::OutputSink;

/// Emitted by the staging script when buildpacks start running.
pub const STAGING_START: &str = "#--- SRT!";
/// Emitted by the staging script when buildpacks are done.
pub const STAGING_END: &str = "#--- END!";
/// Informational line from the staging script, surfaced in any region.
pub const STAGING_INFO: &str = "#--- MSG!";

/// Error code the engine reports for rejected registry credentials.
pub const AUTH_FAILURE_CODE: i64 = 401;

const CLEAR_LINE: &str = "\r\x1b[2K";
const ENGINE_CHATTER: &[&str] = &["---> ", "Removing intermediate container"];

/// One classified message of the progress stream.
#[derive(Debug, Clone, PartialEq)]
pub enum ProgressMessage {
    Log(String),
    Status {
        name: String,
        /// Layer or object the status refers to
        id: Option<String>,
        progress: Option<String>,
    },
    /// Structured build result, e.g. `{"ID": "sha256:..."}`
    Result(Value),
    Error {
        code: Option<i64>,
        message: String,
    },
}

impl ProgressMessage {
    /// Classify a raw message; `None` for messages carrying nothing of interest.
    ///
    /// Priority is error, then result, then log line, then status.
    pub fn classify(message: JsonMessage) -> Option<Self> {
        let detail = message.error_detail.unwrap_or_default();
        if message.error.is_some() || detail.message.is_some() {
            let text = message
                .error
                .filter(|e| !e.is_empty())
                .or(detail.message)
                .unwrap_or_default();
            return Some(Self::Error {
                code: detail.code,
                message: text,
            });
        }
        if let Some(aux) = message.aux {
            return Some(Self::Result(aux));
        }
        if let Some(line) = message.stream {
            let line = line.trim_end();
            if !line.trim().is_empty() {
                return Some(Self::Log(line.to_owned()));
            }
        }
        let name = message.status.filter(|s| !s.is_empty())?;
        Some(Self::Status {
            name,
            id: message.id.filter(|id| !id.is_empty()),
            progress: message.progress.filter(|p| !p.is_empty()),
        })
    }
}

/// Whether log lines currently sit between the staging markers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Region {
    #[default]
    Outside,
    Staging,
}

/// What the last rendered step left open on an interactive terminal.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum OpenLine {
    #[default]
    None,
    Build,
    Status,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DecoderState {
    pub region: Region,
    pub last_status: Option<String>,
    pub open_line: OpenLine,
}

/// Decoded meaning of one message given the state before it.
#[derive(Debug, Clone, PartialEq)]
pub enum Step {
    BuildLog(String),
    StagingLog(String),
    /// Marker text or a "Successfully ..." line; always surfaced
    Notice(String),
    Status {
        name: String,
        id: Option<String>,
        progress: Option<String>,
        /// First update for this name; layer ids do not count
        changed: bool,
        /// A previous status line is still open and must be kept
        close_previous: bool,
    },
    Result {
        digest: Option<String>,
    },
    Failed {
        code: Option<i64>,
        message: String,
    },
}

impl DecoderState {
    pub fn advance(&mut self, message: &ProgressMessage) -> Step {
        match message {
            ProgressMessage::Log(line) => {
                let step = self.log_step(line);
                self.open_line = match step {
                    Step::BuildLog(_) => OpenLine::Build,
                    _ => OpenLine::None,
                };
                step
            }
            ProgressMessage::Status { name, id, progress } => {
                let changed = self.last_status.as_deref() != Some(name.as_str());
                let close_previous = changed && self.open_line == OpenLine::Status;
                self.last_status = Some(name.clone());
                self.open_line = OpenLine::Status;
                Step::Status {
                    name: name.clone(),
                    id: id.clone(),
                    progress: progress.clone(),
                    changed,
                    close_previous,
                }
            }
            ProgressMessage::Result(value) => Step::Result {
                digest: value.get("ID").and_then(Value::as_str).map(str::to_owned),
            },
            ProgressMessage::Error { code, message } => {
                self.open_line = OpenLine::None;
                Step::Failed {
                    code: *code,
                    message: message.clone(),
                }
            }
        }
    }

    fn log_step(&mut self, line: &str) -> Step {
        let trimmed = line.trim_start();
        if let Some(rest) = trimmed.strip_prefix(STAGING_START) {
            self.region = Region::Staging;
            return Step::Notice(marker_text(rest, "staging started"));
        }
        if let Some(rest) = trimmed.strip_prefix(STAGING_END) {
            self.region = Region::Outside;
            return Step::Notice(marker_text(rest, "staging finished"));
        }
        if let Some(rest) = trimmed.strip_prefix(STAGING_INFO) {
            return Step::Notice(marker_text(rest, ""));
        }
        if trimmed.starts_with("Successfully") {
            return Step::Notice(trimmed.to_owned());
        }
        match self.region {
            Region::Staging => Step::StagingLog(line.to_owned()),
            Region::Outside => Step::BuildLog(line.to_owned()),
        }
    }
}

fn marker_text(rest: &str, fallback: &str) -> String {
    let rest = rest.trim();
    if rest.is_empty() {
        fallback.to_owned()
    } else {
        rest.to_owned()
    }
}

/// Rendering parameters of the destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RenderStyle {
    pub interactive: bool,
    pub width: usize,
}

impl From<&OutputSink> for RenderStyle {
    fn from(sink: &OutputSink) -> Self {
        Self {
            interactive: sink.is_interactive(),
            width: sink.width(),
        }
    }
}

/// Text to write for `step`; empty when nothing should be shown.
pub fn render(step: &Step, style: &RenderStyle) -> String {
    if !style.interactive {
        return match step {
            Step::BuildLog(line) | Step::StagingLog(line) | Step::Notice(line) => {
                format!("{line}\n")
            }
            Step::Status {
                name,
                changed: true,
                ..
            } => format!("{name}\n"),
            _ => String::new(),
        };
    }

    let width = style.width;
    match step {
        Step::BuildLog(line) => {
            let trimmed = line.trim_start();
            if ENGINE_CHATTER.iter().any(|c| trimmed.starts_with(c)) {
                return String::new();
            }
            let text = truncate_str(trimmed, width.saturating_sub(1), "…");
            let styled = Style::new().dim().force_styling(true).apply_to(text);
            format!("{CLEAR_LINE}{styled}")
        }
        Step::StagingLog(line) => {
            let styled = Style::new().cyan().force_styling(true).apply_to(line);
            format!("{CLEAR_LINE}{styled}\n")
        }
        Step::Notice(line) => {
            let styled = Style::new().green().bold().force_styling(true).apply_to(line);
            format!("{CLEAR_LINE}{styled}\n")
        }
        Step::Status {
            name,
            id,
            progress,
            close_previous,
            ..
        } => {
            let mut line = match id {
                Some(id) => format!("{id}: {name}"),
                None => name.clone(),
            };
            if let Some(progress) = progress {
                line = format!("{line} {progress}");
            }
            let text = truncate_str(&line, width.saturating_sub(1), "…");
            let lead = if *close_previous { "\n" } else { "" };
            format!("{lead}{CLEAR_LINE}{text}")
        }
        Step::Result { .. } => String::new(),
        Step::Failed { .. } => {
            // Keep the error off a half-drawn line
            CLEAR_LINE.to_owned()
        }
    }
}

/// Outcome of a fully decoded stream.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DecodeSummary {
    /// Digest reported in a structured result, if any
    pub digest: Option<String>,
    pub messages: usize,
}

/// Decode `stream` to completion, writing rendered progress to `sink`.
///
/// `subject` names the image or operation in errors.
pub async fn decode_stream(
    mut stream: MessageStream,
    sink: &OutputSink,
    subject: &str,
) -> Result<DecodeSummary, StagingError> {
    let style = RenderStyle::from(sink);
    let mut state = DecoderState::default();
    let mut summary = DecodeSummary::default();

    while let Some(item) = stream.next().await {
        let raw = match item {
            Ok(raw) => raw,
            Err(err) => {
                close_open_line(&state, &style, sink)?;
                return Err(stream_failure(subject, err));
            }
        };
        summary.messages += 1;
        let Some(message) = ProgressMessage::classify(raw) else {
            continue;
        };

        let step = state.advance(&message);
        match &step {
            Step::Notice(text) => info!(subject, "{text}"),
            Step::BuildLog(line) | Step::StagingLog(line) => debug!(subject, "{line}"),
            Step::Status {
                name,
                changed: true,
                ..
            } => debug!(subject, status = %name, "status"),
            Step::Result {
                digest: Some(digest),
            } => debug!(subject, %digest, "engine reported result"),
            _ => {}
        }

        write(sink, &render(&step, &style))?;

        match step {
            Step::Result { digest } if digest.is_some() => summary.digest = digest,
            Step::Failed { code, message } => {
                return Err(if code == Some(AUTH_FAILURE_CODE) {
                    StagingError::RegistryAuth {
                        image: subject.to_owned(),
                        message,
                    }
                } else {
                    StagingError::EngineStream {
                        subject: subject.to_owned(),
                        message,
                        code,
                    }
                });
            }
            _ => {}
        }
    }

    close_open_line(&state, &style, sink)?;
    Ok(summary)
}

fn stream_failure(subject: &str, err: EngineError) -> StagingError {
    match err {
        EngineError::Unauthorized { message } => StagingError::RegistryAuth {
            image: subject.to_owned(),
            message,
        },
        EngineError::Decode { .. } => StagingError::StreamDecode {
            subject: subject.to_owned(),
            source: err,
        },
        EngineError::Stream { message } => StagingError::EngineStream {
            subject: subject.to_owned(),
            message,
            code: None,
        },
        other => StagingError::engine(subject.to_owned(), other),
    }
}

fn close_open_line(
    state: &DecoderState,
    style: &RenderStyle,
    sink: &OutputSink,
) -> Result<(), StagingError> {
    if style.interactive && state.open_line != OpenLine::None {
        write(sink, "\n")?;
    }
    Ok(())
}

fn write(sink: &OutputSink, text: &str) -> Result<(), StagingError> {
    if text.is_empty() {
        return Ok(());
    }
    sink.write_all(text.as_bytes())
        .map_err(|source| StagingError::Output { source })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn log(line: &str) -> ProgressMessage {
        ProgressMessage::Log(line.to_owned())
    }

    #[test]
    fn classification_priority() {
        let message = JsonMessage {
            stream: Some("line\n".to_owned()),
            error: Some("boom".to_owned()),
            ..JsonMessage::default()
        };
        assert!(matches!(
            ProgressMessage::classify(message),
            Some(ProgressMessage::Error { message, .. }) if message == "boom"
        ));

        let message = JsonMessage {
            stream: Some("line\n".to_owned()),
            aux: Some(serde_json::json!({"ID": "sha256:1"})),
            ..JsonMessage::default()
        };
        assert!(matches!(
            ProgressMessage::classify(message),
            Some(ProgressMessage::Result(_))
        ));

        let message = JsonMessage {
            stream: Some("  \n".to_owned()),
            ..JsonMessage::default()
        };
        assert_eq!(ProgressMessage::classify(message), None);
    }

    #[test]
    fn status_keeps_layer_id_apart_from_name() {
        let message = JsonMessage {
            status: Some("Downloading".to_owned()),
            id: Some("a1b2".to_owned()),
            progress: Some("[==> ]".to_owned()),
            ..JsonMessage::default()
        };
        assert_eq!(
            ProgressMessage::classify(message),
            Some(ProgressMessage::Status {
                name: "Downloading".to_owned(),
                id: Some("a1b2".to_owned()),
                progress: Some("[==> ]".to_owned()),
            })
        );
    }

    #[test]
    fn markers_switch_region() {
        let mut state = DecoderState::default();
        assert_eq!(state.advance(&log("Step 1/4")), Step::BuildLog("Step 1/4".to_owned()));
        assert_eq!(
            state.advance(&log("#--- SRT! buildpacks")),
            Step::Notice("buildpacks".to_owned())
        );
        assert_eq!(state.region, Region::Staging);
        assert_eq!(
            state.advance(&log("-----> Installing")),
            Step::StagingLog("-----> Installing".to_owned())
        );
        assert_eq!(
            state.advance(&log("#--- MSG! detected ruby")),
            Step::Notice("detected ruby".to_owned())
        );
        assert_eq!(state.region, Region::Staging);
        assert_eq!(
            state.advance(&log("#--- END!")),
            Step::Notice("staging finished".to_owned())
        );
        assert_eq!(state.region, Region::Outside);
    }

    #[test]
    fn successfully_lines_are_notices_in_any_region() {
        let mut state = DecoderState::default();
        assert!(matches!(
            state.advance(&log("Successfully built 1234")),
            Step::Notice(_)
        ));
        state.advance(&log("#--- SRT!"));
        assert_eq!(
            state.advance(&log("Successfully tagged web:latest")),
            Step::Notice("Successfully tagged web:latest".to_owned())
        );
    }

    #[test]
    fn repeated_status_is_not_a_change() {
        let mut state = DecoderState::default();
        let status = |progress: &str| ProgressMessage::Status {
            name: "Pulling fs layer".to_owned(),
            id: None,
            progress: Some(progress.to_owned()),
        };
        assert!(matches!(
            state.advance(&status("1")),
            Step::Status { changed: true, close_previous: false, .. }
        ));
        assert!(matches!(
            state.advance(&status("2")),
            Step::Status { changed: false, close_previous: false, .. }
        ));
        let next = ProgressMessage::Status {
            name: "Extracting".to_owned(),
            id: None,
            progress: None,
        };
        assert!(matches!(
            state.advance(&next),
            Step::Status { changed: true, close_previous: true, .. }
        ));
    }

    #[test]
    fn interleaved_layers_share_one_status() {
        let mut state = DecoderState::default();
        let layer = |id: &str| ProgressMessage::Status {
            name: "Downloading".to_owned(),
            id: Some(id.to_owned()),
            progress: None,
        };
        assert!(matches!(state.advance(&layer("aaa")), Step::Status { changed: true, .. }));
        assert!(matches!(state.advance(&layer("bbb")), Step::Status { changed: false, .. }));
        assert!(matches!(state.advance(&layer("aaa")), Step::Status { changed: false, .. }));
    }

    #[test]
    fn interactive_status_shows_layer_id() {
        let style = RenderStyle {
            interactive: true,
            width: 80,
        };
        let step = Step::Status {
            name: "Downloading".to_owned(),
            id: Some("a1b2".to_owned()),
            progress: Some("[=> ]".to_owned()),
            changed: false,
            close_previous: false,
        };
        assert_eq!(render(&step, &style), "\r\x1b[2Ka1b2: Downloading [=> ]");
    }

    #[test]
    fn result_digest_is_extracted() {
        let mut state = DecoderState::default();
        let step = state.advance(&ProgressMessage::Result(
            serde_json::json!({"ID": "sha256:abc"}),
        ));
        assert_eq!(
            step,
            Step::Result {
                digest: Some("sha256:abc".to_owned())
            }
        );
    }

    #[test]
    fn plain_rendering() {
        let style = RenderStyle {
            interactive: false,
            width: 80,
        };
        assert_eq!(render(&Step::BuildLog("Step 1/4".to_owned()), &style), "Step 1/4\n");
        let unchanged = Step::Status {
            name: "Waiting".to_owned(),
            id: None,
            progress: None,
            changed: false,
            close_previous: false,
        };
        assert_eq!(render(&unchanged, &style), "");
    }

    #[test]
    fn interactive_rendering_redraws_and_suppresses_chatter() {
        let style = RenderStyle {
            interactive: true,
            width: 20,
        };
        assert_eq!(render(&Step::BuildLog(" ---> abc123".to_owned()), &style), "");

        let status = Step::Status {
            name: "Downloading".to_owned(),
            id: None,
            progress: Some("[=>   ] 1MB/10MB".to_owned()),
            changed: false,
            close_previous: true,
        };
        let text = render(&status, &style);
        assert!(text.starts_with("\n\r\x1b[2K"));
        assert!(text.contains('…'));
        assert!(!text.contains("10MB"));
        assert!(!text.ends_with('\n'));

        let staging = render(&Step::StagingLog("-----> Ruby".to_owned()), &style);
        assert!(staging.starts_with(CLEAR_LINE));
        assert!(staging.ends_with('\n'));
    }
}
