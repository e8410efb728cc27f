//! Raw communication log for one engine process.

use chrono::{DateTime, Utc};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TranscriptDirection {
    ControllerToEngine,
    EngineToController,
    System,
}

impl TranscriptDirection {
    pub fn label(self) -> &'static str {
        match self {
            Self::ControllerToEngine => "CTRL->ENGINE",
            Self::EngineToController => "ENGINE->CTRL",
            Self::System => "SYSTEM",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TranscriptStream {
    Stdin,
    Stdout,
    Stderr,
    System,
}

impl TranscriptStream {
    pub fn label(self) -> &'static str {
        match self {
            Self::Stdin => "STDIN",
            Self::Stdout => "STDOUT",
            Self::Stderr => "STDERR",
            Self::System => "SYSTEM",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TranscriptEntry {
    pub timestamp: DateTime<Utc>,
    pub direction: TranscriptDirection,
    pub stream: TranscriptStream,
    pub line: String,
}

impl TranscriptEntry {
    /// `[HH:MM:SS.mmm] DIR (STREAM): line`
    pub fn render(&self) -> String {
        format!(
            "[{}] {} ({}): {}",
            self.timestamp.format("%H:%M:%S%.3f"),
            self.direction.label(),
            self.stream.label(),
            self.line
        )
    }
}

#[derive(Debug, Default)]
pub struct Transcript {
    entries: Vec<TranscriptEntry>,
}

impl Transcript {
    pub fn record(&mut self, direction: TranscriptDirection, stream: TranscriptStream, line: &str) {
        self.entries.push(TranscriptEntry {
            timestamp: Utc::now(),
            direction,
            stream,
            line: line.to_string(),
        });
    }

    pub fn entries(&self) -> &[TranscriptEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn render(&self) -> String {
        self.entries
            .iter()
            .map(TranscriptEntry::render)
            .collect::<Vec<_>>()
            .join("\n")
    }
}
