//! Ingestion progress reporting.
//!
//! Progress goes to **stderr** so stdout stays parseable for scripts.

use std::io::Write;

#[derive(Clone, Debug, PartialEq)]
pub enum IngestEvent {
    /// The platform's export is being read. Total unknown.
    Parsing { platform: String },
    /// `n` of `total` conversations embedded and indexed.
    Indexing { platform: String, n: u64, total: u64 },
}

/// Receives ingestion progress. Implementations write to stderr.
pub trait IngestProgress: Send + Sync {
    fn report(&self, event: IngestEvent);
}

/// "ingest chatgpt  indexing  1,234 / 5,000 conversations"
pub struct StderrProgress;

impl IngestProgress for StderrProgress {
    fn report(&self, event: IngestEvent) {
        let line = match &event {
            IngestEvent::Parsing { platform } => format!("ingest {}  parsing...\n", platform),
            IngestEvent::Indexing { platform, n, total } => format!(
                "ingest {}  indexing  {} / {} conversations\n",
                platform,
                format_number(*n),
                format_number(*total)
            ),
        };
        let mut err = std::io::stderr().lock();
        let _ = err.write_all(line.as_bytes());
        let _ = err.flush();
    }
}

/// One JSON object per line on stderr.
pub struct JsonProgress;

impl IngestProgress for JsonProgress {
    fn report(&self, event: IngestEvent) {
        let obj = match &event {
            IngestEvent::Parsing { platform } => serde_json::json!({
                "event": "progress",
                "platform": platform,
                "phase": "parsing"
            }),
            IngestEvent::Indexing { platform, n, total } => serde_json::json!({
                "event": "progress",
                "platform": platform,
                "phase": "indexing",
                "n": n,
                "total": total
            }),
        };
        if let Ok(line) = serde_json::to_string(&obj) {
            let mut err = std::io::stderr().lock();
            let _ = writeln!(err, "{}", line);
            let _ = err.flush();
        }
    }
}

pub struct NoProgress;

impl IngestProgress for NoProgress {
    fn report(&self, _event: IngestEvent) {}
}

pub fn format_number(n: u64) -> String {
    let s = n.to_string();
    let mut out = String::with_capacity(s.len() + s.len() / 3);
    for (i, c) in s.chars().enumerate() {
        if i > 0 && (s.len() - i) % 3 == 0 {
            out.push(',');
        }
        out.push(c);
    }
    out
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ProgressMode {
    Off,
    Human,
    Json,
}

impl ProgressMode {
    /// Human progress when stderr is a TTY, otherwise off.
    pub fn default_for_tty() -> Self {
        if atty::is(atty::Stream::Stderr) {
            ProgressMode::Human
        } else {
            ProgressMode::Off
        }
    }

    pub fn reporter(&self) -> Box<dyn IngestProgress> {
        match self {
            ProgressMode::Off => Box::new(NoProgress),
            ProgressMode::Human => Box::new(StderrProgress),
            ProgressMode::Json => Box::new(JsonProgress),
        }
    }
}

impl std::str::FromStr for ProgressMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "off" | "none" => Ok(ProgressMode::Off),
            "human" => Ok(ProgressMode::Human),
            "json" => Ok(ProgressMode::Json),
            other => Err(format!("unknown progress mode: {} (use off, human or json)", other)),
        }
    }
}
