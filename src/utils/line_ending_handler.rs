use serde::{Deserialize, Serialize};
use std::fmt::Write as _;
use std::str::FromStr;
use tracing::debug;

/// Line terminator used by a serial device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LineEnding {
    None, // raw chunks, nothing appended on send
    #[default]
    Lf, // \n
    CrLf, // \r\n
    Cr, // \r
}

impl LineEnding {
    pub fn as_str(&self) -> &'static str {
        match self {
            LineEnding::None => "",
            LineEnding::Lf => "\n",
            LineEnding::CrLf => "\r\n",
            LineEnding::Cr => "\r",
        }
    }

    fn terminator(&self) -> Option<&'static [u8]> {
        match self {
            LineEnding::None => None,
            LineEnding::Lf => Some(b"\n"),
            LineEnding::CrLf => Some(b"\r\n"),
            LineEnding::Cr => Some(b"\r"),
        }
    }
}

impl FromStr for LineEnding {
    type Err = String;

    /// Accepts the literal terminator stored in preferences ("\n", "\r\n", ...)
    /// as well as the symbolic names.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "" => Ok(LineEnding::None),
            "\n" => Ok(LineEnding::Lf),
            "\r\n" => Ok(LineEnding::CrLf),
            "\r" => Ok(LineEnding::Cr),
            other => match other.to_lowercase().as_str() {
                "none" => Ok(LineEnding::None),
                "lf" | "\\n" => Ok(LineEnding::Lf),
                "crlf" | "\\r\\n" => Ok(LineEnding::CrLf),
                "cr" | "\\r" => Ok(LineEnding::Cr),
                _ => Err(format!("Invalid line ending: {:?}", s)),
            },
        }
    }
}

/// How received bytes are rendered before they reach the sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum DisplayMode {
    #[default]
    Text,
    Ascii,
    Hex,
    Mix,
}

impl FromStr for DisplayMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "text" => Ok(DisplayMode::Text),
            "ascii" => Ok(DisplayMode::Ascii),
            "hex" => Ok(DisplayMode::Hex),
            "mix" => Ok(DisplayMode::Mix),
            _ => Err(format!("Invalid display mode: {}", s)),
        }
    }
}

impl DisplayMode {
    pub fn render(&self, bytes: &[u8]) -> String {
        match self {
            DisplayMode::Text => String::from_utf8_lossy(bytes).into_owned(),
            DisplayMode::Ascii => render_ascii(bytes),
            DisplayMode::Hex => render_hex(bytes),
            DisplayMode::Mix => format!("{} [{}]", render_ascii(bytes), render_hex(bytes)),
        }
    }
}

fn render_ascii(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len());
    for &b in bytes {
        match b {
            b'\t' | 0x20..=0x7e => out.push(b as char),
            _ => {
                let _ = write!(out, "\\x{:02X}", b);
            }
        }
    }
    out
}

fn render_hex(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 3);
    for (i, b) in bytes.iter().enumerate() {
        if i > 0 {
            out.push(' ');
        }
        let _ = write!(out, "{:02X}", b);
    }
    out
}

/// Splits a byte stream into lines according to a [`LineEnding`], holding
/// back incomplete text until its terminator arrives.
#[derive(Debug)]
pub struct LineDecoder {
    ending: LineEnding,
    display: DisplayMode,
    pending: Vec<u8>,
}

impl LineDecoder {
    pub fn new(ending: LineEnding, display: DisplayMode) -> Self {
        Self {
            ending,
            display,
            pending: Vec::new(),
        }
    }

    pub fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        let Some(terminator) = self.ending.terminator() else {
            if bytes.is_empty() {
                return Vec::new();
            }
            return vec![self.display.render(bytes)];
        };

        self.pending.extend_from_slice(bytes);
        let mut lines = Vec::new();
        while let Some(pos) = find(&self.pending, terminator) {
            let mut line: Vec<u8> = self.pending.drain(..pos + terminator.len()).collect();
            line.truncate(pos);
            lines.push(self.render_line(line));
        }
        if !lines.is_empty() {
            debug!(count = lines.len(), pending = self.pending.len(), "Decoded serial lines");
        }
        lines
    }

    /// Returns whatever partial line is still buffered.
    pub fn flush(&mut self) -> Option<String> {
        if self.pending.is_empty() {
            return None;
        }
        let rest = std::mem::take(&mut self.pending);
        Some(self.render_line(rest))
    }

    fn render_line(&self, mut line: Vec<u8>) -> String {
        match self.ending {
            // Devices that send \r\n while the monitor expects \n
            LineEnding::Lf if line.last() == Some(&b'\r') => {
                line.pop();
            }
            // ...and the mirror case for \r
            LineEnding::Cr if line.first() == Some(&b'\n') => {
                line.remove(0);
            }
            _ => {}
        }
        self.display.render(&line)
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.len() == 1 {
        return haystack.iter().position(|b| *b == needle[0]);
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}

/// Normalizes all line endings in outgoing text to the specified style.
pub fn normalize_line_endings(text: &str, target: LineEnding) -> String {
    if target == LineEnding::None {
        return text.to_string();
    }

    let normalized_to_lf = text.replace("\r\n", "\n").replace('\r', "\n");

    match target {
        LineEnding::CrLf => normalized_to_lf.replace('\n', "\r\n"),
        LineEnding::Cr => normalized_to_lf.replace('\n', "\r"),
        _ => normalized_to_lf,
    }
}
