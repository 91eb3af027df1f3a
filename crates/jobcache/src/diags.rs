//! Diagnostics capture
//!
//! While a cache-miss compile runs, rendered diagnostics are teed to real
//! stderr (live streaming) and to an in-memory buffer that becomes the
//! result tree's `stderr` entry. A serialized form is always produced as
//! well, whether or not the user asked for a serialized-diagnostics file,
//! so the action key stays independent of that flag.

use jobcache_cas::{CacheError, Result};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::io::Write;

const SERIAL_DIAGS_MAGIC: &[u8; 4] = b"JCDG";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Severity {
    Note,
    Remark,
    Warning,
    Error,
}

impl Severity {
    fn label(self) -> &'static str {
        match self {
            Self::Note => "note",
            Self::Remark => "remark",
            Self::Warning => "warning",
            Self::Error => "error",
        }
    }

    fn encode(self) -> u8 {
        match self {
            Self::Note => 0,
            Self::Remark => 1,
            Self::Warning => 2,
            Self::Error => 3,
        }
    }

    fn decode(byte: u8) -> Option<Self> {
        match byte {
            0 => Some(Self::Note),
            1 => Some(Self::Remark),
            2 => Some(Self::Warning),
            3 => Some(Self::Error),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Diagnostic {
    pub severity: Severity,
    pub message: String,
}

/// Consumer that mirrors rendered diagnostics and collects them for
/// serialization.
pub struct DiagnosticsCapture {
    live: bool,
    rendered: Mutex<Vec<u8>>,
    collected: Mutex<Vec<Diagnostic>>,
}

impl DiagnosticsCapture {
    /// `live` controls whether reports also stream to real stderr.
    pub fn new(live: bool) -> Self {
        Self {
            live,
            rendered: Mutex::new(Vec::new()),
            collected: Mutex::new(Vec::new()),
        }
    }

    pub fn report(&self, severity: Severity, message: impl Into<String>) {
        let message = message.into();
        let line = format!("{}: {}\n", severity.label(), message);
        if self.live {
            let _ = std::io::stderr().write_all(line.as_bytes());
        }
        self.rendered.lock().extend_from_slice(line.as_bytes());
        self.collected.lock().push(Diagnostic { severity, message });
    }

    /// The textual stderr stream accumulated so far.
    pub fn rendered(&self) -> Vec<u8> {
        self.rendered.lock().clone()
    }

    /// The serialized form of everything collected so far.
    pub fn serialized(&self) -> Vec<u8> {
        serialize_diagnostics(&self.collected.lock())
    }
}

/// Encode diagnostics as stable little-endian records.
pub fn serialize_diagnostics(diagnostics: &[Diagnostic]) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(SERIAL_DIAGS_MAGIC);
    out.extend_from_slice(&(diagnostics.len() as u32).to_le_bytes());
    for diagnostic in diagnostics {
        out.push(diagnostic.severity.encode());
        out.extend_from_slice(&(diagnostic.message.len() as u32).to_le_bytes());
        out.extend_from_slice(diagnostic.message.as_bytes());
    }
    out
}

/// Decode a serialized-diagnostics blob.
pub fn parse_diagnostics(bytes: &[u8]) -> Result<Vec<Diagnostic>> {
    let malformed =
        |reason: &str| CacheError::corruption("<serialized diagnostics>", reason.to_string());

    if bytes.len() < 8 || &bytes[0..4] != SERIAL_DIAGS_MAGIC {
        return Err(malformed("bad magic"));
    }
    let count = u32::from_le_bytes(bytes[4..8].try_into().expect("count width")) as usize;
    let mut out = Vec::with_capacity(count);
    let mut cursor = 8usize;
    for _ in 0..count {
        let severity = bytes
            .get(cursor)
            .copied()
            .and_then(Severity::decode)
            .ok_or_else(|| malformed("bad severity"))?;
        cursor += 1;
        let len = bytes
            .get(cursor..cursor + 4)
            .map(|b| u32::from_le_bytes(b.try_into().expect("length width")) as usize)
            .ok_or_else(|| malformed("truncated length"))?;
        cursor += 4;
        let message = bytes
            .get(cursor..cursor + len)
            .map(|b| String::from_utf8_lossy(b).into_owned())
            .ok_or_else(|| malformed("truncated message"))?;
        cursor += len;
        out.push(Diagnostic { severity, message });
    }
    if cursor != bytes.len() {
        return Err(malformed("trailing bytes"));
    }
    Ok(out)
}
