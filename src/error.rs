use thiserror::Error;

/// Fatal conditions raised by the assembler, disassembler and emulator.
///
/// Every engine invocation aborts on the first error; no partial output
/// is considered valid. Line numbers are 1-based and refer to the input
/// being processed at the time (assembly text, binary stream, or
/// initial-state text).
#[derive(Error, Debug)]
pub enum Error {
    #[error("syntax error line {line}: {text}: {reason}")]
    Syntax {
        line: usize,
        text: String,
        reason: String,
    },
    #[error("resolution error line {line}: {text}: {reason}")]
    Resolution {
        line: usize,
        text: String,
        reason: String,
    },
    #[error("range error line {line}: {text}: {reason}")]
    Range {
        line: usize,
        text: String,
        reason: String,
    },
    #[error("calibration error: {0}")]
    Calibration(String),
    /// Patch ids are a declared extension point with no implemented
    /// semantics; referencing one is rejected by design.
    #[error("patch {id} requested at `{text}`: patches are not implemented")]
    Unsupported { id: u32, text: String },
    #[error("emulation error: {0}")]
    Emulation(String),
}

impl Error {
    pub fn syntax(line: usize, text: &str, reason: impl Into<String>) -> Self {
        Error::Syntax {
            line,
            text: text.to_string(),
            reason: reason.into(),
        }
    }

    pub fn resolution(line: usize, text: &str, reason: impl Into<String>) -> Self {
        Error::Resolution {
            line,
            text: text.to_string(),
            reason: reason.into(),
        }
    }

    pub fn range(line: usize, text: &str, reason: impl Into<String>) -> Self {
        Error::Range {
            line,
            text: text.to_string(),
            reason: reason.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
