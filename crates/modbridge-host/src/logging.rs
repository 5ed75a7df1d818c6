//! Logging sink interface for module-originated messages.
//!
//! Modules log through their capability table; the host forwards each call
//! here with the module's identity and the caller-supplied source-location
//! tag. The default sink emits `tracing` events under the `module` target.

use std::fmt;

use crate::muid::Muid;

/// Severity levels exposed to modules.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Info,
    Warn,
    Error,
    Fatal,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Severity::Info => "info",
            Severity::Warn => "warn",
            Severity::Error => "error",
            Severity::Fatal => "fatal",
        };
        f.write_str(s)
    }
}

/// External logging collaborator: accepts (severity, message, tag).
pub trait LogSink: Send + Sync {
    fn log(&self, severity: Severity, muid: Muid, message: &str, tag: &str);
}

/// Default sink forwarding to `tracing`.
///
/// `tracing` has no fatal level; fatal messages are emitted as errors with
/// a `fatal` marker field so operators can alert on them.
pub struct TracingSink;

impl LogSink for TracingSink {
    fn log(&self, severity: Severity, muid: Muid, message: &str, tag: &str) {
        match severity {
            Severity::Info => {
                tracing::info!(target: "module", muid = %muid, tag, "{message}")
            }
            Severity::Warn => {
                tracing::warn!(target: "module", muid = %muid, tag, "{message}")
            }
            Severity::Error => {
                tracing::error!(target: "module", muid = %muid, tag, "{message}")
            }
            Severity::Fatal => {
                tracing::error!(target: "module", muid = %muid, tag, fatal = true, "{message}")
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use parking_lot::Mutex;

    /// Sink that records every message for assertions.
    #[derive(Default)]
    pub struct RecordingSink {
        pub entries: Mutex<Vec<(Severity, Muid, String, String)>>,
    }

    impl LogSink for RecordingSink {
        fn log(&self, severity: Severity, muid: Muid, message: &str, tag: &str) {
            self.entries
                .lock()
                .push((severity, muid, message.to_string(), tag.to_string()));
        }
    }
}
