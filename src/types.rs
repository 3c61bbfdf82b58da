#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    /// Directive used when `RUST_LOG` is unset.
    pub fn as_filter(&self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

/// One store inside the state database.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum StateScope {
    /// Server index and sync metadata; the next sync is full.
    Index,
    /// Cached content hashes; the next scan rehashes the library.
    Hashes,
    /// This device's upload history.
    Uploads,
}

impl StateScope {
    pub fn label(&self) -> &'static str {
        match self {
            StateScope::Index => "server index",
            StateScope::Hashes => "hash cache",
            StateScope::Uploads => "upload history",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::ValueEnum;

    #[test]
    fn test_log_level_parses_lowercase_names() {
        assert_eq!(LogLevel::from_str("warn", false).unwrap(), LogLevel::Warn);
        assert_eq!(LogLevel::Debug.as_filter(), "debug");
    }
}
