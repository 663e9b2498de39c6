//! Error types for ghost-cov

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Memory access error at {address:#x}: {message}")]
    MemoryAccess { address: u64, message: String },

    #[error("Cannot disassemble at {address:#x}: {message}")]
    Disassembly { address: u64, message: String },

    #[error("No module has been added before registering an address")]
    UnknownModule,

    #[error("Conditional for unregistered line encountered: {file}:{line}")]
    UnregisteredLine { file: String, line: u32 },

    #[error("Cannot enumerate symbols for {module}: {message}")]
    SymbolEnumeration { module: String, message: String },

    #[error("Debug loop error: {0}")]
    DebugLoop(String),

    #[error("Cannot start process: {0}")]
    ProcessLaunch(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Not supported: {0}")]
    NotSupported(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Errors that only cost coverage of the function or module being
    /// walked. Everything else ends the run.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Error::MemoryAccess { .. }
                | Error::Disassembly { .. }
                | Error::SymbolEnumeration { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

impl From<toml::de::Error> for Error {
    fn from(e: toml::de::Error) -> Self {
        Error::Config(e.to_string())
    }
}
