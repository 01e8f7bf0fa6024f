//! The four disjoint error taxonomies: assemble, link, patch, and runtime.
//!
//! Each is a closed enum rather than a trait object, so callers can match on exactly
//! which subsystem failed instead of downcasting.

use std::fmt;

/// Errors raised while translating assembly source text into an object file.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AssembleError {
    ArgCount { line: u32, message: String },
    MissingSize { line: u32, message: String },
    ArgError { line: u32, message: String },
    FormatError { line: u32, message: String },
    UsageError { line: u32, message: String },
    UnknownOp { line: u32, message: String },
    EmptyFile,
    InvalidLabel { line: u32, message: String },
    SymbolRedefinition { line: u32, message: String },
    UnknownSymbol { line: u32, message: String },
    NotImplemented { line: u32, message: String },
}

impl AssembleError {
    pub fn line(&self) -> Option<u32> {
        match self {
            AssembleError::ArgCount { line, .. }
            | AssembleError::MissingSize { line, .. }
            | AssembleError::ArgError { line, .. }
            | AssembleError::FormatError { line, .. }
            | AssembleError::UsageError { line, .. }
            | AssembleError::UnknownOp { line, .. }
            | AssembleError::InvalidLabel { line, .. }
            | AssembleError::SymbolRedefinition { line, .. }
            | AssembleError::UnknownSymbol { line, .. }
            | AssembleError::NotImplemented { line, .. } => Some(*line),
            AssembleError::EmptyFile => None,
        }
    }

    /// Numeric code used by the CLI's process exit status.
    pub fn code(&self) -> i32 {
        match self {
            AssembleError::ArgCount { .. } => 1,
            AssembleError::MissingSize { .. } => 2,
            AssembleError::ArgError { .. } => 3,
            AssembleError::FormatError { .. } => 4,
            AssembleError::UsageError { .. } => 5,
            AssembleError::UnknownOp { .. } => 6,
            AssembleError::EmptyFile => 7,
            AssembleError::InvalidLabel { .. } => 8,
            AssembleError::SymbolRedefinition { .. } => 9,
            AssembleError::UnknownSymbol { .. } => 10,
            AssembleError::NotImplemented { .. } => 10,
        }
    }
}

impl fmt::Display for AssembleError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AssembleError::EmptyFile => write!(f, "empty file: nothing to assemble"),
            other => {
                if let Some(line) = other.line() {
                    write!(f, "line {}: {}", line, other.message())
                } else {
                    write!(f, "{}", other.message())
                }
            }
        }
    }
}

impl AssembleError {
    fn message(&self) -> &str {
        match self {
            AssembleError::ArgCount { message, .. }
            | AssembleError::MissingSize { message, .. }
            | AssembleError::ArgError { message, .. }
            | AssembleError::FormatError { message, .. }
            | AssembleError::UsageError { message, .. }
            | AssembleError::UnknownOp { message, .. }
            | AssembleError::InvalidLabel { message, .. }
            | AssembleError::SymbolRedefinition { message, .. }
            | AssembleError::UnknownSymbol { message, .. }
            | AssembleError::NotImplemented { message, .. } => message,
            AssembleError::EmptyFile => "empty file",
        }
    }
}

impl std::error::Error for AssembleError {}

/// Errors raised while merging object files into an executable image.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LinkError {
    EmptyResult,
    SymbolRedefinition(String),
    MissingSymbol(String),
    FormatError(String),
}

impl LinkError {
    /// Numeric code used by the CLI's process exit status.
    pub fn code(&self) -> i32 {
        match self {
            LinkError::EmptyResult => 1,
            LinkError::SymbolRedefinition(_) => 2,
            LinkError::MissingSymbol(_) => 3,
            LinkError::FormatError(_) => 4,
        }
    }
}

impl fmt::Display for LinkError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LinkError::EmptyResult => write!(f, "link produced an empty executable"),
            LinkError::SymbolRedefinition(name) => write!(f, "symbol redefined: {}", name),
            LinkError::MissingSymbol(name) => write!(f, "undefined symbol: {}", name),
            LinkError::FormatError(message) => write!(f, "format error: {}", message),
        }
    }
}

impl std::error::Error for LinkError {}

/// Outcome of attempting to patch a single hole.
///
/// `Unevaluated` is expected and benign during assembly (the hole just stays in the
/// list); the same variant is fatal once observed at the end of linking.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PatchOutcome {
    Patched,
    Unevaluated,
    Error(String),
}

/// Errors raised by the CPU while executing a program.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RuntimeError {
    OutOfBounds,
    UnhandledSyscall(u64),
    UndefinedBehavior,
    ArithmeticError,
    Abort,
    IOFailure(String),
    FSDisabled,
    AccessViolation,
    InsufficientFDs,
    FDNotInUse,
    NotImplemented(String),
    StackOverflow,
    FPUStackOverflow,
    FPUStackUnderflow,
    FPUError,
    FPUAccessViolation,
    AlignmentViolation,
    UnknownOp,
    FilePermissions,
}

impl fmt::Display for RuntimeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RuntimeError::OutOfBounds => write!(f, "memory access out of bounds"),
            RuntimeError::UnhandledSyscall(code) => write!(f, "unhandled syscall {}", code),
            RuntimeError::UndefinedBehavior => write!(f, "undefined behavior"),
            RuntimeError::ArithmeticError => write!(f, "arithmetic error"),
            RuntimeError::Abort => write!(f, "aborted"),
            RuntimeError::IOFailure(message) => write!(f, "I/O failure: {}", message),
            RuntimeError::FSDisabled => write!(f, "filesystem access is disabled"),
            RuntimeError::AccessViolation => write!(f, "access violation"),
            RuntimeError::InsufficientFDs => write!(f, "no free file descriptors"),
            RuntimeError::FDNotInUse => write!(f, "file descriptor not in use"),
            RuntimeError::NotImplemented(message) => write!(f, "not implemented: {}", message),
            RuntimeError::StackOverflow => write!(f, "stack overflow"),
            RuntimeError::FPUStackOverflow => write!(f, "fpu stack overflow"),
            RuntimeError::FPUStackUnderflow => write!(f, "fpu stack underflow"),
            RuntimeError::FPUError => write!(f, "fpu error"),
            RuntimeError::FPUAccessViolation => write!(f, "fpu access violation"),
            RuntimeError::AlignmentViolation => write!(f, "alignment violation"),
            RuntimeError::UnknownOp => write!(f, "unknown opcode"),
            RuntimeError::FilePermissions => write!(f, "file permissions error"),
        }
    }
}

impl std::error::Error for RuntimeError {}

/// Structural violations of the file-format layer: corrupt bytes, wrong magic, or a
/// version mismatch. Kept distinct from the four domain-error taxonomies above — these
/// are true exceptions, reserved for violations of the container format itself rather
/// than anything a well-formed program could trigger.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ContainerError {
    Corrupt(String),
    TypeMismatch,
    VersionMismatch { found: u64, expected: u64 },
}

impl fmt::Display for ContainerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ContainerError::Corrupt(message) => write!(f, "corrupt container: {}", message),
            ContainerError::TypeMismatch => write!(f, "wrong container magic"),
            ContainerError::VersionMismatch { found, expected } => write!(
                f,
                "version mismatch: found {}, expected {}",
                found, expected
            ),
        }
    }
}

impl std::error::Error for ContainerError {}

impl From<std::io::Error> for ContainerError {
    fn from(err: std::io::Error) -> ContainerError {
        ContainerError::Corrupt(err.to_string())
    }
}
