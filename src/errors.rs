//! # Error Types
//!
//! Defines error types and a result alias used throughout the [crate].
//!
//! All fallible operations in loupe return [`Result`], built on the
//! [`DebuggerError`] enum defined with [thiserror]. The variants cover the
//! whole taxonomy: operator mistakes, gaps in the debug information,
//! tracee-state problems, and the few conditions that are fatal to the
//! session.

use thiserror::Error;

use crate::addr::Addr;

/// Type alias for Results returned by loupe functions
pub type Result<T> = std::result::Result<T, DebuggerError>;

/// Comprehensive error type for the loupe debugger
#[derive(Error, Debug)]
pub enum DebuggerError {
    #[error("Os error: {0}")]
    Os(#[from] nix::Error),
    #[error("Io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Executable does not exist: {0}")]
    ExecutableDoesNotExist(String),
    #[error("Executable is not a file: {0}")]
    ExecutableIsNotAFile(String),
    #[error("Could not convert to CString: {0}")]
    CStringConv(#[from] std::ffi::NulError),
    #[error("Could not parse integer: {0}")]
    ParseInt(#[from] std::num::ParseIntError),
    #[error("Error while getting cli input: {0}")]
    CliUiDialogueError(#[from] dialoguer::Error),
    #[error("Error while reading information from the executable file: {0}")]
    Object(#[from] object::Error),
    #[error("Error while working with the DWARF debug information: {0}")]
    Dwarf(#[from] gimli::Error),
    #[error("Could not format: {0}")]
    Format(#[from] std::fmt::Error),
    #[error("The tracee is no longer alive")]
    TraceeDead,
    #[error("No register is named {0}")]
    UnknownRegister(String),
    #[error("No register has DWARF number {0}")]
    UnknownDwarfRegister(u16),
    #[error("Tried to enable breakpoint again")]
    BreakpointIsAlreadyEnabled,
    #[error("Tried to disable breakpoint again")]
    BreakpointIsAlreadyDisabled,
    #[error("No DWARF line entry covers address {0}")]
    NoLineEntry(Addr),
    #[error("No statement at {0}:{1} in any compilation unit")]
    SourceLineNotFound(String, u64),
    #[error("No function named {0} in the debug information")]
    FunctionNotFound(String),
    #[error("The tracee is currently not in a known function")]
    NotInFunction,
    #[error("No variable named {0} in the current function")]
    VariableNotFound(String),
    #[error("Variable {0} has no location, it was probably optimized out")]
    OptimizedOut(String),
    #[error("The DWARF location kind is not supported by this debugger")]
    UnsupportedLocation,
    #[error("Attempt to dereference invalid address {0}")]
    InvalidAddress(Addr),
    #[error("The current function carries no frame base attribute")]
    NoFrameBase,
    #[error("Could not parse {0} for the load address")]
    MapsParse(String),
    #[error("External disassembler failed: {0}")]
    Disassembler(String),
    #[error("Tried stepping out of main function, this makes no sense")]
    StepOutMain,
}
