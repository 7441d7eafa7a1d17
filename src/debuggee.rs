//! The traced process and everything the engine caches about it.
//!
//! A [`Debuggee`] owns the tracee's pid, its load address, the breakpoint
//! map and the read-only caches built at attach time: the DWARF facade,
//! the disassembly index and the source table. The control flow lives in
//! [`crate::debugger`]; this module holds the data and the pure queries.

use std::collections::HashMap;
use std::path::Path;

use nix::sys::ptrace;
use nix::unistd::Pid;
use tracing::{debug, warn};

use crate::addr::Addr;
use crate::breakpoint::Breakpoint;
use crate::dbginfo::DebugInfo;
use crate::disasm::{AsmFunction, DisasmIndex};
use crate::errors::Result;
use crate::memorymap;

/// Where the tracee is, from the engine's point of view.
///
/// `Launched` covers the window between fork and the first wait at exec;
/// `Running` exists only while the engine is blocked inside a wait; every
/// operator command runs against `Stopped`. `Dead` is final.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TraceeState {
    Launched,
    Stopped,
    Running,
    Dead,
}

/// The traced child process with its caches
pub struct Debuggee {
    pub(crate) pid: Pid,
    pub(crate) load_address: Addr,
    pub(crate) state: TraceeState,
    pub(crate) breakpoints: HashMap<Addr, Breakpoint>,
    pub(crate) dbginfo: DebugInfo,
    pub(crate) disasm: DisasmIndex,
    pub(crate) source: Vec<String>,
}

impl Debuggee {
    /// Builds the debuggee right after the fork.
    ///
    /// Only the debug information is loaded here; everything that depends
    /// on the live process image (load address, disassembly, source table)
    /// waits for [`Self::initialise`] after the post-exec stop has been
    /// observed.
    ///
    /// # Errors
    ///
    /// Fails when the binary cannot be read or its DWARF is malformed.
    pub(crate) fn build(pid: Pid, path: &Path) -> Result<Self> {
        let obj_data = std::fs::read(path)?;
        let dbginfo = DebugInfo::build(obj_data)?;

        Ok(Self {
            pid,
            load_address: Addr::NULL,
            state: TraceeState::Launched,
            breakpoints: HashMap::new(),
            dbginfo,
            disasm: DisasmIndex::default(),
            source: Vec::new(),
        })
    }

    /// Reads the load address, builds the disassembly index and loads the
    /// source table. Must run while the tracee is stopped after exec.
    ///
    /// # Errors
    ///
    /// Fails when the memory map of a position-independent binary cannot
    /// be parsed or the external disassembler fails.
    pub(crate) fn initialise(&mut self, path: &Path) -> Result<()> {
        self.load_address =
            memorymap::load_address(self.pid, self.dbginfo.is_position_independent())?;
        self.disasm = DisasmIndex::build(path, self.load_address)?;
        self.source = self.load_source();
        debug!(
            "attached to pid {}: load address {}, {} source lines",
            self.pid,
            self.load_address,
            self.source.len()
        );
        Ok(())
    }

    fn load_source(&self) -> Vec<String> {
        let Some(path) = self.dbginfo.entry_source_path() else {
            warn!("no compilation unit names a source file");
            return Vec::new();
        };
        match std::fs::read_to_string(&path) {
            Ok(text) => text.lines().map(String::from).collect(),
            Err(e) => {
                warn!("could not read source file {}: {e}", path.display());
                Vec::new()
            }
        }
    }

    pub fn kill(&mut self) -> Result<()> {
        ptrace::kill(self.pid)?;
        self.state = TraceeState::Dead;
        Ok(())
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    pub fn state(&self) -> TraceeState {
        self.state
    }

    pub fn load_address(&self) -> Addr {
        self.load_address
    }

    /// Live address to DWARF-relative
    pub fn offset_load_address(&self, addr: Addr) -> Addr {
        addr.to_dwarf(self.load_address)
    }

    /// DWARF-relative address to live
    pub fn offset_dwarf_address(&self, addr: Addr) -> Addr {
        addr.to_live(self.load_address)
    }

    /// The disassembly-index function owning a live PC
    pub fn function_containing(&self, pc: Addr) -> Option<&AsmFunction> {
        self.disasm.function_containing(pc)
    }

    /// Raw source lines of the entry compilation unit, 1-indexed in display
    pub fn source(&self) -> &[String] {
        &self.source
    }
}
