//! Queries against `/proc/<pid>/maps`.
//!
//! The map is re-read on every call. It changes whenever the tracee maps or
//! unmaps memory, so nothing here may be cached.

use nix::unistd::Pid;
use proc_maps::MapRange;
use tracing::debug;

use crate::addr::Addr;
use crate::errors::{DebuggerError, Result};

fn process_map(pid: Pid) -> Result<Vec<MapRange>> {
    Ok(proc_maps::get_process_maps(pid.as_raw())?)
}

/// Whether `addr` falls inside any mapped range of the tracee
///
/// # Errors
///
/// Fails when `/proc/<pid>/maps` cannot be read.
pub fn is_valid_address(pid: Pid, addr: Addr) -> Result<bool> {
    let ranges = process_map(pid)?;
    Ok(ranges
        .iter()
        .any(|r| r.start() <= addr.usize() && addr.usize() < r.start() + r.size()))
}

/// The runtime base at which the tracee's main object was mapped.
///
/// Position-independent (`ET_DYN`) binaries land at the start of the first
/// range in the map; classic `ET_EXEC` binaries are linked at their runtime
/// addresses, so their load address is zero.
///
/// # Errors
///
/// For a position-independent binary an unreadable or empty map is fatal
/// and surfaces as [`DebuggerError::MapsParse`].
pub fn load_address(pid: Pid, position_independent: bool) -> Result<Addr> {
    if !position_independent {
        return Ok(Addr::NULL);
    }

    let ranges = process_map(pid)?;
    let first = ranges
        .first()
        .ok_or_else(|| DebuggerError::MapsParse(format!("/proc/{pid}/maps")))?;
    let base = Addr::from(first.start());
    debug!("load address of pid {pid}: {base}");
    Ok(base)
}

#[cfg(test)]
mod test {
    use super::*;

    // The tests run against the test runner's own map, which is always
    // readable and nonempty.

    #[test]
    fn test_own_map_is_readable() {
        let me = Pid::this();
        let ranges = process_map(me).unwrap();
        assert!(!ranges.is_empty());
    }

    #[test]
    fn test_stack_address_is_valid() {
        let me = Pid::this();
        let local = 0u64;
        let addr = Addr::from(&local as *const u64 as usize);
        assert!(is_valid_address(me, addr).unwrap());
    }

    #[test]
    fn test_null_is_not_valid() {
        let me = Pid::this();
        assert!(!is_valid_address(me, Addr::NULL).unwrap());
    }

    #[test]
    fn test_load_address_of_fixed_binary_is_zero() {
        let me = Pid::this();
        assert_eq!(load_address(me, false).unwrap(), Addr::NULL);
    }
}
