//! `si_code` values for SIGTRAP, taken from the kernel's siginfo header.
//! They are deeply nested in libc and not exposed through nix.
//!
//! Source: <https://elixir.bootlin.com/linux/v6.13.1/source/include/uapi/asm-generic/siginfo.h#L227>

/// Sent by the kernel from somewhere
pub const SI_KERNEL: i32 = 0x80;

/// Process breakpoint
pub const TRAP_BRKPT: i32 = 0x1;
/// Process trace trap
pub const TRAP_TRACE: i32 = 0x2;
