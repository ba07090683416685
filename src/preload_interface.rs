#![allow(non_camel_case_types)]
#![allow(non_upper_case_globals)]

use crate::remote_code_ptr::RemoteCodePtr;

/// Bump this whenever the interface between the preload library and the
/// supervisor changes in a way replay would notice. Changes that only affect
/// recording, such as the layout of `syscall_patch_hook`, do not need a bump.
///
/// Version 0
pub const SCB_PROTOCOL_VERSION: u16 = 0;

pub const SCB_PRELOAD_LIB_FILENAME: &str = "libscbpreload.so";

/// Set this env var to enable syscall buffering.
pub const SCB_BUFFERING_ENABLED_ENV_VAR: &str = "_SCB_USE_SYSCALLBUF";

/// "Magic" (supervisor-implemented) syscall numbers used by the preload
/// library to rendezvous with the supervisor. These must be positive: the
/// kernel only delivers an entry trap for invalid syscall numbers, never an
/// exit trap, and the controller relies on seeing both.
///
/// The preload library calls SYS_scbcall_init_preload once during its
/// initialization.
pub const SYS_scbcall_init_preload: u32 = 442;

/// Called in every thread that gets created (including the initial main
/// thread) to claim a descriptor slot.
pub const SYS_scbcall_init_buffers: u32 = 443;

/// Called when leaving the syscall hook while the supervisor has requested
/// notification, giving it the opportunity to deliver a pending signal.
pub const SYS_scbcall_notify_syscall_hook_exit: u32 = 444;

/// Fixed, build-time-agreed addresses. The classifier, the trampolines and
/// the external controller all import these constants; nothing negotiates
/// them at runtime. Tools depend on these addresses, so they should not
/// change.
pub const PRELOAD_PAGE_ADDR: usize = 0x7000_0000;
pub const PRELOAD_THREAD_LOCALS_ADDR: usize = PRELOAD_PAGE_ADDR + 0x1000;
pub const PRELOAD_THREAD_LOCALS_SIZE: usize = 0x1000;

/// Each syscall stub on the preload page is `syscall; ret`, 4-byte aligned.
pub const SYSCALL_INSTRUCTION_LENGTH: usize = 2;
pub const PRELOAD_PAGE_SYSCALL_STUB_STRIDE: usize = 4;

/// Entry points of the two stubs. The untraced stub executes under the
/// classifier's trampoline privilege; the traced stub exists so patched code
/// can still reach the controller deliberately.
pub fn untraced_syscall_entry() -> RemoteCodePtr {
    RemoteCodePtr::from_val(PRELOAD_PAGE_ADDR)
}

pub fn traced_syscall_entry() -> RemoteCodePtr {
    RemoteCodePtr::from_val(PRELOAD_PAGE_ADDR + PRELOAD_PAGE_SYSCALL_STUB_STRIDE)
}

/// The instruction pointer the kernel reports to a seccomp filter is the
/// address *after* the syscall instruction, so the classifier must trust
/// entry+2, not the entry itself.
pub fn untraced_syscall_ip() -> RemoteCodePtr {
    untraced_syscall_entry() + SYSCALL_INSTRUCTION_LENGTH
}

/// One syscall attempt: number plus exactly six word-sized argument slots,
/// positional and fixed-size. Created per attempt, destroyed once its result
/// has been consumed.
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct syscall_info {
    pub no: u64,
    pub args: [u64; 6],
}

pub const SYSCALL_INFO_SIZE: usize = 56;

impl syscall_info {
    pub fn new(no: u64, args: [u64; 6]) -> syscall_info {
        syscall_info { no, args }
    }

    pub fn to_bytes(&self) -> [u8; SYSCALL_INFO_SIZE] {
        let mut buf = [0u8; SYSCALL_INFO_SIZE];
        buf[0..8].copy_from_slice(&self.no.to_le_bytes());
        for (i, arg) in self.args.iter().enumerate() {
            let at = 8 + i * 8;
            buf[at..at + 8].copy_from_slice(&arg.to_le_bytes());
        }
        buf
    }

    pub fn from_bytes(buf: &[u8; SYSCALL_INFO_SIZE]) -> syscall_info {
        let mut no_bytes = [0u8; 8];
        no_bytes.copy_from_slice(&buf[0..8]);
        let mut args = [0u64; 6];
        for (i, arg) in args.iter_mut().enumerate() {
            let at = 8 + i * 8;
            let mut arg_bytes = [0u8; 8];
            arg_bytes.copy_from_slice(&buf[at..at + 8]);
            *arg = u64::from_le_bytes(arg_bytes);
        }
        syscall_info {
            no: u64::from_le_bytes(no_bytes),
            args,
        }
    }
}

/// IMPORTANT! Must be kept in sync with the syscall_patch_hook struct.
pub const NEXT_INSTRUCTION_BYTES_LEN: usize = 14;
pub const SYSCALL_PATCH_HOOK_SIZE: usize = 24;

/// Describes how one recognized call-site shape was rewritten: the displaced
/// original instruction bytes (bounded to the inline capacity) and the
/// trampoline the site now branches into. The table may be produced and
/// consumed by different build variants of the same architecture, so the
/// layout must not depend on natural alignment — avoid anything that would
/// introduce padding.
///
/// This is never consulted during replay, so layout changes here do not bump
/// SCB_PROTOCOL_VERSION.
#[repr(C)]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct syscall_patch_hook {
    pub is_multi_instruction: u8,
    pub next_instruction_length: u8,
    pub next_instruction_bytes: [u8; NEXT_INSTRUCTION_BYTES_LEN],
    pub hook_address: u64,
}

impl syscall_patch_hook {
    pub fn to_bytes(&self) -> [u8; SYSCALL_PATCH_HOOK_SIZE] {
        let mut buf = [0u8; SYSCALL_PATCH_HOOK_SIZE];
        buf[0] = self.is_multi_instruction;
        buf[1] = self.next_instruction_length;
        buf[2..2 + NEXT_INSTRUCTION_BYTES_LEN].copy_from_slice(&self.next_instruction_bytes);
        buf[16..24].copy_from_slice(&self.hook_address.to_le_bytes());
        buf
    }

    pub fn from_bytes(buf: &[u8; SYSCALL_PATCH_HOOK_SIZE]) -> syscall_patch_hook {
        let mut next_instruction_bytes = [0u8; NEXT_INSTRUCTION_BYTES_LEN];
        next_instruction_bytes.copy_from_slice(&buf[2..2 + NEXT_INSTRUCTION_BYTES_LEN]);
        let mut addr_bytes = [0u8; 8];
        addr_bytes.copy_from_slice(&buf[16..24]);
        syscall_patch_hook {
            is_multi_instruction: buf[0],
            next_instruction_length: buf[1],
            next_instruction_bytes,
            hook_address: u64::from_le_bytes(addr_bytes),
        }
    }
}

const_assert_eq!(
    std::mem::size_of::<syscall_patch_hook>(),
    SYSCALL_PATCH_HOOK_SIZE
);
const_assert_eq!(std::mem::size_of::<syscall_info>(), SYSCALL_INFO_SIZE);

bitflags! {
    /// Each bit names a reason the syscall buffer is locked. The buffer may
    /// be used only when all bits are clear.
    #[derive(Default)]
    pub struct syscallbuf_locked_why: u8 {
        /// Set by the supervised thread during interruptible syscalls to
        /// avoid recursion from a signal handler.
        const LOCKED_TRACEE = 0x1;
        /// Set by the supervisor to suppress buffering when necessary to
        /// preserve semantics.
        const LOCKED_TRACER = 0x2;
    }
}
