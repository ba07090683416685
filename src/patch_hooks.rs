use crate::{
    preload_interface::{syscall_patch_hook, NEXT_INSTRUCTION_BYTES_LEN},
    remote_code_ptr::RemoteCodePtr,
    seccomp_bpf::IpRule,
};
use serde::Serialize;
use std::fmt;

/// One recognized call-site shape: the instruction bytes that follow a
/// syscall instruction in some known wrapper, and the trampoline that knows
/// how to execute those displaced bytes after running the buffered-syscall
/// protocol.
///
/// The table is plain data, kept out of the patching logic so it can be
/// audited and tested without any instruction-set machinery.
#[derive(Debug, PartialEq, Eq, Serialize)]
pub struct SyscallPatchHook {
    /// NB: when the patched sequence spans multiple instructions, the
    /// enclosing function may contain a jump whose target lies inside the
    /// patched range, which would land execution in the middle of our
    /// rewrite. glibc's clock_nanosleep is the known example, which is why
    /// that syscall is exempt from patching altogether.
    pub is_multi_instruction: bool,
    pub next_instruction_bytes: &'static [u8],
    pub symbol: &'static str,
}

pub static SYSCALL_PATCH_HOOKS: &[SyscallPatchHook] = &[
    /* Many glibc syscall wrappers (e.g. read) have 'syscall' followed by
     * cmp $-4095,%rax */
    SyscallPatchHook {
        is_multi_instruction: false,
        next_instruction_bytes: &[0x48, 0x3d, 0x01, 0xf0, 0xff, 0xff],
        symbol: "_syscall_hook_trampoline_48_3d_01_f0_ff_ff",
    },
    /* Many glibc syscall wrappers (e.g. __libc_recv) have 'syscall'
     * followed by
     * cmp $-4096,%rax */
    SyscallPatchHook {
        is_multi_instruction: false,
        next_instruction_bytes: &[0x48, 0x3d, 0x00, 0xf0, 0xff, 0xff],
        symbol: "_syscall_hook_trampoline_48_3d_00_f0_ff_ff",
    },
    /* Many glibc syscall wrappers (e.g. read) have 'syscall' followed by
     * mov (%rsp),%rdi */
    SyscallPatchHook {
        is_multi_instruction: false,
        next_instruction_bytes: &[0x48, 0x8b, 0x3c, 0x24],
        symbol: "_syscall_hook_trampoline_48_8b_3c_24",
    },
    /* __lll_unlock_wake has 'syscall' followed by
     * pop %rdx; pop %rsi; ret */
    SyscallPatchHook {
        is_multi_instruction: true,
        next_instruction_bytes: &[0x5a, 0x5e, 0xc3],
        symbol: "_syscall_hook_trampoline_5a_5e_c3",
    },
    /* posix_fadvise64 has 'syscall' followed by
     * mov %eax,%edx;
     * neg %edx */
    SyscallPatchHook {
        is_multi_instruction: true,
        next_instruction_bytes: &[0x89, 0xc2, 0xf7, 0xda],
        symbol: "_syscall_hook_trampoline_89_c2_f7_da",
    },
    /* Our VDSO vsyscall patches have 'syscall' followed by
     * nop; nop; nop */
    SyscallPatchHook {
        is_multi_instruction: true,
        next_instruction_bytes: &[0x90, 0x90, 0x90],
        symbol: "_syscall_hook_trampoline_90_90_90",
    },
    /* glibc-2.22-17.fc23.x86_64 has 'syscall' followed by
     * 'mov $1,%rdx' in pthread_barrier_wait. */
    SyscallPatchHook {
        is_multi_instruction: false,
        next_instruction_bytes: &[0xba, 0x01, 0x00, 0x00, 0x00],
        symbol: "_syscall_hook_trampoline_ba_01_00_00_00",
    },
    /* pthread_sigmask has 'syscall' followed by
     * 'mov %eax,%ecx;
     *  xor %edx,%edx' */
    SyscallPatchHook {
        is_multi_instruction: true,
        next_instruction_bytes: &[0x89, 0xc1, 0x31, 0xd2],
        symbol: "_syscall_hook_trampoline_89_c1_31_d2",
    },
    /* getpid has 'syscall' followed by
     * 'retq;
     *  nopl 0x0(%rax,%rax,1) */
    SyscallPatchHook {
        is_multi_instruction: true,
        next_instruction_bytes: &[0xc3, 0x0f, 0x1f, 0x84, 0x00, 0x00, 0x00, 0x00, 0x00],
        symbol: "_syscall_hook_trampoline_c3_nop",
    },
    /* liblsan internal_close has 'syscall' followed by
     * 'retq;
     *  nopl 0x0(%rax,%rax,1) */
    SyscallPatchHook {
        is_multi_instruction: true,
        next_instruction_bytes: &[0xc3, 0x0f, 0x1f, 0x44, 0x00, 0x00],
        symbol: "_syscall_hook_trampoline_c3_nop",
    },
    /* liblsan internal_open has 'syscall' followed by
     * 'retq;
     *  nopl (%rax) */
    SyscallPatchHook {
        is_multi_instruction: true,
        next_instruction_bytes: &[0xc3, 0x0f, 0x1f, 0x00],
        symbol: "_syscall_hook_trampoline_c3_nop",
    },
    /* liblsan internal_dup2 has 'syscall' followed by
     * 'retq;
     *  xchg %ax,%ax */
    SyscallPatchHook {
        is_multi_instruction: true,
        next_instruction_bytes: &[0xc3, 0x66, 0x90],
        symbol: "_syscall_hook_trampoline_c3_nop",
    },
];

/// First table entry whose pattern is a prefix of `bytes`, which should be
/// the bytes found immediately after a syscall instruction. Declaration
/// order decides ties, so longer patterns sharing a prefix must come first.
pub fn find_syscall_hook(bytes: &[u8]) -> Option<&'static SyscallPatchHook> {
    SYSCALL_PATCH_HOOKS
        .iter()
        .find(|hook| bytes.len() >= hook.next_instruction_bytes.len()
            && bytes[..hook.next_instruction_bytes.len()] == *hook.next_instruction_bytes)
}

/// Syscalls that must never be patched even when a call-site shape matches.
/// clock_nanosleep stays on the trap path: glibc's wrapper is one of the
/// multi-instruction shapes (see `SyscallPatchHook::is_multi_instruction`)
/// and its EINTR retry loop re-enters the wrapper with the remaining
/// duration, so the site must keep trapping consistently.
pub fn is_patch_exempt(nr: i64) -> bool {
    nr == libc::SYS_clock_nanosleep
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PatchHookError {
    PatternTooLong(usize),
}

impl fmt::Display for PatchHookError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PatchHookError::PatternTooLong(len) => write!(
                f,
                "displaced instruction pattern is {} bytes, the descriptor holds at most {}",
                len, NEXT_INSTRUCTION_BYTES_LEN
            ),
        }
    }
}

impl std::error::Error for PatchHookError {}

impl SyscallPatchHook {
    /// Produce the wire descriptor for this shape once the external patcher
    /// has resolved `trampoline` for the hook's symbol.
    pub fn to_wire(&self, trampoline: RemoteCodePtr) -> Result<syscall_patch_hook, PatchHookError> {
        let len = self.next_instruction_bytes.len();
        if len > NEXT_INSTRUCTION_BYTES_LEN {
            return Err(PatchHookError::PatternTooLong(len));
        }
        let mut next_instruction_bytes = [0u8; NEXT_INSTRUCTION_BYTES_LEN];
        next_instruction_bytes[..len].copy_from_slice(self.next_instruction_bytes);
        Ok(syscall_patch_hook {
            is_multi_instruction: self.is_multi_instruction as u8,
            next_instruction_length: len as u8,
            next_instruction_bytes,
            hook_address: trampoline.as_usize() as u64,
        })
    }
}

/// Trusted-range rules for the classifier, one per installed trampoline.
/// `span` is the byte length of a trampoline stub. Only the trampolines are
/// trusted -- the original call sites are not, so any path that reaches one
/// without going through its trampoline still traps.
pub fn trusted_ranges(installed: &[syscall_patch_hook], span: usize) -> Vec<IpRule> {
    installed
        .iter()
        .map(|hook| {
            let entry = RemoteCodePtr::from_val(hook.hook_address as usize);
            IpRule::allow_range(entry, entry + span)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::preload_interface::SYSCALL_PATCH_HOOK_SIZE;

    #[test]
    fn matches_known_wrapper_tails() {
        // 'syscall' followed by cmp $-4095,%rax, then whatever.
        let bytes = [0x48, 0x3d, 0x01, 0xf0, 0xff, 0xff, 0xc3, 0x90];
        let hook = find_syscall_hook(&bytes).unwrap();
        assert_eq!("_syscall_hook_trampoline_48_3d_01_f0_ff_ff", hook.symbol);
        assert!(!hook.is_multi_instruction);
    }

    #[test]
    fn shared_prefixes_resolve_by_declaration_order() {
        // 'retq; nopl (%rax)' must not be claimed by the longer nopl forms.
        let bytes = [0xc3, 0x0f, 0x1f, 0x00, 0x00, 0x00];
        let hook = find_syscall_hook(&bytes).unwrap();
        assert_eq!(&[0xc3, 0x0f, 0x1f, 0x00][..], hook.next_instruction_bytes);
    }

    #[test]
    fn unknown_tail_is_not_patchable() {
        assert!(find_syscall_hook(&[0x0f, 0x05]).is_none());
        // A prefix shorter than every pattern cannot match.
        assert!(find_syscall_hook(&[0x48]).is_none());
    }

    #[test]
    fn wire_descriptor_preserves_pattern() {
        let hook = &SYSCALL_PATCH_HOOKS[0];
        let trampoline = RemoteCodePtr::from_val(0x7000_2000);
        let wire = hook.to_wire(trampoline).unwrap();
        assert_eq!(6, wire.next_instruction_length);
        assert_eq!(
            hook.next_instruction_bytes,
            &wire.next_instruction_bytes[..6]
        );
        assert_eq!(0x7000_2000, wire.hook_address);
        assert_eq!(
            SYSCALL_PATCH_HOOK_SIZE,
            wire.to_bytes().len()
        );
    }

    #[test]
    fn oversized_pattern_is_rejected() {
        let fat = SyscallPatchHook {
            is_multi_instruction: true,
            next_instruction_bytes: &[0u8; 15],
            symbol: "_syscall_hook_trampoline_bogus",
        };
        assert_eq!(
            Err(PatchHookError::PatternTooLong(15)),
            fat.to_wire(RemoteCodePtr::null())
        );
    }

    #[test]
    fn timed_wait_is_exempt_exactly() {
        assert!(is_patch_exempt(libc::SYS_clock_nanosleep));
        assert!(!is_patch_exempt(libc::SYS_nanosleep));
        assert!(!is_patch_exempt(libc::SYS_read));
    }

    #[test]
    fn trusted_ranges_cover_trampolines_only() {
        let wire = SYSCALL_PATCH_HOOKS[0]
            .to_wire(RemoteCodePtr::from_val(0x7000_2000))
            .unwrap();
        let rules = trusted_ranges(&[wire], 32);
        assert_eq!(1, rules.len());
        assert_eq!(0x7000_2000, rules[0].start.as_usize());
        assert_eq!(0x7000_2020, rules[0].end.as_usize());
    }

    #[test]
    fn table_serializes_for_audit() {
        let json = serde_json::to_string(&SYSCALL_PATCH_HOOKS).unwrap();
        assert!(json.contains("_syscall_hook_trampoline_48_8b_3c_24"));
        assert!(json.contains("\"is_multi_instruction\":true"));
    }
}
