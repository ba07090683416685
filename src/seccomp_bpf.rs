use crate::{
    kernel_supplement::{
        seccomp_data, BPF_ABS, BPF_JA, BPF_JEQ, BPF_JGE, BPF_JGT, BPF_JMP, BPF_K, BPF_LD,
        BPF_MAXINSNS, BPF_RET, BPF_W, SECCOMP_RET_ALLOW, SECCOMP_RET_DATA, SECCOMP_RET_TRACE,
        SECCOMP_SET_MODE_FILTER,
    },
    remote_code_ptr::RemoteCodePtr,
};
use libc::{sock_filter, sock_fprog};
use std::fmt;
use std::io;
use std::mem::size_of;
use std::slice::from_raw_parts;

// The label/jump scheme follows the classic seccomp BPF helper macros:
/*
 * seccomp example for x86 (32-bit and 64-bit) with BPF macros
 *
 * Copyright (c) 2012 The Chromium OS Authors <chromium-os-dev@chromium.org>
 * Authors:
 *  Will Drewry <wad@chromium.org>
 *  Kees Cook <keescook@chromium.org>
 *
 * The code may be used by anyone for any purpose, and can serve as a
 * starting point for developing applications using mode 2 seccomp.
 */

// Label-carrying instructions are BPF_JA with these marker bytes in jt/jf
// until resolution rewrites them. The markers cannot collide with real
// conditional offsets because BPF_JA ignores jt/jf.
const JUMP_JT: u8 = 0xff;
const JUMP_JF: u8 = 0xff;
const LABEL_JT: u8 = 0xfe;
const LABEL_JF: u8 = 0xfe;

fn bpf_stmt(code: u16, k: u32) -> sock_filter {
    sock_filter {
        code,
        jt: 0,
        jf: 0,
        k,
    }
}

fn bpf_jump(code: u16, k: u32, jt: u8, jf: u8) -> sock_filter {
    sock_filter { code, jt, jf, k }
}

/// What the classifier does with a matched syscall or call site. Trace means
/// "suspend and notify the external controller", never "deny"; enforcement
/// decisions belong to the controller.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Disposition {
    Allow,
    Trace,
}

/// Evaluated in declared order; first match wins.
#[derive(Copy, Clone, Debug)]
pub struct SyscallRule {
    pub nr: u32,
    pub disposition: Disposition,
}

impl SyscallRule {
    pub fn allow(nr: i64) -> SyscallRule {
        SyscallRule {
            nr: nr as u32,
            disposition: Disposition::Allow,
        }
    }

    pub fn trace(nr: i64) -> SyscallRule {
        SyscallRule {
            nr: nr as u32,
            disposition: Disposition::Trace,
        }
    }
}

/// A half-open `[start, end)` range of trusted instruction-pointer values,
/// typically one trampoline entry. Lets code executing there bypass the
/// default disposition even when the syscall number is not allow-listed.
#[derive(Copy, Clone, Debug)]
pub struct IpRule {
    pub start: RemoteCodePtr,
    pub end: RemoteCodePtr,
    pub disposition: Disposition,
}

impl IpRule {
    pub fn allow_address(ip: RemoteCodePtr) -> IpRule {
        IpRule {
            start: ip,
            end: ip + 1,
            disposition: Disposition::Allow,
        }
    }

    pub fn allow_range(start: RemoteCodePtr, end: RemoteCodePtr) -> IpRule {
        IpRule {
            start,
            end,
            disposition: Disposition::Allow,
        }
    }
}

/// The unconditional allow list: process-lifecycle syscalls the controller
/// observes through ptrace events rather than traps, the signal-return path,
/// and clock_nanosleep, which must never be intercepted even through
/// patching -- glibc's wrapper is retried with the remaining duration after
/// EINTR and a spurious trap in that loop would desynchronize the recording.
pub fn baseline_rules() -> Vec<SyscallRule> {
    vec![
        SyscallRule::allow(libc::SYS_clone),
        SyscallRule::allow(libc::SYS_fork),
        SyscallRule::allow(libc::SYS_vfork),
        SyscallRule::allow(libc::SYS_rt_sigreturn),
        SyscallRule::allow(libc::SYS_clock_nanosleep),
    ]
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum FilterBuildError {
    UndefinedLabel(String),
    DuplicateLabel(String),
    ProgramTooLong(usize),
    BackwardJump(String),
}

impl fmt::Display for FilterBuildError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FilterBuildError::UndefinedLabel(name) => {
                write!(f, "label `{}' referenced but never defined", name)
            }
            FilterBuildError::DuplicateLabel(name) => {
                write!(f, "label `{}' defined more than once", name)
            }
            FilterBuildError::ProgramTooLong(len) => write!(
                f,
                "program has {} instructions, the kernel limit is {}",
                len, BPF_MAXINSNS
            ),
            FilterBuildError::BackwardJump(name) => {
                write!(f, "jump to label `{}' goes backwards", name)
            }
        }
    }
}

impl std::error::Error for FilterBuildError {}

/// Symbolic jump target. Only meaningful for the filter that created it.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Label(usize);

struct LabelInfo {
    name: String,
    location: Option<usize>,
    defined_again: bool,
}

/// Assembles a classifier program. Emission is pass one: instructions are
/// appended with the label id in the offset field and marker bytes in jt/jf,
/// and each label definition records its absolute instruction index in the
/// symbol table. `resolve` is pass two.
pub struct SeccompFilter {
    pub filters: Vec<sock_filter>,
    labels: Vec<LabelInfo>,
}

impl Default for SeccompFilter {
    fn default() -> Self {
        Self::new()
    }
}

impl SeccompFilter {
    pub fn new() -> SeccompFilter {
        SeccompFilter {
            filters: Vec::new(),
            labels: Vec::new(),
        }
    }

    pub fn new_label(&mut self, name: &str) -> Label {
        self.labels.push(LabelInfo {
            name: name.to_owned(),
            location: None,
            defined_again: false,
        });
        Label(self.labels.len() - 1)
    }

    /// Define `label` at the current position. The definition occupies one
    /// instruction which resolution turns into a no-op jump.
    pub fn label(&mut self, label: Label) {
        let here = self.filters.len();
        let info = &mut self.labels[label.0];
        if info.location.is_some() {
            info.defined_again = true;
        } else {
            info.location = Some(here);
        }
        self.filters
            .push(bpf_jump(BPF_JMP | BPF_JA, label.0 as u32, LABEL_JT, LABEL_JF));
    }

    /// Unconditional jump to `label`.
    pub fn jump(&mut self, label: Label) {
        self.filters
            .push(bpf_jump(BPF_JMP | BPF_JA, label.0 as u32, JUMP_JT, JUMP_JF));
    }

    pub fn load_syscall_nr(&mut self) {
        let nr = offset_of!(seccomp_data, nr) as u32;
        self.filters.push(bpf_stmt(BPF_LD | BPF_W | BPF_ABS, nr));
    }

    /// Classic BPF loads are 32 bits wide; this loads the low word of the
    /// instruction pointer, which is all the trusted-range comparisons use.
    pub fn load_syscall_ip(&mut self) {
        let inst_ptr = offset_of!(seccomp_data, instruction_pointer) as u32;
        self.filters
            .push(bpf_stmt(BPF_LD | BPF_W | BPF_ABS, inst_ptr));
    }

    pub fn allow(&mut self) {
        self.filters
            .push(bpf_stmt(BPF_RET | BPF_K, SECCOMP_RET_ALLOW));
    }

    pub fn trace(&mut self) {
        self.filters
            .push(bpf_stmt(BPF_RET | BPF_K, SECCOMP_RET_TRACE | SECCOMP_RET_DATA));
    }

    /// Syscall number must already be loaded. Allows `nr` inline, without a
    /// label, the way the hand-written filters do it.
    pub fn allow_syscall(&mut self, nr: u32) {
        self.filters
            .push(bpf_jump(BPF_JMP | BPF_JEQ | BPF_K, nr, 0, 1));
        self.allow();
    }

    /// Loads the instruction pointer and allows syscalls issued from exactly
    /// `ip`, typically the address just past a trusted stub's syscall
    /// instruction.
    pub fn allow_syscalls_from_callsite(&mut self, ip: RemoteCodePtr) {
        self.load_syscall_ip();
        self.filters
            .push(bpf_jump(BPF_JMP | BPF_JEQ | BPF_K, ip.low_word(), 0, 1));
        self.allow();
    }

    /// Syscall number must already be loaded.
    pub fn jump_if_syscall_eq(&mut self, nr: u32, target: Label) {
        // Equal falls through to the jump, not-equal skips it.
        self.filters
            .push(bpf_jump(BPF_JMP | BPF_JEQ | BPF_K, nr, 0, 1));
        self.jump(target);
    }

    /// Instruction pointer must already be loaded. Range is half-open over
    /// low words.
    pub fn jump_if_ip_in_range(&mut self, start: RemoteCodePtr, end: RemoteCodePtr, target: Label) {
        // ip >= start falls through, otherwise skip the end check and jump.
        self.filters
            .push(bpf_jump(BPF_JMP | BPF_JGE | BPF_K, start.low_word(), 0, 2));
        // ip >= end means out of range: skip the jump.
        self.filters
            .push(bpf_jump(BPF_JMP | BPF_JGE | BPF_K, end.low_word(), 1, 0));
        self.jump(target);
    }

    /// Pass two: rewrite every label jump's offset from the symbol table and
    /// decay label definitions into no-ops. Fails on a referenced-but-
    /// undefined label, a doubly-defined label, a backward jump (classic BPF
    /// only jumps forward) or a program over the kernel limit. A partially
    /// resolved program is never returned.
    pub fn resolve(mut self) -> Result<CompiledFilter, FilterBuildError> {
        if self.filters.len() > BPF_MAXINSNS {
            return Err(FilterBuildError::ProgramTooLong(self.filters.len()));
        }
        for info in &self.labels {
            if info.defined_again {
                return Err(FilterBuildError::DuplicateLabel(info.name.clone()));
            }
        }
        for i in 0..self.filters.len() {
            let insn = self.filters[i];
            if insn.code != BPF_JMP | BPF_JA {
                continue;
            }
            match (insn.jt, insn.jf) {
                (JUMP_JT, JUMP_JF) => {
                    let info = match self.labels.get(insn.k as usize) {
                        Some(info) => info,
                        None => {
                            return Err(FilterBuildError::UndefinedLabel(format!(
                                "label#{}",
                                insn.k
                            )));
                        }
                    };
                    let location = match info.location {
                        Some(location) => location,
                        None => {
                            return Err(FilterBuildError::UndefinedLabel(info.name.clone()));
                        }
                    };
                    if location <= i {
                        return Err(FilterBuildError::BackwardJump(info.name.clone()));
                    }
                    self.filters[i] =
                        bpf_jump(BPF_JMP | BPF_JA, (location - (i + 1)) as u32, 0, 0);
                }
                (LABEL_JT, LABEL_JF) => {
                    self.filters[i] = bpf_jump(BPF_JMP | BPF_JA, 0, 0, 0);
                }
                _ => (),
            }
        }
        Ok(CompiledFilter {
            filters: self.filters,
        })
    }

    /// Compile classification rules into the canonical program: match the
    /// syscall number against the declared rules, then the instruction
    /// pointer against the trusted call-site ranges, and trap everything
    /// else to the controller.
    pub fn compile(
        syscall_rules: &[SyscallRule],
        ip_rules: &[IpRule],
    ) -> Result<CompiledFilter, FilterBuildError> {
        let mut f = SeccompFilter::new();
        let allow_exit = f.new_label("allow");
        let trace_exit = f.new_label("trace");
        let exit_for = |disposition: Disposition| match disposition {
            Disposition::Allow => allow_exit,
            Disposition::Trace => trace_exit,
        };

        f.load_syscall_nr();
        for rule in syscall_rules {
            f.jump_if_syscall_eq(rule.nr, exit_for(rule.disposition));
        }
        if !ip_rules.is_empty() {
            f.load_syscall_ip();
            for rule in ip_rules {
                f.jump_if_ip_in_range(rule.start, rule.end, exit_for(rule.disposition));
            }
        }
        f.label(trace_exit);
        f.trace();
        f.label(allow_exit);
        f.allow();
        f.resolve()
    }
}

/// A fully resolved program: no unresolved labels, length within the kernel
/// limit. Immutable once built.
#[derive(Clone)]
pub struct CompiledFilter {
    filters: Vec<sock_filter>,
}

impl CompiledFilter {
    pub fn len(&self) -> usize {
        self.filters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.filters.is_empty()
    }

    pub fn instructions(&self) -> &[sock_filter] {
        &self.filters
    }

    /// Install this program as the calling thread's mandatory policy.
    ///
    /// Must run before any policed syscall is attempted; installation has no
    /// retroactive effect. It is one-shot and irreversible -- a later
    /// installation can only add restrictions -- and is inherited by forked
    /// and cloned children. Callers must treat failure as fatal: running
    /// without the filter breaks the determinism contract of everything
    /// above this layer.
    pub fn install(&self) -> io::Result<()> {
        let ret = unsafe { libc::prctl(libc::PR_SET_NO_NEW_PRIVS, 1, 0, 0, 0) };
        if ret != 0 {
            return Err(io::Error::last_os_error());
        }
        let prog = sock_fprog {
            len: self.filters.len() as u16,
            filter: self.filters.as_ptr() as *mut sock_filter,
        };
        let ret = unsafe {
            libc::syscall(
                libc::SYS_seccomp,
                SECCOMP_SET_MODE_FILTER,
                0 as libc::c_uint,
                &prog as *const sock_fprog,
            )
        };
        if ret != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    /// Reference interpreter for the opcode subset the builder emits. This
    /// is the per-syscall classification decision visible to collaborators,
    /// and what the filter properties are audited against.
    pub fn evaluate(&self, data: &seccomp_data) -> u32 {
        let raw = unsafe { from_raw_parts(data as *const seccomp_data as *const u8, size_of::<seccomp_data>()) };
        let mut acc: u32 = 0;
        let mut pc: usize = 0;
        loop {
            let insn = self.filters[pc];
            pc += 1;
            if insn.code == BPF_LD | BPF_W | BPF_ABS {
                let at = insn.k as usize;
                let mut word = [0u8; 4];
                word.copy_from_slice(&raw[at..at + 4]);
                acc = u32::from_ne_bytes(word);
            } else if insn.code == BPF_JMP | BPF_JA {
                pc += insn.k as usize;
            } else if insn.code == BPF_JMP | BPF_JEQ | BPF_K {
                pc += usize::from(if acc == insn.k { insn.jt } else { insn.jf });
            } else if insn.code == BPF_JMP | BPF_JGE | BPF_K {
                pc += usize::from(if acc >= insn.k { insn.jt } else { insn.jf });
            } else if insn.code == BPF_JMP | BPF_JGT | BPF_K {
                pc += usize::from(if acc > insn.k { insn.jt } else { insn.jf });
            } else if insn.code == BPF_RET | BPF_K {
                return insn.k;
            } else {
                fatal!("unsupported opcode {:#x} at instruction {}", insn.code, pc - 1);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::preload_interface::untraced_syscall_ip;

    fn data(nr: i64, ip: usize) -> seccomp_data {
        seccomp_data {
            nr: nr as i32,
            arch: 0,
            instruction_pointer: ip as u64,
            args: [0; 6],
        }
    }

    fn action(ret: u32) -> u32 {
        ret & !SECCOMP_RET_DATA
    }

    fn insn_tuples(filter: &CompiledFilter) -> Vec<(u16, u8, u8, u32)> {
        filter
            .instructions()
            .iter()
            .map(|i| (i.code, i.jt, i.jf, i.k))
            .collect()
    }

    fn trampoline_rules() -> Vec<IpRule> {
        vec![IpRule::allow_address(untraced_syscall_ip())]
    }

    #[test]
    fn jump_offsets_point_at_their_targets() {
        let mut f = SeccompFilter::new();
        let allow_exit = f.new_label("allow");
        f.load_syscall_nr();
        f.jump_if_syscall_eq(42, allow_exit);
        f.trace();
        f.label(allow_exit);
        f.allow();
        let compiled = f.resolve().unwrap();

        // 0: ld nr
        // 1: jeq 42, +0, +1
        // 2: ja -> label marker at 4, so k = 4 - 3 = 1
        // 3: ret TRACE
        // 4: ja 0 (decayed label)
        // 5: ret ALLOW
        let insns = compiled.instructions();
        assert_eq!(6, insns.len());
        assert_eq!(BPF_JMP | BPF_JEQ | BPF_K, insns[1].code);
        assert_eq!((0, 1), (insns[1].jt, insns[1].jf));
        assert_eq!(BPF_JMP | BPF_JA, insns[2].code);
        assert_eq!(1, insns[2].k);
        assert_eq!(BPF_JMP | BPF_JA, insns[4].code);
        assert_eq!(0, insns[4].k);

        assert_eq!(SECCOMP_RET_ALLOW, action(compiled.evaluate(&data(42, 0))));
        assert_eq!(SECCOMP_RET_TRACE, action(compiled.evaluate(&data(43, 0))));
    }

    #[test]
    fn undefined_label_fails_the_build() {
        let mut f = SeccompFilter::new();
        let nowhere = f.new_label("nowhere");
        f.load_syscall_nr();
        f.jump(nowhere);
        f.trace();
        assert_eq!(
            Err(FilterBuildError::UndefinedLabel("nowhere".into())),
            f.resolve().map(|_| ())
        );
    }

    #[test]
    fn doubly_defined_label_fails_the_build() {
        let mut f = SeccompFilter::new();
        let twice = f.new_label("twice");
        f.label(twice);
        f.trace();
        f.label(twice);
        f.allow();
        assert_eq!(
            Err(FilterBuildError::DuplicateLabel("twice".into())),
            f.resolve().map(|_| ())
        );
    }

    #[test]
    fn backward_jump_fails_the_build() {
        let mut f = SeccompFilter::new();
        let back = f.new_label("back");
        f.label(back);
        f.trace();
        f.jump(back);
        assert_eq!(
            Err(FilterBuildError::BackwardJump("back".into())),
            f.resolve().map(|_| ())
        );
    }

    #[test]
    fn overlong_program_fails_the_build() {
        let mut f = SeccompFilter::new();
        for _ in 0..=BPF_MAXINSNS {
            f.allow();
        }
        assert_eq!(
            Err(FilterBuildError::ProgramTooLong(BPF_MAXINSNS + 1)),
            f.resolve().map(|_| ())
        );
    }

    #[test]
    fn builds_are_deterministic() {
        let a = SeccompFilter::compile(&baseline_rules(), &trampoline_rules()).unwrap();
        let b = SeccompFilter::compile(&baseline_rules(), &trampoline_rules()).unwrap();
        assert_eq!(insn_tuples(&a), insn_tuples(&b));
    }

    #[test]
    fn allowed_syscalls_classify_allow_from_any_ip() {
        let compiled = SeccompFilter::compile(&baseline_rules(), &trampoline_rules()).unwrap();
        for rule in baseline_rules() {
            for ip in &[0usize, 0x400_000, 0x7000_0002, usize::MAX] {
                assert_eq!(
                    SECCOMP_RET_ALLOW,
                    action(compiled.evaluate(&data(rule.nr as i64, *ip))),
                    "syscall {} from {:#x}",
                    rule.nr,
                    ip
                );
            }
        }
    }

    #[test]
    fn unlisted_syscalls_classify_trace_outside_trusted_ranges() {
        let compiled = SeccompFilter::compile(&baseline_rules(), &trampoline_rules()).unwrap();
        for nr in &[libc::SYS_getpid, libc::SYS_read, libc::SYS_openat] {
            for ip in &[0usize, 0x400_000, 0x7000_0000, 0x7000_0003] {
                assert_eq!(
                    SECCOMP_RET_TRACE,
                    action(compiled.evaluate(&data(*nr, *ip))),
                    "syscall {} from {:#x}",
                    nr,
                    ip
                );
            }
        }
    }

    #[test]
    fn trusted_callsite_grants_allow_to_unlisted_syscalls() {
        let compiled = SeccompFilter::compile(&baseline_rules(), &trampoline_rules()).unwrap();
        assert_eq!(
            SECCOMP_RET_ALLOW,
            action(compiled.evaluate(&data(libc::SYS_getpid, untraced_syscall_ip().as_usize())))
        );
    }

    #[test]
    fn ip_ranges_are_half_open() {
        let start = RemoteCodePtr::from_val(0x1000);
        let end = RemoteCodePtr::from_val(0x1010);
        let compiled =
            SeccompFilter::compile(&[], &[IpRule::allow_range(start, end)]).unwrap();
        assert_eq!(SECCOMP_RET_TRACE, action(compiled.evaluate(&data(0, 0xfff))));
        assert_eq!(SECCOMP_RET_ALLOW, action(compiled.evaluate(&data(0, 0x1000))));
        assert_eq!(SECCOMP_RET_ALLOW, action(compiled.evaluate(&data(0, 0x100f))));
        assert_eq!(SECCOMP_RET_TRACE, action(compiled.evaluate(&data(0, 0x1010))));
    }

    #[test]
    fn explicit_trace_rule_beats_later_allow() {
        // First match wins: a trace rule ahead of an allow rule for the same
        // syscall forces the trap path.
        let rules = [
            SyscallRule::trace(libc::SYS_getpid),
            SyscallRule::allow(libc::SYS_getpid),
        ];
        let compiled = SeccompFilter::compile(&rules, &[]).unwrap();
        assert_eq!(
            SECCOMP_RET_TRACE,
            action(compiled.evaluate(&data(libc::SYS_getpid, 0)))
        );
    }

    #[test]
    fn inline_callsite_allow_matches_trusted_ip_only() {
        let mut f = SeccompFilter::new();
        f.load_syscall_nr();
        f.allow_syscall(libc::SYS_rt_sigreturn as u32);
        f.allow_syscalls_from_callsite(untraced_syscall_ip());
        f.trace();
        let compiled = f.resolve().unwrap();

        assert_eq!(
            SECCOMP_RET_ALLOW,
            action(compiled.evaluate(&data(libc::SYS_getpid, untraced_syscall_ip().as_usize())))
        );
        assert_eq!(
            SECCOMP_RET_TRACE,
            action(compiled.evaluate(&data(libc::SYS_getpid, 0x400_000)))
        );
        assert_eq!(
            SECCOMP_RET_ALLOW,
            action(compiled.evaluate(&data(libc::SYS_rt_sigreturn, 0x400_000)))
        );
    }

    #[test]
    fn scenario_getpid_traps_timed_wait_never_does() {
        let trampoline = untraced_syscall_ip();
        let compiled = SeccompFilter::compile(&baseline_rules(), &trampoline_rules()).unwrap();

        // getpid is not allow-listed: any non-trampoline call site traps.
        for ip in &[0usize, 0x400_000, 0x7fff_ffff_f000] {
            assert_eq!(
                SECCOMP_RET_TRACE,
                action(compiled.evaluate(&data(libc::SYS_getpid, *ip)))
            );
        }
        // clock_nanosleep is exempt from interception no matter where it is
        // called from.
        for ip in &[0usize, 0x400_000, trampoline.as_usize()] {
            assert_eq!(
                SECCOMP_RET_ALLOW,
                action(compiled.evaluate(&data(libc::SYS_clock_nanosleep, *ip)))
            );
        }
    }
}
