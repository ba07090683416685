use crate::log::LogDebug;
use crate::preload_interface::{
    syscall_info, syscallbuf_locked_why, PRELOAD_THREAD_LOCALS_SIZE,
};
use std::cell::UnsafeCell;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

/// Whether patched call sites may execute syscalls directly or must defer to
/// the controller. Lives at a fixed address in the shared control region and
/// is read by the external controller, so it is a single word updated with
/// one indivisible store -- an observer never sees a half-written value.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[repr(u32)]
pub enum BufferMode {
    Traced = 0,
    Untraced = 1,
}

pub struct ModeFlag(AtomicU32);

impl Default for ModeFlag {
    fn default() -> Self {
        ModeFlag::new(BufferMode::Traced)
    }
}

impl ModeFlag {
    pub fn new(mode: BufferMode) -> ModeFlag {
        ModeFlag(AtomicU32::new(mode as u32))
    }

    pub fn set(&self, mode: BufferMode) {
        self.0.store(mode as u32, Ordering::SeqCst);
    }

    pub fn get(&self) -> BufferMode {
        match self.0.load(Ordering::SeqCst) {
            0 => BufferMode::Traced,
            _ => BufferMode::Untraced,
        }
    }
}

/// Descriptor life cycle at a patched call site.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[repr(u32)]
pub enum BufferState {
    Idle = 0,
    ArgsWritten,
    FastPathExecuted,
    TrapRequested,
    ResultWritten,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    BadTransition { from: BufferState, to: BufferState },
    /// Every descriptor slot is claimed; the thread must stay on the trap
    /// path.
    NoSlot,
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProtocolError::BadTransition { from, to } => {
                write!(f, "descriptor cannot go from {:?} to {:?}", from, to)
            }
            ProtocolError::NoSlot => write!(f, "no free descriptor slot"),
        }
    }
}

impl std::error::Error for ProtocolError {}

/// Contents of one thread's descriptor slot in the shared control region.
#[repr(C)]
pub struct ThreadDescriptor {
    state: BufferState,
    locked: syscallbuf_locked_why,
    info: syscall_info,
    ret: i64,
}

impl ThreadDescriptor {
    fn new() -> ThreadDescriptor {
        ThreadDescriptor {
            state: BufferState::Idle,
            locked: syscallbuf_locked_why::default(),
            info: syscall_info::default(),
            ret: 0,
        }
    }
}

/// Size reserved per thread on the thread-locals page; bounds how many
/// threads can buffer concurrently.
pub const THREAD_DESCRIPTOR_SLOT_SIZE: usize = 128;
pub const MAX_DESCRIPTOR_SLOTS: usize = PRELOAD_THREAD_LOCALS_SIZE / THREAD_DESCRIPTOR_SLOT_SIZE;

const_assert!(std::mem::size_of::<ThreadDescriptor>() <= THREAD_DESCRIPTOR_SLOT_SIZE);

struct DescriptorCell(UnsafeCell<ThreadDescriptor>);

// Safe because every cell has exactly one writer: the thread holding the
// slot's guard. Claiming goes through an atomic flag.
unsafe impl Sync for DescriptorCell {}

/// The per-thread descriptor storage of the shared control region. Slots are
/// disjoint and single-writer, so record contents need no locking; only slot
/// claiming is synchronized.
pub struct DescriptorTable {
    slots: Vec<DescriptorCell>,
    claimed: Vec<AtomicBool>,
}

impl Default for DescriptorTable {
    fn default() -> Self {
        DescriptorTable::new()
    }
}

impl DescriptorTable {
    pub fn new() -> DescriptorTable {
        let mut slots = Vec::with_capacity(MAX_DESCRIPTOR_SLOTS);
        let mut claimed = Vec::with_capacity(MAX_DESCRIPTOR_SLOTS);
        for _ in 0..MAX_DESCRIPTOR_SLOTS {
            slots.push(DescriptorCell(UnsafeCell::new(ThreadDescriptor::new())));
            claimed.push(AtomicBool::new(false));
        }
        DescriptorTable { slots, claimed }
    }

    /// Claim a free slot for the calling thread. The returned guard is the
    /// slot's only writer until it is dropped.
    pub fn claim(&self) -> Result<SlotGuard<'_>, ProtocolError> {
        for (idx, flag) in self.claimed.iter().enumerate() {
            if flag
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return Ok(SlotGuard { table: self, idx });
            }
        }
        Err(ProtocolError::NoSlot)
    }
}

/// Unique writer for one descriptor slot. Dropping it resets the slot and
/// releases it for another thread.
pub struct SlotGuard<'a> {
    table: &'a DescriptorTable,
    idx: usize,
}

impl SlotGuard<'_> {
    pub fn index(&self) -> usize {
        self.idx
    }

    fn descriptor(&self) -> &mut ThreadDescriptor {
        unsafe { &mut *self.table.slots[self.idx].0.get() }
    }

    pub fn state(&self) -> BufferState {
        self.descriptor().state
    }

    pub fn info(&self) -> syscall_info {
        self.descriptor().info
    }

    pub fn lock(&mut self, why: syscallbuf_locked_why) {
        self.descriptor().locked |= why;
    }

    pub fn unlock(&mut self, why: syscallbuf_locked_why) {
        self.descriptor().locked -= why;
    }

    pub fn is_locked(&self) -> bool {
        !self.descriptor().locked.is_empty()
    }

    fn transition(&mut self, from: BufferState, to: BufferState) -> Result<(), ProtocolError> {
        let d = self.descriptor();
        if d.state != from {
            return Err(ProtocolError::BadTransition { from: d.state, to });
        }
        d.state = to;
        Ok(())
    }

    /// IDLE -> ARGS_WRITTEN. Creates this attempt's record.
    pub fn write_args(&mut self, info: syscall_info) -> Result<(), ProtocolError> {
        self.transition(BufferState::Idle, BufferState::ArgsWritten)?;
        self.descriptor().info = info;
        Ok(())
    }

    /// ARGS_WRITTEN -> FAST_PATH_EXECUTED. The syscall itself has run.
    pub fn note_fast_path_executed(&mut self) -> Result<(), ProtocolError> {
        self.transition(BufferState::ArgsWritten, BufferState::FastPathExecuted)
    }

    /// ARGS_WRITTEN -> TRAP_REQUESTED. Defer to the classifier's trap path;
    /// the controller performs the syscall and writes the result.
    pub fn request_trap(&mut self) -> Result<(), ProtocolError> {
        self.transition(BufferState::ArgsWritten, BufferState::TrapRequested)
    }

    /// FAST_PATH_EXECUTED | TRAP_REQUESTED -> RESULT_WRITTEN.
    pub fn write_result(&mut self, ret: i64) -> Result<(), ProtocolError> {
        let state = self.state();
        if state != BufferState::FastPathExecuted && state != BufferState::TrapRequested {
            return Err(ProtocolError::BadTransition {
                from: state,
                to: BufferState::ResultWritten,
            });
        }
        let d = self.descriptor();
        d.ret = ret;
        d.state = BufferState::ResultWritten;
        Ok(())
    }

    /// RESULT_WRITTEN -> IDLE. Consuming the result destroys the record.
    pub fn take_result(&mut self) -> Result<i64, ProtocolError> {
        self.transition(BufferState::ResultWritten, BufferState::Idle)?;
        let d = self.descriptor();
        let ret = d.ret;
        d.info = syscall_info::default();
        d.ret = 0;
        Ok(ret)
    }
}

impl Drop for SlotGuard<'_> {
    fn drop(&mut self) {
        *self.descriptor() = ThreadDescriptor::new();
        self.table.claimed[self.idx].store(false, Ordering::Release);
    }
}

/// What became of a buffered syscall attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BufferedSyscall {
    /// Executed untraced; the completed record holds the result.
    Fast(i64),
    /// Deferred to the trap path; the controller owns completion.
    Deferred,
}

/// The trampoline-side driver: write the record, consult the mode flag, and
/// either execute the syscall directly or hand the attempt to the trap path.
/// `perform` stands in for the trampoline's untraced syscall instruction.
///
/// A locked slot never enters the fast path: the attempt is deferred without
/// touching the record, so a signal handler interrupting a wrapped syscall
/// cannot corrupt the interrupted record.
pub fn buffered_syscall<F>(
    mode: &ModeFlag,
    slot: &mut SlotGuard<'_>,
    info: syscall_info,
    perform: F,
) -> Result<BufferedSyscall, ProtocolError>
where
    F: FnOnce(&syscall_info) -> i64,
{
    if slot.is_locked() {
        log!(
            LogDebug,
            "slot {} locked, {} stays on the trap path",
            slot.index(),
            crate::kernel_metadata::syscall_name(info.no as i64)
        );
        return Ok(BufferedSyscall::Deferred);
    }
    slot.write_args(info)?;
    match mode.get() {
        BufferMode::Untraced => {
            let ret = perform(&slot.info());
            slot.note_fast_path_executed()?;
            slot.write_result(ret)?;
            Ok(BufferedSyscall::Fast(ret))
        }
        BufferMode::Traced => {
            slot.request_trap()?;
            Ok(BufferedSyscall::Deferred)
        }
    }
}

/// Raw untraced-syscall return convention: values in the top 4096 of the
/// unsigned range are negated errnos.
pub fn untraced_syscall_result(raw: i64) -> Result<i64, i32> {
    if raw as u64 >= -4096i64 as u64 {
        Err(-raw as i32)
    } else {
        Ok(raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel_supplement::{seccomp_data, SECCOMP_RET_ALLOW, SECCOMP_RET_DATA};
    use crate::seccomp_bpf::{baseline_rules, SeccompFilter};
    use std::sync::Arc;
    use std::thread;

    fn info_for(no: i64, args: [u64; 6]) -> syscall_info {
        syscall_info::new(no as u64, args)
    }

    #[test]
    fn fast_path_cycle() {
        let table = DescriptorTable::new();
        let mode = ModeFlag::new(BufferMode::Untraced);
        let mut slot = table.claim().unwrap();

        let info = info_for(libc::SYS_getpid, [0; 6]);
        let out = buffered_syscall(&mode, &mut slot, info, |_| 4242).unwrap();
        assert_eq!(BufferedSyscall::Fast(4242), out);
        assert_eq!(BufferState::ResultWritten, slot.state());
        assert_eq!(info, slot.info());
        assert_eq!(4242, slot.take_result().unwrap());
        // Consuming the result destroyed the record.
        assert_eq!(BufferState::Idle, slot.state());
        assert_eq!(syscall_info::default(), slot.info());
    }

    #[test]
    fn traced_mode_defers_to_trap_path() {
        let table = DescriptorTable::new();
        let mode = ModeFlag::new(BufferMode::Traced);
        let mut slot = table.claim().unwrap();

        let out = buffered_syscall(&mode, &mut slot, info_for(libc::SYS_read, [3, 0, 16, 0, 0, 0]), |_| {
            panic!("fast path must not run in traced mode")
        })
        .unwrap();
        assert_eq!(BufferedSyscall::Deferred, out);
        assert_eq!(BufferState::TrapRequested, slot.state());

        // The controller completes the attempt.
        slot.write_result(16).unwrap();
        assert_eq!(16, slot.take_result().unwrap());
    }

    #[test]
    fn locked_slot_never_buffers() {
        let table = DescriptorTable::new();
        let mode = ModeFlag::new(BufferMode::Untraced);
        let mut slot = table.claim().unwrap();

        slot.lock(syscallbuf_locked_why::LOCKED_TRACEE);
        let out = buffered_syscall(&mode, &mut slot, info_for(libc::SYS_write, [0; 6]), |_| {
            panic!("fast path must not run while locked")
        })
        .unwrap();
        assert_eq!(BufferedSyscall::Deferred, out);
        // The record was never created.
        assert_eq!(BufferState::Idle, slot.state());

        slot.unlock(syscallbuf_locked_why::LOCKED_TRACEE);
        assert!(!slot.is_locked());
        let out = buffered_syscall(&mode, &mut slot, info_for(libc::SYS_write, [0; 6]), |_| 7).unwrap();
        assert_eq!(BufferedSyscall::Fast(7), out);
    }

    #[test]
    fn illegal_transitions_are_rejected() {
        let table = DescriptorTable::new();
        let mut slot = table.claim().unwrap();

        assert_eq!(
            Err(ProtocolError::BadTransition {
                from: BufferState::Idle,
                to: BufferState::ResultWritten,
            }),
            slot.write_result(0)
        );
        assert_eq!(
            Err(ProtocolError::BadTransition {
                from: BufferState::Idle,
                to: BufferState::FastPathExecuted,
            }),
            slot.note_fast_path_executed()
        );

        slot.write_args(info_for(libc::SYS_getpid, [0; 6])).unwrap();
        // A second attempt cannot start before the first completes.
        assert_eq!(
            Err(ProtocolError::BadTransition {
                from: BufferState::ArgsWritten,
                to: BufferState::ArgsWritten,
            }),
            slot.write_args(info_for(libc::SYS_getpid, [0; 6]))
        );
    }

    #[test]
    fn slots_exhaust_then_recycle() {
        let table = DescriptorTable::new();
        let mut guards = Vec::new();
        for _ in 0..MAX_DESCRIPTOR_SLOTS {
            guards.push(table.claim().unwrap());
        }
        assert_eq!(Err(ProtocolError::NoSlot), table.claim().map(|_| ()));
        guards.pop();
        assert!(table.claim().is_ok());
    }

    #[test]
    fn threads_see_only_their_own_slots() {
        let table = Arc::new(DescriptorTable::new());
        let mode = Arc::new(ModeFlag::new(BufferMode::Untraced));

        let mut handles = Vec::new();
        for t in 0..2u64 {
            let table = Arc::clone(&table);
            let mode = Arc::clone(&mode);
            handles.push(thread::spawn(move || {
                let mut slot = table.claim().unwrap();
                let no = if t == 0 { libc::SYS_getpid } else { libc::SYS_gettid };
                let args = [t + 1, t + 2, t + 3, t + 4, t + 5, t + 6];
                for _ in 0..1000 {
                    let out = buffered_syscall(
                        &mode,
                        &mut slot,
                        info_for(no, args),
                        |info| (info.args[0] * 100) as i64,
                    )
                    .unwrap();
                    assert_eq!(BufferedSyscall::Fast(((t + 1) * 100) as i64), out);
                    assert_eq!(no as u64, slot.info().no);
                    assert_eq!(args, slot.info().args);
                    assert_eq!(((t + 1) * 100) as i64, slot.take_result().unwrap());
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
    }

    #[test]
    fn mode_flag_is_observed_whole() {
        let mode = Arc::new(ModeFlag::new(BufferMode::Traced));
        let writer_mode = Arc::clone(&mode);
        let writer = thread::spawn(move || {
            for i in 0..10_000 {
                writer_mode.set(if i % 2 == 0 {
                    BufferMode::Untraced
                } else {
                    BufferMode::Traced
                });
            }
        });
        for _ in 0..10_000 {
            let seen = mode.get();
            assert!(seen == BufferMode::Traced || seen == BufferMode::Untraced);
        }
        writer.join().unwrap();
    }

    #[test]
    fn untraced_result_convention() {
        assert_eq!(Ok(0), untraced_syscall_result(0));
        assert_eq!(Ok(42), untraced_syscall_result(42));
        assert_eq!(Err(libc::EINTR), untraced_syscall_result(-(libc::EINTR as i64)));
        assert_eq!(Err(libc::ENOENT), untraced_syscall_result(-(libc::ENOENT as i64)));
    }

    #[test]
    fn interrupted_timed_wait_retries_to_completion() {
        let compiled = SeccompFilter::compile(&baseline_rules(), &[]).unwrap();
        let classify = |ip: usize| {
            let data = seccomp_data {
                nr: libc::SYS_clock_nanosleep as i32,
                arch: 0,
                instruction_pointer: ip as u64,
                args: [0; 6],
            };
            compiled.evaluate(&data) & !SECCOMP_RET_DATA
        };

        // Fake kernel: sleeps are interrupted twice, consuming 40ms each
        // time, before the third attempt runs to completion.
        let mut interruptions_left = 2;
        let mut kernel_sleep = |requested_ns: u64| -> (i64, u64) {
            if interruptions_left > 0 {
                interruptions_left -= 1;
                (-(libc::EINTR as i64), requested_ns - 40_000_000)
            } else {
                (0, 0)
            }
        };

        let mut remaining: u64 = 100_000_000;
        let mut attempts = 0;
        loop {
            attempts += 1;
            // The caller's retry loop issues the syscall from an ordinary
            // glibc call site; every attempt must execute untraced.
            assert_eq!(SECCOMP_RET_ALLOW, classify(0x400_000 + attempts));
            let (raw, rem) = kernel_sleep(remaining);
            match untraced_syscall_result(raw) {
                Ok(_) => break,
                Err(err) => {
                    assert_eq!(libc::EINTR, err);
                    remaining = rem;
                }
            }
        }
        assert_eq!(3, attempts);
        assert_eq!(20_000_000, remaining);
    }
}
