//! Human-readable names for the kernel identifiers that show up in this
//! layer's log lines. Only the syscalls the classifier polices or the
//! baseline allow list names are spelled out; everything else falls back to
//! a numeric form.

pub fn syscall_name(nr: i64) -> String {
    match nr {
        libc::SYS_read => "read".into(),
        libc::SYS_write => "write".into(),
        libc::SYS_open => "open".into(),
        libc::SYS_close => "close".into(),
        libc::SYS_mmap => "mmap".into(),
        libc::SYS_mprotect => "mprotect".into(),
        libc::SYS_munmap => "munmap".into(),
        libc::SYS_rt_sigreturn => "rt_sigreturn".into(),
        libc::SYS_rt_sigprocmask => "rt_sigprocmask".into(),
        libc::SYS_clone => "clone".into(),
        libc::SYS_fork => "fork".into(),
        libc::SYS_vfork => "vfork".into(),
        libc::SYS_execve => "execve".into(),
        libc::SYS_exit => "exit".into(),
        libc::SYS_exit_group => "exit_group".into(),
        libc::SYS_getpid => "getpid".into(),
        libc::SYS_gettid => "gettid".into(),
        libc::SYS_nanosleep => "nanosleep".into(),
        libc::SYS_clock_nanosleep => "clock_nanosleep".into(),
        libc::SYS_clock_gettime => "clock_gettime".into(),
        libc::SYS_futex => "futex".into(),
        libc::SYS_seccomp => "seccomp".into(),
        libc::SYS_prctl => "prctl".into(),
        libc::SYS_recvfrom => "recvfrom".into(),
        libc::SYS_sendto => "sendto".into(),
        libc::SYS_fadvise64 => "fadvise64".into(),
        _ => format!("syscall({})", nr),
    }
}

pub fn errno_name(err: i32) -> String {
    match err {
        0 => "SUCCESS".into(),
        libc::EPERM => "EPERM".into(),
        libc::ENOENT => "ENOENT".into(),
        libc::ESRCH => "ESRCH".into(),
        libc::EINTR => "EINTR".into(),
        libc::EIO => "EIO".into(),
        libc::E2BIG => "E2BIG".into(),
        libc::ENOEXEC => "ENOEXEC".into(),
        libc::EBADF => "EBADF".into(),
        libc::ECHILD => "ECHILD".into(),
        libc::EAGAIN => "EAGAIN".into(),
        libc::ENOMEM => "ENOMEM".into(),
        libc::EACCES => "EACCES".into(),
        libc::EFAULT => "EFAULT".into(),
        libc::EBUSY => "EBUSY".into(),
        libc::EEXIST => "EEXIST".into(),
        libc::ENODEV => "ENODEV".into(),
        libc::EINVAL => "EINVAL".into(),
        libc::ENOSPC => "ENOSPC".into(),
        libc::ERANGE => "ERANGE".into(),
        libc::ENOSYS => "ENOSYS".into(),
        libc::ELOOP => "ELOOP".into(),
        libc::ETIMEDOUT => "ETIMEDOUT".into(),
        _ => format!("errno({})", err),
    }
}
