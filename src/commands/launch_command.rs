use crate::{
    commands::{
        scb_options::{ScbOptions, ScbSubCommand},
        ScbCommand,
    },
    flags::Flags,
    log::{LogDebug, LogInfo, LogWarn},
    preload_interface::untraced_syscall_ip,
    remote_code_ptr::RemoteCodePtr,
    seccomp_bpf::{baseline_rules, IpRule, SeccompFilter, SyscallRule},
    util::running_under_scb,
};
use nix::unistd::execvp;
use std::{
    env,
    ffi::{CString, OsString},
    io,
    os::unix::ffi::OsStrExt,
};

pub struct LaunchCommand {
    extra_allowed: Vec<i64>,
    trusted: Vec<(usize, usize)>,
    exe: OsString,
    exe_args: Vec<OsString>,
}

impl LaunchCommand {
    pub fn new(options: &ScbOptions) -> LaunchCommand {
        match &options.cmd {
            ScbSubCommand::Launch {
                extra_allowed,
                trusted,
                exe,
                exe_args,
            } => LaunchCommand {
                extra_allowed: extra_allowed.clone(),
                trusted: trusted.clone(),
                exe: exe.clone(),
                exe_args: exe_args.clone(),
            },
            _ => panic!("Unexpected ScbSubCommand variant. Not a `Launch` variant!"),
        }
    }
}

fn to_cstring(os: &OsString) -> io::Result<CString> {
    CString::new(os.as_bytes()).map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))
}

impl ScbCommand for LaunchCommand {
    fn run(&mut self) -> io::Result<()> {
        if running_under_scb() && !Flags::get().suppress_environment_warnings {
            log!(
                LogWarn,
                "Already running under an scb supervisor; the outer classifier still applies"
            );
        }

        let mut rules = baseline_rules();
        rules.extend(self.extra_allowed.iter().map(|nr| SyscallRule::allow(*nr)));

        let mut ip_rules = vec![IpRule::allow_address(untraced_syscall_ip())];
        ip_rules.extend(self.trusted.iter().map(|(start, end)| {
            IpRule::allow_range(RemoteCodePtr::from_val(*start), RemoteCodePtr::from_val(*end))
        }));

        let filter = match SeccompFilter::compile(&rules, &ip_rules) {
            Ok(filter) => filter,
            Err(e) => fatal!("Cannot build the classifier program: {}", e),
        };
        if is_logging!(LogDebug) {
            for (i, insn) in filter.instructions().iter().enumerate() {
                log!(
                    LogDebug,
                    "{:4}: code={:#06x} jt={} jf={} k={:#010x}",
                    i,
                    insn.code,
                    insn.jt,
                    insn.jf,
                    insn.k
                );
            }
        }
        log!(
            LogInfo,
            "Installing a {} instruction classifier ({} syscall rules, {} trusted ranges)",
            filter.len(),
            rules.len(),
            ip_rules.len()
        );

        // The program must be active before the exec'd image issues its
        // first policed syscall; there is no installing it afterwards.
        if let Err(e) = filter.install() {
            fatal!(
                "Cannot install the classifier: {}. Running without it would \
                 break the recording, so not continuing",
                e
            );
        }

        env::set_var("RUNNING_UNDER_SCB", "1");

        let exe = to_cstring(&self.exe)?;
        let mut argv = vec![exe.clone()];
        for arg in &self.exe_args {
            argv.push(to_cstring(arg)?);
        }
        let err = execvp(&exe, &argv).unwrap_err();
        fatal!("Failed to exec {:?}: {}", self.exe, err);
    }
}
