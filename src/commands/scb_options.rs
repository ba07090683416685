use std::{ffi::OsString, num::ParseIntError};
use structopt::{clap::AppSettings, StructOpt};

#[derive(Debug, StructOpt)]
#[structopt(
    name = "scb",
    about = "The syscall classification and buffering supervisor",
    after_help = "Use SCB_LOG to control logging; e.g. SCB_LOG=all:warn,seccomp_bpf:debug"
)]
#[structopt(global_settings =
&[AppSettings::AllowNegativeNumbers, AppSettings::UnifiedHelpMessage])]
pub struct ScbOptions {
    #[structopt(
        short = "S",
        long,
        help = "Suppress warnings about issues in the environment that scb has no control over."
    )]
    pub suppress_environment_warnings: bool,

    #[structopt(subcommand)]
    pub cmd: ScbSubCommand,
}

#[derive(Debug, StructOpt)]
pub enum ScbSubCommand {
    /// Print the patch hook table as JSON, for auditing which call-site
    /// shapes the patcher will rewrite.
    #[structopt(name = "dump-hooks")]
    DumpHooks,

    /// Install the classifier and exec a command under it.
    #[structopt(name = "launch")]
    Launch {
        /// Extra syscall numbers to allow unconditionally, ahead of the
        /// trap fallback.
        #[structopt(short = "a", long = "allow", number_of_values = 1)]
        extra_allowed: Vec<i64>,

        /// Extra trusted instruction-pointer ranges as start-end pairs,
        /// e.g. 0x70002000-0x70002020. Normally reported by the patcher as
        /// it installs trampolines.
        #[structopt(
            short = "t",
            long = "trust",
            number_of_values = 1,
            parse(try_from_str = parse_address_range)
        )]
        trusted: Vec<(usize, usize)>,

        /// Program to run under the classifier.
        #[structopt(parse(from_os_str))]
        exe: OsString,

        /// Arguments passed to the program.
        #[structopt(parse(from_os_str))]
        exe_args: Vec<OsString>,
    },
}

fn parse_address(s: &str) -> Result<usize, ParseIntError> {
    let t = s.trim();
    match t.strip_prefix("0x") {
        Some(hex) => usize::from_str_radix(hex, 16),
        None => t.parse::<usize>(),
    }
}

fn parse_address_range(s: &str) -> Result<(usize, usize), ParseIntError> {
    let mut parts = s.splitn(2, '-');
    let start = parse_address(parts.next().unwrap_or(""))?;
    let end = parse_address(parts.next().unwrap_or(""))?;
    Ok((start, end))
}
