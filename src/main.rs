// Much of the protocol surface here is consumed by the preload library and
// the external controller rather than by this binary.
#![allow(dead_code)]

#[macro_use]
extern crate bitflags;
#[macro_use]
extern crate lazy_static;
#[macro_use]
extern crate static_assertions;
#[macro_use]
extern crate memoffset;

#[macro_use]
mod log;
mod commands;
mod core;
mod flags;
mod kernel_metadata;
mod kernel_supplement;
mod patch_hooks;
mod preload_interface;
mod remote_code_ptr;
mod seccomp_bpf;
mod syscallbuf;
mod util;

use crate::commands::{
    dump_hooks_command::DumpHooksCommand,
    launch_command::LaunchCommand,
    scb_options::{ScbOptions, ScbSubCommand},
    ScbCommand,
};
use nix::sys::utsname::uname;
use std::io;
use structopt::StructOpt;

pub fn assert_prerequisites() {
    let unm = uname();
    let release = unm.release();
    let parts: Vec<&str> = release.split('.').collect();
    if parts.len() < 2 {
        fatal!("Could not parse kernel version string. Got: `{}`", release);
    }

    let maybe_major = parts[0].parse::<u32>();
    let maybe_minor = parts[1].parse::<u32>();
    if maybe_major.is_err() || maybe_minor.is_err() {
        fatal!("Could not parse kernel version string. Got: `{}`", release);
    }

    let (major, minor) = (maybe_major.unwrap(), maybe_minor.unwrap());
    if (major, minor) < (3, 5) {
        clean_fatal!("Your kernel does not support seccomp syscall filtering; need 3.5.0 or better.");
    }
}

fn main() -> io::Result<()> {
    let options = ScbOptions::from_args();
    match &options.cmd {
        ScbSubCommand::DumpHooks => DumpHooksCommand::new().run(),
        ScbSubCommand::Launch { .. } => {
            assert_prerequisites();
            LaunchCommand::new(&options).run()
        }
    }
}
