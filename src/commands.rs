use std::io;

pub mod dump_hooks_command;
pub mod launch_command;
pub mod scb_options;

pub trait ScbCommand {
    fn run(&mut self) -> io::Result<()>;
}
