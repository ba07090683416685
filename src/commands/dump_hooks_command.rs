use crate::commands::ScbCommand;
use crate::patch_hooks::SYSCALL_PATCH_HOOKS;
use std::io::{self, stdout, Write};

/// Emits the patch hook table so the call-site shapes the patcher will
/// rewrite can be reviewed without reading the source.
pub struct DumpHooksCommand {}

impl DumpHooksCommand {
    pub fn new() -> DumpHooksCommand {
        DumpHooksCommand {}
    }
}

impl Default for DumpHooksCommand {
    fn default() -> Self {
        DumpHooksCommand::new()
    }
}

impl ScbCommand for DumpHooksCommand {
    fn run(&mut self) -> io::Result<()> {
        let serialized = serde_json::to_string_pretty(&SYSCALL_PATCH_HOOKS).unwrap();
        writeln!(stdout(), "{}", serialized)
    }
}
