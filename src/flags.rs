use crate::commands::scb_options::ScbOptions;
use structopt::StructOpt;

lazy_static! {
    static ref FLAGS: Flags = init_flags();
}

#[derive(Clone)]
pub struct Flags {
    /// Suppress warnings related to environmental features outside scb's
    /// control.
    pub suppress_environment_warnings: bool,
}

impl Flags {
    pub fn get() -> &'static Flags {
        &*FLAGS
    }
}

pub fn init_flags() -> Flags {
    let options = ScbOptions::from_args();

    Flags {
        suppress_environment_warnings: options.suppress_environment_warnings,
    }
}
