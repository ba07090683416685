use crate::kernel_metadata::errno_name;
use crate::util::running_under_scb;
use backtrace::Backtrace;
use nix::errno::errno;
use std::{
    collections::HashMap,
    env,
    env::var_os,
    fs::{File, OpenOptions},
    io::{self, BufWriter, Result, Write},
    path::Path,
    sync::{Mutex, MutexGuard},
};

#[derive(Clone)]
struct LogModule {
    name: String,
    level: LogLevel,
}

#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Debug)]
pub enum LogLevel {
    LogFatal,
    LogError,
    LogWarn,
    LogInfo,
    LogDebug,
}

pub use LogLevel::*;

struct LogGlobals {
    level_map: HashMap<String, LogLevel>,
    log_modules_cache: HashMap<String, LogModule>,
    /// Possibly buffered
    log_file: Box<dyn Write + Send>,
    default_level: LogLevel,
}

extern "C" fn flush_log_buffer_at_exit() {
    flush_log_buffer();
}

pub fn flush_log_buffer() {
    let mut maybe_log_lock = LOG_GLOBALS.lock();
    match &mut maybe_log_lock {
        Ok(lock) => {
            lock.log_file.flush().unwrap_or(());
        }
        Err(e) => panic!("Could not obtain lock on the scb log: {:?}", e),
    };
}

lazy_static! {
    static ref LOG_GLOBALS: Mutex<LogGlobals> = {
        let maybe_filename = var_os("SCB_LOG_FILE");
        let maybe_append_filename = var_os("SCB_APPEND_LOG_FILE");
        let mut f: Box<dyn Write + Send>;
        if let Some(filename) = maybe_filename {
            f = Box::new(File::create(&filename).unwrap_or_else(|e| {
                panic!(
                    "Could not create `{:?}' specified in SCB_LOG_FILE: {}",
                    filename, e
                )
            }));
        } else if let Some(append_filename) = maybe_append_filename {
            f = Box::new(
                OpenOptions::new()
                    .append(true)
                    .create(true)
                    .open(&append_filename)
                    .unwrap_or_else(|e| {
                        panic!(
                            "Could not append to `{:?}' specified in SCB_APPEND_LOG_FILE: {}",
                            append_filename, e
                        )
                    }),
            );
        } else {
            f = Box::new(io::stderr());
        }

        if let Ok(buf_size) = env::var("SCB_LOG_BUFFER") {
            let log_buffer_size = buf_size.parse::<usize>().unwrap_or_else(|_| {
                panic!("Could not parse `{}' in SCB_LOG_BUFFER as a number", buf_size)
            });
            f = Box::new(BufWriter::with_capacity(log_buffer_size, f));
        }

        let ret = unsafe { libc::atexit(flush_log_buffer_at_exit) };
        assert_eq!(ret, 0);

        let env = if running_under_scb() {
            env::var("SCB_UNDER_SCB_LOG")
        } else {
            env::var("SCB_LOG")
        };

        let (default_level, level_map) = match env {
            Ok(spec) => init_log_levels(&spec),
            Err(_) => (LogError, HashMap::new()),
        };

        Mutex::new(LogGlobals {
            level_map,
            log_modules_cache: HashMap::new(),
            // Possibly buffered
            log_file: f,
            default_level,
        })
    };
}

fn log_level_string_to_level(log_level_string: &str) -> LogLevel {
    match log_level_string {
        "fatal" => LogFatal,
        "error" => LogError,
        "warn" => LogWarn,
        "info" => LogInfo,
        "debug" => LogDebug,
        _ => LogWarn,
    }
}

fn init_log_levels(spec: &str) -> (LogLevel, HashMap<String, LogLevel>) {
    let mut hm: HashMap<String, LogLevel> = HashMap::new();
    let mod_colon_levels = spec.split(',');
    let mut default_level = LogDebug;
    for mod_colon_level in mod_colon_levels {
        let res: Vec<&str> = mod_colon_level.splitn(2, ':').collect();
        if res.len() == 2 {
            let mod_name = res[0].trim();
            let log_level_string = res[1].trim();
            if mod_name == "all" {
                default_level = log_level_string_to_level(log_level_string);
            } else {
                hm.insert(
                    mod_name.to_owned(),
                    log_level_string_to_level(log_level_string),
                );
            }
        }
    }
    (default_level, hm)
}

fn get_log_level(module_name: &str, l: &MutexGuard<LogGlobals>) -> LogLevel {
    // Filenames are case sensitive on Linux, so no lowercasing here.
    match l.level_map.get(module_name) {
        Some(log_level) => *log_level,
        None => l.default_level,
    }
}

fn filename_to_module_name(filename: &str) -> String {
    let path = Path::new(filename);
    path.file_stem().unwrap().to_string_lossy().to_string()
}

fn get_log_module(filename: &str, l: &mut MutexGuard<LogGlobals>) -> LogModule {
    if let Some(log_module) = l.log_modules_cache.get(filename) {
        log_module.to_owned()
    } else {
        let name = filename_to_module_name(filename);
        let level = get_log_level(&name, l);
        let m = LogModule { level, name };
        l.log_modules_cache.insert(filename.to_owned(), m.clone());
        m
    }
}

fn log_name(level: LogLevel) -> String {
    match level {
        LogFatal => "FATAL".into(),
        LogError => "ERROR".into(),
        LogWarn => "WARN".into(),
        LogInfo => "INFO".into(),
        LogDebug => "DEBUG".into(),
    }
}

pub struct NewLineTerminatingOstream {
    enabled: bool,
    message: Vec<u8>,
    lock: MutexGuard<'static, LogGlobals>,
}

impl NewLineTerminatingOstream {
    fn new(
        level: LogLevel,
        filename: &str,
        line: u32,
        always_enabled: bool,
    ) -> Option<NewLineTerminatingOstream> {
        let mut lock = LOG_GLOBALS.lock().unwrap();
        let m = get_log_module(filename, &mut lock);
        let enabled = always_enabled || level <= m.level;
        if enabled {
            let mut stream = NewLineTerminatingOstream {
                message: Vec::new(),
                enabled,
                lock,
            };
            if level == LogDebug {
                write!(stream, "[{}] ", m.name).unwrap();
            } else {
                write_prefix(&mut stream, level, filename, line);
            }

            Some(stream)
        } else {
            None
        }
    }
}

/// Low level. Use the is_logging!() macro instead.
pub fn is_logging(level: LogLevel, filename: &str) -> bool {
    let mut lock = LOG_GLOBALS.lock().unwrap();
    let m = get_log_module(filename, &mut lock);
    level <= m.level
}

impl Drop for NewLineTerminatingOstream {
    fn drop(&mut self) {
        if self.enabled {
            self.write(b"\n").unwrap();
            // Flushes self.message to the log file (which may itself be
            // buffered; that layer flushes at exit).
            self.flush().unwrap_or(());
        }
    }
}

impl Write for NewLineTerminatingOstream {
    fn flush(&mut self) -> Result<()> {
        if !self.message.is_empty() && self.enabled {
            self.lock.log_file.write_all(&self.message)?;
        }
        self.message.clear();
        Ok(())
    }

    fn write(&mut self, buf: &[u8]) -> Result<usize> {
        if self.enabled {
            self.message.extend_from_slice(buf);
        }

        // Pretend the bytes were written even when disabled, otherwise the
        // caller gets a spurious WriteZero error.
        Ok(buf.len())
    }
}

pub fn write_prefix(stream: &mut dyn Write, level: LogLevel, filename: &str, line: u32) {
    write!(stream, "[{} {}:{}", log_name(level), filename, line).unwrap();

    let err = errno();
    if level <= LogWarn && err != 0 {
        write!(stream, " errno: {}", errno_name(err)).unwrap();
    }
    write!(stream, "] ").unwrap();
}

/// This is almost never the function you want. Use the log!() macro instead.
pub fn log(
    log_level: LogLevel,
    filename: &str,
    line: u32,
    always_enabled: bool,
) -> Option<NewLineTerminatingOstream> {
    NewLineTerminatingOstream::new(log_level, filename, line, always_enabled)
}

/// Outputs to the (possibly buffered) log file, or stderr if no log file was
/// specified. The program continues normally afterwards.
macro_rules! log {
    ($log_level:expr, $($args:tt)+) => {
        {
            use std::io::Write;
            let maybe_stream = crate::log::log(
                $log_level,
                file!(),
                line!(),
                false
            );
            match maybe_stream {
                Some(mut stream) => write!(stream, $($args)+).unwrap(),
                None => ()
            }
        }
    };
}

macro_rules! is_logging {
    ($log_level:expr) => {
        crate::log::is_logging($log_level, file!())
    };
}

/// Log at fatal level, dump a backtrace to stderr and abort.
macro_rules! fatal {
    ($($args:tt)+) => {
        {
            {
                use std::io::Write;
                use crate::log::LogFatal;
                let maybe_stream = crate::log::log(
                    LogFatal,
                    file!(),
                    line!(),
                    true
                );
                match maybe_stream {
                   Some(mut stream) => write!(stream, $($args)+).unwrap(),
                   None => ()
                }
            }
            crate::log::notifying_abort(backtrace::Backtrace::new());
            unreachable!();
        }
    };
}

/// Output to stderr always. No backtrace, simply exit.
macro_rules! clean_fatal {
    ($($args:tt)+) => {
        use std::io::stderr;
        crate::log::write_prefix(&mut stderr(), crate::log::LogLevel::LogFatal, file!(), line!());
        eprintln!($($args)+);
        std::process::exit(1);
    };
}

/// Dump the stacktrace and abort.
pub fn notifying_abort(bt: Backtrace) -> ! {
    flush_log_buffer();
    dump_scb_stack(bt);
    std::process::abort();
}

fn dump_scb_stack(bt: Backtrace) {
    eprintln!("=== Start scb backtrace:");
    eprintln!("{:?}", bt);
    eprintln!("=== End scb backtrace");
}
