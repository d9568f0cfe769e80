//! Bridges the `log` macros used throughout the engine onto `slog` drains:
//! formatted terminal output for interactive builds, an async append-only
//! file drain for deployments.

use std::{fs, io::Write, path::Path, sync::Mutex};

use log::{LevelFilter, Log, Metadata, Record};
use slog::{o, Drain, Level};

pub struct Logger {
    root: slog::Logger,
    level: LevelFilter,
}

fn term_root() -> slog::Logger {
    let decorator = slog_term::TermDecorator::new().build();
    let format = slog_term::FullFormat::new(decorator).build();
    slog::Logger::root(Mutex::new(format).fuse(), o!())
}

fn file_root(file: fs::File) -> slog::Logger {
    let drain = LogFileDrain {
        file: Mutex::new(file),
    };
    slog::Logger::root(slog_async::Async::new(drain).build().fuse(), o!())
}

impl Logger {
    /// Wraps an slog root the host application already configured.
    pub fn with_root(root: slog::Logger, level: LevelFilter) -> Logger {
        Logger { root, level }
    }

    /// Picks a drain: the terminal in debug builds, `log_path` otherwise.
    /// Falls back to the terminal when the log file cannot be created.
    pub fn pick<P: AsRef<Path>>(level: LevelFilter, log_path: Option<P>) -> Logger {
        let file = if cfg!(debug_assertions) {
            None
        } else {
            log_path.and_then(|path| fs::File::create(path).ok())
        };
        let root = match file {
            Some(file) => file_root(file),
            None => term_root(),
        };
        Logger { root, level }
    }

    /// Installs the logger behind the `log` facade. A second install keeps
    /// the first logger and is a no-op.
    pub fn init<P: AsRef<Path>>(level: LevelFilter, log_path: Option<P>) {
        let logger = Logger::pick(level, log_path);
        if log::set_logger(Box::leak(Box::new(logger))).is_ok() {
            log::set_max_level(level);
        }
    }
}

fn slog_level(level: log::Level) -> Level {
    match level {
        log::Level::Error => Level::Error,
        log::Level::Warn => Level::Warning,
        log::Level::Info => Level::Info,
        log::Level::Debug => Level::Debug,
        log::Level::Trace => Level::Trace,
    }
}

impl Log for Logger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= self.level
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let location = slog::RecordLocation {
            file: record.file_static().unwrap_or(""),
            line: record.line().unwrap_or(0),
            column: 0,
            function: "",
            module: record.module_path_static().unwrap_or(""),
        };
        let header = slog::RecordStatic {
            location: &location,
            level: slog_level(record.metadata().level()),
            tag: record.target(),
        };
        self.root
            .log(&slog::Record::new(&header, record.args(), slog::b!()));
    }

    fn flush(&self) {}
}

struct LogFileDrain {
    file: Mutex<fs::File>,
}

impl Drain for LogFileDrain {
    type Ok = ();
    type Err = slog::Never;

    fn log(
        &self,
        record: &slog::Record,
        _values: &slog::OwnedKVList,
    ) -> Result<Self::Ok, Self::Err> {
        // A failed append is not worth killing the logging thread over.
        let mut file = self.file.lock().unwrap();
        let _ = writeln!(file, "[{}] {}", record.level(), record.msg());
        Ok(())
    }
}
