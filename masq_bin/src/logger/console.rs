use chrono::Local;
use colored::Colorize;
use log::{Level, Metadata, Record};

pub struct ConsoleLogger {
    all_targets: bool,
    targets: Vec<String>,
}

impl ConsoleLogger {
    pub fn new_all() -> Self {
        Self {
            all_targets: true,
            targets: vec![],
        }
    }

    pub fn new_with(targets: Vec<String>) -> Self {
        Self {
            all_targets: false,
            targets,
        }
    }
}

impl log::Log for ConsoleLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        if self.all_targets {
            return true;
        }
        let target = metadata.target();
        self.targets
            .iter()
            .any(|enabled| target.starts_with(enabled.as_str()))
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let time = Local::now().format("%Y-%m-%d %H:%M:%S");
        let line = format!(
            "[{}] [{:<5}] [{}] {}",
            time,
            record.level(),
            record.metadata().target(),
            record.args()
        );
        match record.level() {
            Level::Error => println!("{}", line.bright_red()),
            Level::Warn => println!("{}", line.bright_yellow()),
            Level::Info => println!("{}", line.bright_blue()),
            Level::Debug => println!("{}", line.bright_cyan()),
            Level::Trace => println!("{}", line.bright_white()),
        }
    }

    fn flush(&self) {}
}
