mod console;

use crate::logger::console::ConsoleLogger;

pub enum LoggerType {
    Simple,
    Verbose,
}

pub fn init(logger_type: LoggerType) {
    let (logger, level) = match logger_type {
        LoggerType::Verbose => (ConsoleLogger::new_all(), log::LevelFilter::Trace),
        LoggerType::Simple => (
            ConsoleLogger::new_with(vec!["masq_bin".to_string(), "masq_lib".to_string()]),
            log::LevelFilter::Info,
        ),
    };
    if let Err(err) = log::set_boxed_logger(Box::new(logger)) {
        println!("set logger error: {err}");
    } else {
        log::set_max_level(level);
    }
}
