use chrono::Local;
use log::{Level, Metadata, Record, SetLoggerError};
use serde::Serialize;

use crate::core::bluetooth::events::{EventBus, LinkEvent};

#[derive(Debug, Serialize, Clone, PartialEq)]
pub struct LogMessage {
    pub level: String,
    pub message: String,
    pub target: String,
    pub timestamp: String,
}

/// Logger that mirrors every record onto the event bus, so subscribers can
/// show the link core's log next to its state changes.
pub struct BusLogger {
    bus: EventBus,
    level: Level,
}

impl BusLogger {
    pub fn new(bus: EventBus, level: Level) -> Self {
        Self { bus, level }
    }

    pub fn init(bus: EventBus, level: Level) -> Result<(), SetLoggerError> {
        log::set_boxed_logger(Box::new(BusLogger::new(bus, level)))
            .map(|()| log::set_max_level(level.to_level_filter()))
    }

    fn emit_log(&self, record: &Record) {
        let log_message = LogMessage {
            level: record.level().to_string(),
            message: record.args().to_string(),
            target: record.target().to_string(),
            timestamp: Local::now().to_rfc3339(),
        };

        // EventBus::publish never logs, no recursion here.
        self.bus.publish(LinkEvent::Log(log_message));
    }
}

impl log::Log for BusLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= self.level
    }

    fn log(&self, record: &Record) {
        if self.enabled(record.metadata()) {
            eprintln!("[{}] {}", record.level(), record.args());
            self.emit_log(record);
        }
    }

    fn flush(&self) {}
}

/// Installs a [`BusLogger`] as the global logger.
pub fn init(bus: EventBus, level: Level) -> Result<(), SetLoggerError> {
    BusLogger::init(bus, level)
}

/// Fallback for hosts that install their logger elsewhere or fail [`init`].
pub fn init_env_logger() {
    let env = env_logger::Env::default().default_filter_or("info");
    if env_logger::Builder::from_env(env).try_init().is_ok() {
        log::info!("Logging initialized");
    }
}
