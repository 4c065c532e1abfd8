// This file is Copyright its original authors, visible in version control history.
//
// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. You may not use this file except in
// accordance with one or both of these licenses.

//! Logging-related objects.

use chrono::Utc;

use std::fmt;
use std::fs;
use std::io::Write;
use std::path::Path;
use std::sync::{Arc, Mutex};

/// The level of a log record.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum LogLevel {
	/// Designates very low priority, often extremely verbose, information.
	Trace,
	/// Designates lower priority information.
	Debug,
	/// Designates useful information.
	Info,
	/// Designates hazardous situations.
	Warn,
	/// Designates very serious errors.
	Error,
}

impl fmt::Display for LogLevel {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		match self {
			LogLevel::Trace => write!(f, "TRACE"),
			LogLevel::Debug => write!(f, "DEBUG"),
			LogLevel::Info => write!(f, "INFO"),
			LogLevel::Warn => write!(f, "WARN"),
			LogLevel::Error => write!(f, "ERROR"),
		}
	}
}

impl From<LogLevel> for log::Level {
	fn from(level: LogLevel) -> Self {
		match level {
			LogLevel::Trace => log::Level::Trace,
			LogLevel::Debug => log::Level::Debug,
			LogLevel::Info => log::Level::Info,
			LogLevel::Warn => log::Level::Warn,
			LogLevel::Error => log::Level::Error,
		}
	}
}

/// A unit of logging output with metadata to enable filtering `module_path`,
/// `file`, and `line` to inform on log's source.
pub struct LogRecord<'a> {
	/// The verbosity level of the message.
	pub level: LogLevel,
	/// The message body.
	pub args: fmt::Arguments<'a>,
	/// The module path of the message.
	pub module_path: &'a str,
	/// The line containing the message.
	pub line: u32,
}

/// Defines the behavior required for writing log records.
///
/// Implementors of this trait are responsible for handling log messages,
/// which may involve formatting, filtering, and forwarding them to specific
/// outputs.
pub trait LogWriter: Send + Sync {
	/// Log the record.
	fn log<'a>(&self, record: LogRecord<'a>);
}

pub(crate) enum Writer {
	/// Writes logs to the file system.
	FileWriter { file: Mutex<fs::File>, max_log_level: LogLevel },
	/// Forwards logs to the `log` facade.
	LogFacadeWriter,
	/// Forwards logs to a custom writer.
	CustomWriter(Arc<dyn LogWriter>),
}

impl LogWriter for Writer {
	fn log<'a>(&self, record: LogRecord<'a>) {
		match self {
			Writer::FileWriter { file, max_log_level } => {
				if record.level < *max_log_level {
					return;
				}

				let log = format!(
					"{} {:<5} [{}:{}] {}\n",
					Utc::now().format("%Y-%m-%d %H:%M:%S%.3f"),
					record.level.to_string(),
					record.module_path,
					record.line,
					record.args
				);

				if let Ok(mut file) = file.lock() {
					let _ = file.write_all(log.as_bytes());
				}
			},
			Writer::LogFacadeWriter => {
				log::logger().log(
					&log::Record::builder()
						.level(record.level.into())
						.args(record.args)
						.target(record.module_path)
						.module_path(Some(record.module_path))
						.line(Some(record.line))
						.build(),
				);
			},
			Writer::CustomWriter(custom_logger) => custom_logger.log(record),
		}
	}
}

/// The logger handed to every component.
pub struct Logger {
	/// Specifies the logger's writer.
	writer: Writer,
}

impl Logger {
	/// Creates a new logger with a filesystem writer. The parameters to this function
	/// are the path to the log file, and the log level.
	pub fn new_fs_writer(file_path: &Path, max_log_level: LogLevel) -> Result<Self, ()> {
		if let Some(parent_dir) = file_path.parent() {
			fs::create_dir_all(parent_dir)
				.map_err(|e| eprintln!("ERROR: Failed to create log parent directory: {}", e))?;
		}

		let file = fs::OpenOptions::new()
			.create(true)
			.append(true)
			.open(file_path)
			.map_err(|e| eprintln!("ERROR: Failed to open log file: {}", e))?;

		Ok(Self { writer: Writer::FileWriter { file: Mutex::new(file), max_log_level } })
	}

	/// Creates a new logger forwarding to the `log` facade.
	pub fn new_log_facade() -> Self {
		Self { writer: Writer::LogFacadeWriter }
	}

	/// Creates a new logger forwarding to the given custom writer.
	pub fn new_custom_writer(log_writer: Arc<dyn LogWriter>) -> Self {
		Self { writer: Writer::CustomWriter(log_writer) }
	}

	/// Logs the given record.
	pub fn log<'a>(&self, record: LogRecord<'a>) {
		self.writer.log(record)
	}
}

macro_rules! log_given_level {
	($logger: expr, $lvl: expr, $($arg: tt)+) => {
		$logger.log($crate::logger::LogRecord {
			level: $lvl,
			args: format_args!($($arg)+),
			module_path: module_path!(),
			line: line!(),
		})
	};
}

macro_rules! log_error {
	($logger: expr, $($arg: tt)*) => {
		$crate::logger::log_given_level!($logger, $crate::logger::LogLevel::Error, $($arg)*)
	};
}

macro_rules! log_warn {
	($logger: expr, $($arg: tt)*) => {
		$crate::logger::log_given_level!($logger, $crate::logger::LogLevel::Warn, $($arg)*)
	};
}

macro_rules! log_info {
	($logger: expr, $($arg: tt)*) => {
		$crate::logger::log_given_level!($logger, $crate::logger::LogLevel::Info, $($arg)*)
	};
}

macro_rules! log_debug {
	($logger: expr, $($arg: tt)*) => {
		$crate::logger::log_given_level!($logger, $crate::logger::LogLevel::Debug, $($arg)*)
	};
}

macro_rules! log_trace {
	($logger: expr, $($arg: tt)*) => {
		$crate::logger::log_given_level!($logger, $crate::logger::LogLevel::Trace, $($arg)*)
	};
}

pub(crate) use {log_debug, log_error, log_given_level, log_info, log_trace, log_warn};
