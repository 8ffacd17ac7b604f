use chrono::Local;
use log::{Level, Log, SetLoggerError, set_boxed_logger, set_max_level};
use std::fs::OpenOptions;
use std::io::{BufWriter, Write, stdout};
use std::path::PathBuf;
use std::sync::mpsc;
use std::thread;

enum LogCommand {
    Record(String),
    Flush,
    Terminate,
}

/// Where the writer thread sends finished lines.
#[derive(Debug, Clone, Default)]
pub enum LogSink {
    #[default]
    Stdout,
    File(PathBuf),
}

/// Buffered asynchronous logger. Formatting happens on the calling thread;
/// the write syscall happens on a dedicated writer thread fed over a
/// bounded channel, so the transport's hot paths never block on I/O. When
/// the channel is full the record is dropped rather than blocking.
pub struct GarnetLogger {
    max_level: Level,
    sender: mpsc::SyncSender<LogCommand>,
}

/// Handle returned by [`GarnetLogger::init`]; dropping it leaves the logger
/// running, calling [`LoggerHandle::terminate`] flushes and stops the
/// writer thread.
pub struct LoggerHandle {
    sender: mpsc::SyncSender<LogCommand>,
    join: Option<thread::JoinHandle<()>>,
}

impl LoggerHandle {
    pub fn terminate(mut self) {
        let _ = self.sender.send(LogCommand::Terminate);
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}

impl GarnetLogger {
    pub fn init(
        max_level: Level,
        buffer_size: usize,
        sink: LogSink,
    ) -> Result<LoggerHandle, SetLoggerError> {
        let (sender, receiver) = mpsc::sync_channel(buffer_size);
        let logger = GarnetLogger {
            max_level,
            sender: sender.clone(),
        };

        let join = thread::Builder::new()
            .name("garnet-log-writer".into())
            .spawn(move || {
                let mut writer: BufWriter<Box<dyn Write + Send>> = match sink {
                    LogSink::Stdout => BufWriter::new(Box::new(stdout())),
                    LogSink::File(path) => {
                        match OpenOptions::new().create(true).append(true).open(&path) {
                            Ok(file) => BufWriter::new(Box::new(file)),
                            Err(e) => {
                                eprintln!(
                                    "[GarnetLogger] Cannot open {}: {}, falling back to stdout",
                                    path.display(),
                                    e
                                );
                                BufWriter::new(Box::new(stdout()))
                            }
                        }
                    }
                };
                while let Ok(command) = receiver.recv() {
                    match command {
                        LogCommand::Record(message) => {
                            if let Err(e) = writer.write_all(message.as_bytes()) {
                                eprintln!("[GarnetLogger] Failed to write log record: {}", e);
                            }
                        }
                        LogCommand::Flush => {
                            if let Err(e) = writer.flush() {
                                eprintln!("[GarnetLogger] Failed to flush log: {}", e);
                            }
                        }
                        LogCommand::Terminate => break,
                    }
                }
                // Channel closed or termination requested. Ensure final flush.
                let _ = writer.flush();
            })
            .expect("Failed to spawn logger thread");

        set_boxed_logger(Box::new(logger))?;
        set_max_level(max_level.to_level_filter());
        Ok(LoggerHandle {
            sender,
            join: Some(join),
        })
    }
}

impl Log for GarnetLogger {
    fn enabled(&self, metadata: &log::Metadata) -> bool {
        metadata.level() <= self.max_level
    }

    fn log(&self, record: &log::Record) {
        if self.enabled(record.metadata()) {
            let now = Local::now();
            let message = format!(
                "{} {} [{}] {}\n",
                now.format("%Y-%m-%d %H:%M:%S%.3f"),
                record.level(),
                record.target(),
                record.args()
            );

            // try_send: a full buffer drops the record instead of stalling
            // the update loop.
            let _ = self.sender.try_send(LogCommand::Record(message));
        }
    }

    fn flush(&self) {
        let _ = self.sender.send(LogCommand::Flush);
    }
}
