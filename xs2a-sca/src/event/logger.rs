//! # Audit trail of SCA events
//!
//! [`EventLogger`] subscribes to the [`EventBus`](crate::event::EventBus) and
//! writes one line per authorisation event. A line is either a short
//! human-readable summary or a JSON object carrying a timestamp and the
//! serialized [`ScaEvent`].
//!
//! ```no_run
//! use std::sync::Arc;
//! use xs2a_sca::event::EventBus;
//! use xs2a_sca::event::logger::{EventLogger, EventLoggerConfig, LogDestination};
//!
//! async fn audit(bus: &EventBus) {
//!     let config = EventLoggerConfig {
//!         destination: LogDestination::File {
//!             path: "/var/log/xs2a-sca/audit.log".into(),
//!         },
//!         structured: true,
//!         log_level: log::Level::Info,
//!     };
//!     bus.subscribe(Arc::new(EventLogger::new(config))).await;
//! }
//! ```

use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Utc;
use serde_json::json;
use tracing::{debug, error, info, trace, warn};

use crate::error::{Error, Result};
use crate::event::{EventSubscriber, ScaEvent};

/// Where audit lines go.
#[derive(Clone)]
pub enum LogDestination {
    /// Emitted as tracing events at the configured level
    Tracing,

    /// Appended to a file, parent directories are created
    File { path: PathBuf },

    /// Handed to a callback
    Custom(Arc<dyn Fn(&str) + Send + Sync>),
}

impl fmt::Debug for LogDestination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogDestination::Tracing => f.write_str("Tracing"),
            LogDestination::File { path } => f.debug_struct("File").field("path", path).finish(),
            LogDestination::Custom(_) => f.write_str("Custom(..)"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct EventLoggerConfig {
    pub destination: LogDestination,
    /// JSON lines instead of plain summaries
    pub structured: bool,
    /// Level for the `Tracing` destination
    pub log_level: log::Level,
}

impl Default for EventLoggerConfig {
    fn default() -> Self {
        Self {
            destination: LogDestination::Tracing,
            structured: false,
            log_level: log::Level::Info,
        }
    }
}

/// Resolved destination. A file that cannot be opened degrades to tracing.
enum Sink {
    Tracing(log::Level),
    File(Mutex<File>),
    Custom(Arc<dyn Fn(&str) + Send + Sync>),
}

/// Event bus subscriber writing the audit trail.
pub struct EventLogger {
    structured: bool,
    sink: Sink,
}

impl EventLogger {
    pub fn new(config: EventLoggerConfig) -> Self {
        let sink = match config.destination {
            LogDestination::Tracing => Sink::Tracing(config.log_level),
            LogDestination::Custom(callback) => Sink::Custom(callback),
            LogDestination::File { path } => match open_append(&path) {
                Ok(file) => Sink::File(Mutex::new(file)),
                Err(err) => {
                    error!("Cannot open audit log {}: {}", path.display(), err);
                    Sink::Tracing(log::Level::Error)
                }
            },
        };

        Self {
            structured: config.structured,
            sink,
        }
    }

    fn render(&self, event: &ScaEvent) -> Result<String> {
        if self.structured {
            let entry = json!({
                "timestamp": Utc::now().to_rfc3339(),
                "event": event,
            });
            Ok(serde_json::to_string(&entry)?)
        } else {
            Ok(summary(event))
        }
    }

    fn write(&self, line: &str) -> Result<()> {
        match &self.sink {
            Sink::Tracing(level) => match level {
                log::Level::Error => error!("{}", line),
                log::Level::Warn => warn!("{}", line),
                log::Level::Info => info!("{}", line),
                log::Level::Debug => debug!("{}", line),
                log::Level::Trace => trace!("{}", line),
            },
            Sink::File(file) => {
                let mut file = file
                    .lock()
                    .map_err(|_| Error::Invariant("audit log mutex poisoned".to_string()))?;
                writeln!(file, "{}", line)?;
                file.flush()?;
            }
            Sink::Custom(callback) => callback(line),
        }
        Ok(())
    }
}

fn open_append(path: &Path) -> std::io::Result<File> {
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir)?;
    }
    OpenOptions::new().create(true).append(true).open(path)
}

fn summary(event: &ScaEvent) -> String {
    let at = Utc::now().format("%Y-%m-%dT%H:%M:%S%.3fZ");
    match event {
        ScaEvent::AuthorisationCreated {
            authorisation_id,
            parent_id,
            sca_approach,
        } => format!(
            "[{}] {} created for {} ({})",
            at, authorisation_id, parent_id, sca_approach
        ),
        ScaEvent::ScaStatusChanged {
            authorisation_id,
            old_status,
            new_status,
            ..
        } => format!(
            "[{}] {} sca status {} -> {}",
            at, authorisation_id, old_status, new_status
        ),
        ScaEvent::AuthorisationRejected {
            authorisation_id,
            error,
            message,
        } => format!("[{}] {} refused {}: {}", at, authorisation_id, error, message),
        ScaEvent::AuthorisationExpired {
            authorisation_id,
            parent_id,
        } => format!("[{}] {} of {} expired", at, authorisation_id, parent_id),
        ScaEvent::ParentStatusChanged {
            parent_id,
            old_status,
            new_status,
        } => format!(
            "[{}] {} status {} -> {}",
            at, parent_id, old_status, new_status
        ),
    }
}

#[async_trait]
impl EventSubscriber for EventLogger {
    async fn handle_event(&self, event: ScaEvent) {
        if let Err(err) = self.render(&event).and_then(|line| self.write(&line)) {
            error!("Dropping audit line: {}", err);
        }
    }
}

impl fmt::Debug for EventLogger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sink = match &self.sink {
            Sink::Tracing(_) => "tracing",
            Sink::File(_) => "file",
            Sink::Custom(_) => "custom",
        };
        f.debug_struct("EventLogger")
            .field("structured", &self.structured)
            .field("sink", &sink)
            .finish()
    }
}
