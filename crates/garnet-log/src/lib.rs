//! Log sink for the transport workspace.
//!
//! The transport logs per-packet detail on `trace!` and state
//! transitions on `debug!`; at streaming rates a single global level is
//! useless, because opening the connection state machine also opens the
//! datagram-dispatch and buffer floods. This sink keeps a per-target
//! level table so noisy subtrees can be capped independently, and stamps every
//! record with the monotonic time since startup (seconds.micros), the
//! same timeline the transport prints its deadlines and TsbPd times in.
//! A session header ties the elapsed stamps back to wall-clock time.
//!
//! Records go to stderr through a shared buffered writer; warnings and
//! errors flush eagerly so they survive a crash, the chatter is flushed
//! on demand via `log::logger().flush()`.

use chrono::Local;
use log::{Level, LevelFilter, Log, Metadata, Record, SetLoggerError};
use std::io::{BufWriter, Stderr, Write, stderr};
use std::sync::Mutex;
use std::time::Instant;

/// Target subtrees capped by [`GarnetLogger::init`]: the per-datagram
/// paths that drown everything else at full rate.
const NOISY_TARGETS: &[&str] = &["garnet_transport::mux", "garnet_transport::buffer"];

pub struct GarnetLogger {
    default_level: LevelFilter,
    /// `(target prefix, cap)`, first match wins.
    overrides: Vec<(String, LevelFilter)>,
    start: Instant,
    sink: Mutex<BufWriter<Stderr>>,
}

impl GarnetLogger {
    pub fn builder() -> Builder {
        Builder {
            default_level: LevelFilter::Info,
            overrides: Vec::new(),
        }
    }

    /// The usual entry point: the given global level, with the known
    /// noisy transport subtrees capped at their milestone lines.
    pub fn init(level: LevelFilter) -> Result<(), SetLoggerError> {
        let mut builder = Self::builder().default_level(level);
        for target in NOISY_TARGETS {
            builder = builder.quiet(target);
        }
        builder.install()
    }

    fn level_for(&self, target: &str) -> LevelFilter {
        for (prefix, level) in &self.overrides {
            if target.starts_with(prefix.as_str()) {
                return *level;
            }
        }
        self.default_level
    }

    fn write_session_header(&self) {
        let Ok(mut sink) = self.sink.lock() else {
            return;
        };
        let _ = writeln!(
            sink,
            "-- garnet log opened {} (stamps are seconds since here) --",
            Local::now().format("%Y-%m-%d %H:%M:%S%.3f %z")
        );
        let _ = sink.flush();
    }
}

/// Configures and installs a [`GarnetLogger`].
pub struct Builder {
    default_level: LevelFilter,
    overrides: Vec<(String, LevelFilter)>,
}

impl Builder {
    pub fn default_level(mut self, level: LevelFilter) -> Self {
        self.default_level = level;
        self
    }

    /// Pins every target starting with `prefix` to `level`, regardless
    /// of the global default.
    pub fn target_level(mut self, prefix: &str, level: LevelFilter) -> Self {
        self.overrides.push((prefix.to_string(), level));
        self
    }

    /// Caps a target subtree at milestones: per-packet chatter stays
    /// out of the way while progress lines and warnings still land.
    pub fn quiet(self, prefix: &str) -> Self {
        self.target_level(prefix, LevelFilter::Info)
    }

    pub fn build(self) -> GarnetLogger {
        GarnetLogger {
            default_level: self.default_level,
            overrides: self.overrides,
            start: Instant::now(),
            sink: Mutex::new(BufWriter::new(stderr())),
        }
    }

    pub fn install(self) -> Result<(), SetLoggerError> {
        // The facade's fast-path gate must admit the most verbose level
        // any target can reach.
        let mut max = self.default_level;
        for (_, level) in &self.overrides {
            max = max.max(*level);
        }
        let logger = self.build();
        logger.write_session_header();
        log::set_boxed_logger(Box::new(logger))?;
        log::set_max_level(max);
        Ok(())
    }
}

impl Log for GarnetLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= self.level_for(metadata.target())
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let elapsed = self.start.elapsed();
        let Ok(mut sink) = self.sink.lock() else {
            return;
        };
        let _ = writeln!(
            sink,
            "{:>6}.{:06} {:<5} [{}] {}",
            elapsed.as_secs(),
            elapsed.subsec_micros(),
            record.level(),
            short_target(record.target()),
            record.args()
        );
        if record.level() <= Level::Warn {
            let _ = sink.flush();
        }
    }

    fn flush(&self) {
        if let Ok(mut sink) = self.sink.lock() {
            let _ = sink.flush();
        }
    }
}

/// Drops the workspace prefix from a target so lines read as
/// `[connection]`, not `[garnet_transport::connection]`.
fn short_target(target: &str) -> &str {
    target
        .strip_prefix("garnet_transport::")
        .or_else(|| target.strip_prefix("garnet::"))
        .unwrap_or(target)
}
