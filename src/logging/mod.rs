//! Leveled, structured logging sink with an optional user callback.
//! Everything else in the crate depends on this module.

mod rotating_file;

pub use rotating_file::RotatingFileSink;

use std::sync::{Arc, OnceLock, RwLock};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Level {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
    Off,
}

/// File/line/function captured at the call site for the user callback.
#[derive(Debug, Clone, Copy)]
pub struct SourceLocation {
    pub file: &'static str,
    pub line: u32,
    pub function: &'static str,
}

pub type LogCallback = dyn Fn(&str, Level, SourceLocation) + Send + Sync;

struct LoggerState {
    level: Level,
    callback: Option<Arc<LogCallback>>,
    protocol_sink: Option<Arc<RotatingFileSink>>,
}

static STATE: OnceLock<RwLock<LoggerState>> = OnceLock::new();

fn state() -> &'static RwLock<LoggerState> {
    STATE.get_or_init(|| {
        RwLock::new(LoggerState {
            level: Level::Info,
            callback: None,
            protocol_sink: None,
        })
    })
}

/// Sets the minimum level that reaches either `tracing` or the user callback.
pub fn set_level(level: Level) {
    state().write().unwrap().level = level;
}

pub fn current_level() -> Level {
    state().read().unwrap().level
}

/// Installs a callback that receives every log message the level filter
/// admits, in addition to (not instead of) the `tracing` emission.
pub fn set_log_callback<F>(callback: F)
where
    F: Fn(&str, Level, SourceLocation) + Send + Sync + 'static,
{
    state().write().unwrap().callback = Some(Arc::new(callback));
}

pub fn clear_log_callback() {
    state().write().unwrap().callback = None;
}

/// Enables the protocol logger: every inbound/outbound byte stream is hex
/// dumped at `trace` level into its own rotating file.
pub fn enable_protocol_log(sink: RotatingFileSink) {
    state().write().unwrap().protocol_sink = Some(Arc::new(sink));
}

pub fn disable_protocol_log() {
    state().write().unwrap().protocol_sink = None;
}

/// Hex-dumps a frame to the protocol log, if enabled. Cheap no-op otherwise.
pub fn log_protocol_bytes(direction: &str, endpoint: &str, bytes: &[u8]) {
    let guard = state().read().unwrap();
    if let Some(sink) = &guard.protocol_sink {
        let mut line = format!("{direction} {endpoint} ");
        for b in bytes {
            line.push_str(&format!("{b:02x}"));
        }
        sink.write_line(&line);
    }
}

/// Called only by the `log!` macro below; never call directly so that
/// argument formatting stays behind the level check.
#[doc(hidden)]
pub fn dispatch(level: Level, location: SourceLocation, message: std::fmt::Arguments<'_>) {
    let guard = state().read().unwrap();
    if level > guard.level || guard.level == Level::Off {
        return;
    }
    let rendered = message.to_string();
    match level {
        Level::Error => tracing::error!(file = location.file, line = location.line, "{rendered}"),
        Level::Warn => tracing::warn!(file = location.file, line = location.line, "{rendered}"),
        Level::Info => tracing::info!(file = location.file, line = location.line, "{rendered}"),
        Level::Debug => tracing::debug!(file = location.file, line = location.line, "{rendered}"),
        Level::Trace => tracing::trace!(file = location.file, line = location.line, "{rendered}"),
        Level::Off => unreachable!(),
    }
    if let Some(cb) = &guard.callback {
        cb(&rendered, level, location);
    }
}

/// Short-circuits argument formatting entirely when the level is
/// disabled, so a hot `trace!`-style call site costs one branch.
#[macro_export]
macro_rules! cb_log {
    ($level:expr, $($arg:tt)*) => {{
        if $level <= $crate::logging::current_level() && $crate::logging::current_level() != $crate::logging::Level::Off {
            $crate::logging::dispatch(
                $level,
                $crate::logging::SourceLocation {
                    file: file!(),
                    line: line!(),
                    function: module_path!(),
                },
                format_args!($($arg)*),
            );
        }
    }};
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn callback_fires_when_level_admitted() {
        static HITS: AtomicUsize = AtomicUsize::new(0);
        set_level(Level::Debug);
        set_log_callback(|_msg, _level, _loc| {
            HITS.fetch_add(1, Ordering::SeqCst);
        });
        cb_log!(Level::Debug, "hello {}", 42);
        assert!(HITS.load(Ordering::SeqCst) >= 1);
        clear_log_callback();
    }

    #[test]
    fn callback_does_not_fire_below_level() {
        static HITS: AtomicUsize = AtomicUsize::new(0);
        set_level(Level::Warn);
        set_log_callback(|_msg, _level, _loc| {
            HITS.fetch_add(1, Ordering::SeqCst);
        });
        let before = HITS.load(Ordering::SeqCst);
        cb_log!(Level::Trace, "should not format {}", expensive());
        assert_eq!(HITS.load(Ordering::SeqCst), before);
        clear_log_callback();
        set_level(Level::Info);
    }

    fn expensive() -> &'static str {
        "value"
    }
}
