// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0
use std::{
    env,
    fmt::{self, Write},
    sync::atomic::{AtomicU64, Ordering},
};

use tracing::{field::Visit, Event, Id, Level, Metadata, Subscriber};
use tracing_core::{
    span::{Attributes, Record},
    Field,
};

struct StringVisitor<'a> {
    string: &'a mut String,
}

impl Visit for StringVisitor<'_> {
    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        let _ = if field.name() == "message" {
            write!(self.string, "{value:?} ")
        } else {
            write!(self.string, "{} = {:?}; ", field.name(), value)
        };
    }
}

struct LogFilter {
    target: Option<String>,
    level: Level,
}

/// Prints events matching `RUST_LOG` to stderr.
///
/// `RUST_LOG` is a comma separated list of `level` or `target=level`
/// entries; an entry enables its level and everything more severe.
pub struct MinimalTracer {
    filters: Vec<LogFilter>,
}

fn string_to_level(string: &str) -> Option<Level> {
    match string.to_lowercase().as_str() {
        "info" => Some(Level::INFO),
        "debug" => Some(Level::DEBUG),
        "warn" | "warning" => Some(Level::WARN),
        "trace" => Some(Level::TRACE),
        "error" => Some(Level::ERROR),
        _ => None,
    }
}

impl MinimalTracer {
    fn from_env_value(env_value: &str) -> Self {
        let filters = env_value
            .split(',')
            .filter_map(|filter| match filter.split_once('=') {
                Some((target, level)) => Some(LogFilter {
                    target: Some(target.to_string()),
                    level: string_to_level(level)?,
                }),
                None => match string_to_level(filter) {
                    Some(level) => Some(LogFilter {
                        target: None,
                        level,
                    }),
                    None => Some(LogFilter {
                        target: Some(filter.to_string()),
                        level: Level::TRACE,
                    }),
                },
            })
            .collect();
        Self { filters }
    }

    /// Registers the tracer as global default when `RUST_LOG` is set.
    pub fn register() -> Result<(), tracing::subscriber::SetGlobalDefaultError> {
        match env::var("RUST_LOG") {
            Ok(env_value) => {
                tracing::subscriber::set_global_default(Self::from_env_value(&env_value))
            },
            Err(_) => Ok(()),
        }
    }
}

static AUTO_ID: AtomicU64 = AtomicU64::new(1);

impl Subscriber for MinimalTracer {
    fn enabled(&self, metadata: &Metadata<'_>) -> bool {
        self.filters.iter().any(|filter| {
            metadata.level() <= &filter.level
                && filter
                    .target
                    .as_ref()
                    .map_or(true, |target| metadata.target().starts_with(target.as_str()))
        })
    }

    fn new_span(&self, _span: &Attributes<'_>) -> Id {
        Id::from_u64(AUTO_ID.fetch_add(1, Ordering::Relaxed))
    }

    fn record(&self, _span: &Id, _values: &Record<'_>) {}

    fn record_follows_from(&self, _span: &Id, _follows: &Id) {}

    fn event(&self, event: &Event<'_>) {
        let metadata = event.metadata();
        let mut text = String::new();
        event.record(&mut StringVisitor { string: &mut text });
        eprintln!("{} {}: {}", metadata.level(), metadata.target(), text);
    }

    fn enter(&self, _span: &Id) {}

    fn exit(&self, _span: &Id) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_filters() {
        let tracer = MinimalTracer::from_env_value("debug,brook_stream_web=trace,bogus=loud");
        assert_eq!(tracer.filters.len(), 2);
        assert_eq!(tracer.filters[0].level, Level::DEBUG);
        assert!(tracer.filters[0].target.is_none());
        assert_eq!(
            tracer.filters[1].target.as_deref(),
            Some("brook_stream_web")
        );
        assert_eq!(tracer.filters[1].level, Level::TRACE);
    }
}
