//! Logger initialization.

use std::{fmt::Write, io::IsTerminal, str::FromStr, sync::Once};

use jiff::{Zoned, tz::TimeZone};
use logforth::{append::Stderr, filter::EnvFilter, layout::Layout};

static INIT: Once = Once::new();

/// Layout with UTC timestamps and colored levels when stderr is a terminal.
#[derive(Debug)]
struct UtcLayout {
    no_color: bool,
}

impl Layout for UtcLayout {
    fn format(
        &self,
        record: &log::Record<'_>,
        _diagnostics: &[Box<dyn logforth::diagnostic::Diagnostic>],
    ) -> anyhow::Result<Vec<u8>> {
        let mut output = String::new();

        let now = Zoned::now().with_time_zone(TimeZone::UTC);
        write!(output, "{} ", now.strftime("%Y-%m-%dT%H:%M:%S%.6fZ"))?;

        let level = if self.no_color {
            format!("{:>5}", record.level())
        } else {
            match record.level() {
                log::Level::Error => format!("\x1b[31m{:>5}\x1b[0m", record.level()),
                log::Level::Warn => format!("\x1b[33m{:>5}\x1b[0m", record.level()),
                log::Level::Info => format!("\x1b[32m{:>5}\x1b[0m", record.level()),
                log::Level::Debug => format!("\x1b[34m{:>5}\x1b[0m", record.level()),
                log::Level::Trace => format!("\x1b[35m{:>5}\x1b[0m", record.level()),
            }
        };
        write!(output, "{level}  ")?;

        write!(output, "{}", record.args())?;

        Ok(output.into_bytes())
    }
}

/// Initialize once. `RUST_LOG` wins; `--debug` raises the default filter.
pub fn init(debug: bool) {
    INIT.call_once(move || {
        let default_filter = if debug { "debug" } else { "info" };
        let filter_spec = std::env::var("RUST_LOG").unwrap_or_else(|_| default_filter.to_string());

        let layout = UtcLayout {
            no_color: !std::io::stderr().is_terminal(),
        };

        logforth::builder()
            .dispatch(move |d| {
                let filter = EnvFilter::from_str(&filter_spec).unwrap_or_else(|_| {
                    EnvFilter::from_str("info").expect("default filter should be valid")
                });

                d.filter(filter).append(Stderr::default().with_layout(layout))
            })
            .apply();
    });
}
