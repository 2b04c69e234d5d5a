//! Logging setup for the piplates binaries.
//!
//! Call [`init_with_default`] once at startup. Under systemd events go to
//! journald, otherwise to stdout.
//! Library code logs through `use crate::tracing::prelude::*`.

use std::env;
use time::OffsetDateTime;
use tracing_subscriber::{
    filter::EnvFilter,
    fmt::{format::Writer, time::FormatTime},
    prelude::*,
};

pub use tracing_subscriber::filter::LevelFilter;

pub mod prelude {
    #[allow(unused_imports)]
    pub use tracing::{debug, error, info, trace, warn};
}

use prelude::*;

/// Initialize logging with a caller-chosen default level.
///
/// `RUST_LOG` still takes precedence when set. The binaries use this to map
/// `--verbose` onto DEBUG without hiding an explicit filter.
pub fn init_with_default(default_level: LevelFilter) {
    if env::var("JOURNAL_STREAM").is_ok() {
        if let Ok(layer) = tracing_journald::layer() {
            tracing_subscriber::registry().with(layer).init();
        } else {
            use_stdout(default_level);
            error!("Failed to initialize journald logging, using stdout.");
        }
    } else {
        use_stdout(default_level);
    }
}

// Log to stdout, filtering according to environment variable RUST_LOG,
// falling back to the given level when it is unset.
fn use_stdout(default_level: LevelFilter) {
    let env_filter = EnvFilter::builder()
        .with_default_directive(default_level.into())
        .with_env_var("RUST_LOG")
        .from_env_lossy();

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer().with_timer(LocalTimer))
        .init();
}

// Format timestamps in local time, to the millisecond. Transactions on the
// plate bus take a few milliseconds each, so whole seconds hide too much.
struct LocalTimer;

impl FormatTime for LocalTimer {
    fn format_time(&self, w: &mut Writer<'_>) -> std::fmt::Result {
        let now = OffsetDateTime::now_local().unwrap_or(OffsetDateTime::now_utc());
        let formatted = now
            .format(time::macros::format_description!(
                "[hour]:[minute]:[second].[subsecond digits:3]"
            ))
            .map_err(|_| std::fmt::Error)?;
        write!(w, "{}", formatted)
    }
}
