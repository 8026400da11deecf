//! Observability utilities.

use std::sync::OnceLock;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::types::ObservabilityConfig;

static TRACING_INIT: OnceLock<()> = OnceLock::new();

/// Initialize the process-wide tracing subscriber once.
///
/// The filter comes from [`ObservabilityConfig::log_level`]; it accepts full
/// `EnvFilter` directives, so per-module overrides such as
/// `info,axon_core::manager=trace` work. `json_logs` switches the output
/// format. Later calls (other loops in the same process) are no-ops.
pub fn init_tracing(config: &ObservabilityConfig) {
    TRACING_INIT.get_or_init(|| {
        let filter = EnvFilter::try_new(&config.log_level).unwrap_or_else(|err| {
            eprintln!(
                "invalid log_level directive {:?}: {err}, using info",
                config.log_level
            );
            EnvFilter::new("info")
        });

        let result = if config.json_logs {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().json())
                .try_init()
        } else {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().compact())
                .try_init()
        };

        if let Err(err) = result {
            eprintln!("tracing init skipped: {err}");
        }
    });
}

#[cfg(test)]
mod tests {
    use super::init_tracing;
    use crate::types::ObservabilityConfig;

    #[test]
    fn init_tracing_is_idempotent() {
        init_tracing(&ObservabilityConfig::default());
        // A second call with a different configuration is a no-op.
        init_tracing(&ObservabilityConfig {
            log_level: "debug,axon_core::queue=trace".to_string(),
            json_logs: true,
        });
    }

    #[test]
    fn init_tracing_survives_bad_directive() {
        init_tracing(&ObservabilityConfig {
            log_level: "((not a directive))".to_string(),
            json_logs: false,
        });
    }
}
