//! Console tracing setup. `WSB_LOG` (then `RUST_LOG`) overrides the level;
//! `--debug` only changes the default.

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

pub fn init(debug: bool) {
    let fallback = if debug { "debug" } else { "info" };
    let filter = std::env::var("WSB_LOG")
        .ok()
        .and_then(|spec| EnvFilter::try_new(spec).ok())
        .unwrap_or_else(|| {
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback))
        });
    tracing_subscriber::registry()
        .with(fmt::layer().with_filter(filter))
        .init();
}
