use log::LevelFilter;

use crate::config::Environment;

/// Dependencies stay at `warn`; our own crate logs at the level picked by
/// the environment or the command line. `RUST_LOG` overrides everything.
pub fn init(environment: Environment, level: Option<LevelFilter>) {
    let mut builder = pretty_env_logger::formatted_timed_builder();
    builder
        .filter_level(LevelFilter::Warn)
        .filter_module(env!("CARGO_CRATE_NAME"), crate_level(environment, level));

    if let Ok(filters) = std::env::var("RUST_LOG") {
        builder.parse_filters(&filters);
    }

    builder.init();
}

fn crate_level(environment: Environment, level: Option<LevelFilter>) -> LevelFilter {
    level.unwrap_or(match environment {
        Environment::Production => LevelFilter::Info,
        Environment::Development => LevelFilter::Debug,
    })
}
