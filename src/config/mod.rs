mod settings;

use config::{Config, ConfigError, Environment, File};

use crate::config::settings::PartialSettings;

pub use settings::{BrokerSettings, ProducerSettings, Settings, StreamSettings, WorkerSettings};

/// Prefix of environment overrides, e.g. `TASKFAN_BROKER__PORT=5700`.
pub const ENV_PREFIX: &str = "TASKFAN";

/// Loads the configuration from `path`, or from `config/default` (if
/// present) when `path` is `None`, then the environment, merged over the
/// defaults. An explicit file must exist.
pub fn load_config_from(path: Option<&str>) -> Result<Settings, ConfigError> {
    let file = match path {
        Some(path) => File::with_name(path).required(true),
        None => File::with_name("config/default").required(false),
    };

    let config = Config::builder()
        .add_source(file)
        .add_source(
            Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        )
        .build()?;

    // Try to deserialize what is available
    let partial: PartialSettings = config.try_deserialize()?;

    Ok(Settings::default().merge(partial))
}
