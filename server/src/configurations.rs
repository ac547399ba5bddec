// SPDX-FileCopyrightText: 2024 Phoenix R&D GmbH <hello@phnx.im>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

use config::{Config, ConfigError, File, Source};
use emberbackend::settings::Settings;

/// The possible runtime environment for our application.
pub enum Environment {
    Local,
    Production,
}

impl Environment {
    pub fn from_env() -> Result<Self, String> {
        std::env::var("APP_ENVIRONMENT")
            .unwrap_or_else(|_| "local".into())
            .try_into()
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Environment::Local => "local",
            Environment::Production => "production",
        }
    }
}

impl TryFrom<String> for Environment {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        match s.to_lowercase().as_str() {
            "local" => Ok(Self::Local),
            "production" => Ok(Self::Production),
            other => Err(format!(
                "{other} is not a supported environment. Use either `local` or `production`."
            )),
        }
    }
}

/// Load the configuration from the configuration file.
pub fn get_configuration(prefix: &str) -> Result<Settings, ConfigError> {
    let base_path = std::env::current_dir().expect("Failed to determine the current directory");
    let configuration_directory = base_path.join(format!("{prefix}configuration"));

    // Detect the running environment. Default to `local` if unspecified.
    let environment = Environment::from_env().map_err(ConfigError::Message)?;

    get_configuration_impl(
        File::from(configuration_directory.join("base")).required(true),
        File::from(configuration_directory.join(environment.as_str())).required(true),
    )
}

/// Load the configuration from the given configuration strings (in YAML
/// format).
pub fn get_configuration_from_str(base: &str, environment: &str) -> Result<Settings, ConfigError> {
    get_configuration_impl(
        File::from_str(base, config::FileFormat::Yaml),
        File::from_str(environment, config::FileFormat::Yaml),
    )
}

fn get_configuration_impl(
    base: impl Source + Send + Sync + 'static,
    environment: impl Source + Send + Sync + 'static,
) -> Result<Settings, ConfigError> {
    let builder = Config::builder()
        // Read the "default" configuration file
        .add_source(base)
        // Layer on the environment-specific values.
        .add_source(environment)
        // Add in settings from environment variables (with a prefix of EMBER
        // and '__' as separator). E.g. `EMBER__APPLICATION__PORT=5001` sets
        // `Settings.application.port`.
        .add_source(config::Environment::with_prefix("EMBER").separator("__"));
    builder.build()?.try_deserialize()
}

#[cfg(test)]
mod tests {
    use super::*;

    const BASE: &str = r#"
application:
  host: 127.0.0.1
  port: 8080
database:
  username: ember
  password: secret
  port: 5432
  host: localhost
  name: ember
redis:
  pubsub: redis://localhost:6379/
  partitions:
    - name: p0
      replicas:
        - redis://localhost:6380/
        - redis://localhost:6381/
metrics:
  dir: ./metrics
  client_id: emb01
"#;

    #[test]
    fn minimal_configuration_parses() {
        let settings = get_configuration_from_str(BASE, "{}").unwrap();
        assert_eq!(settings.application.port, 8080);
        assert_eq!(settings.application.node_id(), "127.0.0.1:8080");
        assert_eq!(settings.redis.partitions.len(), 1);
        assert_eq!(settings.redis.partitions[0].replicas.len(), 2);
        assert!(settings.apns.is_none());
        // defaults kick in for the optional sections
        assert_eq!(settings.offline.message_delay_secs, 5);
        assert_eq!(settings.offline.scan_limit, 300);
        assert_eq!(settings.push.concurrency, 5);
        assert!(!settings.group.plain_uid_support);
    }

    #[test]
    fn environment_overlay_wins() {
        let settings = get_configuration_from_str(
            BASE,
            "application:\n  port: 9999\ngroup:\n  plain_uid_support: true\n",
        )
        .unwrap();
        assert_eq!(settings.application.port, 9999);
        assert!(settings.group.plain_uid_support);
    }
}
