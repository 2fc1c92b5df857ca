//! Collector configuration.
//!
//! The file is TOML; engines and transports are picked by name and get
//! their own option tables:
//!
//! ```toml
//! [storage]
//! engine = "postgres"
//! transport = "grpc"
//!
//! [storage.postgres]
//! url = "postgres://tracekit@localhost/tracekit"
//!
//! [storage_transport.grpc]
//! listen = "127.0.0.1:9999"
//!
//! [query]
//! transports = ["http", "zipkin"]
//!
//! [query.http]
//! listen = "127.0.0.1:9998"
//!
//! [query.zipkin]
//! listen = "127.0.0.1:9411"
//! ```
//!
//! Lookups stay string-keyed so engine options remain opaque to the
//! collector; every missing piece fails startup naming the section or key.

use thiserror::Error;

#[derive(Error, Debug)]
#[non_exhaustive]
pub enum ConfigError {
    #[error("missing configuration section: {0}")]
    MissingSection(String),

    #[error("missing configuration key: {0}")]
    MissingKey(String),

    #[error("wrong type for configuration {key}; expected type {expected}")]
    WrongValueType { key: String, expected: &'static str },

    #[error("couldn't parse configuration: {0}")]
    Parse(#[from] toml::de::Error),
}

/// A parsed configuration file.
#[derive(Clone, Debug)]
pub struct Config {
    root: toml::Table,
}

impl Config {
    pub fn parse(input: &str) -> Result<Self, ConfigError> {
        Ok(Config {
            root: toml::from_str(input)?,
        })
    }

    fn section(&self, name: &str) -> Result<&toml::Table, ConfigError> {
        self.root
            .get(name)
            .ok_or_else(|| ConfigError::MissingSection(name.to_owned()))?
            .as_table()
            .ok_or_else(|| ConfigError::WrongValueType {
                key: name.to_owned(),
                expected: "table",
            })
    }

    fn string_key(&self, section: &str, key: &str) -> Result<&str, ConfigError> {
        let qualified = || format!("{section}.{key}");
        self.section(section)?
            .get(key)
            .ok_or_else(|| ConfigError::MissingKey(qualified()))?
            .as_str()
            .ok_or_else(|| ConfigError::WrongValueType {
                key: qualified(),
                expected: "string",
            })
    }

    fn sub_table(&self, section: &str, name: &str) -> Result<toml::Table, ConfigError> {
        self.section(section)?
            .get(name)
            .and_then(toml::Value::as_table)
            .cloned()
            .ok_or_else(|| ConfigError::MissingSection(format!("{section}.{name}")))
    }

    /// The name of the storage engine.
    pub fn storage_engine(&self) -> Result<&str, ConfigError> {
        self.string_key("storage", "engine")
    }

    /// The configuration table of the selected storage engine.
    pub fn storage_engine_config(&self) -> Result<toml::Table, ConfigError> {
        self.sub_table("storage", self.storage_engine()?)
    }

    /// The name of the storage transport.
    pub fn storage_transport(&self) -> Result<&str, ConfigError> {
        self.string_key("storage", "transport")
    }

    /// The configuration table of the selected storage transport.
    pub fn storage_transport_config(&self) -> Result<toml::Table, ConfigError> {
        self.sub_table("storage_transport", self.storage_transport()?)
    }

    /// The names of the query transports to run.
    pub fn query_transports(&self) -> Result<Vec<String>, ConfigError> {
        let wrong_type = || ConfigError::WrongValueType {
            key: "query.transports".to_owned(),
            expected: "array of strings",
        };
        let values = self
            .section("query")?
            .get("transports")
            .ok_or_else(|| ConfigError::MissingKey("query.transports".to_owned()))?
            .as_array()
            .ok_or_else(wrong_type)?;
        values
            .iter()
            .map(|value| {
                value
                    .as_str()
                    .map(str::to_owned)
                    .ok_or_else(wrong_type)
            })
            .collect()
    }

    /// The configuration table of one query transport.
    pub fn query_transport_config(&self, name: &str) -> Result<toml::Table, ConfigError> {
        self.sub_table("query", name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FULL: &str = r#"
[storage]
engine = "postgres"
transport = "grpc"

[storage.postgres]
url = "postgres://tracekit@localhost/tracekit"

[storage_transport.grpc]
listen = "127.0.0.1:9999"

[query]
transports = ["http", "zipkin"]

[query.http]
listen = "127.0.0.1:9998"

[query.zipkin]
listen = "127.0.0.1:9411"
"#;

    #[test]
    fn reads_a_full_configuration() {
        let config = Config::parse(FULL).unwrap();
        assert_eq!(config.storage_engine().unwrap(), "postgres");
        assert_eq!(config.storage_transport().unwrap(), "grpc");
        assert_eq!(
            config
                .storage_engine_config()
                .unwrap()
                .get("url")
                .and_then(toml::Value::as_str),
            Some("postgres://tracekit@localhost/tracekit")
        );
        assert_eq!(config.query_transports().unwrap(), vec!["http", "zipkin"]);
        assert_eq!(
            config
                .query_transport_config("zipkin")
                .unwrap()
                .get("listen")
                .and_then(toml::Value::as_str),
            Some("127.0.0.1:9411")
        );
    }

    #[test]
    fn missing_pieces_are_named() {
        let config = Config::parse("[storage]\ntransport = \"grpc\"\n").unwrap();
        assert_eq!(
            config.storage_engine().unwrap_err().to_string(),
            "missing configuration key: storage.engine"
        );

        let config = Config::parse("").unwrap();
        assert_eq!(
            config.query_transports().unwrap_err().to_string(),
            "missing configuration section: query"
        );

        let config = Config::parse("[storage]\nengine = \"postgres\"\n").unwrap();
        assert_eq!(
            config.storage_engine_config().unwrap_err().to_string(),
            "missing configuration section: storage.postgres"
        );
    }

    #[test]
    fn wrong_types_are_reported() {
        let config = Config::parse("[storage]\nengine = 3\n").unwrap();
        assert_eq!(
            config.storage_engine().unwrap_err().to_string(),
            "wrong type for configuration storage.engine; expected type string"
        );

        let config = Config::parse("[query]\ntransports = [3]\n").unwrap();
        assert!(matches!(
            config.query_transports().unwrap_err(),
            ConfigError::WrongValueType { .. }
        ));
    }
}
