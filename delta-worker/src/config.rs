use std::num::NonZeroUsize;
use std::str::FromStr;

use delta_common::codec::CodecOptions;
use delta_common::config::{ConsumerConfig, KafkaConfig};
use delta_common::MappingSpec;
use envconfig::Envconfig;
use thiserror::Error;

pub const DEFAULT_CHUNK_SIZE: usize = 300;

#[derive(Envconfig, Clone)]
pub struct Config {
    #[envconfig(from = "BIND_HOST", default = "0.0.0.0")]
    pub host: String,

    #[envconfig(from = "BIND_PORT", default = "3302")]
    pub port: u16,

    #[envconfig(from = "APP_NAME", default = "delta-worker")]
    pub app_name: String,

    #[envconfig(nested = true)]
    pub kafka: KafkaConfig,

    #[envconfig(nested = true)]
    pub consumer: ConsumerConfig,

    #[envconfig(from = "OUTPUT_TOPIC", default = "deltas")]
    pub output_topic: NonEmptyString,

    #[envconfig(from = "REDIS_URL", default = "redis://localhost:6379/")]
    pub redis_url: String,

    // Custom S3-compatible endpoint, e.g. a local MinIO
    #[envconfig(from = "S3_ENDPOINT")]
    pub s3_endpoint: Option<String>,

    #[envconfig(from = "STATE_STORAGE", default = "snapshot_archive")]
    pub state_storage: StateStorageKind,

    #[envconfig(from = "ID_PROPERTY")]
    pub id_property: Option<NonEmptyString>,

    #[envconfig(from = "ENTITY_NAME")]
    pub entity_name: Option<NonEmptyString>,

    #[envconfig(from = "CHUNK_SIZE", default = "300")]
    pub chunk_size: NonZeroUsize,

    #[envconfig(from = "FULL_LOAD", default = "false")]
    pub full_load: bool,

    #[envconfig(from = "DROP_DUPLICATES", default = "true")]
    pub drop_duplicates: bool,

    #[envconfig(from = "COLUMNS_DROP", default = "")]
    pub columns_drop: CommaSeparated,

    #[envconfig(from = "COLUMNS_NONPII", default = "")]
    pub columns_nonpii: CommaSeparated,

    // JSON object of output field to rule, records are published as delivered when unset
    #[envconfig(from = "COLUMNS_PUBLISH")]
    pub columns_publish: Option<MappingSpec>,

    #[envconfig(from = "BATCH_MESSAGE_SIZE")]
    pub batch_message_size: Option<NonZeroUsize>,

    #[envconfig(from = "SUBJECT")]
    pub subject: Option<NonEmptyString>,

    #[envconfig(from = "FILEPATH_PREFIX_FILTER")]
    pub filepath_prefix_filter: Option<String>,

    #[envconfig(from = "INBOX")]
    pub inbox: NonEmptyString,

    #[envconfig(from = "ARCHIVE")]
    pub archive: NonEmptyString,

    #[envconfig(from = "ERROR")]
    pub error: Option<NonEmptyString>,

    #[envconfig(from = "LIST_ATTRIBUTE")]
    pub list_attribute: Option<NonEmptyString>,

    #[envconfig(from = "CSV_DELIMITER", default = ",")]
    pub csv_delimiter: CsvByte,

    #[envconfig(from = "CSV_QUOTE", default = "\"")]
    pub csv_quote: CsvByte,
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ConfigError {
    #[error("STATE_STORAGE=entity_store requires ID_PROPERTY")]
    MissingIdProperty,
    #[error("STATE_STORAGE=entity_store requires ENTITY_NAME")]
    MissingEntityName,
}

impl Config {
    /// Produce a host:port address for binding a TcpListener.
    pub fn bind(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Check the cross-field rules and flatten the settings a run needs.
    pub fn pipeline_settings(&self) -> Result<PipelineSettings, ConfigError> {
        let state = match self.state_storage {
            StateStorageKind::EntityStore => StateSettings::EntityStore {
                id_property: self
                    .id_property
                    .clone()
                    .ok_or(ConfigError::MissingIdProperty)?
                    .0,
                collection: self
                    .entity_name
                    .clone()
                    .ok_or(ConfigError::MissingEntityName)?
                    .0,
                chunk_size: self.chunk_size,
            },
            StateStorageKind::SnapshotArchive => StateSettings::SnapshotArchive {
                id_property: self.id_property.clone().map(|p| p.0),
                columns_nonpii: self.columns_nonpii.0.clone(),
            },
        };

        Ok(PipelineSettings {
            processed_by: self.app_name.clone(),
            topic: self.output_topic.0.clone(),
            inbox: self.inbox.0.clone(),
            archive: self.archive.0.clone(),
            error: self.error.clone().map(|e| e.0),
            path_prefix_filter: self.filepath_prefix_filter.clone().filter(|p| !p.is_empty()),
            full_load: self.full_load,
            drop_duplicates: self.drop_duplicates,
            columns_drop: self.columns_drop.0.clone(),
            mapping: self.columns_publish.clone(),
            batch_size: self.batch_message_size,
            subject: self.subject.clone().map(|s| s.0),
            codec: CodecOptions {
                list_attribute: self.list_attribute.clone().map(|a| a.0),
                csv_delimiter: self.csv_delimiter.0,
                csv_quote: self.csv_quote.0,
            },
            state,
        })
    }
}

/// Everything one pipeline run is parameterized by.
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    /// Reported in the provenance header.
    pub processed_by: String,
    pub topic: String,
    pub inbox: String,
    pub archive: String,
    pub error: Option<String>,
    pub path_prefix_filter: Option<String>,
    pub full_load: bool,
    pub drop_duplicates: bool,
    pub columns_drop: Vec<String>,
    pub mapping: Option<MappingSpec>,
    pub batch_size: Option<NonZeroUsize>,
    pub subject: Option<String>,
    pub codec: CodecOptions,
    pub state: StateSettings,
}

impl PipelineSettings {
    /// Settings for a run that reads from `inbox` and archives to `archive`,
    /// everything else at its default.
    pub fn new(inbox: &str, archive: &str, state: StateSettings) -> Self {
        Self {
            processed_by: "delta-worker".to_owned(),
            topic: "deltas".to_owned(),
            inbox: inbox.to_owned(),
            archive: archive.to_owned(),
            error: None,
            path_prefix_filter: None,
            full_load: false,
            drop_duplicates: true,
            columns_drop: Vec::new(),
            mapping: None,
            batch_size: None,
            subject: None,
            codec: CodecOptions::default(),
            state,
        }
    }

    /// The delivered file already sits in the archive.
    pub fn archives_in_place(&self) -> bool {
        self.inbox == self.archive
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StateSettings {
    EntityStore {
        id_property: String,
        collection: String,
        chunk_size: NonZeroUsize,
    },
    SnapshotArchive {
        /// When set, every record must carry a usable identity.
        id_property: Option<String>,
        columns_nonpii: Vec<String>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateStorageKind {
    EntityStore,
    SnapshotArchive,
}

#[derive(Debug, PartialEq, Eq)]
pub struct UnknownStateStorageError(pub String);

impl FromStr for StateStorageKind {
    type Err = UnknownStateStorageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "entity_store" => Ok(StateStorageKind::EntityStore),
            "snapshot_archive" => Ok(StateStorageKind::SnapshotArchive),
            other => Err(UnknownStateStorageError(other.to_owned())),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommaSeparated(pub Vec<String>);

impl FromStr for CommaSeparated {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(CommaSeparated(
            s.split(',')
                .map(str::trim)
                .filter(|item| !item.is_empty())
                .map(str::to_owned)
                .collect(),
        ))
    }
}

/// A single-byte CSV control character, `\t` spelled out is accepted for tabs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CsvByte(pub u8);

#[derive(Debug, PartialEq, Eq)]
pub struct InvalidCsvByteError;

impl FromStr for CsvByte {
    type Err = InvalidCsvByteError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.as_bytes() {
            [b'\\', b't'] => Ok(CsvByte(b'\t')),
            [byte] if byte.is_ascii() => Ok(CsvByte(*byte)),
            _ => Err(InvalidCsvByteError),
        }
    }
}

#[derive(Debug, Clone)]
pub struct NonEmptyString(pub String);

impl NonEmptyString {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

#[derive(Debug, PartialEq, Eq)]
pub struct StringIsEmptyError;

impl FromStr for NonEmptyString {
    type Err = StringIsEmptyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            Err(StringIsEmptyError)
        } else {
            Ok(NonEmptyString(s.to_owned()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn defaults_for_snapshot_archive() {
        let config =
            Config::init_from_hashmap(&env(&[("INBOX", "inbox"), ("ARCHIVE", "archive")])).unwrap();
        let settings = config.pipeline_settings().unwrap();

        assert_eq!(config.bind(), "0.0.0.0:3302");
        assert!(settings.drop_duplicates);
        assert!(!settings.full_load);
        assert!(settings.batch_size.is_none());
        assert!(settings.mapping.is_none());
        assert_eq!(settings.codec, CodecOptions::default());
        assert_eq!(
            settings.state,
            StateSettings::SnapshotArchive {
                id_property: None,
                columns_nonpii: vec![]
            }
        );
    }

    #[test]
    fn entity_store_requires_identity_and_collection() {
        let base = [
            ("INBOX", "inbox"),
            ("ARCHIVE", "archive"),
            ("STATE_STORAGE", "entity_store"),
        ];
        let config = Config::init_from_hashmap(&env(&base)).unwrap();
        assert_eq!(
            config.pipeline_settings().unwrap_err(),
            ConfigError::MissingIdProperty
        );

        let mut full = base.to_vec();
        full.extend([("ID_PROPERTY", "id"), ("ENTITY_NAME", "Orders"), ("CHUNK_SIZE", "50")]);
        let settings = Config::init_from_hashmap(&env(&full))
            .unwrap()
            .pipeline_settings()
            .unwrap();
        assert_eq!(
            settings.state,
            StateSettings::EntityStore {
                id_property: "id".to_string(),
                collection: "Orders".to_string(),
                chunk_size: NonZeroUsize::new(50).unwrap(),
            }
        );
    }

    #[test]
    fn parses_lists_mapping_and_dialect() {
        let config = Config::init_from_hashmap(&env(&[
            ("INBOX", "inbox"),
            ("ARCHIVE", "archive"),
            ("COLUMNS_DROP", "reported_at, ,exported_by"),
            ("COLUMNS_PUBLISH", r#"{"name": "last_name"}"#),
            ("BATCH_MESSAGE_SIZE", "100"),
            ("CSV_DELIMITER", "\\t"),
        ]))
        .unwrap();
        let settings = config.pipeline_settings().unwrap();
        assert_eq!(settings.columns_drop, vec!["reported_at", "exported_by"]);
        assert_eq!(settings.mapping.map(|m| m.len()), Some(1));
        assert_eq!(settings.batch_size, NonZeroUsize::new(100));
        assert_eq!(settings.codec.csv_delimiter, b'\t');
    }

    #[test]
    fn rejects_invalid_values() {
        assert!("datastore".parse::<StateStorageKind>().is_err());
        assert!("".parse::<NonEmptyString>().is_err());
        assert!(";;".parse::<CsvByte>().is_err());
        assert!(Config::init_from_hashmap(&env(&[
            ("INBOX", "inbox"),
            ("ARCHIVE", "archive"),
            ("CHUNK_SIZE", "0"),
        ]))
        .is_err());
    }
}
