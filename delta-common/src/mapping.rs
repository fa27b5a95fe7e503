//! Declarative description of the published record shape.
//!
//! A mapping is read from the same JSON layout the field rules have always been
//! configured with:
//!
//! ```json
//! {
//!   "name": "last_name",
//!   "email": {"source_attribute": ["mail", "email"], "conversion": ["strip", "lowercase"]},
//!   "created": {"source_attribute": "created", "conversion": "datetime",
//!               "format_from": "%d-%m-%Y %H:%M", "format_to": "%Y-%m-%dT%H:%M:%SZ"},
//!   "ref": {"source_attribute": "id", "prefix_value": "crm-"},
//!   "geometry": {"conversion": "geojson_point",
//!                "longitude_attribute": "lon", "latitude_attribute": "lat"}
//! }
//! ```
//!
//! Output fields keep the order they are declared in.

use std::str::FromStr;

use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;

pub const DEFAULT_DATETIME_FORMAT: &str = "%Y-%m-%dT%H:%M:%SZ";

const GEOJSON_POINT: &str = "geojson_point";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MappingError {
    #[error("mapping is not valid JSON: {0}")]
    Json(String),
    #[error("mapping must be a JSON object of output field to rule")]
    NotAnObject,
    #[error("rule for '{field}' is invalid: {reason}")]
    InvalidRule { field: String, reason: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Conversion {
    Strip,
    Lowercase,
    Uppercase,
    Capitalize,
    Numeric,
    Datetime,
    Hash,
}

impl FromStr for Conversion {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "strip" => Ok(Conversion::Strip),
            "lowercase" => Ok(Conversion::Lowercase),
            "uppercase" => Ok(Conversion::Uppercase),
            "capitalize" => Ok(Conversion::Capitalize),
            "numeric" => Ok(Conversion::Numeric),
            "datetime" => Ok(Conversion::Datetime),
            "hash" => Ok(Conversion::Hash),
            invalid => Err(format!("unknown conversion '{invalid}'")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatetimeFormats {
    pub from: String,
    pub to: String,
}

impl Default for DatetimeFormats {
    fn default() -> Self {
        Self {
            from: DEFAULT_DATETIME_FORMAT.to_owned(),
            to: DEFAULT_DATETIME_FORMAT.to_owned(),
        }
    }
}

/// How one output field is produced from a source record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldRule {
    /// Copy a single source field, null when absent.
    Direct(String),
    /// First present candidate, then conversions in order, then the prefix.
    Structured {
        sources: Vec<String>,
        conversions: Vec<Conversion>,
        datetime: DatetimeFormats,
        prefix: Option<String>,
    },
    /// `{"type": "Point", "coordinates": [lon, lat]}` from two source fields.
    GeoPoint { longitude: String, latitude: String },
}

#[derive(Deserialize)]
#[serde(untagged)]
enum OneOrMany {
    One(String),
    Many(Vec<String>),
}

impl OneOrMany {
    fn into_vec(self) -> Vec<String> {
        match self {
            OneOrMany::One(one) => vec![one],
            OneOrMany::Many(many) => many,
        }
    }
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct RawRule {
    source_attribute: Option<OneOrMany>,
    conversion: Option<OneOrMany>,
    format_from: Option<String>,
    format_to: Option<String>,
    prefix_value: Option<String>,
    longitude_attribute: Option<String>,
    latitude_attribute: Option<String>,
}

impl FieldRule {
    fn from_json(field: &str, value: Value) -> Result<Self, MappingError> {
        let invalid = |reason: String| MappingError::InvalidRule {
            field: field.to_owned(),
            reason,
        };

        let raw = match value {
            Value::String(source) => return Ok(FieldRule::Direct(source)),
            value @ Value::Object(_) => {
                serde_json::from_value::<RawRule>(value).map_err(|e| invalid(e.to_string()))?
            }
            other => return Err(invalid(format!("expected a string or an object, got {other}"))),
        };

        let conversions = raw.conversion.map(OneOrMany::into_vec).unwrap_or_default();

        if conversions.iter().any(|c| c == GEOJSON_POINT) {
            if conversions.len() > 1 {
                return Err(invalid(format!(
                    "{GEOJSON_POINT} cannot be chained with other conversions"
                )));
            }
            let (Some(longitude), Some(latitude)) =
                (raw.longitude_attribute, raw.latitude_attribute)
            else {
                return Err(invalid(format!(
                    "{GEOJSON_POINT} requires longitude_attribute and latitude_attribute"
                )));
            };
            return Ok(FieldRule::GeoPoint {
                longitude,
                latitude,
            });
        }

        let conversions = conversions
            .iter()
            .map(|c| c.parse::<Conversion>())
            .collect::<Result<Vec<_>, _>>()
            .map_err(invalid)?;

        let defaults = DatetimeFormats::default();
        Ok(FieldRule::Structured {
            sources: raw
                .source_attribute
                .map(OneOrMany::into_vec)
                .unwrap_or_default(),
            conversions,
            datetime: DatetimeFormats {
                from: raw.format_from.unwrap_or(defaults.from),
                to: raw.format_to.unwrap_or(defaults.to),
            },
            prefix: raw.prefix_value,
        })
    }
}

/// Output field name to rule, in declaration order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MappingSpec {
    fields: Vec<(String, FieldRule)>,
}

impl MappingSpec {
    pub fn new(fields: Vec<(String, FieldRule)>) -> Self {
        Self { fields }
    }

    pub fn from_json(value: Value) -> Result<Self, MappingError> {
        let Value::Object(object) = value else {
            return Err(MappingError::NotAnObject);
        };
        let fields = object
            .into_iter()
            .map(|(field, rule)| FieldRule::from_json(&field, rule).map(|rule| (field, rule)))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { fields })
    }

    pub fn fields(&self) -> impl Iterator<Item = (&str, &FieldRule)> {
        self.fields.iter().map(|(name, rule)| (name.as_str(), rule))
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

/// Allow reading a mapping straight from an environment variable.
impl FromStr for MappingSpec {
    type Err = MappingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let value: Value = serde_json::from_str(s).map_err(|e| MappingError::Json(e.to_string()))?;
        Self::from_json(value)
    }
}
