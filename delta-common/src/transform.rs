use std::fmt::Write;

use chrono::{DateTime, NaiveDate, NaiveDateTime};
use serde_json::{json, Number, Value};
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::mapping::{Conversion, DatetimeFormats, FieldRule, MappingSpec};
use crate::record::Record;

/// A declared conversion could not be applied to the value it was given.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConversionError {
    #[error("{conversion:?} on field '{field}' expects a string, got {value}")]
    NotAString {
        field: String,
        conversion: Conversion,
        value: Value,
    },
    #[error("field '{field}': cannot parse '{value}' with format '{format}'")]
    UnparsableDatetime {
        field: String,
        value: String,
        format: String,
    },
    #[error("field '{field}': epoch milliseconds {millis} out of range")]
    EpochOutOfRange { field: String, millis: i64 },
    #[error("field '{field}': '{format}' is not a valid datetime output format")]
    InvalidFormat { field: String, format: String },
    #[error("field '{field}': coordinate {value} is not a number")]
    InvalidCoordinate { field: String, value: Value },
}

/// Map one source record onto the published shape. Without a mapping the record
/// is published as it was delivered.
pub fn transform(record: &Record, mapping: Option<&MappingSpec>) -> Result<Record, ConversionError> {
    let Some(mapping) = mapping else {
        return Ok(record.clone());
    };

    let mut output = Record::new();
    for (field, rule) in mapping.fields() {
        let value = apply_rule(field, rule, record)?;
        output.insert(field.to_owned(), value);
    }
    Ok(output)
}

fn apply_rule(field: &str, rule: &FieldRule, record: &Record) -> Result<Value, ConversionError> {
    match rule {
        FieldRule::Direct(source) => Ok(record.get(source).cloned().unwrap_or(Value::Null)),
        FieldRule::GeoPoint {
            longitude,
            latitude,
        } => geo_point(field, record, longitude, latitude),
        FieldRule::Structured {
            sources,
            conversions,
            datetime,
            prefix,
        } => {
            let resolved = sources.iter().find_map(|source| record.get(source));
            let mut value = match resolved {
                None | Some(Value::Null) => return Ok(Value::Null),
                Some(value) => value.clone(),
            };
            // Text a numeric conversion read its number from, hashed instead of the number
            let mut numeric_source: Option<String> = None;
            for conversion in conversions {
                value = match (conversion, value) {
                    (Conversion::Numeric, Value::String(text)) => {
                        let coerced = numeric(Value::String(text.clone()));
                        if coerced.is_number() {
                            numeric_source = Some(text);
                        }
                        coerced
                    }
                    (Conversion::Hash, Value::Number(n)) => match numeric_source.take() {
                        Some(text) => hash(field, Value::String(text))?,
                        None => hash(field, Value::Number(n))?,
                    },
                    (conversion, value) => convert(field, *conversion, value, datetime)?,
                };
            }
            match prefix {
                Some(prefix) => Ok(Value::String(format!("{prefix}{}", render(&value)))),
                None => Ok(value),
            }
        }
    }
}

fn geo_point(
    field: &str,
    record: &Record,
    longitude: &str,
    latitude: &str,
) -> Result<Value, ConversionError> {
    let present = |name: &str| record.get(name).filter(|v| !v.is_null());
    let (Some(lon), Some(lat)) = (present(longitude), present(latitude)) else {
        return Ok(Value::Null);
    };
    Ok(json!({
        "type": "Point",
        "coordinates": [coordinate(field, lon)?, coordinate(field, lat)?],
    }))
}

fn coordinate(field: &str, value: &Value) -> Result<f64, ConversionError> {
    let parsed = match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    };
    parsed
        .filter(|f| f.is_finite())
        .ok_or_else(|| ConversionError::InvalidCoordinate {
            field: field.to_owned(),
            value: value.clone(),
        })
}

fn convert(
    field: &str,
    conversion: Conversion,
    value: Value,
    formats: &DatetimeFormats,
) -> Result<Value, ConversionError> {
    match conversion {
        Conversion::Strip => with_str(field, conversion, value, |s| s.trim().to_owned()),
        Conversion::Lowercase => with_str(field, conversion, value, str::to_lowercase),
        Conversion::Uppercase => with_str(field, conversion, value, str::to_uppercase),
        Conversion::Capitalize => with_str(field, conversion, value, capitalize),
        Conversion::Numeric => Ok(numeric(value)),
        Conversion::Datetime => datetime(field, value, formats),
        Conversion::Hash => hash(field, value),
    }
}

fn with_str(
    field: &str,
    conversion: Conversion,
    value: Value,
    op: impl Fn(&str) -> String,
) -> Result<Value, ConversionError> {
    match value {
        Value::String(s) => Ok(Value::String(op(&s))),
        other => Err(ConversionError::NotAString {
            field: field.to_owned(),
            conversion,
            value: other,
        }),
    }
}

fn capitalize(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars.flat_map(char::to_lowercase)).collect(),
        None => String::new(),
    }
}

/// Integer when that loses nothing, float otherwise, the original value if
/// neither applies.
fn numeric(value: Value) -> Value {
    match &value {
        Value::String(s) => {
            let trimmed = s.trim();
            if let Ok(int) = trimmed.parse::<i64>() {
                return Value::Number(int.into());
            }
            if let Ok(int) = trimmed.parse::<u64>() {
                return Value::Number(int.into());
            }
            match trimmed.parse::<f64>() {
                Ok(float) if float.is_finite() => integral(float)
                    .or_else(|| Number::from_f64(float).map(Value::Number))
                    .unwrap_or(value),
                _ => value,
            }
        }
        Value::Number(n) if n.is_f64() => n.as_f64().and_then(integral).unwrap_or(value),
        _ => value,
    }
}

fn integral(float: f64) -> Option<Value> {
    const LIMIT: f64 = 9_007_199_254_740_992.0; // 2^53, beyond which f64 skips integers
    if float.fract() == 0.0 && float.abs() <= LIMIT {
        Some(Value::Number((float as i64).into()))
    } else {
        None
    }
}

fn datetime(field: &str, value: Value, formats: &DatetimeFormats) -> Result<Value, ConversionError> {
    let parsed: NaiveDateTime = match &value {
        Value::Number(n) if n.is_i64() || n.is_u64() => {
            let millis = n.as_i64().ok_or_else(|| ConversionError::EpochOutOfRange {
                field: field.to_owned(),
                millis: i64::MAX,
            })?;
            DateTime::from_timestamp(millis / 1000, 0)
                .ok_or_else(|| ConversionError::EpochOutOfRange {
                    field: field.to_owned(),
                    millis,
                })?
                .naive_utc()
        }
        Value::String(s) => parse_datetime(s, &formats.from).ok_or_else(|| {
            ConversionError::UnparsableDatetime {
                field: field.to_owned(),
                value: s.clone(),
                format: formats.from.clone(),
            }
        })?,
        _ => {
            return Err(ConversionError::NotAString {
                field: field.to_owned(),
                conversion: Conversion::Datetime,
                value,
            })
        }
    };

    let mut out = String::new();
    write!(out, "{}", parsed.format(&formats.to)).map_err(|_| ConversionError::InvalidFormat {
        field: field.to_owned(),
        format: formats.to.clone(),
    })?;
    Ok(Value::String(out))
}

/// Date-only formats are accepted and read as midnight.
fn parse_datetime(s: &str, format: &str) -> Option<NaiveDateTime> {
    NaiveDateTime::parse_from_str(s, format)
        .ok()
        .or_else(|| {
            NaiveDate::parse_from_str(s, format)
                .ok()
                .and_then(|date| date.and_hms_opt(0, 0, 0))
        })
}

fn hash(field: &str, value: Value) -> Result<Value, ConversionError> {
    let text = match value {
        Value::String(s) => s,
        Value::Number(n) => n.to_string(),
        other => {
            return Err(ConversionError::NotAString {
                field: field.to_owned(),
                conversion: Conversion::Hash,
                value: other,
            })
        }
    };
    Ok(Value::String(hex::encode(Sha256::digest(text.as_bytes()))))
}

fn render(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(value: Value) -> Record {
        match value {
            Value::Object(map) => map,
            _ => panic!("not an object"),
        }
    }

    fn mapping(value: Value) -> MappingSpec {
        MappingSpec::from_json(value).unwrap()
    }

    fn single(rule: Value, source: Value) -> Result<Value, ConversionError> {
        let spec = mapping(json!({ "out": rule }));
        transform(&record(source), Some(&spec)).map(|mut r| r.remove("out").unwrap())
    }

    #[test]
    fn identity_without_mapping() {
        let r = record(json!({"b": 1, "a": "x", "c": null}));
        assert_eq!(transform(&r, None).unwrap(), r);
    }

    #[test]
    fn direct_rule_copies_or_nulls() {
        let spec = mapping(json!({"name": "last_name", "missing": "nope"}));
        let out = transform(&record(json!({"last_name": "Jansen", "other": 1})), Some(&spec)).unwrap();
        assert_eq!(out, record(json!({"name": "Jansen", "missing": null})));
    }

    #[test]
    fn first_present_candidate_wins() {
        let rule = json!({"source_attribute": ["a", "b"]});
        assert_eq!(single(rule.clone(), json!({"b": "B", "a": "A"})).unwrap(), json!("A"));
        assert_eq!(single(rule.clone(), json!({"b": "B"})).unwrap(), json!("B"));
        assert_eq!(single(rule, json!({"c": "C"})).unwrap(), Value::Null);
    }

    #[test]
    fn null_short_circuits_conversions_and_prefix() {
        let rule = json!({"source_attribute": "a", "conversion": "lowercase", "prefix_value": "p-"});
        assert_eq!(single(rule.clone(), json!({"a": null})).unwrap(), Value::Null);
        assert_eq!(single(rule, json!({})).unwrap(), Value::Null);
    }

    #[test]
    fn string_conversions() {
        let conv = |c: &str, v: &str| single(json!({"source_attribute": "a", "conversion": c}), json!({"a": v})).unwrap();
        assert_eq!(conv("strip", "  ab \t"), json!("ab"));
        assert_eq!(conv("lowercase", "AbC"), json!("abc"));
        assert_eq!(conv("uppercase", "AbC"), json!("ABC"));
        assert_eq!(conv("capitalize", "hELLO world"), json!("Hello world"));
        assert_eq!(conv("capitalize", ""), json!(""));
    }

    #[test]
    fn chained_conversions_apply_in_order() {
        let rule = json!({"source_attribute": "a", "conversion": ["strip", "uppercase"]});
        assert_eq!(single(rule, json!({"a": " ab "})).unwrap(), json!("AB"));

        let stripped_then_hashed =
            single(json!({"source_attribute": "a", "conversion": ["strip", "hash"]}), json!({"a": " ab "})).unwrap();
        let hashed_then_stripped =
            single(json!({"source_attribute": "a", "conversion": ["hash", "strip"]}), json!({"a": " ab "})).unwrap();
        assert_eq!(stripped_then_hashed, json!(hex::encode(Sha256::digest(b"ab"))));
        assert_eq!(hashed_then_stripped, json!(hex::encode(Sha256::digest(b" ab "))));
        assert_ne!(stripped_then_hashed, hashed_then_stripped);
    }

    #[test]
    fn hash_after_numeric_digests_the_delivered_text() {
        let digest = |text: &[u8]| json!(hex::encode(Sha256::digest(text)));
        let chain = |conversions: Value, value: Value| {
            single(json!({"source_attribute": "a", "conversion": conversions}), json!({"a": value})).unwrap()
        };

        assert_eq!(chain(json!(["numeric", "hash"]), json!("0042")), digest(b"0042"));
        assert_ne!(chain(json!(["numeric", "hash"]), json!("0042")), digest(b"42"));
        // Conversions before numeric still shape the hashed text
        assert_eq!(chain(json!(["strip", "numeric", "hash"]), json!(" 0042 ")), digest(b"0042"));
        // Delivered numbers are hashed over their decimal text
        assert_eq!(chain(json!("hash"), json!(42)), digest(b"42"));
        assert_eq!(chain(json!(["numeric", "hash"]), json!(42)), digest(b"42"));

        let err = single(json!({"source_attribute": "a", "conversion": "hash"}), json!({"a": true})).unwrap_err();
        assert!(matches!(err, ConversionError::NotAString { conversion: Conversion::Hash, .. }));
    }

    #[test]
    fn numeric_prefers_integers() {
        let num = |v: Value| single(json!({"source_attribute": "a", "conversion": "numeric"}), json!({"a": v})).unwrap();
        assert_eq!(num(json!("42")), json!(42));
        assert_eq!(num(json!(" -7 ")), json!(-7));
        assert_eq!(num(json!("3.0")), json!(3));
        assert_eq!(num(json!("3.25")), json!(3.25));
        assert_eq!(num(json!(8.0)), json!(8));
        assert_eq!(num(json!("n/a")), json!("n/a"));
        assert_eq!(num(json!(true)), json!(true));
    }

    #[test]
    fn numeric_keeps_unsigned_integers_exact() {
        let num = |v: Value| single(json!({"source_attribute": "a", "conversion": "numeric"}), json!({"a": v})).unwrap();
        assert_eq!(num(json!("18446744073709551615")), json!(18446744073709551615u64));
        assert_eq!(num(json!("9223372036854775808")), json!(9223372036854775808u64));
        // Past u64 only a float is left
        assert_eq!(num(json!("18446744073709551616")), json!(18446744073709551616.0_f64));
    }

    #[test]
    fn datetime_from_string_and_epoch_millis() {
        let rule = json!({
            "source_attribute": "a",
            "conversion": "datetime",
            "format_from": "%d-%m-%Y %H:%M",
            "format_to": "%Y-%m-%dT%H:%M:%SZ"
        });
        assert_eq!(
            single(rule.clone(), json!({"a": "05-03-2021 14:30"})).unwrap(),
            json!("2021-03-05T14:30:00Z")
        );
        assert_eq!(
            single(rule.clone(), json!({"a": 1_614_954_600_999_i64})).unwrap(),
            json!("2021-03-05T14:30:00Z")
        );
        assert!(matches!(
            single(rule, json!({"a": "yesterday"})).unwrap_err(),
            ConversionError::UnparsableDatetime { .. }
        ));
    }

    #[test]
    fn datetime_defaults_and_date_only_formats() {
        let default = json!({"source_attribute": "a", "conversion": "datetime"});
        assert_eq!(
            single(default, json!({"a": "2020-01-02T03:04:05Z"})).unwrap(),
            json!("2020-01-02T03:04:05Z")
        );
        let date_only = json!({"source_attribute": "a", "conversion": "datetime", "format_from": "%Y%m%d"});
        assert_eq!(
            single(date_only, json!({"a": "20200102"})).unwrap(),
            json!("2020-01-02T00:00:00Z")
        );
    }

    #[test]
    fn prefix_applies_after_conversions() {
        let rule = json!({"source_attribute": "a", "conversion": "numeric", "prefix_value": "nr-"});
        assert_eq!(single(rule, json!({"a": "007"})).unwrap(), json!("nr-7"));
    }

    #[test]
    fn geo_point_builds_geojson() {
        let rule = json!({"conversion": "geojson_point", "longitude_attribute": "lon", "latitude_attribute": "lat"});
        assert_eq!(
            single(rule.clone(), json!({"lon": "4.895", "lat": "52.370"})).unwrap(),
            json!({"type": "Point", "coordinates": [4.895, 52.370]})
        );
        assert_eq!(single(rule.clone(), json!({"lon": "4.895"})).unwrap(), Value::Null);
        assert_eq!(single(rule.clone(), json!({"lon": "4.895", "lat": null})).unwrap(), Value::Null);
        assert!(matches!(
            single(rule, json!({"lon": "east", "lat": "52.370"})).unwrap_err(),
            ConversionError::InvalidCoordinate { .. }
        ));
    }

    #[test]
    fn non_string_to_string_conversion_is_an_error() {
        let err = single(json!({"source_attribute": "a", "conversion": "lowercase"}), json!({"a": 12})).unwrap_err();
        assert_eq!(
            err,
            ConversionError::NotAString {
                field: "out".to_string(),
                conversion: Conversion::Lowercase,
                value: json!(12),
            }
        );
    }
}
