//! Typed column value parsing.
//!
//! The server encodes most column values as JSON strings. A [`ValueParser`]
//! turns them into typed JSON values using the announced [`Schema`].
//!
//! [`Schema`]: crate::Schema

use crate::error::{ProtocolError, ProtocolResult};
use crate::schema::ColumnInfo;
use serde_json::{Number, Value};

/// Converts raw column values into typed values.
pub trait ValueParser: Send + Sync {
    /// Parses one column value.
    ///
    /// `Null` is passed through untouched by every implementation in this
    /// crate; implementations may assume `value` is non-null.
    fn parse(&self, value: Value, column: &ColumnInfo) -> ProtocolResult<Value>;
}

/// Leaves every value exactly as received.
#[derive(Debug, Clone, Copy, Default)]
pub struct RawValueParser;

impl ValueParser for RawValueParser {
    fn parse(&self, value: Value, _column: &ColumnInfo) -> ProtocolResult<Value> {
        Ok(value)
    }
}

/// Parser for the Postgres text encodings the server emits.
///
/// Handles integers, floats, booleans, `json`/`jsonb` and array literals of
/// those. Unknown types (including `numeric`, whose precision JSON numbers
/// cannot carry) stay as strings.
#[derive(Debug, Clone, Copy, Default)]
pub struct PgValueParser;

impl ValueParser for PgValueParser {
    fn parse(&self, value: Value, column: &ColumnInfo) -> ProtocolResult<Value> {
        let raw = match value {
            Value::String(raw) => raw,
            other => return Ok(other),
        };

        if column.dims > 0 {
            parse_pg_array(&raw, |elem| parse_scalar(elem, &column.type_name))
        } else {
            parse_scalar(&raw, &column.type_name)
        }
    }
}

fn parse_scalar(raw: &str, type_name: &str) -> ProtocolResult<Value> {
    match type_name {
        "int2" | "int4" | "int8" | "oid" => raw
            .parse::<i64>()
            .map(Value::from)
            .map_err(|e| ProtocolError::value_parse(type_name, raw, e.to_string())),
        "float4" | "float8" => {
            let parsed = raw
                .parse::<f64>()
                .map_err(|e| ProtocolError::value_parse(type_name, raw, e.to_string()))?;
            // NaN and infinities have no JSON number form.
            Ok(Number::from_f64(parsed)
                .map(Value::Number)
                .unwrap_or_else(|| Value::String(raw.to_string())))
        }
        "bool" => match raw {
            "t" | "true" => Ok(Value::Bool(true)),
            "f" | "false" => Ok(Value::Bool(false)),
            _ => Err(ProtocolError::value_parse(type_name, raw, "expected t or f")),
        },
        "json" | "jsonb" => serde_json::from_str(raw)
            .map_err(|e| ProtocolError::value_parse(type_name, raw, e.to_string())),
        _ => Ok(Value::String(raw.to_string())),
    }
}

/// Parses a Postgres array literal such as `{1,NULL,"a,b",{2,3}}`.
///
/// `element` converts each non-null element; unquoted `NULL` becomes
/// `Value::Null`.
pub fn parse_pg_array<F>(raw: &str, element: F) -> ProtocolResult<Value>
where
    F: Fn(&str) -> ProtocolResult<Value>,
{
    let chars: Vec<char> = raw.trim().chars().collect();
    let mut pos = 0;
    let value = parse_array_at(&chars, &mut pos, &element, raw)?;
    if pos != chars.len() {
        return Err(ProtocolError::value_parse(
            "array",
            raw,
            "trailing characters after array",
        ));
    }
    Ok(value)
}

fn parse_array_at<F>(chars: &[char], pos: &mut usize, element: &F, raw: &str) -> ProtocolResult<Value>
where
    F: Fn(&str) -> ProtocolResult<Value>,
{
    let malformed = |reason: &str| ProtocolError::value_parse("array", raw, reason);

    if chars.get(*pos) != Some(&'{') {
        return Err(malformed("expected '{'"));
    }
    *pos += 1;

    let mut items = Vec::new();
    if chars.get(*pos) == Some(&'}') {
        *pos += 1;
        return Ok(Value::Array(items));
    }

    loop {
        match chars.get(*pos) {
            Some('{') => items.push(parse_array_at(chars, pos, element, raw)?),
            Some('"') => {
                *pos += 1;
                let mut text = String::new();
                loop {
                    match chars.get(*pos) {
                        Some('\\') => {
                            let escaped = chars.get(*pos + 1).ok_or_else(|| malformed("dangling escape"))?;
                            text.push(*escaped);
                            *pos += 2;
                        }
                        Some('"') => {
                            *pos += 1;
                            break;
                        }
                        Some(c) => {
                            text.push(*c);
                            *pos += 1;
                        }
                        None => return Err(malformed("unterminated quoted element")),
                    }
                }
                items.push(element(&text)?);
            }
            Some(_) => {
                let start = *pos;
                while let Some(c) = chars.get(*pos) {
                    if *c == ',' || *c == '}' {
                        break;
                    }
                    *pos += 1;
                }
                let text: String = chars[start..*pos].iter().collect();
                let text = text.trim();
                if text.eq_ignore_ascii_case("NULL") {
                    items.push(Value::Null);
                } else {
                    items.push(element(text)?);
                }
            }
            None => return Err(malformed("unterminated array")),
        }

        match chars.get(*pos) {
            Some(',') => *pos += 1,
            Some('}') => {
                *pos += 1;
                return Ok(Value::Array(items));
            }
            _ => return Err(malformed("expected ',' or '}'")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn parse(value: Value, type_name: &str) -> Value {
        PgValueParser
            .parse(value, &ColumnInfo::new(type_name))
            .unwrap()
    }

    #[test]
    fn scalars() {
        assert_eq!(parse(json!("42"), "int4"), json!(42));
        assert_eq!(parse(json!("-9000000000"), "int8"), json!(-9_000_000_000i64));
        assert_eq!(parse(json!("1.5"), "float8"), json!(1.5));
        assert_eq!(parse(json!("NaN"), "float8"), json!("NaN"));
        assert_eq!(parse(json!("t"), "bool"), json!(true));
        assert_eq!(parse(json!("false"), "bool"), json!(false));
        assert_eq!(parse(json!("{\"a\":1}"), "jsonb"), json!({"a": 1}));
        assert_eq!(parse(json!("12.50"), "numeric"), json!("12.50"));
        assert_eq!(parse(json!("hello"), "text"), json!("hello"));
    }

    #[test]
    fn non_strings_pass_through() {
        assert_eq!(parse(Value::Null, "int4"), Value::Null);
        assert_eq!(parse(json!(7), "int4"), json!(7));
    }

    #[test]
    fn invalid_scalar() {
        let err = PgValueParser
            .parse(json!("abc"), &ColumnInfo::new("int4"))
            .unwrap_err();
        assert!(matches!(err, ProtocolError::ValueParse { .. }));

        assert!(PgValueParser
            .parse(json!("yes"), &ColumnInfo::new("bool"))
            .is_err());
    }

    #[test]
    fn arrays() {
        let column = ColumnInfo::new("int4").array(1);
        assert_eq!(
            PgValueParser.parse(json!("{1,2,NULL}"), &column).unwrap(),
            json!([1, 2, null])
        );

        let nested = ColumnInfo::new("int4").array(2);
        assert_eq!(
            PgValueParser.parse(json!("{{1,2},{3,4}}"), &nested).unwrap(),
            json!([[1, 2], [3, 4]])
        );

        let text = ColumnInfo::new("text").array(1);
        assert_eq!(
            PgValueParser
                .parse(json!(r#"{"a,b","say \"hi\"",plain,"NULL"}"#), &text)
                .unwrap(),
            json!(["a,b", "say \"hi\"", "plain", "NULL"])
        );

        assert_eq!(
            PgValueParser.parse(json!("{}"), &column).unwrap(),
            json!([])
        );
    }

    #[test]
    fn malformed_arrays() {
        let column = ColumnInfo::new("text").array(1);
        assert!(PgValueParser.parse(json!("{a,b"), &column).is_err());
        assert!(PgValueParser.parse(json!("a,b}"), &column).is_err());
        assert!(PgValueParser.parse(json!("{\"a}"), &column).is_err());
        assert!(PgValueParser.parse(json!("{a}x"), &column).is_err());
    }
}
