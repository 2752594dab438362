//! Entity property values.
//!
//! Wire payloads are plain JSON; at the primitive boundary every value is
//! promoted into a closed variant so the reducer never touches raw JSON.
//! Strings that parse as full ISO-8601 dates or datetimes-with-offset are
//! promoted to the temporal variants and serialize back to the same text.

use std::collections::BTreeMap;
use std::fmt;

use serde::de::{MapAccess, SeqAccess, Visitor};
use serde::ser::{SerializeMap, SerializeSeq};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use time::format_description::well_known::Rfc3339;
use time::macros::format_description;

const DATE_FORMAT: &[time::format_description::BorrowedFormatItem<'static>] =
    format_description!("[year]-[month]-[day]");

/// Reserved prefix for internal metadata keys.
pub const RESERVED_KEY_PREFIX: char = '_';

#[derive(Clone, Debug, PartialEq)]
pub enum PropValue {
    String(String),
    Number(f64),
    Bool(bool),
    Date(time::Date),
    DateTime(time::OffsetDateTime),
    List(Vec<PropValue>),
    Map(BTreeMap<String, PropValue>),
}

pub type Props = BTreeMap<String, PropValue>;

impl PropValue {
    /// Scalar (non-container) check, used to validate list elements.
    pub fn is_scalar(&self) -> bool {
        !matches!(self, PropValue::List(_) | PropValue::Map(_))
    }

    /// How many levels of containers this value nests.
    pub fn depth(&self) -> usize {
        match self {
            PropValue::List(items) => {
                1 + items.iter().map(PropValue::depth).max().unwrap_or(0)
            }
            PropValue::Map(map) => {
                1 + map.values().map(PropValue::depth).max().unwrap_or(0)
            }
            _ => 0,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            PropValue::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            PropValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_number(&self) -> Option<f64> {
        match self {
            PropValue::Number(n) => Some(*n),
            _ => None,
        }
    }

    fn promote_string(s: String) -> PropValue {
        if let Ok(dt) = time::OffsetDateTime::parse(&s, &Rfc3339) {
            return PropValue::DateTime(dt);
        }
        if let Ok(d) = time::Date::parse(&s, DATE_FORMAT) {
            return PropValue::Date(d);
        }
        PropValue::String(s)
    }
}

impl From<&str> for PropValue {
    fn from(value: &str) -> Self {
        PropValue::promote_string(value.to_owned())
    }
}

impl From<f64> for PropValue {
    fn from(value: f64) -> Self {
        PropValue::Number(value)
    }
}

impl From<bool> for PropValue {
    fn from(value: bool) -> Self {
        PropValue::Bool(value)
    }
}

impl fmt::Display for PropValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PropValue::String(s) => f.write_str(s),
            PropValue::Number(n) => {
                // Integral values print without the trailing `.0` JSON gives them.
                if n.fract() == 0.0 && n.abs() < 1e15 {
                    write!(f, "{}", *n as i64)
                } else {
                    write!(f, "{n}")
                }
            }
            PropValue::Bool(b) => write!(f, "{b}"),
            PropValue::Date(d) => match d.format(DATE_FORMAT) {
                Ok(s) => f.write_str(&s),
                Err(_) => write!(f, "{d}"),
            },
            PropValue::DateTime(dt) => match dt.format(&Rfc3339) {
                Ok(s) => f.write_str(&s),
                Err(_) => write!(f, "{dt}"),
            },
            PropValue::List(items) => {
                let mut first = true;
                for item in items {
                    if !first {
                        f.write_str(", ")?;
                    }
                    first = false;
                    item.fmt(f)?;
                }
                Ok(())
            }
            PropValue::Map(map) => {
                let mut first = true;
                for (k, v) in map {
                    if !first {
                        f.write_str(", ")?;
                    }
                    first = false;
                    write!(f, "{k}: {v}")?;
                }
                Ok(())
            }
        }
    }
}

impl Serialize for PropValue {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match self {
            PropValue::String(s) => serializer.serialize_str(s),
            PropValue::Number(n) => serializer.serialize_f64(*n),
            PropValue::Bool(b) => serializer.serialize_bool(*b),
            PropValue::Date(d) => {
                let s = d
                    .format(DATE_FORMAT)
                    .map_err(serde::ser::Error::custom)?;
                serializer.serialize_str(&s)
            }
            PropValue::DateTime(dt) => {
                let s = dt.format(&Rfc3339).map_err(serde::ser::Error::custom)?;
                serializer.serialize_str(&s)
            }
            PropValue::List(items) => {
                let mut seq = serializer.serialize_seq(Some(items.len()))?;
                for item in items {
                    seq.serialize_element(item)?;
                }
                seq.end()
            }
            PropValue::Map(map) => {
                let mut m = serializer.serialize_map(Some(map.len()))?;
                for (k, v) in map {
                    m.serialize_entry(k, v)?;
                }
                m.end()
            }
        }
    }
}

impl<'de> Deserialize<'de> for PropValue {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct PropValueVisitor;

        impl<'de> Visitor<'de> for PropValueVisitor {
            type Value = PropValue;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a string, number, bool, array or object")
            }

            fn visit_bool<E>(self, v: bool) -> Result<Self::Value, E> {
                Ok(PropValue::Bool(v))
            }

            fn visit_i64<E>(self, v: i64) -> Result<Self::Value, E> {
                Ok(PropValue::Number(v as f64))
            }

            fn visit_u64<E>(self, v: u64) -> Result<Self::Value, E> {
                Ok(PropValue::Number(v as f64))
            }

            fn visit_f64<E>(self, v: f64) -> Result<Self::Value, E> {
                Ok(PropValue::Number(v))
            }

            fn visit_str<E>(self, v: &str) -> Result<Self::Value, E> {
                Ok(PropValue::promote_string(v.to_owned()))
            }

            fn visit_string<E>(self, v: String) -> Result<Self::Value, E> {
                Ok(PropValue::promote_string(v))
            }

            fn visit_seq<A>(self, mut seq: A) -> Result<Self::Value, A::Error>
            where
                A: SeqAccess<'de>,
            {
                let mut items = Vec::new();
                while let Some(item) = seq.next_element()? {
                    items.push(item);
                }
                Ok(PropValue::List(items))
            }

            fn visit_map<A>(self, mut map: A) -> Result<Self::Value, A::Error>
            where
                A: MapAccess<'de>,
            {
                let mut out = BTreeMap::new();
                while let Some((k, v)) = map.next_entry::<String, PropValue>()? {
                    out.insert(k, v);
                }
                Ok(PropValue::Map(out))
            }

            fn visit_unit<E>(self) -> Result<Self::Value, E> {
                // JSON null has no variant; treat it as an empty string.
                Ok(PropValue::String(String::new()))
            }
        }

        deserializer.deserialize_any(PropValueVisitor)
    }
}

/// Merge `src` into `dst`, overwriting existing keys.
pub fn merge_props(dst: &mut Props, src: &Props) {
    for (k, v) in src {
        dst.insert(k.clone(), v.clone());
    }
}

/// First key (if any) that uses the reserved `_` prefix.
pub fn find_reserved_key(props: &Props) -> Option<&str> {
    props
        .keys()
        .find(|k| k.starts_with(RESERVED_KEY_PREFIX))
        .map(String::as_str)
}
