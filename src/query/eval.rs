//! Query evaluation: key path resolution, ordering and sectioning.

use super::{KeyPath, Query, META_ID, META_SEQUENCE, META_TIMESTAMP, META_TYPE};
use crate::observation::RawSection;
use crate::types::Record;
use serde_json::Value;
use std::cmp::Ordering;

/// Resolve a key path against a record. Missing values resolve to `Null`.
pub fn resolve(record: &Record, payload: Option<&Value>, path: &KeyPath) -> Value {
    if path.is_meta() {
        return match path.as_str() {
            META_ID => Value::from(record.id.0),
            META_TYPE => Value::from(record.record_type.clone()),
            META_SEQUENCE => Value::from(record.sequence.0),
            META_TIMESTAMP => Value::from(record.timestamp.0),
            _ => Value::Null,
        };
    }

    let mut current = match payload {
        Some(value) => value,
        None => return Value::Null,
    };
    for segment in path.segments() {
        current = match current {
            Value::Object(map) => match map.get(segment) {
                Some(next) => next,
                None => return Value::Null,
            },
            Value::Array(items) => match segment.parse::<usize>().ok().and_then(|i| items.get(i)) {
                Some(next) => next,
                None => return Value::Null,
            },
            _ => return Value::Null,
        };
    }
    current.clone()
}

fn type_rank(value: &Value) -> u8 {
    match value {
        Value::Null => 0,
        Value::Bool(_) => 1,
        Value::Number(_) => 2,
        Value::String(_) => 3,
        Value::Array(_) => 4,
        Value::Object(_) => 5,
    }
}

/// Total order over JSON values: null < bool < number < string < array < object.
pub fn compare_values(a: &Value, b: &Value) -> Ordering {
    match (a, b) {
        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
        (Value::Number(x), Value::Number(y)) => {
            let x = x.as_f64().unwrap_or(f64::NAN);
            let y = y.as_f64().unwrap_or(f64::NAN);
            x.total_cmp(&y)
        }
        (Value::String(x), Value::String(y)) => x.cmp(y),
        (Value::Array(x), Value::Array(y)) => {
            for (left, right) in x.iter().zip(y.iter()) {
                let ord = compare_values(left, right);
                if ord != Ordering::Equal {
                    return ord;
                }
            }
            x.len().cmp(&y.len())
        }
        (Value::Object(_), Value::Object(_)) => a.to_string().cmp(&b.to_string()),
        _ => type_rank(a).cmp(&type_rank(b)),
    }
}

/// Display name of a section key value. Null renders as the empty string.
pub fn section_name(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Index title for a section: the uppercased first character of its name.
pub fn index_title(name: &str) -> Option<String> {
    name.chars().next().map(|c| c.to_uppercase().collect())
}

/// Filter and order records for a query. Ties break by record id.
pub(crate) fn execute<'a>(query: &Query, records: impl Iterator<Item = &'a Record>) -> Vec<Record> {
    let mut keyed: Vec<(Vec<Value>, &Record)> = records
        .filter_map(|record| {
            let payload = record.json();
            if !query.predicate.matches_parsed(record, payload.as_ref()) {
                return None;
            }
            let keys = query
                .sort
                .iter()
                .map(|descriptor| resolve(record, payload.as_ref(), &descriptor.key))
                .collect();
            Some((keys, record))
        })
        .collect();

    keyed.sort_by(|(left_keys, left), (right_keys, right)| {
        for ((l, r), descriptor) in left_keys.iter().zip(right_keys).zip(&query.sort) {
            let ord = compare_values(l, r);
            let ord = if descriptor.ascending { ord } else { ord.reverse() };
            if ord != Ordering::Equal {
                return ord;
            }
        }
        left.id.cmp(&right.id)
    });

    keyed.into_iter().map(|(_, record)| record.clone()).collect()
}

/// Split an ordered result into contiguous sections by the query's section
/// key. Returns a single unnamed section when the query is not sectioned.
pub fn group_sections(query: &Query, ordered: &[Record]) -> Vec<RawSection<Record>> {
    let key = match query.section_key {
        Some(ref key) => key,
        None => {
            return vec![RawSection {
                name: None,
                index_title: None,
                records: ordered.to_vec(),
            }]
        }
    };

    let mut sections: Vec<RawSection<Record>> = Vec::new();
    for record in ordered {
        let payload = record.json();
        let name = section_name(&resolve(record, payload.as_ref(), key));

        match sections.last_mut() {
            Some(section) if section.name.as_deref() == Some(name.as_str()) => {
                section.records.push(record.clone());
            }
            _ => sections.push(RawSection {
                index_title: index_title(&name),
                name: Some(name),
                records: vec![record.clone()],
            }),
        }
    }
    sections
}
