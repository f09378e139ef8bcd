//! Dotted-path access to TOML tables
//!
//! Only used at the serialization boundary (`set`/`show` commands, layer
//! persistence). Core logic reads the typed views in [`super::schema`].

use std::collections::BTreeMap;

use toml::{Table, Value};

use crate::{Error, Result};

fn split(path: &str) -> Result<Vec<&str>> {
    let parts: Vec<&str> = path.split('.').collect();
    if parts.iter().any(|p| p.is_empty()) {
        return Err(Error::config(format!("malformed attribute path [{path}]")));
    }
    Ok(parts)
}

/// Looks up a value by dotted path
pub fn get<'a>(table: &'a Table, path: &str) -> Option<&'a Value> {
    let mut parts = path.split('.');
    let mut current = table.get(parts.next()?)?;
    for part in parts {
        current = current.as_table()?.get(part)?;
    }
    Some(current)
}

/// Sets a value by dotted path, creating intermediate tables.
/// Returns whether the table changed.
pub fn set(table: &mut Table, path: &str, value: Value) -> Result<bool> {
    set_inner(table, path, value, true)
}

/// Sets a value only if nothing is stored at the path yet
pub fn set_default(table: &mut Table, path: &str, value: Value) -> Result<bool> {
    set_inner(table, path, value, false)
}

fn set_inner(table: &mut Table, path: &str, value: Value, replace: bool) -> Result<bool> {
    let parts = split(path)?;
    let (leaf, parents) = parts
        .split_last()
        .ok_or_else(|| Error::config("empty attribute path"))?;

    let mut current = table;
    for part in parents {
        let entry = current
            .entry(part.to_string())
            .or_insert_with(|| Value::Table(Table::new()));
        current = match entry {
            Value::Table(t) => t,
            _ => {
                return Err(Error::config(format!(
                    "cannot set [{path}]: [{part}] is not a table"
                )))
            }
        };
    }

    match current.get(*leaf) {
        Some(_) if !replace => Ok(false),
        Some(existing) if *existing == value => Ok(false),
        _ => {
            current.insert(leaf.to_string(), value);
            Ok(true)
        }
    }
}

/// Removes the value at the path. Returns whether something was removed.
pub fn remove(table: &mut Table, path: &str) -> Result<bool> {
    let parts = split(path)?;
    let (leaf, parents) = parts
        .split_last()
        .ok_or_else(|| Error::config("empty attribute path"))?;

    let mut current = table;
    for part in parents {
        current = match current.get_mut(*part) {
            Some(Value::Table(t)) => t,
            _ => return Ok(false),
        };
    }
    Ok(current.remove(*leaf).is_some())
}

/// Flattens nested tables into dotted keys. Arrays are leaves.
pub fn flatten(table: &Table) -> BTreeMap<String, Value> {
    let mut out = BTreeMap::new();
    flatten_into(&mut out, None, table);
    out
}

fn flatten_into(out: &mut BTreeMap<String, Value>, prefix: Option<&str>, table: &Table) {
    for (key, value) in table {
        let full = match prefix {
            Some(p) => format!("{p}.{key}"),
            None => key.clone(),
        };
        match value {
            Value::Table(inner) if !inner.is_empty() => flatten_into(out, Some(&full), inner),
            Value::Table(_) => {}
            other => {
                out.insert(full, other.clone());
            }
        }
    }
}

/// Rebuilds a nested table from dotted keys.
/// A key that is both a leaf and a prefix of another key keeps the nested form.
pub fn unflatten(flat: &BTreeMap<String, Value>) -> Table {
    let mut root = Table::new();
    'keys: for (key, value) in flat {
        let parts: Vec<&str> = key.split('.').collect();
        let Some((leaf, parents)) = parts.split_last() else {
            continue;
        };
        let mut current = &mut root;
        for part in parents {
            let entry = current
                .entry(part.to_string())
                .or_insert_with(|| Value::Table(Table::new()));
            if !entry.is_table() {
                *entry = Value::Table(Table::new());
            }
            match entry {
                Value::Table(t) => current = t,
                _ => continue 'keys,
            }
        }
        if !matches!(current.get(*leaf), Some(Value::Table(_))) {
            current.insert(leaf.to_string(), value.clone());
        }
    }
    root
}

/// Interprets an operator-supplied value.
///
/// `[a, b]` becomes a list, digit-only strings become integers, everything
/// else stays a string.
pub fn parse_cli_value(raw: &str) -> Value {
    let trimmed = raw.trim();
    if trimmed.starts_with('[') && trimmed.ends_with(']') {
        if let Ok(doc) = format!("v = {trimmed}").parse::<Table>() {
            if let Some(v) = doc.get("v") {
                return v.clone();
            }
        }
        let inner = &trimmed[1..trimmed.len() - 1];
        let items = inner
            .split(',')
            .map(|s| s.trim().trim_matches(|c| c == '"' || c == '\''))
            .filter(|s| !s.is_empty())
            .map(|s| Value::String(s.to_string()))
            .collect();
        return Value::Array(items);
    }
    if !trimmed.is_empty() && trimmed.bytes().all(|b| b.is_ascii_digit()) {
        if let Ok(n) = trimmed.parse::<i64>() {
            return Value::Integer(n);
        }
    }
    Value::String(raw.to_string())
}
