//! Construction of resource JSON from attribute paths

use serde_json::{Map, Value};

use crate::ast::MAX_ATTRIBUTE_INDEX;

/// An indexed step pointed past the largest array slot the builder creates
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexOutOfRange {
    pub index: usize,
}

/// One step of an attribute path as the builder sees it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Step<'a> {
    pub name: &'a str,
    pub index: Option<usize>,
    /// The attribute repeats, so it is written as an array even without an index
    pub list: bool,
}

impl<'a> Step<'a> {
    pub fn new(name: &'a str) -> Self {
        Self {
            name,
            index: None,
            list: false,
        }
    }

    pub fn at(mut self, index: usize) -> Self {
        self.index = Some(index);
        self
    }

    pub fn list(mut self) -> Self {
        self.list = true;
        self
    }
}

/// Write `value` at `path` inside `target`, creating intermediate objects
/// and arrays. An indexed step addresses that array slot, padding with
/// nulls. An unindexed repeating leaf appends; an unindexed repeating
/// intermediate reuses the first element.
pub fn set_path(
    target: &mut Map<String, Value>,
    path: &[Step<'_>],
    value: Value,
) -> Result<(), IndexOutOfRange> {
    let Some((leaf, parents)) = path.split_last() else {
        return Ok(());
    };

    let mut current = target;
    for step in parents {
        let slot = current
            .entry(step.name.to_string())
            .or_insert(Value::Null);
        let child = match step.index {
            Some(index) => array_slot(slot, index)?,
            None if step.list => array_slot(slot, 0)?,
            None => slot,
        };
        if !child.is_object() {
            *child = Value::Object(Map::new());
        }
        current = match child {
            Value::Object(map) => map,
            _ => return Ok(()),
        };
    }

    let slot = current.entry(leaf.name.to_string()).or_insert(Value::Null);
    match leaf.index {
        Some(index) => *array_slot(slot, index)? = value,
        None if leaf.list => {
            if !slot.is_array() {
                *slot = Value::Array(Vec::new());
            }
            if let Value::Array(items) = slot {
                items.push(value);
            }
        }
        None => *slot = value,
    }
    Ok(())
}

fn array_slot(slot: &mut Value, index: usize) -> Result<&mut Value, IndexOutOfRange> {
    let len = index
        .checked_add(1)
        .filter(|len| *len <= MAX_ATTRIBUTE_INDEX + 1)
        .ok_or(IndexOutOfRange { index })?;
    if !slot.is_array() {
        *slot = Value::Array(Vec::new());
    }
    match slot {
        Value::Array(items) => {
            if items.len() < len {
                items.resize(len, Value::Null);
            }
            Ok(&mut items[index])
        }
        other => Ok(other),
    }
}

/// Drop nulls, empty strings, empty objects and empty arrays, bottom up.
/// Returns true when `value` itself is empty afterwards.
pub fn prune(value: &mut Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.is_empty(),
        Value::Object(map) => {
            map.retain(|_, v| !prune(v));
            map.is_empty()
        }
        Value::Array(items) => {
            items.retain_mut(|v| !prune(v));
            items.is_empty()
        }
        Value::Bool(_) | Value::Number(_) => false,
    }
}

/// Deep-merge `from` into `into`. Objects merge by key, arrays element by
/// element, and any other non-null value of `from` overwrites.
pub fn merge(into: &mut Value, from: Value) {
    match (into, from) {
        (Value::Object(a), Value::Object(b)) => {
            for (key, value) in b {
                match a.get_mut(&key) {
                    Some(existing) => merge(existing, value),
                    None => {
                        a.insert(key, value);
                    }
                }
            }
        }
        (Value::Array(a), Value::Array(b)) => {
            for (i, value) in b.into_iter().enumerate() {
                match a.get_mut(i) {
                    Some(existing) => merge(existing, value),
                    None => a.push(value),
                }
            }
        }
        (_, Value::Null) => {}
        (slot, value) => *slot = value,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn build(writes: Vec<(Vec<Step<'_>>, Value)>) -> Value {
        let mut map = Map::new();
        for (path, value) in writes {
            set_path(&mut map, &path, value).unwrap();
        }
        Value::Object(map)
    }

    #[test]
    fn test_nested_objects() {
        let out = build(vec![
            (vec![Step::new("code"), Step::new("text")], json!("Weight")),
            (vec![Step::new("status")], json!("final")),
        ]);
        assert_eq!(out, json!({"code": {"text": "Weight"}, "status": "final"}));
    }

    #[test]
    fn test_indexed_slots_pad_and_share() {
        let out = build(vec![
            (
                vec![Step::new("identifier").at(1), Step::new("value")],
                json!("B"),
            ),
            (
                vec![Step::new("identifier").at(1), Step::new("system")],
                json!("urn:b"),
            ),
            (
                vec![Step::new("identifier").at(0), Step::new("value")],
                json!("A"),
            ),
        ]);
        assert_eq!(
            out,
            json!({"identifier": [{"value": "A"}, {"value": "B", "system": "urn:b"}]})
        );
    }

    #[test]
    fn test_index_past_limit_is_rejected() {
        let mut map = Map::new();
        let huge = vec![Step::new("identifier").at(usize::MAX), Step::new("value")];
        assert_eq!(
            set_path(&mut map, &huge, json!("x")),
            Err(IndexOutOfRange { index: usize::MAX })
        );
        let past = vec![Step::new("identifier").at(MAX_ATTRIBUTE_INDEX + 1)];
        assert!(set_path(&mut map, &past, json!("x")).is_err());
        assert!(map.get("identifier").is_none());

        let last = vec![Step::new("identifier").at(MAX_ATTRIBUTE_INDEX)];
        assert!(set_path(&mut map, &last, json!("x")).is_ok());
    }

    #[test]
    fn test_list_leaf_appends() {
        let out = build(vec![
            (vec![Step::new("given").list()], json!("Ann")),
            (vec![Step::new("given").list()], json!("Marie")),
        ]);
        assert_eq!(out, json!({"given": ["Ann", "Marie"]}));
    }

    #[test]
    fn test_list_intermediate_reuses_first_element() {
        let out = build(vec![
            (vec![Step::new("name").list(), Step::new("family")], json!("Doe")),
            (vec![Step::new("name").list(), Step::new("text")], json!("J Doe")),
        ]);
        assert_eq!(out, json!({"name": [{"family": "Doe", "text": "J Doe"}]}));
    }

    #[test]
    fn test_prune_removes_empty_containers() {
        let mut value = json!({
            "a": null,
            "b": {"c": [], "d": {}},
            "e": [null, {"f": ""}, 1],
            "g": false
        });
        assert!(!prune(&mut value));
        assert_eq!(value, json!({"e": [1], "g": false}));
    }

    #[test]
    fn test_merge_is_deep() {
        let mut a = json!({"id": "p", "name": [{"family": "Doe"}], "active": true});
        merge(
            &mut a,
            json!({"name": [{"given": ["J"]}, {"text": "x"}], "active": null, "gender": "male"}),
        );
        assert_eq!(
            a,
            json!({
                "id": "p",
                "name": [{"family": "Doe", "given": ["J"]}, {"text": "x"}],
                "active": true,
                "gender": "male"
            })
        );
    }
}
