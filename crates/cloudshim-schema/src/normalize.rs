//! Recursive-descent schema normalization

use std::collections::{BTreeSet, HashMap};

use serde_json::{json, Map, Value};
use tracing::debug;

use crate::node::{is_null_schema, is_object_schema, SchemaNode, UnionKeyword};

/// Keywords the backend rejects; removed at every depth.
pub const STRIPPED_KEYWORDS: &[&str] = &[
    "$schema",
    "$id",
    "default",
    "examples",
    "const",
    "additionalProperties",
];

const DEFINITION_KEYS: &[&str] = &["$defs", "definitions"];

/// Normalize a tool parameter schema for the cloud backend.
///
/// `$ref` targets are looked up in the root document's `$defs` / `definitions`
/// and inlined; keys written next to the `$ref` override the inlined ones.
/// References that do not resolve, or that recurse into themselves, become
/// `{"type": "object"}`.
///
/// With `simplify_unions`, `anyOf` / `oneOf` collapse to their first non-null
/// branch, except when two or more branches are objects with different
/// property sets: those are flattened into a single object carrying every
/// property. `allOf` is always merged.
///
/// Anything that is not a JSON object is returned unchanged.
pub fn normalize(schema: &Value, simplify_unions: bool) -> Value {
    let Value::Object(root) = schema else {
        return schema.clone();
    };

    let mut normalizer = Normalizer {
        definitions: collect_definitions(root),
        simplify_unions,
        resolving: Vec::new(),
    };
    normalizer.visit(schema)
}

fn collect_definitions(root: &Map<String, Value>) -> HashMap<String, &Value> {
    let mut definitions = HashMap::new();
    for key in DEFINITION_KEYS {
        if let Some(Value::Object(defs)) = root.get(*key) {
            for (name, schema) in defs {
                let escaped = name.replace('~', "~0").replace('/', "~1");
                definitions.insert(format!("#/{key}/{escaped}"), schema);
            }
        }
    }
    definitions
}

struct Normalizer<'a> {
    definitions: HashMap<String, &'a Value>,
    simplify_unions: bool,
    resolving: Vec<String>,
}

impl<'a> Normalizer<'a> {
    fn visit(&mut self, value: &Value) -> Value {
        let Value::Object(map) = value else {
            return value.clone();
        };

        match SchemaNode::classify(map) {
            SchemaNode::Ref(reference) => self.inline_ref(reference, map),
            SchemaNode::AllOf(branches) => self.merge_all_of(branches, map),
            SchemaNode::Union { keyword, branches } if self.simplify_unions => {
                self.collapse_union(keyword, branches, map)
            }
            _ => Value::Object(self.visit_keywords(map)),
        }
    }

    fn visit_keywords(&mut self, map: &Map<String, Value>) -> Map<String, Value> {
        let mut out = Map::new();

        for (key, value) in map {
            if STRIPPED_KEYWORDS.contains(&key.as_str()) || DEFINITION_KEYS.contains(&key.as_str())
            {
                continue;
            }

            let normalized = match key.as_str() {
                // Keys under `properties` are property names, not keywords.
                "properties" => match value {
                    Value::Object(properties) => Value::Object(
                        properties
                            .iter()
                            .map(|(name, schema)| (name.clone(), self.visit(schema)))
                            .collect(),
                    ),
                    other => other.clone(),
                },
                "items" => match value {
                    Value::Array(items) => {
                        Value::Array(items.iter().map(|item| self.visit(item)).collect())
                    }
                    other => self.visit(other),
                },
                "anyOf" | "oneOf" => match value {
                    Value::Array(branches) => {
                        Value::Array(branches.iter().map(|branch| self.visit(branch)).collect())
                    }
                    other => other.clone(),
                },
                "type" => collapse_type(value),
                _ => value.clone(),
            };
            out.insert(key.clone(), normalized);
        }

        prune_required(&mut out);
        out
    }

    fn inline_ref(&mut self, reference: &str, site: &Map<String, Value>) -> Value {
        let target = self.definitions.get(reference).copied();
        let resolved = match target {
            Some(target) if !self.resolving.iter().any(|r| r == reference) => {
                self.resolving.push(reference.to_string());
                let resolved = self.visit(target);
                self.resolving.pop();
                resolved
            }
            Some(_) => {
                debug!(reference, "cutting recursive $ref");
                fallback_object()
            }
            None => {
                debug!(reference, "unresolvable $ref");
                fallback_object()
            }
        };

        let siblings = without(site, "$ref");
        if siblings.is_empty() {
            return resolved;
        }
        let siblings = self.visit(&Value::Object(siblings));
        overlay(resolved, siblings)
    }

    fn collapse_union(
        &mut self,
        keyword: UnionKeyword,
        branches: &[Value],
        site: &Map<String, Value>,
    ) -> Value {
        let normalized: Vec<Value> = branches.iter().map(|branch| self.visit(branch)).collect();
        let candidates: Vec<&Value> = normalized.iter().filter(|b| !is_null_schema(b)).collect();

        let base = match flatten_object_branches(&candidates) {
            Some(flattened) => {
                debug!(
                    keyword = keyword.as_str(),
                    branches = candidates.len(),
                    "flattening object union"
                );
                flattened
            }
            None => candidates
                .first()
                .map(|branch| (*branch).clone())
                .unwrap_or_else(|| json!({ "type": "null" })),
        };

        let siblings = without(site, keyword.as_str());
        if siblings.is_empty() {
            return base;
        }
        let siblings = self.visit(&Value::Object(siblings));
        overlay(base, siblings)
    }

    fn merge_all_of(&mut self, branches: &[Value], site: &Map<String, Value>) -> Value {
        let mut parts: Vec<Value> = branches.iter().map(|branch| self.visit(branch)).collect();
        let siblings = without(site, "allOf");
        if !siblings.is_empty() {
            parts.push(self.visit(&Value::Object(siblings)));
        }

        let mut merged = Map::new();
        let mut properties = Map::new();
        let mut required: Vec<Value> = Vec::new();

        for part in parts {
            let Value::Object(part) = part else {
                continue;
            };
            for (key, value) in part {
                if key == "properties" {
                    if let Value::Object(props) = value {
                        properties.extend(props);
                    }
                } else if key == "required" {
                    for name in value.as_array().into_iter().flatten() {
                        if !required.contains(name) {
                            required.push(name.clone());
                        }
                    }
                } else {
                    merged.insert(key, value);
                }
            }
        }

        if !properties.is_empty() {
            merged.insert("properties".to_string(), Value::Object(properties));
            merged
                .entry("type")
                .or_insert_with(|| Value::String("object".to_string()));
        }
        if !required.is_empty() {
            merged.insert("required".to_string(), Value::Array(required));
        }
        prune_required(&mut merged);
        Value::Object(merged)
    }
}

/// Merge two or more object branches with differing property sets into one
/// object. Only names required by every object branch stay required.
fn flatten_object_branches(branches: &[&Value]) -> Option<Value> {
    let objects: Vec<&Map<String, Value>> = branches
        .iter()
        .filter_map(|branch| branch.as_object())
        .filter(|map| is_object_schema(map) && map.get("properties").is_some_and(Value::is_object))
        .collect();
    if objects.len() < 2 {
        return None;
    }

    let name_sets: Vec<BTreeSet<&str>> = objects
        .iter()
        .map(|map| property_map(map).map(|(name, _)| name.as_str()).collect())
        .collect();
    if name_sets.windows(2).all(|pair| pair[0] == pair[1]) {
        return None;
    }

    let mut properties = Map::new();
    let mut required: Option<BTreeSet<String>> = None;
    for object in &objects {
        for (name, schema) in property_map(object) {
            properties
                .entry(name.clone())
                .or_insert_with(|| schema.clone());
        }
        let names: BTreeSet<String> = object
            .get("required")
            .and_then(Value::as_array)
            .map(|names| {
                names
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();
        required = Some(match required {
            Some(acc) => acc.intersection(&names).cloned().collect(),
            None => names,
        });
    }

    let mut merged = Map::new();
    merged.insert("type".to_string(), Value::String("object".to_string()));
    merged.insert("properties".to_string(), Value::Object(properties));
    if let Some(required) = required.filter(|names| !names.is_empty()) {
        merged.insert(
            "required".to_string(),
            Value::Array(required.into_iter().map(Value::String).collect()),
        );
    }
    Some(Value::Object(merged))
}

fn property_map(map: &Map<String, Value>) -> impl Iterator<Item = (&String, &Value)> {
    map.get("properties")
        .and_then(Value::as_object)
        .into_iter()
        .flatten()
}

fn without(map: &Map<String, Value>, key: &str) -> Map<String, Value> {
    map.iter()
        .filter(|(k, _)| k.as_str() != key)
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}

/// Keys from `top` replace the same keys in `base`.
fn overlay(base: Value, top: Value) -> Value {
    match (base, top) {
        (Value::Object(mut base), Value::Object(top)) => {
            base.extend(top);
            prune_required(&mut base);
            Value::Object(base)
        }
        (base, _) => base,
    }
}

/// `["string", "null"]` becomes `"string"`; the backend takes a single type.
fn collapse_type(value: &Value) -> Value {
    match value {
        Value::Array(types) => types
            .iter()
            .find(|t| t.as_str().is_some_and(|t| t != "null"))
            .cloned()
            .unwrap_or_else(|| Value::String("null".to_string())),
        other => other.clone(),
    }
}

/// Keep only required names that still exist as properties; drop empty lists.
fn prune_required(map: &mut Map<String, Value>) {
    let Some(required) = map.get("required").and_then(Value::as_array) else {
        return;
    };

    let kept: Vec<Value> = match map.get("properties").and_then(Value::as_object) {
        Some(properties) => required
            .iter()
            .filter(|name| name.as_str().is_some_and(|n| properties.contains_key(n)))
            .cloned()
            .collect(),
        None => Vec::new(),
    };

    if kept.is_empty() {
        map.remove("required");
    } else {
        map.insert("required".to_string(), Value::Array(kept));
    }
}

fn fallback_object() -> Value {
    json!({ "type": "object" })
}
