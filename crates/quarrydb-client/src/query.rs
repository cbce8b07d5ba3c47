//! Query submission body (spec §6.5) and the `query-*` context-settings
//! keys that fill it (spec §4.6's table entry "fields of the query
//! request body §6.5").
//!
//! [`QueryOptions`] is the typed-builder equivalent of those keys;
//! [`QueryOptions::build_body`] produces the JSON object the cursor
//! engine (C7) POSTs to `/_api/cursor` to open a query. Building the
//! body is the C6/C7 seam the core is responsible for; deciding *what*
//! query string and bind variables to send is the out-of-scope typed
//! `Database::query()` surface's job.

use std::collections::BTreeMap;

use serde_json::{Map, Value};

/// The subset of a query submission's `options.*` nested object.
#[derive(Debug, Clone, Default)]
pub struct QueryOptions {
    pub count: Option<bool>,
    pub batch_size: Option<u32>,
    pub cache: Option<bool>,
    pub memory_limit: Option<u64>,
    pub ttl: Option<f64>,
    pub full_count: Option<bool>,
    pub stream: Option<bool>,
    pub satellite_sync_wait: Option<f64>,
    pub profile: Option<bool>,
    pub optimizer_rules: Option<Vec<String>>,
    pub max_plans: Option<u32>,
}

impl QueryOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build the `/_api/cursor` request body (spec §6.5). `query` is the
    /// only required field; everything else is emitted only when set.
    pub fn build_body(&self, query: &str, bind_vars: &BTreeMap<String, Value>) -> Value {
        let mut body = Map::new();
        body.insert("query".to_string(), Value::String(query.to_string()));
        if !bind_vars.is_empty() {
            let vars: Map<String, Value> = bind_vars.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
            body.insert("bindVars".to_string(), Value::Object(vars));
        }
        if let Some(count) = self.count {
            body.insert("count".to_string(), Value::Bool(count));
        }
        if let Some(batch_size) = self.batch_size {
            body.insert("batchSize".to_string(), Value::from(batch_size));
        }
        if let Some(cache) = self.cache {
            body.insert("cache".to_string(), Value::Bool(cache));
        }
        if let Some(memory_limit) = self.memory_limit {
            body.insert("memoryLimit".to_string(), Value::from(memory_limit));
        }
        if let Some(ttl) = self.ttl {
            body.insert("ttl".to_string(), Value::from(ttl));
        }

        let mut nested = Map::new();
        if let Some(profile) = self.profile {
            nested.insert("profile".to_string(), Value::Bool(profile));
        }
        if let Some(rules) = &self.optimizer_rules {
            let mut optimizer = Map::new();
            optimizer.insert("rules".to_string(), Value::Array(rules.iter().cloned().map(Value::String).collect()));
            nested.insert("optimizer".to_string(), Value::Object(optimizer));
        }
        if let Some(wait) = self.satellite_sync_wait {
            nested.insert("satelliteSyncWait".to_string(), Value::from(wait));
        }
        if let Some(full_count) = self.full_count {
            nested.insert("fullCount".to_string(), Value::Bool(full_count));
        }
        if let Some(max_plans) = self.max_plans {
            nested.insert("maxPlans".to_string(), Value::from(max_plans));
        }
        if let Some(stream) = self.stream {
            nested.insert("stream".to_string(), Value::Bool(stream));
        }
        if !nested.is_empty() {
            body.insert("options".to_string(), Value::Object(nested));
        }

        Value::Object(body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_query_field_is_required() {
        let opts = QueryOptions::new();
        let body = opts.build_body("FOR i IN 1..3 RETURN i", &BTreeMap::new());
        assert_eq!(body, serde_json::json!({"query": "FOR i IN 1..3 RETURN i"}));
    }

    #[test]
    fn nested_options_group_under_the_options_key() {
        let opts = QueryOptions {
            full_count: Some(true),
            profile: Some(true),
            optimizer_rules: Some(vec!["-all".to_string()]),
            ..Default::default()
        };
        let body = opts.build_body("RETURN 1", &BTreeMap::new());
        let nested = body.get("options").unwrap();
        assert_eq!(nested.get("fullCount").unwrap(), &serde_json::json!(true));
        assert_eq!(nested.get("profile").unwrap(), &serde_json::json!(true));
        assert_eq!(nested.get("optimizer").unwrap().get("rules").unwrap(), &serde_json::json!(["-all"]));
    }

    #[test]
    fn bind_vars_are_attached_when_present() {
        let mut vars = BTreeMap::new();
        vars.insert("name".to_string(), serde_json::json!("alice"));
        let body = QueryOptions::new().build_body("FOR d IN users FILTER d.name == @name RETURN d", &vars);
        assert_eq!(body.get("bindVars").unwrap().get("name").unwrap(), "alice");
    }

    #[test]
    fn batch_size_and_ttl_serialize_as_top_level_fields() {
        let opts = QueryOptions { batch_size: Some(500), ttl: Some(30.0), ..Default::default() };
        let body = opts.build_body("RETURN 1", &BTreeMap::new());
        assert_eq!(body.get("batchSize").unwrap(), &serde_json::json!(500));
        assert_eq!(body.get("ttl").unwrap(), &serde_json::json!(30.0));
    }
}
