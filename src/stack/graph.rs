//! Dependency graph ordering and output substitution

use std::collections::HashMap;

use regex::Regex;

use super::request::StackResourceRequest;

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum GraphError {
    #[error("dependency cycle involving '{0}'")]
    Cycle(String),

    #[error("unresolved placeholder '${{{0}.{1}}}': {2}")]
    Unresolved(String, String, String),
}

/// Order resources so every dependency precedes its dependents.
///
/// Sort key: dependency depth ascending, then declared `order`, then
/// declared name. Returns indexes into the input slice. A cycle fails
/// the whole call.
pub fn topo_order(resources: &[StackResourceRequest]) -> Result<Vec<usize>, GraphError> {
    let index_of: HashMap<&str, usize> = resources
        .iter()
        .enumerate()
        .map(|(i, r)| (r.name.as_str(), i))
        .collect();

    // Longest-path depth via DFS with cycle detection
    const UNVISITED: u8 = 0;
    const IN_PROGRESS: u8 = 1;
    const DONE: u8 = 2;

    let mut state = vec![UNVISITED; resources.len()];
    let mut depth = vec![0usize; resources.len()];

    fn visit(
        i: usize,
        resources: &[StackResourceRequest],
        index_of: &HashMap<&str, usize>,
        state: &mut [u8],
        depth: &mut [usize],
    ) -> Result<usize, GraphError> {
        match state[i] {
            2 => return Ok(depth[i]),
            1 => return Err(GraphError::Cycle(resources[i].name.clone())),
            _ => {}
        }

        state[i] = 1;
        let mut max_dep_depth = 0usize;
        for dep in &resources[i].depends_on {
            // Unknown names are caught by request validation
            if let Some(&j) = index_of.get(dep.as_str()) {
                max_dep_depth = max_dep_depth.max(visit(j, resources, index_of, state, depth)? + 1);
            }
        }
        state[i] = 2;
        depth[i] = max_dep_depth;
        Ok(max_dep_depth)
    }

    for i in 0..resources.len() {
        visit(i, resources, &index_of, &mut state, &mut depth)?;
    }

    let mut order: Vec<usize> = (0..resources.len()).collect();
    order.sort_by(|&a, &b| {
        depth[a]
            .cmp(&depth[b])
            .then(resources[a].order.cmp(&resources[b].order))
            .then(resources[a].name.cmp(&resources[b].name))
    });

    Ok(order)
}

/// Expand `${declared_name.output_key}` placeholders in a spec against
/// the outputs of already-created resources. Controllers never see the
/// placeholder syntax.
pub fn substitute_placeholders(
    spec: &serde_json::Value,
    outputs: &HashMap<String, HashMap<String, String>>,
) -> Result<serde_json::Value, GraphError> {
    let pattern = Regex::new(r"\$\{([A-Za-z0-9_-]+)\.([A-Za-z0-9_]+)\}")
        .expect("placeholder pattern is valid");

    fn walk(
        value: &serde_json::Value,
        pattern: &Regex,
        outputs: &HashMap<String, HashMap<String, String>>,
    ) -> Result<serde_json::Value, GraphError> {
        match value {
            serde_json::Value::String(text) => {
                let mut result = String::with_capacity(text.len());
                let mut last = 0;

                for captures in pattern.captures_iter(text) {
                    let whole = captures.get(0).expect("capture 0 always present");
                    let name = &captures[1];
                    let key = &captures[2];

                    let replacement = outputs
                        .get(name)
                        .ok_or_else(|| {
                            GraphError::Unresolved(
                                name.to_string(),
                                key.to_string(),
                                "no such resource created earlier".to_string(),
                            )
                        })?
                        .get(key)
                        .ok_or_else(|| {
                            GraphError::Unresolved(
                                name.to_string(),
                                key.to_string(),
                                "resource has no such output".to_string(),
                            )
                        })?;

                    result.push_str(&text[last..whole.start()]);
                    result.push_str(replacement);
                    last = whole.end();
                }
                result.push_str(&text[last..]);

                Ok(serde_json::Value::String(result))
            }
            serde_json::Value::Array(items) => {
                let mut out = Vec::with_capacity(items.len());
                for item in items {
                    out.push(walk(item, pattern, outputs)?);
                }
                Ok(serde_json::Value::Array(out))
            }
            serde_json::Value::Object(map) => {
                let mut out = serde_json::Map::with_capacity(map.len());
                for (k, v) in map {
                    out.insert(k.clone(), walk(v, pattern, outputs)?);
                }
                Ok(serde_json::Value::Object(out))
            }
            other => Ok(other.clone()),
        }
    }

    walk(spec, &pattern, outputs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::ResourceKind;

    fn resource(name: &str, deps: &[&str], order: i64) -> StackResourceRequest {
        StackResourceRequest {
            name: name.to_string(),
            kind: ResourceKind::DockerService,
            role: None,
            depends_on: deps.iter().map(|s| s.to_string()).collect(),
            order,
            spec: serde_json::Value::Null,
        }
    }

    #[test]
    fn test_dependencies_precede_dependents() {
        let resources = vec![
            resource("gw", &["app"], 0),
            resource("app", &["db"], 0),
            resource("db", &[], 0),
        ];

        let order = topo_order(&resources).unwrap();
        let names: Vec<&str> = order.iter().map(|&i| resources[i].name.as_str()).collect();
        assert_eq!(names, ["db", "app", "gw"]);
    }

    #[test]
    fn test_equal_depth_breaks_ties_on_order_then_name() {
        let resources = vec![
            resource("c", &[], 3),
            resource("a", &[], 1),
            resource("b", &[], 2),
        ];

        let order = topo_order(&resources).unwrap();
        let names: Vec<&str> = order.iter().map(|&i| resources[i].name.as_str()).collect();
        assert_eq!(names, ["a", "b", "c"]);

        let resources = vec![
            resource("zeta", &[], 0),
            resource("alpha", &[], 0),
        ];
        let order = topo_order(&resources).unwrap();
        let names: Vec<&str> = order.iter().map(|&i| resources[i].name.as_str()).collect();
        assert_eq!(names, ["alpha", "zeta"]);
    }

    #[test]
    fn test_cycle_is_rejected() {
        let resources = vec![
            resource("a", &["b"], 0),
            resource("b", &["c"], 0),
            resource("c", &["a"], 0),
        ];

        assert!(matches!(topo_order(&resources), Err(GraphError::Cycle(_))));
    }

    #[test]
    fn test_diamond_resolves() {
        let resources = vec![
            resource("top", &["left", "right"], 0),
            resource("left", &["base"], 0),
            resource("right", &["base"], 0),
            resource("base", &[], 0),
        ];

        let order = topo_order(&resources).unwrap();
        let names: Vec<&str> = order.iter().map(|&i| resources[i].name.as_str()).collect();
        assert_eq!(names[0], "base");
        assert_eq!(names[3], "top");
    }

    #[test]
    fn test_placeholder_substitution() {
        let mut outputs = HashMap::new();
        let mut db_outputs = HashMap::new();
        db_outputs.insert(
            "primary_endpoint".to_string(),
            "localhost:20000".to_string(),
        );
        outputs.insert("db".to_string(), db_outputs);

        let spec = serde_json::json!({
            "env": {
                "DATABASE_URL": "postgres://app:pw@${db.primary_endpoint}/app",
            },
            "nested": [{ "value": "${db.primary_endpoint}" }],
            "untouched": 42,
        });

        let result = substitute_placeholders(&spec, &outputs).unwrap();
        assert_eq!(
            result["env"]["DATABASE_URL"],
            "postgres://app:pw@localhost:20000/app"
        );
        assert_eq!(result["nested"][0]["value"], "localhost:20000");
        assert_eq!(result["untouched"], 42);
    }

    #[test]
    fn test_unknown_placeholder_errors() {
        let spec = serde_json::json!({ "url": "${db.primary_endpoint}" });
        let err = substitute_placeholders(&spec, &HashMap::new()).unwrap_err();
        assert!(matches!(err, GraphError::Unresolved(name, key, _)
            if name == "db" && key == "primary_endpoint"));
    }

    #[test]
    fn test_unknown_output_key_errors() {
        let mut outputs = HashMap::new();
        outputs.insert("db".to_string(), HashMap::new());

        let spec = serde_json::json!({ "url": "${db.missing_key}" });
        assert!(substitute_placeholders(&spec, &outputs).is_err());
    }
}
