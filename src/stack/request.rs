//! Stack request types and structural validation

use serde::{Deserialize, Serialize};

use crate::resource::ResourceKind;

const ENVIRONMENTS: [&str; 3] = ["development", "staging", "production"];

/// Declarative create-stack request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateStackRequest {
    pub name: String,

    #[serde(default = "default_environment")]
    pub environment: String,

    #[serde(default)]
    pub description: Option<String>,

    #[serde(default)]
    pub tags: Vec<String>,

    pub resources: Vec<StackResourceRequest>,
}

fn default_environment() -> String {
    "development".to_string()
}

/// One declared resource within a stack request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StackResourceRequest {
    /// Declared name, unique within the stack
    pub name: String,

    pub kind: ResourceKind,

    #[serde(default)]
    pub role: Option<String>,

    /// Declared names this resource depends on
    #[serde(default)]
    pub depends_on: Vec<String>,

    /// Tie-breaker among resources at equal dependency depth
    #[serde(default)]
    pub order: i64,

    /// Kind-specific spec; may reference earlier resources' outputs
    /// with `${name.output_key}` placeholders
    pub spec: serde_json::Value,
}

impl CreateStackRequest {
    /// Structural validation; every error identifies the offending
    /// resource. Kind-specific spec schemas are checked by the
    /// controllers before any side effect.
    pub fn validate(&self) -> Result<(), String> {
        if self.name.trim().is_empty() {
            return Err("stack name must not be empty".to_string());
        }
        if !ENVIRONMENTS.contains(&self.environment.as_str()) {
            return Err(format!(
                "environment must be one of {:?}, got '{}'",
                ENVIRONMENTS, self.environment
            ));
        }
        if self.resources.is_empty() {
            return Err("stack must declare at least one resource".to_string());
        }

        let mut seen = std::collections::HashSet::new();
        for resource in &self.resources {
            if resource.name.trim().is_empty() {
                return Err("resource name must not be empty".to_string());
            }
            if !seen.insert(resource.name.as_str()) {
                return Err(format!(
                    "duplicate resource name '{}' in stack",
                    resource.name
                ));
            }
        }

        for resource in &self.resources {
            for dep in &resource.depends_on {
                if dep == &resource.name {
                    return Err(format!("resource '{}' depends on itself", resource.name));
                }
                if !seen.contains(dep.as_str()) {
                    return Err(format!(
                        "resource '{}' depends on unknown resource '{}'",
                        resource.name, dep
                    ));
                }
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resource(name: &str, deps: &[&str]) -> StackResourceRequest {
        StackResourceRequest {
            name: name.to_string(),
            kind: ResourceKind::DockerService,
            role: None,
            depends_on: deps.iter().map(|s| s.to_string()).collect(),
            order: 0,
            spec: serde_json::json!({ "image": "busybox" }),
        }
    }

    fn request(resources: Vec<StackResourceRequest>) -> CreateStackRequest {
        CreateStackRequest {
            name: "web".to_string(),
            environment: "development".to_string(),
            description: None,
            tags: vec![],
            resources,
        }
    }

    #[test]
    fn test_valid_request_passes() {
        let req = request(vec![resource("db", &[]), resource("app", &["db"])]);
        assert!(req.validate().is_ok());
    }

    #[test]
    fn test_empty_name_rejected() {
        let mut req = request(vec![resource("db", &[])]);
        req.name = "  ".to_string();
        assert!(req.validate().is_err());
    }

    #[test]
    fn test_unknown_dependency_names_the_pair() {
        let req = request(vec![resource("app", &["db"])]);
        let err = req.validate().unwrap_err();
        assert!(err.contains("'app'"));
        assert!(err.contains("'db'"));
    }

    #[test]
    fn test_self_dependency_rejected() {
        let req = request(vec![resource("app", &["app"])]);
        assert!(req.validate().unwrap_err().contains("depends on itself"));
    }

    #[test]
    fn test_duplicate_names_rejected() {
        let req = request(vec![resource("app", &[]), resource("app", &[])]);
        assert!(req.validate().unwrap_err().contains("duplicate"));
    }

    #[test]
    fn test_bad_environment_rejected() {
        let mut req = request(vec![resource("db", &[])]);
        req.environment = "qa".to_string();
        assert!(req.validate().is_err());
    }
}
