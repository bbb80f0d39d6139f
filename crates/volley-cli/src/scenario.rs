//! Scenario files
//!
//! A scenario names a target, the schema to load and the steps one
//! iteration runs:
//!
//! ```toml
//! address = "localhost:8080"
//! schema = "ping.json"
//! iterations = 3
//!
//! [connect]
//! plaintext = true
//!
//! [[steps]]
//! kind = "stream"
//! method = "/connectrpc.ping.v1.PingService/CumSum"
//! messages = [{ number = 5 }, { number = 10 }]
//! ```

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;
use serde_json::Value;
use volley_core::schema::MethodInfo;
use volley_core::SchemaRegistry;

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Scenario {
    /// `host:port` or an `http(s)://` URL
    pub address: String,
    /// Descriptor JSON (`.json`) or binary protoset, relative to the scenario file
    pub schema: PathBuf,
    #[serde(default = "default_iterations")]
    pub iterations: u64,
    /// Options for `connect`, same keys a script would pass
    #[serde(default)]
    pub connect: Option<Value>,
    #[serde(default)]
    pub steps: Vec<Step>,
}

fn default_iterations() -> u64 {
    1
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Step {
    Unary {
        method: String,
        #[serde(default)]
        request: Value,
        #[serde(default)]
        options: Option<Value>,
    },
    Stream {
        method: String,
        #[serde(default)]
        messages: Vec<Value>,
        #[serde(default)]
        options: Option<Value>,
        /// Abort with `close()` instead of half-closing with `end()`
        #[serde(default)]
        close: bool,
    },
}

impl Step {
    pub fn method(&self) -> &str {
        match self {
            Step::Unary { method, .. } | Step::Stream { method, .. } => method,
        }
    }
}

impl Scenario {
    /// Read a scenario; relative schema paths resolve against its directory
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read scenario {}", path.display()))?;
        let mut scenario: Scenario = toml::from_str(&content)
            .with_context(|| format!("Failed to parse scenario {}", path.display()))?;

        if scenario.schema.is_relative() {
            if let Some(dir) = path.parent() {
                scenario.schema = dir.join(&scenario.schema);
            }
        }
        if scenario.steps.is_empty() {
            tracing::warn!(scenario = %path.display(), "Scenario has no steps");
        }
        Ok(scenario)
    }
}

/// Load a descriptor JSON document or a binary protoset into `registry`
pub fn load_schema(registry: &SchemaRegistry, path: &Path) -> Result<Vec<MethodInfo>> {
    let is_json = path
        .extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));

    let methods = if is_json {
        let document = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        registry.load_descriptor_json(&document)
    } else {
        registry.load_protoset_file(path)
    }
    .with_context(|| format!("Failed to load schema from {}", path.display()))?;

    tracing::info!(schema = %path.display(), methods = methods.len(), "Schema loaded");
    Ok(methods)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::io::Write;
    use tempfile::TempDir;

    const DESCRIPTORS: &str = include_str!("../../volley-core/testdata/ping.json");

    fn write(dir: &TempDir, name: &str, content: &str) -> PathBuf {
        let path = dir.path().join(name);
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(content.as_bytes()).unwrap();
        path
    }

    #[test]
    fn test_load_scenario() {
        let dir = TempDir::new().unwrap();
        let path = write(
            &dir,
            "ping.toml",
            r#"
address = "localhost:8080"
schema = "ping.json"
iterations = 2

[connect]
plaintext = true
protocol = "grpc"

[[steps]]
kind = "unary"
method = "/test.v1.PingService/Ping"
request = { number = 7 }

[[steps]]
kind = "stream"
method = "/test.v1.PingService/CumSum"
messages = [{ number = 5 }, { number = 10 }]
options = { timeout = "2s" }
"#,
        );

        let scenario = Scenario::load(&path).unwrap();
        assert_eq!(scenario.address, "localhost:8080");
        assert_eq!(scenario.schema, dir.path().join("ping.json"));
        assert_eq!(scenario.iterations, 2);
        assert_eq!(
            scenario.connect,
            Some(json!({"plaintext": true, "protocol": "grpc"}))
        );
        assert_eq!(
            scenario.steps[0],
            Step::Unary {
                method: "/test.v1.PingService/Ping".into(),
                request: json!({"number": 7}),
                options: None,
            }
        );
        assert_eq!(
            scenario.steps[1],
            Step::Stream {
                method: "/test.v1.PingService/CumSum".into(),
                messages: vec![json!({"number": 5}), json!({"number": 10})],
                options: Some(json!({"timeout": "2s"})),
                close: false,
            }
        );
    }

    #[test]
    fn test_defaults_and_absolute_schema() {
        let dir = TempDir::new().unwrap();
        let path = write(
            &dir,
            "bare.toml",
            "address = \"localhost:8080\"\nschema = \"/etc/volley/ping.binpb\"\n",
        );
        let scenario = Scenario::load(&path).unwrap();
        assert_eq!(scenario.iterations, 1);
        assert_eq!(scenario.schema, PathBuf::from("/etc/volley/ping.binpb"));
        assert!(scenario.connect.is_none());
        assert!(scenario.steps.is_empty());
    }

    #[test]
    fn test_unknown_step_kind_rejected() {
        let dir = TempDir::new().unwrap();
        let path = write(
            &dir,
            "bad.toml",
            r#"
address = "localhost:8080"
schema = "ping.json"

[[steps]]
kind = "carrier-pigeon"
method = "/test.v1.PingService/Ping"
"#,
        );
        let err = Scenario::load(&path).unwrap_err();
        assert!(format!("{err:#}").contains("Failed to parse scenario"));
    }

    #[test]
    fn test_load_descriptor_schema() {
        let dir = TempDir::new().unwrap();
        let path = write(&dir, "ping.json", DESCRIPTORS);
        let registry = SchemaRegistry::new();
        let methods = load_schema(&registry, &path).unwrap();
        let cum_sum = methods
            .iter()
            .find(|m| m.full_method == "/test.v1.PingService/CumSum")
            .unwrap();
        assert_eq!(cum_sum.kind(), "bidi-stream");
        assert!(registry.is_loaded());
    }

    #[test]
    fn test_missing_schema_file() {
        let dir = TempDir::new().unwrap();
        let registry = SchemaRegistry::new();
        let err = load_schema(&registry, &dir.path().join("missing.binpb")).unwrap_err();
        assert!(err.to_string().contains("Failed to load schema"));
    }
}
