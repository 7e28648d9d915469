//! Rig configuration types and validation

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::lifecycle::NodeSettings;
use crate::registry::NodeKind;
use crate::retry::RetryConfig;

/// One node of a rig.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeSpec {
    /// Unique node name; also its source tag and topic prefix.
    pub name: String,
    pub kind: NodeKind,
    /// Kind-specific parameters, decoded by the node's factory.
    #[serde(default)]
    pub params: serde_json::Value,
    /// Names of the publishing nodes this node reads from.
    #[serde(default)]
    pub inputs: Vec<String>,
}

impl NodeSpec {
    pub fn new(name: impl Into<String>, kind: NodeKind) -> Self {
        Self {
            name: name.into(),
            kind,
            params: serde_json::Value::Null,
            inputs: vec![],
        }
    }

    pub fn with_params(mut self, params: serde_json::Value) -> Self {
        self.params = params;
        self
    }

    pub fn with_inputs<I, S>(mut self, inputs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.inputs = inputs.into_iter().map(Into::into).collect();
        self
    }

    /// Decodes `params` into `P`; absent params give `P::default()`.
    pub fn decode_params<P: DeserializeOwned + Default>(&self) -> Result<P, ConfigError> {
        if self.params.is_null() {
            return Ok(P::default());
        }
        serde_json::from_value(self.params.clone()).map_err(|e| ConfigError::BadParams {
            node: self.name.clone(),
            message: e.to_string(),
        })
    }
}

/// Complete rig configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RigConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_poll_timeout_ms")]
    pub poll_timeout_ms: u64,
    /// Absent waits at the barrier forever.
    #[serde(default)]
    pub barrier_timeout_ms: Option<u64>,
    #[serde(default)]
    pub retry: RetryConfig,
    pub nodes: Vec<NodeSpec>,
}

fn default_host() -> String {
    "localhost".to_string()
}

fn default_poll_timeout_ms() -> u64 {
    50
}

impl RigConfig {
    pub fn new(nodes: Vec<NodeSpec>) -> Self {
        Self {
            host: default_host(),
            poll_timeout_ms: default_poll_timeout_ms(),
            barrier_timeout_ms: None,
            retry: RetryConfig::default(),
            nodes,
        }
    }

    pub fn from_yaml_str(yaml: &str) -> Result<Self, ConfigError> {
        Ok(serde_yaml::from_str(yaml)?)
    }

    /// Reads and validates a YAML rig file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        let config = Self::from_yaml_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn node(&self, name: &str) -> Option<&NodeSpec> {
        self.nodes.iter().find(|n| n.name == name)
    }

    /// Every node name, in declaration order. These are the barrier's
    /// expected participants.
    pub fn participants(&self) -> Vec<String> {
        self.nodes.iter().map(|n| n.name.clone()).collect()
    }

    pub fn barrier_timeout(&self) -> Option<Duration> {
        self.barrier_timeout_ms.map(Duration::from_millis)
    }

    pub fn settings(&self) -> NodeSettings {
        NodeSettings {
            poll_timeout: Duration::from_millis(self.poll_timeout_ms.max(1)),
            retry: self.retry.clone().into(),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.nodes.is_empty() {
            return Err(ConfigError::Empty);
        }
        if self.retry.max_attempts == Some(0) {
            return Err(ConfigError::ZeroAttempts);
        }

        let mut seen = HashSet::new();
        for node in &self.nodes {
            if !is_valid_name(&node.name) {
                return Err(ConfigError::InvalidName(node.name.clone()));
            }
            if !seen.insert(node.name.as_str()) {
                return Err(ConfigError::DuplicateName(node.name.clone()));
            }
        }

        for node in &self.nodes {
            if node.kind.subscribes() && node.inputs.is_empty() {
                return Err(ConfigError::MissingInputs(node.name.clone()));
            }
            if !node.kind.subscribes() && !node.inputs.is_empty() {
                return Err(ConfigError::UnexpectedInputs(node.name.clone()));
            }
            for input in &node.inputs {
                let Some(upstream) = self.node(input) else {
                    return Err(ConfigError::UnknownInput {
                        node: node.name.clone(),
                        input: input.clone(),
                    });
                };
                if !upstream.kind.publishes() {
                    return Err(ConfigError::NotAPublisher {
                        node: node.name.clone(),
                        input: input.clone(),
                    });
                }
            }
        }

        self.build_order().map(|_| ())
    }

    /// Nodes ordered so that every node comes after its inputs.
    pub fn build_order(&self) -> Result<Vec<&NodeSpec>, ConfigError> {
        let mut order = Vec::with_capacity(self.nodes.len());
        let mut marks = HashMap::new();
        for node in &self.nodes {
            self.visit(node, &mut marks, &mut order)?;
        }
        Ok(order)
    }

    fn visit<'a>(
        &'a self,
        node: &'a NodeSpec,
        marks: &mut HashMap<&'a str, bool>,
        order: &mut Vec<&'a NodeSpec>,
    ) -> Result<(), ConfigError> {
        match marks.get(node.name.as_str()) {
            Some(true) => return Ok(()),
            Some(false) => return Err(ConfigError::Cycle(node.name.clone())),
            None => {}
        }
        marks.insert(&node.name, false);
        for input in &node.inputs {
            let upstream = self.node(input).ok_or_else(|| ConfigError::UnknownInput {
                node: node.name.clone(),
                input: input.clone(),
            })?;
            self.visit(upstream, marks, order)?;
        }
        marks.insert(&node.name, true);
        order.push(node);
        Ok(())
    }
}

/// Names become topic prefixes, so a dot would let one node's
/// subscription match another node's topic.
fn is_valid_name(name: &str) -> bool {
    !name.is_empty() && !name.chars().any(|c| c == '.' || c.is_whitespace())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const RIG: &str = r#"
host: lab-pc
barrier_timeout_ms: 2000
retry: { backoff_ms: 10, max_attempts: 3 }
nodes:
  - name: dummy
    kind: dummy_producer
    params: { sampling_rate_hz: 50, devices: 2 }
  - name: probe
    kind: latency_probe
    inputs: [dummy]
  - name: logger
    kind: data_logger
    inputs: [dummy, probe]
"#;

    #[test]
    fn test_parse_and_validate() {
        let config = RigConfig::from_yaml_str(RIG).unwrap();
        config.validate().unwrap();
        assert_eq!(config.host, "lab-pc");
        assert_eq!(config.poll_timeout_ms, 50);
        assert_eq!(config.barrier_timeout(), Some(Duration::from_secs(2)));
        assert_eq!(config.retry.max_attempts, Some(3));
        assert_eq!(config.retry.max_backoff_ms, 5000);
        assert_eq!(config.participants(), vec!["dummy", "probe", "logger"]);
        assert_eq!(config.nodes[0].params, json!({"sampling_rate_hz": 50, "devices": 2}));

        let settings = config.settings();
        assert_eq!(settings.retry.max_attempts, Some(3));
        assert_eq!(settings.retry.backoff, Duration::from_millis(10));
    }

    #[test]
    fn test_unknown_kind_fails_to_load() {
        let yaml = "nodes:\n  - name: x\n    kind: quantum_sensor\n";
        assert!(matches!(RigConfig::from_yaml_str(yaml), Err(ConfigError::Yaml(_))));
    }

    #[test]
    fn test_build_order_puts_inputs_first() {
        let config = RigConfig::from_yaml_str(RIG).unwrap();
        let order: Vec<&str> = config.build_order().unwrap().iter().map(|n| n.name.as_str()).collect();
        assert_eq!(order, vec!["dummy", "probe", "logger"]);

        let reversed = RigConfig::new(config.nodes.iter().rev().cloned().collect());
        let order: Vec<&str> = reversed.build_order().unwrap().iter().map(|n| n.name.as_str()).collect();
        assert_eq!(order, vec!["dummy", "probe", "logger"]);
    }

    #[test]
    fn test_validation_errors() {
        assert!(matches!(RigConfig::new(vec![]).validate(), Err(ConfigError::Empty)));

        let dup = RigConfig::new(vec![
            NodeSpec::new("a", NodeKind::DummyProducer),
            NodeSpec::new("a", NodeKind::DummyProducer),
        ]);
        assert!(matches!(dup.validate(), Err(ConfigError::DuplicateName(n)) if n == "a"));

        let dotted = RigConfig::new(vec![NodeSpec::new("a.b", NodeKind::DummyProducer)]);
        assert!(matches!(dotted.validate(), Err(ConfigError::InvalidName(_))));

        let unknown = RigConfig::new(vec![NodeSpec::new("log", NodeKind::DataLogger).with_inputs(["ghost"])]);
        assert!(matches!(unknown.validate(), Err(ConfigError::UnknownInput { .. })));

        let from_consumer = RigConfig::new(vec![
            NodeSpec::new("src", NodeKind::DummyProducer),
            NodeSpec::new("log", NodeKind::DataLogger).with_inputs(["src"]),
            NodeSpec::new("log2", NodeKind::DataLogger).with_inputs(["log"]),
        ]);
        assert!(matches!(from_consumer.validate(), Err(ConfigError::NotAPublisher { .. })));

        let no_inputs = RigConfig::new(vec![NodeSpec::new("log", NodeKind::DataLogger)]);
        assert!(matches!(no_inputs.validate(), Err(ConfigError::MissingInputs(_))));

        let producer_inputs = RigConfig::new(vec![
            NodeSpec::new("a", NodeKind::DummyProducer),
            NodeSpec::new("b", NodeKind::DummyProducer).with_inputs(["a"]),
        ]);
        assert!(matches!(producer_inputs.validate(), Err(ConfigError::UnexpectedInputs(_))));
    }

    #[test]
    fn test_zero_connect_attempts_is_rejected() {
        let yaml = "retry: { max_attempts: 0 }\nnodes:\n  - name: a\n    kind: dummy_producer\n";
        let config = RigConfig::from_yaml_str(yaml).unwrap();
        assert!(matches!(config.validate(), Err(ConfigError::ZeroAttempts)));

        let mut once = config.clone();
        once.retry.max_attempts = Some(1);
        once.validate().unwrap();
    }

    #[test]
    fn test_cycle_is_rejected() {
        let config = RigConfig::new(vec![
            NodeSpec::new("p", NodeKind::LatencyProbe).with_inputs(["q"]),
            NodeSpec::new("q", NodeKind::LatencyProbe).with_inputs(["p"]),
        ]);
        assert!(matches!(config.validate(), Err(ConfigError::Cycle(_))));
    }

    #[test]
    fn test_decode_params() {
        #[derive(Debug, Default, Deserialize, PartialEq)]
        struct Params {
            #[serde(default)]
            rate: f64,
        }
        let spec = NodeSpec::new("n", NodeKind::DummyProducer);
        assert_eq!(spec.decode_params::<Params>().unwrap(), Params::default());
        let spec = spec.with_params(json!({"rate": 2.5}));
        assert_eq!(spec.decode_params::<Params>().unwrap().rate, 2.5);
        let spec = NodeSpec::new("n", NodeKind::DummyProducer).with_params(json!({"rate": "fast"}));
        assert!(matches!(spec.decode_params::<Params>(), Err(ConfigError::BadParams { .. })));
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rig.yaml");
        std::fs::write(&path, RIG).unwrap();
        let config = RigConfig::load(&path).unwrap();
        assert_eq!(config.nodes.len(), 3);

        assert!(matches!(RigConfig::load(dir.path().join("missing.yaml")), Err(ConfigError::Io(_))));
    }
}
