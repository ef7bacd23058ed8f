//
// kernel_spec.rs
//
// Copyright (C) 2025 Posit Software, PBC. All rights reserved.
//
//

//! Discovery of installed Jupyter kernels.

use std::collections::BTreeMap;
use std::process::Stdio;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A kernel launch specification, from the Jupyter documentation for
/// [Kernel Specs](https://jupyter-client.readthedocs.io/en/stable/kernels.html#kernel-specs).
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct KernelSpec {
    /// The unique kernel name (the directory name under `kernels/`)
    #[serde(default)]
    pub name: String,

    /// List of command line arguments to be used to start the kernel
    pub argv: Vec<String>,

    /// The kernel name as it should be displayed in the UI
    pub display_name: String,

    /// The kernel's language
    pub language: String,

    /// The directory holding the kernel's resources
    #[serde(default)]
    pub resource_dir: String,

    /// Environment variables to set for the kernel
    #[serde(default)]
    pub env: serde_json::Map<String, Value>,
}

/// The placeholder token Jupyter kernel specs use for the connection file path.
pub const CONNECTION_FILE_PLACEHOLDER: &str = "{connection_file}";

impl KernelSpec {
    /// Whether the spec's argv is usable: non-empty, with the connection file
    /// placeholder appearing in exactly one argument.
    pub fn is_launchable(&self) -> bool {
        !self.argv.is_empty()
            && self
                .argv
                .iter()
                .filter(|arg| arg.contains(CONNECTION_FILE_PLACEHOLDER))
                .count()
                == 1
    }
}

/// One entry in the `jupyter kernelspec list --json` output.
#[derive(Deserialize)]
struct KernelSpecEntry {
    resource_dir: String,
    spec: KernelSpec,
}

/// The top-level shape of the `jupyter kernelspec list --json` output.
#[derive(Deserialize)]
struct KernelSpecList {
    kernelspecs: BTreeMap<String, KernelSpecEntry>,
}

/// A registry of the kernels installed on this machine.
///
/// Discovery shells out to the `jupyter` command line tool. Absence of the
/// tool, or of any kernels, is a normal state: discovery degrades to an empty
/// registry and never errors.
#[derive(Debug, Default)]
pub struct KernelSpecRegistry {
    /// Discovered kernels, keyed by kernel name. BTreeMap keeps iteration in
    /// lexicographic order so language resolution is reproducible.
    specs: BTreeMap<String, KernelSpec>,
}

impl KernelSpecRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a registry from a fixed set of specs. Used by hosts that manage
    /// their own kernel installations, and by tests.
    pub fn from_specs(specs: Vec<KernelSpec>) -> Self {
        let mut registry = Self::new();
        for spec in specs {
            registry.insert(spec);
        }
        registry
    }

    /// Discover installed kernels by invoking `jupyter kernelspec list --json`.
    pub async fn discover() -> Self {
        let output = tokio::process::Command::new("jupyter")
            .args(["kernelspec", "list", "--json"])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await;

        let output = match output {
            Ok(output) => output,
            Err(e) => {
                log::debug!("Kernel discovery unavailable ('jupyter' did not run: {})", e);
                return Self::new();
            }
        };

        if !output.status.success() {
            log::debug!(
                "Kernel discovery failed with status {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr)
            );
            return Self::new();
        }

        Self::parse_discovery_output(&output.stdout)
    }

    /// Parse the JSON output of `jupyter kernelspec list --json` into a
    /// registry. Malformed output yields an empty registry; individual specs
    /// that are not launchable are skipped with a warning.
    pub fn parse_discovery_output(output: &[u8]) -> Self {
        let list: KernelSpecList = match serde_json::from_slice(output) {
            Ok(list) => list,
            Err(e) => {
                log::warn!("Could not parse kernel discovery output: {}", e);
                return Self::new();
            }
        };

        let mut registry = Self::new();
        for (name, entry) in list.kernelspecs {
            let mut spec = entry.spec;
            spec.name = name;
            spec.resource_dir = entry.resource_dir;
            registry.insert(spec);
        }
        registry
    }

    fn insert(&mut self, spec: KernelSpec) {
        if !spec.is_launchable() {
            log::warn!(
                "Skipping kernel '{}': argv must be non-empty and contain '{}' exactly once",
                spec.name,
                CONNECTION_FILE_PLACEHOLDER
            );
            return;
        }
        log::trace!(
            "Discovered kernel '{}' ({}) for language '{}'",
            spec.name,
            spec.display_name,
            spec.language
        );
        self.specs.insert(spec.name.clone(), spec);
    }

    /// The number of kernels in the registry.
    pub fn len(&self) -> usize {
        self.specs.len()
    }

    /// Whether the registry holds no kernels.
    pub fn is_empty(&self) -> bool {
        self.specs.is_empty()
    }

    /// All discovered kernels, in lexicographic order by name.
    pub fn specs(&self) -> impl Iterator<Item = &KernelSpec> {
        self.specs.values()
    }

    /// Look up a kernel by its unique name.
    pub fn get(&self, name: &str) -> Option<&KernelSpec> {
        self.specs.get(name)
    }

    /// Find the first kernel (lexicographically by name) whose language
    /// matches `lang`, case-insensitively. Returns `None` for unknown
    /// languages; never errors.
    pub fn find_for_language(&self, lang: &str) -> Option<&KernelSpec> {
        self.specs
            .values()
            .find(|spec| spec.language.eq_ignore_ascii_case(lang))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(name: &str, language: &str) -> KernelSpec {
        KernelSpec {
            name: name.to_string(),
            argv: vec![
                "python".to_string(),
                "-m".to_string(),
                "ipykernel_launcher".to_string(),
                "-f".to_string(),
                "{connection_file}".to_string(),
            ],
            display_name: format!("{} kernel", name),
            language: language.to_string(),
            resource_dir: String::new(),
            env: serde_json::Map::new(),
        }
    }

    #[test]
    fn test_find_for_language_case_insensitive() {
        let registry = KernelSpecRegistry::from_specs(vec![spec("python3", "python")]);
        assert!(registry.find_for_language("Python").is_some());
        assert!(registry.find_for_language("PYTHON").is_some());
        assert!(registry.find_for_language("python").is_some());
    }

    #[test]
    fn test_find_for_language_unknown_returns_none() {
        let registry = KernelSpecRegistry::from_specs(vec![spec("python3", "python")]);
        assert!(registry
            .find_for_language("nonexistent-language-xyz")
            .is_none());
    }

    #[test]
    fn test_find_for_language_lexicographic_tiebreak() {
        let registry = KernelSpecRegistry::from_specs(vec![
            spec("zpython", "python"),
            spec("apython", "python"),
        ]);
        // Two kernels serve the language; the first by name wins.
        assert_eq!(
            registry.find_for_language("python").unwrap().name,
            "apython"
        );
    }

    #[test]
    fn test_rejects_spec_without_placeholder() {
        let mut bad = spec("broken", "python");
        bad.argv = vec!["python".to_string()];
        let registry = KernelSpecRegistry::from_specs(vec![bad]);
        assert!(registry.is_empty());
    }

    #[test]
    fn test_rejects_spec_with_duplicate_placeholder() {
        let mut bad = spec("broken", "python");
        bad.argv.push("{connection_file}".to_string());
        let registry = KernelSpecRegistry::from_specs(vec![bad]);
        assert!(registry.is_empty());
    }

    #[test]
    fn test_parse_discovery_output() {
        let json = serde_json::json!({
            "kernelspecs": {
                "python3": {
                    "resource_dir": "/usr/share/jupyter/kernels/python3",
                    "spec": {
                        "argv": ["python", "-m", "ipykernel_launcher", "-f", "{connection_file}"],
                        "display_name": "Python 3",
                        "language": "python",
                        "env": {}
                    }
                }
            }
        });
        let registry =
            KernelSpecRegistry::parse_discovery_output(json.to_string().as_bytes());
        assert_eq!(registry.len(), 1);
        let spec = registry.get("python3").unwrap();
        assert_eq!(spec.language, "python");
        assert_eq!(spec.resource_dir, "/usr/share/jupyter/kernels/python3");
    }

    #[test]
    fn test_parse_discovery_output_malformed() {
        let registry = KernelSpecRegistry::parse_discovery_output(b"this is not json");
        assert!(registry.is_empty());
    }
}
