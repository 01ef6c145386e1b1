//! Forensic input snapshot taken at the start of planning

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::hash::{ContentHash, FieldHasher};

/// Tool name to reported version, ordered by tool name
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ToolchainManifest(BTreeMap<String, String>);

impl ToolchainManifest {
    /// Empty manifest
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a tool version, replacing any previous entry
    pub fn insert(&mut self, tool: impl Into<String>, version: impl Into<String>) {
        self.0.insert(tool.into(), version.into());
    }

    /// Builder-style insert
    #[must_use]
    pub fn with(mut self, tool: impl Into<String>, version: impl Into<String>) -> Self {
        self.insert(tool, version);
        self
    }

    /// Version for a tool, if recorded
    #[must_use]
    pub fn get(&self, tool: &str) -> Option<&str> {
        self.0.get(tool).map(String::as_str)
    }

    /// Iterate in tool-name order
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    fn canonical_bytes(&self) -> Vec<u8> {
        let mut out = Vec::new();
        for (tool, version) in &self.0 {
            out.extend_from_slice(tool.as_bytes());
            out.push(b'=');
            out.extend_from_slice(version.as_bytes());
            out.push(b'\n');
        }
        out
    }
}

impl FromIterator<(String, String)> for ToolchainManifest {
    fn from_iter<I: IntoIterator<Item = (String, String)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// Everything the planner saw, captured once per task
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputSnapshot {
    /// Raw user request
    pub request: String,
    /// Discovered repository map, as rendered for the planner
    pub repo_map: String,
    /// Content hash of the base tree (e.g. the git tree id)
    pub base_tree_hash: String,
    /// Toolchain versions present on the host
    pub toolchain: ToolchainManifest,
}

impl InputSnapshot {
    /// Capture a snapshot
    pub fn new(
        request: impl Into<String>,
        repo_map: impl Into<String>,
        base_tree_hash: impl Into<String>,
        toolchain: ToolchainManifest,
    ) -> Self {
        Self {
            request: request.into(),
            repo_map: repo_map.into(),
            base_tree_hash: base_tree_hash.into(),
            toolchain,
        }
    }

    /// Deterministic hash over all four inputs
    #[must_use]
    pub fn hash(&self) -> ContentHash {
        FieldHasher::new()
            .field("request", self.request.as_bytes())
            .field("repo_map", self.repo_map.as_bytes())
            .field("base_tree", self.base_tree_hash.as_bytes())
            .field("toolchain", &self.toolchain.canonical_bytes())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot() -> InputSnapshot {
        InputSnapshot::new(
            "add a health endpoint",
            "app.py\ntests/test_app.py",
            "4b825dc642cb6eb9a060e54bf8d69288fbee4904",
            ToolchainManifest::new().with("python", "3.12.1").with("pip", "24.0"),
        )
    }

    #[test]
    fn identical_inputs_hash_identically() {
        assert_eq!(snapshot().hash(), snapshot().hash());
    }

    #[test]
    fn manifest_insertion_order_is_irrelevant() {
        let a = ToolchainManifest::new().with("node", "20").with("npm", "10");
        let b = ToolchainManifest::new().with("npm", "10").with("node", "20");
        let mut s1 = snapshot();
        let mut s2 = snapshot();
        s1.toolchain = a;
        s2.toolchain = b;
        assert_eq!(s1.hash(), s2.hash());
    }

    #[test]
    fn every_field_contributes() {
        let base = snapshot().hash();

        let mut s = snapshot();
        s.request.push('!');
        assert_ne!(s.hash(), base);

        let mut s = snapshot();
        s.repo_map.clear();
        assert_ne!(s.hash(), base);

        let mut s = snapshot();
        s.base_tree_hash = "0".repeat(40);
        assert_ne!(s.hash(), base);

        let mut s = snapshot();
        s.toolchain.insert("python", "3.11.0");
        assert_ne!(s.hash(), base);
    }
}
