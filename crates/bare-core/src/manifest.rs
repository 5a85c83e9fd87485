//! `GET D` instance manifest (spec.md §3 "Instance Manifest", §6.5,
//! component J).

use serde::Serialize;

#[derive(Debug, Clone, Serialize)]
pub struct Maintainer {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub website: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Project {
    pub name: String,
    pub description: String,
    pub repository: String,
    pub version: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct Manifest {
    pub versions: Vec<&'static str>,
    pub language: &'static str,
    #[serde(rename = "memoryUsage")]
    pub memory_usage: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub maintainer: Option<Maintainer>,
    pub project: Project,
}

impl Manifest {
    pub fn new(project: Project, maintainer: Option<Maintainer>) -> Self {
        Self {
            versions: vec!["v1", "v2", "v3"],
            language: "rust",
            memory_usage: current_memory_usage_mib(),
            maintainer,
            project,
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).expect("Manifest always serializes")
    }
}

/// Reads `/proc/self/status` for `VmRSS`; falls back to `0.0` off Linux
/// or if the read fails, since `memoryUsage` is advisory (spec.md §3).
fn current_memory_usage_mib() -> f64 {
    std::fs::read_to_string("/proc/self/status")
        .ok()
        .and_then(|status| {
            status.lines().find_map(|line| {
                let rest = line.strip_prefix("VmRSS:")?;
                let kib: f64 = rest.trim().trim_end_matches(" kB").trim().parse().ok()?;
                Some(kib / 1024.0)
            })
        })
        .unwrap_or(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serializes_expected_shape() {
        let manifest = Manifest::new(
            Project {
                name: "bare-server".into(),
                description: "tunneling proxy".into(),
                repository: "local".into(),
                version: "0.1.0".into(),
            },
            None,
        );
        let json = manifest.to_json();
        assert!(json.contains("\"versions\":[\"v1\",\"v2\",\"v3\"]"));
        assert!(json.contains("\"language\":\"rust\""));
        assert!(!json.contains("\"maintainer\""));
    }

    #[test]
    fn includes_maintainer_when_present() {
        let manifest = Manifest::new(
            Project {
                name: "bare-server".into(),
                description: "d".into(),
                repository: "r".into(),
                version: "0.1.0".into(),
            },
            Some(Maintainer { email: Some("a@b.c".into()), website: None }),
        );
        assert!(manifest.to_json().contains("\"email\":\"a@b.c\""));
    }
}
