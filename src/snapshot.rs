use crate::policy::{LabelSelector, NamespacePolicy, Policy};
use crate::registry_map::RegistryMap;
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeMap;

const DEFAULT_PROXIES: [(&str, &str); 6] = [
    ("docker.io", "docker.m.daocloud.io"),
    ("registry.k8s.io", "k8s.m.daocloud.io"),
    ("quay.io", "quay.m.daocloud.io"),
    ("ghcr.io", "ghcr.m.daocloud.io"),
    ("gcr.io", "gcr.m.daocloud.io"),
    ("k8s.gcr.io", "k8s-gcr.m.daocloud.io"),
];

const DEFAULT_EXCLUDE_NAMESPACES: [&str; 4] = [
    "kube-system",
    "kube-public",
    "kube-node-lease",
    "registry-proxy",
];

/// The registry proxy configuration document stored in the ConfigMap.
///
/// Fields missing from the document take their empty value, so an omitted
/// `enabled` disables the proxy and an omitted `includeNamespaces` selects nothing.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ProxyConfig {
    #[serde(deserialize_with = "null_as_default")]
    pub enabled: bool,
    #[serde(deserialize_with = "null_as_default")]
    pub proxies: BTreeMap<String, String>,
    #[serde(deserialize_with = "null_as_default")]
    pub exclude_namespaces: Vec<String>,
    #[serde(deserialize_with = "null_as_default")]
    pub include_namespaces: Vec<String>,
    #[serde(deserialize_with = "null_as_default")]
    pub pod_selector: BTreeMap<String, String>,
    #[serde(deserialize_with = "null_as_default")]
    pub namespace_selector: BTreeMap<String, String>,
}

fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

impl ProxyConfig {
    /// Configuration used at startup and whenever the ConfigMap disappears.
    pub fn builtin() -> Self {
        Self {
            enabled: true,
            proxies: DEFAULT_PROXIES
                .iter()
                .map(|(from, to)| (from.to_string(), to.to_string()))
                .collect(),
            exclude_namespaces: DEFAULT_EXCLUDE_NAMESPACES
                .iter()
                .map(|ns| ns.to_string())
                .collect(),
            include_namespaces: vec![crate::policy::ALL_NAMESPACES.to_string()],
            pod_selector: BTreeMap::new(),
            namespace_selector: BTreeMap::new(),
        }
    }

    pub fn to_yaml(&self) -> Result<String, serde_yaml_ng::Error> {
        serde_yaml_ng::to_string(self)
    }
}

/// Immutable view of one configuration generation, shared by in-flight requests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigSnapshot {
    pub enabled: bool,
    pub registries: RegistryMap,
    pub policy: Policy,
    document: ProxyConfig,
}

impl ConfigSnapshot {
    pub fn defaults() -> Self {
        Self::from(ProxyConfig::builtin())
    }

    pub fn document(&self) -> &ProxyConfig {
        &self.document
    }

    /// YAML rendering of the configuration this snapshot was built from.
    pub fn render(&self) -> Result<String, serde_yaml_ng::Error> {
        self.document().to_yaml()
    }
}

impl Default for ConfigSnapshot {
    fn default() -> Self {
        Self::defaults()
    }
}

impl From<ProxyConfig> for ConfigSnapshot {
    fn from(document: ProxyConfig) -> Self {
        let registries = document
            .proxies
            .iter()
            .map(|(from, to)| (from.clone(), to.clone()))
            .collect();
        let policy = Policy {
            namespaces: NamespacePolicy::new(
                document.exclude_namespaces.iter().cloned(),
                document.include_namespaces.iter().cloned(),
            ),
            pod_selector: LabelSelector::new(document.pod_selector.clone()),
            namespace_selector: LabelSelector::new(document.namespace_selector.clone()),
        };

        Self {
            enabled: document.enabled,
            registries,
            policy,
            document,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let snapshot = ConfigSnapshot::defaults();
        assert!(snapshot.enabled);
        assert_eq!(snapshot.registries.get("docker.io"), "docker.m.daocloud.io");
        assert_eq!(snapshot.registries.get("k8s.gcr.io"), "k8s-gcr.m.daocloud.io");
        assert_eq!(snapshot.registries.len(), 6);

        let empty = BTreeMap::new();
        assert!(!snapshot.policy.is_included("kube-system", &empty, &empty));
        assert!(!snapshot.policy.is_included("registry-proxy", &empty, &empty));
        assert!(snapshot.policy.is_included("default", &empty, &empty));
    }

    #[test]
    fn test_deserialize_document() {
        let yaml = r#"
        enabled: true
        proxies:
          docker.io: mirror.example.com
        excludeNamespaces:
          - kube-system
        includeNamespaces:
          - "*"
        podSelector:
          team: x
        namespaceSelector:
          proxy: enabled
        "#;

        let document: ProxyConfig = serde_yaml_ng::from_str(yaml).expect("Should parse document");
        assert!(document.enabled);
        assert_eq!(document.proxies["docker.io"], "mirror.example.com");
        assert_eq!(document.exclude_namespaces, vec!["kube-system"]);
        assert_eq!(document.include_namespaces, vec!["*"]);
        assert_eq!(document.pod_selector["team"], "x");
        assert_eq!(document.namespace_selector["proxy"], "enabled");
    }

    #[test]
    fn test_missing_and_null_fields_are_empty() {
        let document: ProxyConfig =
            serde_yaml_ng::from_str("proxies:\nincludeNamespaces: [default]\n").unwrap();
        assert!(!document.enabled);
        assert!(document.proxies.is_empty());
        assert!(document.exclude_namespaces.is_empty());
        assert_eq!(document.include_namespaces, vec!["default"]);
        assert!(document.pod_selector.is_empty());
    }

    #[test]
    fn test_unknown_fields_are_ignored() {
        let document: ProxyConfig =
            serde_yaml_ng::from_str("enabled: true\nincludeRegistries: [docker.io]\n").unwrap();
        assert!(document.enabled);
    }

    #[test]
    fn test_render_round_trips_document() {
        let snapshot = ConfigSnapshot::defaults();
        let yaml = snapshot.render().expect("Should render");
        assert!(yaml.contains("excludeNamespaces"));
        let reparsed: ProxyConfig = serde_yaml_ng::from_str(&yaml).unwrap();
        assert_eq!(&reparsed, snapshot.document());
    }
}
