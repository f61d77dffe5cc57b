use std::collections::{BTreeMap, HashSet};

/// Matches every namespace when present in an include or exclude list.
pub const ALL_NAMESPACES: &str = "*";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NamespacePolicy {
    exclude: HashSet<String>,
    include: HashSet<String>,
}

impl NamespacePolicy {
    pub fn new<E, I>(exclude: E, include: I) -> Self
    where
        E: IntoIterator,
        E::Item: Into<String>,
        I: IntoIterator,
        I::Item: Into<String>,
    {
        Self {
            exclude: exclude.into_iter().map(Into::into).collect(),
            include: include.into_iter().map(Into::into).collect(),
        }
    }

    /// Exclusion wins over inclusion, and a namespace in neither list is not included.
    pub fn is_included(&self, namespace: &str) -> bool {
        if matches_namespace(&self.exclude, namespace) {
            return false;
        }
        matches_namespace(&self.include, namespace)
    }
}

fn matches_namespace(set: &HashSet<String>, namespace: &str) -> bool {
    set.contains(ALL_NAMESPACES) || set.contains(namespace)
}

/// Required label equalities. An empty selector matches everything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LabelSelector(BTreeMap<String, String>);

impl LabelSelector {
    pub fn new(match_labels: BTreeMap<String, String>) -> Self {
        Self(match_labels)
    }

    pub fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        self.0
            .iter()
            .all(|(key, value)| labels.get(key) == Some(value))
    }
}

/// Decides whether a pod qualifies for image rewriting.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Policy {
    pub namespaces: NamespacePolicy,
    pub pod_selector: LabelSelector,
    pub namespace_selector: LabelSelector,
}

impl Policy {
    pub fn is_included(
        &self,
        namespace: &str,
        pod_labels: &BTreeMap<String, String>,
        namespace_labels: &BTreeMap<String, String>,
    ) -> bool {
        self.namespaces.is_included(namespace)
            && self.pod_selector.matches(pod_labels)
            && self.namespace_selector.matches(namespace_labels)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labels(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn no_labels() -> BTreeMap<String, String> {
        BTreeMap::new()
    }

    #[test]
    fn test_exclude_takes_precedence() {
        let policy = NamespacePolicy::new(["kube-system"], ["kube-system", "default"]);
        assert!(!policy.is_included("kube-system"));
        assert!(policy.is_included("default"));
    }

    #[test]
    fn test_exclude_wildcard_excludes_everything() {
        let policy = NamespacePolicy::new(["*"], ["*", "default"]);
        assert!(!policy.is_included("default"));
        assert!(!policy.is_included("anything"));
    }

    #[test]
    fn test_include_wildcard_includes_everything() {
        let policy = NamespacePolicy::new(Vec::<String>::new(), ["*"]);
        assert!(policy.is_included("default"));
        assert!(policy.is_included("kube-system"));
    }

    #[test]
    fn test_namespace_in_neither_list_is_not_included() {
        let policy = NamespacePolicy::new(["kube-system"], ["team-a"]);
        assert!(!policy.is_included("team-b"));
        assert!(!NamespacePolicy::default().is_included("default"));
    }

    #[test]
    fn test_namespace_match_is_exact() {
        let policy = NamespacePolicy::new(["kube"], ["*"]);
        assert!(policy.is_included("kube-system"));
    }

    #[test]
    fn test_label_selector() {
        let selector = LabelSelector::new(labels(&[("team", "x")]));
        assert!(!selector.matches(&no_labels()));
        assert!(!selector.matches(&labels(&[("team", "y")])));
        assert!(selector.matches(&labels(&[("team", "x"), ("env", "prod")])));
        assert!(LabelSelector::default().matches(&no_labels()));
    }

    #[test]
    fn test_policy_requires_all_checks() {
        let policy = Policy {
            namespaces: NamespacePolicy::new(["kube-system"], ["*"]),
            pod_selector: LabelSelector::new(labels(&[("team", "x")])),
            namespace_selector: LabelSelector::new(labels(&[("proxy", "on")])),
        };
        let pod = labels(&[("team", "x")]);
        let ns = labels(&[("proxy", "on")]);

        assert!(policy.is_included("default", &pod, &ns));
        assert!(!policy.is_included("kube-system", &pod, &ns));
        assert!(!policy.is_included("default", &no_labels(), &ns));
        assert!(!policy.is_included("default", &pod, &no_labels()));
    }
}
