use std::collections::HashMap;

/// Exact host to proxy host lookup table.
///
/// Hosts are compared as plain strings. There is no wildcard, prefix or suffix matching.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RegistryMap {
    proxies: HashMap<String, String>,
}

impl RegistryMap {
    pub fn new(proxies: HashMap<String, String>) -> Self {
        Self { proxies }
    }

    /// Returns the proxy for `host`, or `host` itself when it is not mapped.
    pub fn get<'a>(&'a self, host: &'a str) -> &'a str {
        self.proxies.get(host).map(String::as_str).unwrap_or(host)
    }

    pub fn len(&self) -> usize {
        self.proxies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.proxies.is_empty()
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for RegistryMap {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self::new(
            iter.into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_get_mapped_host() {
        let map: RegistryMap = [("docker.io", "mirror.example.com")].into_iter().collect();
        assert_eq!(map.get("docker.io"), "mirror.example.com");
    }

    #[test]
    fn test_get_unmapped_host_passes_through() {
        let map: RegistryMap = [("docker.io", "mirror.example.com")].into_iter().collect();
        assert_eq!(map.get("ghcr.io"), "ghcr.io");
        assert_eq!(RegistryMap::default().get("ghcr.io"), "ghcr.io");
    }

    #[test]
    fn test_get_is_exact_match_only() {
        let map: RegistryMap = [("docker.io", "mirror.example.com")].into_iter().collect();
        assert_eq!(map.get("index.docker.io"), "index.docker.io");
        assert_eq!(map.get("docker.io:443"), "docker.io:443");
        assert_eq!(map.get("DOCKER.IO"), "DOCKER.IO");
    }
}
