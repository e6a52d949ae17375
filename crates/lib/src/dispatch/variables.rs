//! Server-side values a client can query: hostname and nameserver.

use std::path::{Path, PathBuf};

/// Files the variable lookups read. Overridable for tests.
#[derive(Debug, Clone)]
pub struct VariableSources {
    pub namespace_file: PathBuf,
    pub resolv_conf: PathBuf,
}

impl Default for VariableSources {
    fn default() -> Self {
        Self {
            namespace_file: PathBuf::from("/var/run/secrets/kubernetes.io/serviceaccount/namespace"),
            resolv_conf: PathBuf::from("/etc/resolv.conf"),
        }
    }
}

impl VariableSources {
    /// Resolve a selector (`hostname`, `nameserver`). Unknown selectors yield `None`.
    pub fn lookup(&self, selector: Option<&str>) -> Option<String> {
        match selector? {
            "hostname" => self.hostname(),
            "nameserver" => self.nameserver(),
            other => {
                log::debug!("unknown variable selector: {}", other);
                None
            }
        }
    }

    /// System hostname, prefixed with `<namespace>/` when running in Kubernetes.
    pub fn hostname(&self) -> Option<String> {
        let host = hostname::get().ok()?.to_string_lossy().into_owned();
        log::info!("found hostname: {}", host);
        Some(with_namespace(&host, &self.namespace_file))
    }

    /// First `nameserver` entry of resolv.conf.
    pub fn nameserver(&self) -> Option<String> {
        let contents = std::fs::read_to_string(&self.resolv_conf).ok()?;
        let ns = first_nameserver(&contents)?;
        log::info!("found nameserver: {}", ns);
        Some(ns)
    }
}

fn with_namespace(host: &str, namespace_file: &Path) -> String {
    match std::fs::read_to_string(namespace_file) {
        Ok(ns) => {
            let ns: String = ns.chars().filter(|c| !c.is_whitespace()).collect();
            format!("{}/{}", ns, host)
        }
        Err(_) => host.to_string(),
    }
}

fn first_nameserver(resolv_conf: &str) -> Option<String> {
    resolv_conf
        .lines()
        .map(str::trim)
        .filter(|l| !l.starts_with('#') && !l.starts_with(';'))
        .find_map(|l| {
            let mut parts = l.split_whitespace();
            match (parts.next(), parts.next()) {
                (Some("nameserver"), Some(addr)) => Some(addr.to_string()),
                _ => None,
            }
        })
}
