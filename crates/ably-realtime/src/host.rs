//! Endpoint resolution from the deployment environment.

pub const DEFAULT_REST_HOST: &str = "rest.ably.io";
pub const DEFAULT_REALTIME_HOST: &str = "realtime.ably.io";

/// REST and realtime hostnames for one deployment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Hosts {
    pub rest: String,
    pub realtime: String,
}

impl Default for Hosts {
    fn default() -> Self {
        Self {
            rest: DEFAULT_REST_HOST.to_string(),
            realtime: DEFAULT_REALTIME_HOST.to_string(),
        }
    }
}

/// Map an environment name to its hosts.
///
/// `Some("eu-central-1-a-sandbox")` yields `eu-central-1-a-sandbox-rest.ably.io`
/// and `eu-central-1-a-sandbox-realtime.ably.io`. `None` or an empty name
/// yields the production defaults. The name is used verbatim (case preserved).
pub fn resolve_hosts(environment: Option<&str>) -> Hosts {
    match environment {
        Some(env) if !env.is_empty() => Hosts {
            rest: format!("{env}-{DEFAULT_REST_HOST}"),
            realtime: format!("{env}-{DEFAULT_REALTIME_HOST}"),
        },
        _ => Hosts::default(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_environment_uses_defaults() {
        let hosts = resolve_hosts(None);
        assert_eq!(hosts.rest, "rest.ably.io");
        assert_eq!(hosts.realtime, "realtime.ably.io");
        assert_eq!(resolve_hosts(Some("")), hosts);
    }

    #[test]
    fn environment_prefixes_both_hosts() {
        let hosts = resolve_hosts(Some("test"));
        assert_eq!(hosts.rest, "test-rest.ably.io");
        assert_eq!(hosts.realtime, "test-realtime.ably.io");
    }

    #[test]
    fn environment_case_is_preserved() {
        let hosts = resolve_hosts(Some("Sandbox"));
        assert_eq!(hosts.rest, "Sandbox-rest.ably.io");
        assert_eq!(hosts.realtime, "Sandbox-realtime.ably.io");
    }
}
