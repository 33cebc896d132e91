//! Input validation for operator- and agent-facing calls.

use common::api::{ClusterNetworkSpec, NodeIdentity};

use crate::config::LimitsConfig;
use crate::error::{ApiResult, AppError};

pub fn validate_field_len(what: &str, value: &str, limits: &LimitsConfig) -> ApiResult<()> {
    if value.len() > limits.max_field_len {
        return Err(AppError::invalid_argument(format!(
            "{what} exceeds {} bytes",
            limits.max_field_len
        )));
    }
    Ok(())
}

/// DNS-style name check: non-empty labels of letters, digits, and
/// hyphens, no leading/trailing hyphen, dot-separated.
pub fn is_valid_domain(domain: &str) -> bool {
    if domain.is_empty() || domain.len() > 253 {
        return false;
    }
    domain.split('.').all(|label| {
        !label.is_empty()
            && label.len() <= 63
            && !label.starts_with('-')
            && !label.ends_with('-')
            && label
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-')
    })
}

pub fn validate_domain(what: &str, domain: &str) -> ApiResult<()> {
    if !is_valid_domain(domain) {
        return Err(AppError::invalid_argument(format!(
            "{what} {domain:?} is not a valid domain name"
        )));
    }
    Ok(())
}

pub fn validate_identity(identity: &NodeIdentity, limits: &LimitsConfig) -> ApiResult<()> {
    if identity.hostname.trim().is_empty() {
        return Err(AppError::invalid_argument("hostname must not be empty"));
    }
    validate_field_len("hostname", &identity.hostname, limits)?;
    if !identity.domain.is_empty() {
        validate_domain("node domain", &identity.domain)?;
    }
    validate_field_len("agent_version", &identity.agent_version, limits)?;
    for ip in &identity.ips {
        if ip.parse::<std::net::IpAddr>().is_err() {
            return Err(AppError::invalid_argument(format!(
                "ip address {ip:?} is not valid"
            )));
        }
    }
    Ok(())
}

pub fn validate_profiles(profiles: &[String], limits: &LimitsConfig) -> ApiResult<()> {
    if profiles.len() > limits.max_profiles {
        return Err(AppError::invalid_argument(format!(
            "at most {} profiles may be assigned",
            limits.max_profiles
        )));
    }
    for profile in profiles {
        if profile.trim().is_empty() {
            return Err(AppError::invalid_argument("profile names must not be empty"));
        }
        validate_field_len("profile name", profile, limits)?;
    }
    Ok(())
}

pub fn validate_network_spec(spec: &ClusterNetworkSpec) -> ApiResult<()> {
    validate_domain("cluster domain", &spec.cluster_domain)?;
    for alt in &spec.alternate_domains {
        validate_domain("alternate domain", alt)?;
    }
    if spec.port_http == 0 || spec.port_https == 0 {
        return Err(AppError::invalid_argument("ports must be non-zero"));
    }
    if spec.acme_enabled && spec.admin_email.is_empty() {
        return Err(AppError::invalid_argument(
            "admin_email is required when ACME is enabled",
        ));
    }
    if !spec.admin_email.is_empty() && !spec.admin_email.contains('@') {
        return Err(AppError::invalid_argument("admin_email is not an email address"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limits() -> LimitsConfig {
        LimitsConfig {
            max_field_len: 255,
            max_profiles: 16,
            max_units_per_report: 256,
            max_artifact_bytes: 1024,
        }
    }

    #[test]
    fn domain_syntax() {
        assert!(is_valid_domain("cluster.example.org"));
        assert!(is_valid_domain("a-b.example"));
        assert!(!is_valid_domain(""));
        assert!(!is_valid_domain("-bad.example"));
        assert!(!is_valid_domain("bad-.example"));
        assert!(!is_valid_domain("ex ample.org"));
        assert!(!is_valid_domain("double..dot"));
    }

    #[test]
    fn identity_requires_hostname_and_valid_ips() {
        let mut identity = NodeIdentity {
            hostname: "node-1".to_string(),
            ips: vec!["10.0.0.4".to_string()],
            ..NodeIdentity::default()
        };
        assert!(validate_identity(&identity, &limits()).is_ok());

        identity.ips.push("not-an-ip".to_string());
        assert!(validate_identity(&identity, &limits()).is_err());

        identity.ips.pop();
        identity.hostname = "  ".to_string();
        assert!(validate_identity(&identity, &limits()).is_err());
    }

    #[test]
    fn acme_requires_admin_email() {
        let spec = ClusterNetworkSpec {
            cluster_domain: "cluster.example.org".to_string(),
            acme_enabled: true,
            ..ClusterNetworkSpec::default()
        };
        assert!(validate_network_spec(&spec).is_err());
    }
}
