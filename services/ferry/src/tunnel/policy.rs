//! Server-mode access control.
//!
//! Applied after rustls has verified the client chain against the trusted
//! roots. A peer is allowed if any of its names matches any rule.

use ferry_credentials::PeerIdentity;

/// Which verified client identities may use the tunnel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AccessPolicy {
    /// Any peer with a valid chain.
    AllowAll,
    /// Only peers matching at least one rule.
    Rules(AccessRules),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AccessRules {
    pub common_names: Vec<String>,
    pub organizational_units: Vec<String>,
    pub dns_names: Vec<String>,
    pub uris: Vec<String>,
}

impl AccessRules {
    pub fn is_empty(&self) -> bool {
        self.common_names.is_empty()
            && self.organizational_units.is_empty()
            && self.dns_names.is_empty()
            && self.uris.is_empty()
    }
}

impl AccessPolicy {
    /// Check a verified peer against the policy.
    pub fn allows(&self, peer: &PeerIdentity) -> bool {
        match self {
            AccessPolicy::AllowAll => true,
            AccessPolicy::Rules(rules) => {
                any_match(&rules.common_names, &peer.common_names)
                    || any_match(&rules.organizational_units, &peer.organizational_units)
                    || rules
                        .dns_names
                        .iter()
                        .any(|allowed| peer.dns_names.iter().any(|n| n.eq_ignore_ascii_case(allowed)))
                    || any_match(&rules.uris, &peer.uris)
            }
        }
    }
}

fn any_match(allowed: &[String], presented: &[String]) -> bool {
    allowed.iter().any(|a| presented.contains(a))
}
