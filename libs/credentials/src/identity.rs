//! X.509 metadata extraction.
//!
//! The tunnel never makes trust decisions from this module; chain validation
//! is done by rustls. These types only describe a certificate that has
//! already been loaded or verified.

use chrono::{DateTime, Utc};
use x509_parser::extensions::GeneralName;
use x509_parser::parse_x509_certificate;

use crate::CredentialError;

/// Summary of the local identity certificate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdentityInfo {
    /// Subject distinguished name, RFC 4514 style.
    pub subject: String,
    /// Start of the validity window.
    pub not_before: DateTime<Utc>,
    /// End of the validity window.
    pub not_after: DateTime<Utc>,
}

impl IdentityInfo {
    /// Parse the leaf certificate of an identity chain.
    pub fn from_der(der: &[u8]) -> Result<Self, CredentialError> {
        let (_, cert) = parse_x509_certificate(der)
            .map_err(|e| CredentialError::InvalidCertificate(e.to_string()))?;
        let validity = cert.validity();

        Ok(Self {
            subject: cert.subject().to_string(),
            not_before: timestamp(validity.not_before.timestamp()),
            not_after: timestamp(validity.not_after.timestamp()),
        })
    }

    /// Seconds until `not_after`, negative once expired.
    pub fn seconds_until_expiry(&self, now: DateTime<Utc>) -> i64 {
        (self.not_after - now).num_seconds()
    }

    /// Whether `now` falls inside the validity window.
    pub fn is_valid_at(&self, now: DateTime<Utc>) -> bool {
        self.not_before <= now && now <= self.not_after
    }
}

/// Names carried by a verified peer certificate.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PeerIdentity {
    pub common_names: Vec<String>,
    pub organizational_units: Vec<String>,
    pub dns_names: Vec<String>,
    pub uris: Vec<String>,
}

impl PeerIdentity {
    /// Extract subject and SAN names from a DER certificate.
    pub fn from_der(der: &[u8]) -> Result<Self, CredentialError> {
        let (_, cert) = parse_x509_certificate(der)
            .map_err(|e| CredentialError::InvalidCertificate(e.to_string()))?;

        let subject = cert.subject();
        let common_names = subject
            .iter_common_name()
            .filter_map(|attr| attr.as_str().ok())
            .map(str::to_string)
            .collect();
        let organizational_units = subject
            .iter_organizational_unit()
            .filter_map(|attr| attr.as_str().ok())
            .map(str::to_string)
            .collect();

        let mut dns_names = Vec::new();
        let mut uris = Vec::new();
        if let Ok(Some(san)) = cert.subject_alternative_name() {
            for name in &san.value.general_names {
                match name {
                    GeneralName::DNSName(dns) => dns_names.push(dns.to_string()),
                    GeneralName::URI(uri) => uris.push(uri.to_string()),
                    _ => {}
                }
            }
        }

        Ok(Self {
            common_names,
            organizational_units,
            dns_names,
            uris,
        })
    }
}

fn timestamp(secs: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(secs, 0).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rcgen::{CertificateParams, DnType, KeyPair};

    fn cert_der(cn: &str, ou: Option<&str>, sans: Vec<String>) -> Vec<u8> {
        let mut params = CertificateParams::new(sans).unwrap();
        params.distinguished_name.push(DnType::CommonName, cn);
        if let Some(ou) = ou {
            params
                .distinguished_name
                .push(DnType::OrganizationalUnitName, ou);
        }
        let key = KeyPair::generate().unwrap();
        params.self_signed(&key).unwrap().der().to_vec()
    }

    #[test]
    fn test_peer_identity_names() {
        let der = cert_der(
            "client",
            Some("payments"),
            vec!["client.example.test".to_string()],
        );
        let peer = PeerIdentity::from_der(&der).unwrap();

        assert_eq!(peer.common_names, vec!["client"]);
        assert_eq!(peer.organizational_units, vec!["payments"]);
        assert_eq!(peer.dns_names, vec!["client.example.test"]);
        assert!(peer.uris.is_empty());
    }

    #[test]
    fn test_identity_info_window() {
        let der = cert_der("server", None, vec!["localhost".to_string()]);
        let info = IdentityInfo::from_der(&der).unwrap();

        assert!(info.subject.contains("CN=server"));
        assert!(info.not_before < info.not_after);
        assert!(info.is_valid_at(Utc::now()));
        assert!(info.seconds_until_expiry(Utc::now()) > 0);
    }

    #[test]
    fn test_garbage_is_rejected() {
        let err = PeerIdentity::from_der(b"garbage").unwrap_err();
        assert!(matches!(err, CredentialError::InvalidCertificate(_)));
    }
}
