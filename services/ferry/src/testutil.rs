//! Throwaway PKI for unit tests.

use std::path::PathBuf;

use ferry_credentials::{CertificateProvider, CredentialSource, IdentitySource};
use rcgen::{BasicConstraints, Certificate, CertificateParams, DnType, IsCa, KeyPair};
use tempfile::TempDir;

pub struct TestPki {
    dir: TempDir,
    ca: Certificate,
    ca_key: KeyPair,
}

impl TestPki {
    pub fn new() -> Self {
        let mut params = CertificateParams::new(Vec::new()).unwrap();
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.distinguished_name.push(DnType::CommonName, "root");
        let ca_key = KeyPair::generate().unwrap();
        let ca = params.self_signed(&ca_key).unwrap();

        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("root.crt"), ca.pem()).unwrap();

        Self { dir, ca, ca_key }
    }

    pub fn path(&self, name: &str) -> PathBuf {
        self.dir.path().join(name)
    }

    /// Write a keystore for `cn` (with a `localhost` SAN) and return its path.
    pub fn keystore(&self, cn: &str) -> PathBuf {
        let mut params = CertificateParams::new(vec!["localhost".to_string()]).unwrap();
        params.distinguished_name.push(DnType::CommonName, cn);
        let key = KeyPair::generate().unwrap();
        let cert = params.signed_by(&key, &self.ca, &self.ca_key).unwrap();

        let path = self.path(&format!("{cn}.pem"));
        std::fs::write(&path, format!("{}{}", cert.pem(), key.serialize_pem())).unwrap();
        path
    }

    pub fn provider(&self, cn: &str) -> CertificateProvider {
        CertificateProvider::load(CredentialSource {
            identity: IdentitySource::Keystore(self.keystore(cn)),
            cacert: self.path("root.crt"),
        })
        .unwrap()
    }
}
