//! Signing key supply for the token service

use std::path::PathBuf;

use jsonwebtoken::{DecodingKey, EncodingKey};

#[derive(Debug, thiserror::Error)]
#[error("Signing key unavailable: {0}")]
pub struct KeyUnavailable(pub String);

/// Supplies the RSA key pair used to sign and verify tokens
pub trait KeyProvider: Send + Sync {
    fn encoding_key(&self) -> Result<EncodingKey, KeyUnavailable>;
    fn decoding_key(&self) -> Result<DecodingKey, KeyUnavailable>;
}

/// Reads PEM files on every call, so rotated keys on disk take effect without a restart
pub struct PemFileKeyProvider {
    private_key_path: PathBuf,
    public_key_path: PathBuf,
}

impl PemFileKeyProvider {
    pub fn new(private_key_path: impl Into<PathBuf>, public_key_path: impl Into<PathBuf>) -> Self {
        Self {
            private_key_path: private_key_path.into(),
            public_key_path: public_key_path.into(),
        }
    }

    fn read(path: &PathBuf) -> Result<Vec<u8>, KeyUnavailable> {
        std::fs::read(path).map_err(|e| KeyUnavailable(format!("{}: {e}", path.display())))
    }
}

impl KeyProvider for PemFileKeyProvider {
    fn encoding_key(&self) -> Result<EncodingKey, KeyUnavailable> {
        let pem = Self::read(&self.private_key_path)?;
        EncodingKey::from_rsa_pem(&pem).map_err(|e| KeyUnavailable(e.to_string()))
    }

    fn decoding_key(&self) -> Result<DecodingKey, KeyUnavailable> {
        let pem = Self::read(&self.public_key_path)?;
        DecodingKey::from_rsa_pem(&pem).map_err(|e| KeyUnavailable(e.to_string()))
    }
}

/// Keys parsed once from PEM strings held in memory
#[derive(Clone)]
pub struct StaticKeyProvider {
    encoding: EncodingKey,
    decoding: DecodingKey,
}

impl StaticKeyProvider {
    pub fn from_pem(private_pem: &str, public_pem: &str) -> Result<Self, KeyUnavailable> {
        Ok(Self {
            encoding: EncodingKey::from_rsa_pem(private_pem.as_bytes())
                .map_err(|e| KeyUnavailable(e.to_string()))?,
            decoding: DecodingKey::from_rsa_pem(public_pem.as_bytes())
                .map_err(|e| KeyUnavailable(e.to_string()))?,
        })
    }
}

impl KeyProvider for StaticKeyProvider {
    fn encoding_key(&self) -> Result<EncodingKey, KeyUnavailable> {
        Ok(self.encoding.clone())
    }

    fn decoding_key(&self) -> Result<DecodingKey, KeyUnavailable> {
        Ok(self.decoding.clone())
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_static_provider_parses_test_keys() {
        let provider =
            StaticKeyProvider::from_pem(test_keys::PRIVATE_PEM, test_keys::PUBLIC_PEM).unwrap();
        assert!(provider.encoding_key().is_ok());
        assert!(provider.decoding_key().is_ok());
    }

    #[test]
    fn test_file_provider_reports_missing_file() {
        let provider = PemFileKeyProvider::new("/nonexistent/private.pem", "/nonexistent/public.pem");
        let err = provider.encoding_key().err().unwrap();
        assert!(err.0.contains("/nonexistent/private.pem"));
    }

    #[test]
    fn test_garbage_pem_is_rejected() {
        assert!(StaticKeyProvider::from_pem("not a key", test_keys::PUBLIC_PEM).is_err());
    }
}
