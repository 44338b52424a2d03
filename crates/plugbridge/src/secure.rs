//! Executable integrity check before launch

use std::path::Path;

use sha2::{Digest, Sha256};

use crate::error::{BridgeError, BridgeResult};

/// Expected SHA-256 of the plugin executable
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecureConfig {
    checksum: Vec<u8>,
}

impl SecureConfig {
    /// Expect the given raw digest
    pub fn sha256(checksum: impl Into<Vec<u8>>) -> Self {
        Self {
            checksum: checksum.into(),
        }
    }

    /// Expect a hex encoded digest
    pub fn from_hex(checksum: &str) -> BridgeResult<Self> {
        let checksum = hex::decode(checksum.trim())
            .map_err(|e| BridgeError::InvalidConfig(format!("checksum is not hex: {e}")))?;
        if checksum.len() != 32 {
            return Err(BridgeError::InvalidConfig(format!(
                "sha256 checksum must be 32 bytes, got {}",
                checksum.len()
            )));
        }
        Ok(Self::sha256(checksum))
    }

    /// Hex form of the expected digest
    pub fn checksum_hex(&self) -> String {
        hex::encode(&self.checksum)
    }

    /// Hash the file at `path` and compare
    pub async fn check(&self, path: &Path) -> BridgeResult<()> {
        if self.checksum.is_empty() {
            return Err(BridgeError::Security("no checksum configured".to_string()));
        }

        let actual = sha256_file(path).await?;
        if actual != self.checksum {
            return Err(BridgeError::Security(format!(
                "checksum of {} is {}, expected {}",
                path.display(),
                hex::encode(actual),
                self.checksum_hex()
            )));
        }
        Ok(())
    }
}

/// SHA-256 of a file's contents
pub async fn sha256_file(path: &Path) -> BridgeResult<Vec<u8>> {
    let bytes = tokio::fs::read(path).await.map_err(|e| {
        BridgeError::Security(format!("cannot read {} for checksum: {e}", path.display()))
    })?;
    Ok(Sha256::digest(&bytes).to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[tokio::test]
    async fn test_checksum_match_and_mismatch() -> BridgeResult<()> {
        let mut file = tempfile::NamedTempFile::new().map_err(|e| BridgeError::Internal(e.to_string()))?;
        file.write_all(b"#!/bin/sh\necho plugin\n")
            .map_err(|e| BridgeError::Internal(e.to_string()))?;

        let digest = sha256_file(file.path()).await?;
        SecureConfig::sha256(digest.clone()).check(file.path()).await?;
        SecureConfig::from_hex(&hex::encode(&digest))?
            .check(file.path())
            .await?;

        let wrong = SecureConfig::sha256(vec![0u8; 32]);
        assert!(matches!(
            wrong.check(file.path()).await,
            Err(BridgeError::Security(_))
        ));
        Ok(())
    }

    #[test]
    fn test_from_hex_rejects_bad_input() {
        assert!(SecureConfig::from_hex("zz").is_err());
        assert!(SecureConfig::from_hex("abcd").is_err());
        assert!(SecureConfig::from_hex(&"ab".repeat(32)).is_ok());
    }

    #[tokio::test]
    async fn test_missing_file_is_security_error() {
        let config = SecureConfig::sha256(vec![1u8; 32]);
        let result = config.check(Path::new("/nonexistent/plugin")).await;
        assert!(matches!(result, Err(BridgeError::Security(_))));
    }
}
