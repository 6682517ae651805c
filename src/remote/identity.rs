//! Signing identity loading
//!
//! The bridge signs canister calls with an Ed25519 key stored as PEM
//! (the format `dfx identity export` produces).

use crate::error::{BridgeError, BridgeResult};
use ic_agent::identity::BasicIdentity;
use ic_agent::Identity;
use std::path::Path;
use tracing::info;

/// Load the signing identity and log the principal it signs as.
pub fn load_identity(path: &Path) -> BridgeResult<BasicIdentity> {
    if !path.exists() {
        return Err(BridgeError::identity(path, "file does not exist"));
    }

    let identity =
        BasicIdentity::from_pem_file(path).map_err(|e| BridgeError::identity(path, e.to_string()))?;

    let principal = identity
        .sender()
        .map_err(|e| BridgeError::identity(path, e))?;
    info!(principal = %principal, "Loaded signing identity");

    Ok(identity)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_missing_file_is_identity_error() {
        let result = load_identity(Path::new("/nonexistent/bridge/identity.pem"));
        assert!(matches!(result, Err(BridgeError::IdentityError { .. })));
    }

    #[test]
    fn test_garbage_pem_is_identity_error() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "this is not a pem file").unwrap();

        let result = load_identity(file.path());
        assert!(matches!(result, Err(BridgeError::IdentityError { .. })));
    }
}
