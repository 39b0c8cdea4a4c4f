//! Shared-secret material handed over by the management platform.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use serde::Deserialize;

/// Credentials the service uses to log into the platform API.
#[derive(Debug, Clone, Deserialize)]
pub struct PlatformUser {
    pub user: String,
    pub password: String,
}

/// The secrets file contents.
///
/// `token` authenticates status checkers, `adcm_internal_token` the
/// platform's own service-to-service calls.
#[derive(Debug, Clone, Deserialize)]
pub struct Secrets {
    pub adcmuser: PlatformUser,
    pub token: String,
    pub adcm_internal_token: String,
}

impl Secrets {
    /// Load and parse the secrets file. Failure here is fatal to startup.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("reading secrets file {}", path.display()))?;
        serde_json::from_str(&raw)
            .with_context(|| format!("parsing secrets file {}", path.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn loads_the_expected_shape() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"adcmuser":{{"user":"status","password":"pw"}},
                "token":"checker-secret",
                "adcm_internal_token":"internal-secret"}}"#
        )
        .unwrap();

        let secrets = Secrets::load(file.path()).unwrap();
        assert_eq!(secrets.adcmuser.user, "status");
        assert_eq!(secrets.token, "checker-secret");
        assert_eq!(secrets.adcm_internal_token, "internal-secret");
    }

    #[test]
    fn missing_file_is_an_error() {
        assert!(Secrets::load(Path::new("/nonexistent/secrets.json")).is_err());
    }
}
