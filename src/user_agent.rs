//! Shared User-Agent string for upload HTTP traffic.
//!
//! Single source for project URL and UA format so all session, probe, and
//! chunk requests identify themselves consistently (good citizenship; RFC 9308).

/// Project URL for User-Agent identification (good citizenship; RFC 9308).
const PROJECT_UA_URL: &str = "https://github.com/nicksrandall/Uploader";

/// Default User-Agent for upload requests (identifies the tool).
#[must_use]
pub(crate) fn default_upload_user_agent() -> String {
    let version = env!("CARGO_PKG_VERSION");
    format!("uploader/{version} (object-storage-client; +{PROJECT_UA_URL})")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ua_contains_project_url_and_version() {
        let ua = default_upload_user_agent();
        assert!(ua.contains(PROJECT_UA_URL), "UA must contain project URL");
        assert_eq!(
            env!("CARGO_PKG_VERSION"),
            ua.strip_prefix("uploader/")
                .and_then(|s| s.split(' ').next())
                .expect("UA has version"),
            "UA must contain crate version"
        );
    }
}
