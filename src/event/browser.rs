/// Browser name and version reported for a user agent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrowserInfo {
    pub name: String,
    pub version: String,
}

impl BrowserInfo {
    pub const UNKNOWN_NAME: &'static str = "Unknown Browser";
    pub const UNKNOWN_VERSION: &'static str = "0";

    fn unknown() -> Self {
        Self {
            name: Self::UNKNOWN_NAME.to_string(),
            version: Self::UNKNOWN_VERSION.to_string(),
        }
    }
}

/// Maps a raw user-agent string to a browser identity.
pub trait BrowserClassifier: Send + Sync {
    fn classify(&self, user_agent: &str) -> BrowserInfo;
}

/// Token-matching classifier for the common desktop and mobile browsers.
///
/// Rules are ordered: Edge and Opera advertise Chrome, and Chrome
/// advertises Safari, so the more specific tokens are checked first.
#[derive(Debug, Default, Clone, Copy)]
pub struct UserAgentClassifier;

/// (browser name, version token).
const RULES: &[(&str, &str)] = &[
    ("Microsoft Edge", "Edg/"),
    ("Microsoft Edge", "Edge/"),
    ("Opera", "OPR/"),
    ("Samsung Browser", "SamsungBrowser/"),
    ("Firefox", "Firefox/"),
    ("Firefox", "FxiOS/"),
    ("Chrome", "CriOS/"),
    ("Chrome", "Chrome/"),
];

impl BrowserClassifier for UserAgentClassifier {
    fn classify(&self, user_agent: &str) -> BrowserInfo {
        for (name, token) in RULES {
            if let Some(version) = major_version_after(user_agent, token) {
                return BrowserInfo {
                    name: (*name).to_string(),
                    version,
                };
            }
        }

        if user_agent.contains("Safari/") {
            if let Some(version) = major_version_after(user_agent, "Version/") {
                return BrowserInfo {
                    name: "Safari".to_string(),
                    version,
                };
            }
        }

        if let Some(version) = major_version_after(user_agent, "MSIE ") {
            return BrowserInfo {
                name: "Internet Explorer".to_string(),
                version,
            };
        }
        if user_agent.contains("Trident/") {
            if let Some(version) = major_version_after(user_agent, "rv:") {
                return BrowserInfo {
                    name: "Internet Explorer".to_string(),
                    version,
                };
            }
        }

        BrowserInfo::unknown()
    }
}

/// Returns the major version number following `token`, if any.
fn major_version_after(user_agent: &str, token: &str) -> Option<String> {
    let start = user_agent.find(token)? + token.len();
    let digits: String = user_agent[start..]
        .chars()
        .take_while(char::is_ascii_digit)
        .collect();

    (!digits.is_empty()).then_some(digits)
}
