//! Best-effort User-Agent parsing for device records.
//!
//! The results are display metadata only ("Chrome on macOS" in the devices
//! screen); admission decisions key off the fingerprint, never off these
//! strings.

/// Rough device class derived from the User-Agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceType {
    Desktop,
    Mobile,
    Tablet,
    Unknown,
}

impl DeviceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceType::Desktop => "desktop",
            DeviceType::Mobile => "mobile",
            DeviceType::Tablet => "tablet",
            DeviceType::Unknown => "unknown",
        }
    }
}

/// Parsed client information.
#[derive(Debug, Clone)]
pub struct ClientInfo {
    pub browser: String,
    pub platform: String,
    pub device_type: DeviceType,
}

impl ClientInfo {
    /// Parse a User-Agent string. Unrecognized agents yield "Unknown"
    /// fields rather than an error.
    pub fn from_user_agent(user_agent: &str) -> Self {
        let ua = user_agent.to_lowercase();
        Self {
            browser: detect_browser(&ua),
            platform: detect_platform(&ua),
            device_type: detect_device_type(&ua),
        }
    }

    /// Human-readable device name, e.g. "Firefox on Linux".
    pub fn display_name(&self) -> String {
        format!("{} on {}", self.browser, self.platform)
    }
}

// Order matters: Edge and Opera embed "chrome/", Chrome embeds "safari/".
const BROWSERS: &[(&str, &str)] = &[
    ("edg/", "Edge"),
    ("edge/", "Edge"),
    ("opr/", "Opera"),
    ("opera", "Opera"),
    ("samsungbrowser/", "Samsung Internet"),
    ("chrome/", "Chrome"),
    ("firefox/", "Firefox"),
    ("safari/", "Safari"),
    ("msie", "Internet Explorer"),
    ("trident/", "Internet Explorer"),
];

const PLATFORMS: &[(&str, &str)] = &[
    ("windows nt 10", "Windows 10"),
    ("windows", "Windows"),
    ("iphone", "iOS"),
    ("ipad", "iPadOS"),
    ("mac os x", "macOS"),
    ("macintosh", "macOS"),
    ("android", "Android"),
    ("cros", "Chrome OS"),
    ("linux", "Linux"),
];

fn detect_browser(ua: &str) -> String {
    for (needle, name) in BROWSERS {
        if ua.contains(needle) {
            // Chrome-based agents also advertise Safari.
            if *name == "Safari" && ua.contains("chrome") {
                continue;
            }
            return (*name).to_string();
        }
    }
    "Unknown Browser".to_string()
}

fn detect_platform(ua: &str) -> String {
    for (needle, name) in PLATFORMS {
        if ua.contains(needle) {
            return (*name).to_string();
        }
    }
    "Unknown OS".to_string()
}

fn detect_device_type(ua: &str) -> DeviceType {
    if ua.contains("ipad") || ua.contains("tablet") {
        DeviceType::Tablet
    } else if ua.contains("mobile") || ua.contains("iphone") || ua.contains("android") {
        DeviceType::Mobile
    } else if ["windows", "macintosh", "mac os x", "linux", "cros"]
        .iter()
        .any(|p| ua.contains(p))
    {
        DeviceType::Desktop
    } else {
        DeviceType::Unknown
    }
}

/// Device name for an optional User-Agent.
pub fn device_name(user_agent: Option<&str>) -> String {
    match user_agent {
        Some(ua) if !ua.is_empty() => ClientInfo::from_user_agent(ua).display_name(),
        _ => "Unknown Device".to_string(),
    }
}
