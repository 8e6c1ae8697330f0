//! Shared User-Agent string for every outgoing request.
//!
//! Resolver lookups, robots.txt fetches and document fetches all identify the
//! tool the same way, so one host sees one consistent client.

/// Project URL for User-Agent identification (RFC 9308).
const PROJECT_UA_URL: &str = "https://github.com/doifetch/doifetch";

/// Product token used in the User-Agent and for robots.txt group matching.
pub const PRODUCT_TOKEN: &str = "doifetch";

/// Default User-Agent for all requests.
#[must_use]
pub fn default_user_agent() -> String {
    let version = env!("CARGO_PKG_VERSION");
    format!("{PRODUCT_TOKEN}/{version} (academic-research-tool; +{PROJECT_UA_URL})")
}
