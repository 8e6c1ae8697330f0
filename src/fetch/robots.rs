//! robots.txt fetching and parsing for polite crawling.
//!
//! Reads the group for `User-agent: *` (or our own product token, which takes
//! precedence) and extracts `Crawl-delay`, `Disallow` and `Allow` rules. Each
//! origin is fetched at most once per run; concurrent first contacts wait on
//! the same fetch.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use reqwest::Client;
use tokio::sync::OnceCell;
use tracing::{debug, instrument, warn};
use url::Url;

use crate::throttle::{HostThrottle, host_of};
use crate::user_agent::PRODUCT_TOKEN;

use super::client::read_body_limited;

/// Largest crawl delay honoured. Larger values are clamped.
pub const MAX_CRAWL_DELAY: Duration = Duration::from_secs(120);

/// robots.txt bodies beyond this size are ignored.
const MAX_ROBOTS_BYTES: usize = 512 * 1024;

/// Rules that apply to us on one origin.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RobotsRules {
    /// Requested minimum gap between requests.
    pub crawl_delay: Option<Duration>,
    disallow: Vec<String>,
    allow: Vec<String>,
}

impl RobotsRules {
    /// Rules that allow everything and request no delay.
    #[must_use]
    pub fn empty() -> Self {
        Self::default()
    }

    /// Returns whether `path` (path plus optional query) may be fetched.
    ///
    /// The longest matching rule wins; `Allow` wins a tie.
    #[must_use]
    pub fn is_allowed(&self, path: &str) -> bool {
        let longest = |rules: &[String]| {
            rules
                .iter()
                .filter(|prefix| path.starts_with(prefix.as_str()))
                .map(String::len)
                .max()
        };
        match (longest(&self.disallow), longest(&self.allow)) {
            (None, _) => true,
            (Some(_), None) => false,
            (Some(disallow), Some(allow)) => allow >= disallow,
        }
    }
}

/// Parses a robots.txt body into the rules that apply to us.
#[must_use]
pub fn parse_robots(body: &str) -> RobotsRules {
    let mut wildcard = RobotsRules::default();
    let mut specific = RobotsRules::default();
    let mut saw_specific = false;

    // Consecutive User-agent lines open one group
    let mut group_agents: Vec<String> = Vec::new();
    let mut in_rules = false;

    for raw_line in body.lines() {
        let line = raw_line.split('#').next().unwrap_or("").trim();
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        let key = key.trim().to_ascii_lowercase();
        let value = value.trim();

        if key == "user-agent" {
            if in_rules {
                group_agents.clear();
                in_rules = false;
            }
            group_agents.push(value.to_ascii_lowercase());
            continue;
        }

        in_rules = true;
        let matches_specific = group_agents.iter().any(|agent| agent == PRODUCT_TOKEN);
        let matches_wildcard = group_agents.iter().any(|agent| agent == "*");
        let target = if matches_specific {
            saw_specific = true;
            &mut specific
        } else if matches_wildcard {
            &mut wildcard
        } else {
            continue;
        };

        match key.as_str() {
            "disallow" => push_rule(&mut target.disallow, value),
            "allow" => push_rule(&mut target.allow, value),
            "crawl-delay" => {
                if let Some(delay) = parse_crawl_delay(value) {
                    target.crawl_delay = Some(target.crawl_delay.map_or(delay, |d| d.max(delay)));
                }
            }
            _ => {}
        }
    }

    if saw_specific { specific } else { wildcard }
}

fn push_rule(rules: &mut Vec<String>, value: &str) {
    // Empty Disallow means "allow all"
    if value.is_empty() {
        return;
    }
    let mut rule = value.trim_end_matches('*').to_string();
    if !rule.starts_with('/') {
        rule.insert(0, '/');
    }
    if !rules.contains(&rule) {
        rules.push(rule);
    }
}

fn parse_crawl_delay(value: &str) -> Option<Duration> {
    let seconds: f64 = value.parse().ok()?;
    if !seconds.is_finite() || seconds < 0.0 {
        return None;
    }
    let max = MAX_CRAWL_DELAY.as_secs_f64();
    if seconds > max {
        debug!(seconds, "clamping crawl delay");
    }
    Some(Duration::from_secs_f64(seconds.min(max)))
}

/// Builds the origin string (scheme + host) from a URL for robots.txt lookup.
#[must_use]
pub fn origin_for_robots(url: &str) -> Option<String> {
    let parsed = Url::parse(url).ok()?;
    let scheme = parsed.scheme();
    let host = parsed.host_str()?;
    Some(match parsed.port() {
        Some(port) => format!("{scheme}://{host}:{port}"),
        None => format!("{scheme}://{host}"),
    })
}

/// Per-origin robots.txt cache for one run.
pub struct RobotsCache {
    client: Client,
    throttle: Arc<HostThrottle>,
    entries: DashMap<String, Arc<OnceCell<Arc<RobotsRules>>>>,
}

impl RobotsCache {
    /// Creates an empty cache that fetches through `client`, gated by `throttle`.
    #[must_use]
    pub fn new(client: Client, throttle: Arc<HostThrottle>) -> Self {
        Self {
            client,
            throttle,
            entries: DashMap::new(),
        }
    }

    /// Returns the rules for the origin of `url`, fetching them on first use.
    ///
    /// Never fails: unreachable or malformed robots.txt yields empty rules.
    /// Cancel safe: if the fetching future is dropped another caller takes
    /// over the fetch.
    pub async fn rules_for(&self, url: &str) -> Arc<RobotsRules> {
        let Some(origin) = origin_for_robots(url) else {
            return Arc::new(RobotsRules::empty());
        };

        // Clone the cell out so no shard lock is held across the fetch
        let cell = self
            .entries
            .entry(origin.clone())
            .or_insert_with(|| Arc::new(OnceCell::new()))
            .clone();

        cell.get_or_init(|| async { Arc::new(self.fetch_rules(&origin).await) })
            .await
            .clone()
    }

    /// Returns the number of origins with cached or pending rules.
    #[must_use]
    pub fn origin_count(&self) -> usize {
        self.entries.len()
    }

    #[instrument(skip(self))]
    async fn fetch_rules(&self, origin: &str) -> RobotsRules {
        let robots_url = format!("{origin}/robots.txt");
        self.throttle.acquire(&host_of(&robots_url)).await;

        let response = match self.client.get(&robots_url).send().await {
            Ok(response) => response,
            Err(error) => {
                warn!(error = %error, "robots.txt unreachable; assuming no rules");
                return RobotsRules::empty();
            }
        };

        let status = response.status();
        if !status.is_success() {
            debug!(status = status.as_u16(), "no robots.txt; assuming no rules");
            return RobotsRules::empty();
        }

        match read_body_limited(response, MAX_ROBOTS_BYTES).await {
            Ok(Some(body)) => {
                let rules = parse_robots(&String::from_utf8_lossy(&body));
                debug!(
                    crawl_delay_ms = rules.crawl_delay.map(|d| d.as_millis()),
                    disallow = rules.disallow.len(),
                    "parsed robots.txt"
                );
                rules
            }
            Ok(None) => {
                warn!("robots.txt too large; assuming no rules");
                RobotsRules::empty()
            }
            Err(error) => {
                warn!(error = %error, "failed to read robots.txt; assuming no rules");
                RobotsRules::empty()
            }
        }
    }
}

impl std::fmt::Debug for RobotsCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RobotsCache")
            .field("origins", &self.entries.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_empty_body_allows_everything() {
        let rules = parse_robots("");
        assert_eq!(rules, RobotsRules::empty());
        assert!(rules.is_allowed("/anything"));
    }

    #[test]
    fn test_parse_wildcard_disallow() {
        let rules = parse_robots("User-agent: *\nDisallow: /api/\nDisallow: /private/\n");
        assert!(!rules.is_allowed("/api/v1"));
        assert!(!rules.is_allowed("/private/x"));
        assert!(rules.is_allowed("/public/x"));
    }

    #[test]
    fn test_other_agents_ignored() {
        let body = "User-agent: Googlebot\nDisallow: /nobot/\nCrawl-delay: 9\n\nUser-agent: *\nDisallow: /all/\n";
        let rules = parse_robots(body);
        assert!(rules.is_allowed("/nobot/x"));
        assert!(!rules.is_allowed("/all/x"));
        assert_eq!(rules.crawl_delay, None);
    }

    #[test]
    fn test_own_group_wins_over_wildcard() {
        let body = "User-agent: *\nDisallow: /\n\nUser-agent: doifetch\nDisallow: /admin/\n";
        let rules = parse_robots(body);
        assert!(rules.is_allowed("/article/1"));
        assert!(!rules.is_allowed("/admin/x"));
    }

    #[test]
    fn test_grouped_user_agent_lines() {
        let body = "User-agent: bingbot\nUser-agent: *\nCrawl-delay: 4\n";
        assert_eq!(parse_robots(body).crawl_delay, Some(Duration::from_secs(4)));
    }

    #[test]
    fn test_crawl_delay_fractional_and_case_insensitive() {
        let rules = parse_robots("user-agent: *\ncrawl-delay: 2.5\n");
        assert_eq!(rules.crawl_delay, Some(Duration::from_millis(2500)));
    }

    #[test]
    fn test_crawl_delay_clamped() {
        let rules = parse_robots("User-agent: *\nCrawl-delay: 86400\n");
        assert_eq!(rules.crawl_delay, Some(MAX_CRAWL_DELAY));
    }

    #[test]
    fn test_crawl_delay_garbage_ignored() {
        let rules = parse_robots("User-agent: *\nCrawl-delay: soon\nCrawl-delay: -3\n");
        assert_eq!(rules.crawl_delay, None);
    }

    #[test]
    fn test_comments_and_empty_disallow() {
        let body = "# hello\nUser-agent: * # everyone\nDisallow:\nDisallow: /tmp/ # scratch\n";
        let rules = parse_robots(body);
        assert!(rules.is_allowed("/"));
        assert!(!rules.is_allowed("/tmp/file"));
    }

    #[test]
    fn test_allow_overrides_shorter_disallow() {
        let body = "User-agent: *\nDisallow: /content/\nAllow: /content/pdf/\n";
        let rules = parse_robots(body);
        assert!(rules.is_allowed("/content/pdf/10.1/x.pdf"));
        assert!(!rules.is_allowed("/content/html/x"));
    }

    #[test]
    fn test_rule_without_leading_slash_normalized() {
        let rules = parse_robots("User-agent: *\nDisallow: secret\n");
        assert!(!rules.is_allowed("/secret/x"));
    }

    #[test]
    fn test_origin_for_robots() {
        assert_eq!(
            origin_for_robots("https://example.com/path?query=1#frag"),
            Some("https://example.com".to_string())
        );
        assert_eq!(
            origin_for_robots("http://localhost:8080/file"),
            Some("http://localhost:8080".to_string())
        );
        assert_eq!(origin_for_robots("not_a_valid_url"), None);
    }
}
