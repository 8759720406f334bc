//! Maps panel server names onto engine proxy names.
//!
//! The panel and the engine name nodes independently, so a server called
//! `HK-01` may show up as `HK-01`, `HK-01 | IPLC` or `HK` in the generated
//! config. Matching is an ordered list of strategies; the first strategy with
//! any hit across the member list wins.

use std::collections::HashMap;
use std::sync::OnceLock;

use regex::Regex;

use super::fetcher::ServerRecord;

fn numeral_suffix_re() -> &'static Regex {
    static NUMERAL_SUFFIX: OnceLock<Regex> = OnceLock::new();
    NUMERAL_SUFFIX.get_or_init(|| Regex::new(r"-\d+$").expect("regex"))
}

/// How a resolution was obtained, strongest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Confidence {
    Exact,
    Prefix,
    Substring,
    NumeralSuffix,
    /// Nothing matched; the server name was passed through unchanged.
    PassThrough,
}

impl std::fmt::Display for Confidence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Exact => write!(f, "exact"),
            Self::Prefix => write!(f, "prefix"),
            Self::Substring => write!(f, "substring"),
            Self::NumeralSuffix => write!(f, "numeral-suffix"),
            Self::PassThrough => write!(f, "pass-through"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    pub name: String,
    pub confidence: Confidence,
}

impl Resolution {
    pub fn is_match(&self) -> bool {
        self.confidence != Confidence::PassThrough
    }
}

type Strategy = fn(server: &str, member: &str) -> bool;

const STRATEGIES: [(Confidence, Strategy); 4] = [
    (Confidence::Exact, exact),
    (Confidence::Prefix, prefix),
    (Confidence::Substring, substring),
    (Confidence::NumeralSuffix, numeral_suffix),
];

fn exact(server: &str, member: &str) -> bool {
    server == member
}

fn prefix(server: &str, member: &str) -> bool {
    server.starts_with(member) || member.starts_with(server)
}

fn substring(server: &str, member: &str) -> bool {
    server.contains(member) || member.contains(server)
}

/// `HK-01` matches server `HK`.
fn numeral_suffix(server: &str, member: &str) -> bool {
    numeral_suffix_re().replace(member, "") == server
}

/// Resolve `server_name` against engine group `members`.
///
/// Never fails: a miss returns the server name itself with
/// [`Confidence::PassThrough`].
pub fn resolve<S: AsRef<str>>(server_name: &str, members: &[S]) -> Resolution {
    if !server_name.is_empty() {
        for (confidence, matches) in STRATEGIES {
            let hit = members
                .iter()
                .map(|m| m.as_ref())
                .filter(|m| !m.is_empty())
                .find(|m| matches(server_name, m));
            if let Some(member) = hit {
                return Resolution {
                    name: member.to_string(),
                    confidence,
                };
            }
        }
    }
    Resolution {
        name: server_name.to_string(),
        confidence: Confidence::PassThrough,
    }
}

/// Server name → proxy name for every server that actually matched.
pub fn build_mapping<S: AsRef<str>>(
    servers: &[ServerRecord],
    members: &[S],
) -> HashMap<String, String> {
    let mut mapping = HashMap::with_capacity(servers.len());
    for server in servers {
        let resolution = resolve(&server.name, members);
        if resolution.is_match() {
            mapping.insert(server.name.clone(), resolution.name);
        } else {
            tracing::debug!(server = %server.name, "no engine proxy matches server");
        }
    }
    mapping
}
