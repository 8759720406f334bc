//! Structural scanner for Clash engine config text.
//!
//! Only the `proxies` and `proxy-groups` sections are interpreted. The scan is
//! a single forward pass over lines with an explicit state machine; anything it
//! does not understand is skipped, so malformed or drifting input yields a
//! best-effort partial result instead of an error.
//!
//! Accepted shapes:
//! ```text
//! proxies: [{name: A}, {name: B}]        # inline flow list
//! proxies:
//!   - name: A                            # block entry
//!   - {name: B, type: ss, ...}           # flow entry
//! proxy-groups:
//!   - {name: G, type: select, proxies: [A, B]}
//!   - name: H
//!     type: url-test
//!     proxies:
//!       - A
//!       - "B"
//! ```

use std::collections::{HashMap, HashSet};

/// A named proxy group with its ordered member tokens.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyGroup {
    pub name: String,
    /// Group policy such as `select` or `url-test`; empty when the entry had none.
    pub group_type: String,
    pub members: Vec<String>,
}

impl ProxyGroup {
    pub fn is_select(&self) -> bool {
        self.group_type.eq_ignore_ascii_case("select")
    }
}

/// Result of one parse pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParsedConfig {
    proxy_names: Vec<String>,
    group_order: Vec<String>,
    groups: HashMap<String, ProxyGroup>,
}

impl ParsedConfig {
    /// Names from the `proxies` section, in file order.
    pub fn proxy_names(&self) -> &[String] {
        &self.proxy_names
    }

    /// Group names, in file order.
    pub fn group_names(&self) -> &[String] {
        &self.group_order
    }

    pub fn group(&self, name: &str) -> Option<&ProxyGroup> {
        self.groups.get(name)
    }

    pub fn groups(&self) -> impl Iterator<Item = &ProxyGroup> {
        self.group_order.iter().filter_map(|name| self.groups.get(name))
    }

    pub fn is_group(&self, name: &str) -> bool {
        self.groups.contains_key(name)
    }

    /// Members of `group`, or an empty slice for unknown groups.
    pub fn members(&self, group: &str) -> &[String] {
        self.groups.get(group).map_or(&[], |g| g.members.as_slice())
    }

    /// Every leaf proxy name: the `proxies` section plus any group member that
    /// is not itself a group. Never contains a group name.
    pub fn leaf_names(&self) -> Vec<String> {
        let mut seen = HashSet::new();
        self.proxy_names
            .iter()
            .chain(self.groups().flat_map(|g| g.members.iter()))
            .filter(|name| !self.is_group(name))
            .filter(|name| seen.insert(name.as_str()))
            .cloned()
            .collect()
    }

    /// First member of `group` that is not a nested group reference.
    pub fn first_actual_node(&self, group: &str) -> Option<&str> {
        self.members(group)
            .iter()
            .find(|m| !self.is_group(m))
            .map(String::as_str)
    }

    /// Default `(group, node)` pair for a fresh profile.
    ///
    /// Picks the first `select` group named in `preferred`, else the first
    /// `select` group, and pairs it with that group's first actual node.
    pub fn default_selection(&self, preferred: &[String]) -> Option<(String, String)> {
        let target = self
            .groups()
            .filter(|g| g.is_select())
            .find(|g| preferred.iter().any(|p| p == &g.name))
            .or_else(|| self.groups().find(|g| g.is_select()))?;

        match self.first_actual_node(&target.name) {
            Some(node) => Some((target.name.clone(), node.to_string())),
            None => {
                tracing::debug!(group = %target.name, "select group has no actual node");
                None
            }
        }
    }
}

// ── Scanner ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Section {
    Other,
    Proxies,
    ProxyGroups,
}

/// Group entry being accumulated.
#[derive(Debug, Default)]
struct PendingGroup {
    name: Option<String>,
    group_type: Option<String>,
    members: Vec<String>,
}

struct Scanner {
    section: Section,
    /// Indentation of the `- ` that opens a group entry.
    entry_indent: Option<usize>,
    current: Option<PendingGroup>,
    in_members: bool,
    /// A block proxy entry whose `name:` has not been seen yet.
    proxy_name_pending: bool,
    out: ParsedConfig,
    seen_proxies: HashSet<String>,
}

/// Parse engine config text. Never fails.
pub fn parse(text: &str) -> ParsedConfig {
    let mut scanner = Scanner {
        section: Section::Other,
        entry_indent: None,
        current: None,
        in_members: false,
        proxy_name_pending: false,
        out: ParsedConfig::default(),
        seen_proxies: HashSet::new(),
    };
    for raw in text.lines() {
        scanner.line(raw);
    }
    scanner.flush_group();
    tracing::debug!(
        proxies = scanner.out.proxy_names.len(),
        groups = scanner.out.group_order.len(),
        "parsed engine config"
    );
    scanner.out
}

impl Scanner {
    fn line(&mut self, raw: &str) {
        let line = strip_comment(raw.trim_end_matches('\r'));
        let trimmed = line.trim();
        if trimmed.is_empty() {
            return;
        }
        let indent = line.len() - line.trim_start().len();

        if indent == 0 && !trimmed.starts_with('-') {
            self.top_level_key(trimmed);
            return;
        }

        match self.section {
            Section::Proxies => self.proxies_line(trimmed),
            Section::ProxyGroups => self.groups_line(indent, trimmed),
            Section::Other => {}
        }
    }

    fn top_level_key(&mut self, trimmed: &str) {
        self.flush_group();
        self.entry_indent = None;
        self.proxy_name_pending = false;
        let Some((key, value)) = split_key_value(trimmed) else {
            self.section = Section::Other;
            return;
        };
        self.section = match key {
            "proxies" => Section::Proxies,
            "proxy-groups" => Section::ProxyGroups,
            _ => Section::Other,
        };
        if value.starts_with('[') {
            match self.section {
                Section::Proxies => {
                    for item in split_flow_list(value) {
                        if let Some(name) = flow_mapping_name(&item) {
                            self.push_proxy(name);
                        }
                    }
                }
                Section::ProxyGroups => {
                    for item in split_flow_list(value) {
                        if item.starts_with('{') {
                            self.flow_group(&item);
                        }
                    }
                }
                Section::Other => {}
            }
        }
    }

    fn proxies_line(&mut self, trimmed: &str) {
        if let Some(body) = list_item(trimmed) {
            self.proxy_name_pending = false;
            if body.starts_with('{') {
                if let Some(name) = flow_mapping_name(body) {
                    self.push_proxy(name);
                }
                return;
            }
            match split_key_value(body) {
                Some(("name", value)) => self.push_proxy(unquote(value)),
                _ => self.proxy_name_pending = true,
            }
        } else if self.proxy_name_pending {
            if let Some(("name", value)) = split_key_value(trimmed) {
                self.proxy_name_pending = false;
                self.push_proxy(unquote(value));
            }
        }
    }

    fn groups_line(&mut self, indent: usize, trimmed: &str) {
        if let Some(body) = list_item(trimmed) {
            let opens_entry = self.entry_indent.is_none_or(|entry| indent <= entry);
            if opens_entry {
                self.entry_indent = Some(indent);
                self.flush_group();
                if body.starts_with('{') {
                    self.flow_group(body);
                } else {
                    self.current = Some(PendingGroup::default());
                    self.group_key(body);
                }
            } else if self.in_members {
                if let Some(group) = self.current.as_mut() {
                    let member = unquote(body);
                    if !member.is_empty() {
                        group.members.push(member);
                    }
                }
            }
            return;
        }
        if self.current.is_some() {
            self.group_key(trimmed);
        }
    }

    /// Apply one `key: value` line of a block group entry.
    fn group_key(&mut self, text: &str) {
        let Some((key, value)) = split_key_value(text) else {
            return;
        };
        let Some(group) = self.current.as_mut() else {
            return;
        };
        self.in_members = false;
        match key {
            "name" => group.name = Some(unquote(value)),
            "type" => group.group_type = Some(unquote(value)),
            "proxies" if value.starts_with('[') => {
                group.members.extend(split_flow_list(value).iter().map(|m| unquote(m)));
                group.members.retain(|m| !m.is_empty());
            }
            "proxies" if value.is_empty() => self.in_members = true,
            _ => {}
        }
    }

    fn flow_group(&mut self, text: &str) {
        let mut group = PendingGroup::default();
        for (key, value) in flow_mapping(text) {
            match key.as_str() {
                "name" => group.name = Some(unquote(&value)),
                "type" => group.group_type = Some(unquote(&value)),
                "proxies" => {
                    group.members = split_flow_list(&value)
                        .iter()
                        .map(|m| unquote(m))
                        .filter(|m| !m.is_empty())
                        .collect();
                }
                _ => {}
            }
        }
        self.current = Some(group);
        self.flush_group();
    }

    fn flush_group(&mut self) {
        self.in_members = false;
        let Some(pending) = self.current.take() else {
            return;
        };
        let Some(name) = pending.name.filter(|n| !n.is_empty()) else {
            return;
        };
        if !self.out.groups.contains_key(&name) {
            self.out.group_order.push(name.clone());
        }
        self.out.groups.insert(
            name.clone(),
            ProxyGroup {
                name,
                group_type: pending.group_type.unwrap_or_default(),
                members: pending.members,
            },
        );
    }

    fn push_proxy(&mut self, name: String) {
        if !name.is_empty() && self.seen_proxies.insert(name.clone()) {
            self.out.proxy_names.push(name);
        }
    }
}

// ── Tokenizer helpers ───────────────────────────────────────────────

/// Drop a trailing `# comment` that is not inside quotes.
fn strip_comment(line: &str) -> &str {
    let mut quote: Option<char> = None;
    let mut prev_is_space = true;
    for (i, ch) in line.char_indices() {
        match quote {
            Some(q) if ch == q => quote = None,
            Some(_) => {}
            None if ch == '\'' || ch == '"' => quote = Some(ch),
            None if ch == '#' && prev_is_space => return &line[..i],
            None => {}
        }
        prev_is_space = ch.is_whitespace();
    }
    line
}

/// Body of a `- item` line.
fn list_item(trimmed: &str) -> Option<&str> {
    let rest = trimmed.strip_prefix('-')?;
    if rest.is_empty() {
        return Some(rest);
    }
    if rest.starts_with(char::is_whitespace) || rest.starts_with('{') {
        return Some(rest.trim_start());
    }
    None
}

/// Split `key: value` on the first colon followed by whitespace or end of line.
fn split_key_value(text: &str) -> Option<(&str, &str)> {
    let bytes = text.as_bytes();
    let mut quote: Option<u8> = None;
    for (i, &b) in bytes.iter().enumerate() {
        match quote {
            Some(q) if b == q => quote = None,
            Some(_) => {}
            None if b == b'\'' || b == b'"' => quote = Some(b),
            None if b == b':' => {
                let next = bytes.get(i + 1);
                if next.is_none_or(|c| c.is_ascii_whitespace()) {
                    let key = text[..i].trim();
                    let key = key.trim_matches(|c| c == '"' || c == '\'');
                    return Some((key, text[i + 1..].trim()));
                }
            }
            None => {}
        }
    }
    None
}

/// Remove surrounding quotes and whitespace from a scalar.
fn unquote(value: &str) -> String {
    let v = value.trim();
    for q in ['"', '\''] {
        if v.len() >= 2 && v.starts_with(q) && v.ends_with(q) {
            return v[1..v.len() - 1].trim().to_string();
        }
    }
    v.to_string()
}

/// Split the inside of a `[...]` or `{...}` at top-level commas.
///
/// An unterminated opener is tolerated; the text runs to the end of the line.
fn split_flow(text: &str, open: char, close: char) -> Vec<String> {
    let inner = text.trim();
    let inner = inner.strip_prefix(open).unwrap_or(inner);
    let inner = inner.strip_suffix(close).unwrap_or(inner);

    let mut items = Vec::new();
    let mut depth = 0usize;
    let mut quote: Option<char> = None;
    let mut current = String::new();
    for ch in inner.chars() {
        match quote {
            Some(q) => {
                if ch == q {
                    quote = None;
                }
                current.push(ch);
                continue;
            }
            None => {}
        }
        match ch {
            '\'' | '"' => {
                quote = Some(ch);
                current.push(ch);
            }
            '[' | '{' => {
                depth += 1;
                current.push(ch);
            }
            ']' | '}' => {
                depth = depth.saturating_sub(1);
                current.push(ch);
            }
            ',' if depth == 0 => {
                let item = current.trim();
                if !item.is_empty() {
                    items.push(item.to_string());
                }
                current.clear();
            }
            _ => current.push(ch),
        }
    }
    let item = current.trim();
    if !item.is_empty() {
        items.push(item.to_string());
    }
    items
}

fn split_flow_list(text: &str) -> Vec<String> {
    split_flow(text, '[', ']')
}

/// `{k: v, k2: [a, b]}` into ordered key/value pairs.
fn flow_mapping(text: &str) -> Vec<(String, String)> {
    split_flow(text, '{', '}')
        .iter()
        .filter_map(|pair| split_key_value(pair).map(|(k, v)| (k.to_string(), v.to_string())))
        .collect()
}

fn flow_mapping_name(text: &str) -> Option<String> {
    flow_mapping(text)
        .into_iter()
        .find(|(k, _)| k == "name")
        .map(|(_, v)| unquote(&v))
        .filter(|n| !n.is_empty())
}
