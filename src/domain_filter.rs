use anyhow::{Context, Result};
use radix_trie::{Trie, TrieCommon};
use std::collections::HashSet;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

const MAX_FILE_SIZE: u64 = 100 * 1024 * 1024;
const MAX_DOMAINS: usize = 10_000_000;
const BUFFER_SIZE: usize = 256 * 1024;
const MAX_DOMAIN_LENGTH: usize = 253;
const MAX_LABEL_LENGTH: usize = 63;

/// Domains whose tunnels are relayed without splitting the ClientHello.
///
/// One rule per line: `example.com` matches only itself, `*.example.com`
/// and `.example.com` match the domain and everything under it. Comments,
/// URL schemes, paths and adblock `||`/`@@` prefixes are tolerated.
pub struct DomainFilter {
    exact: HashSet<String>,
    // Suffix rules stored reversed: "example.com" -> "moc.elpmaxe"
    suffix_trie: Trie<String, ()>,
    len: usize,
}

impl Default for DomainFilter {
    fn default() -> Self {
        Self {
            exact: HashSet::new(),
            suffix_trie: Trie::new(),
            len: 0,
        }
    }
}

impl DomainFilter {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let metadata = std::fs::metadata(path)
            .with_context(|| format!("Failed to read metadata for direct list: {:?}", path))?;

        if metadata.len() > MAX_FILE_SIZE {
            anyhow::bail!("direct list {:?} too large", path);
        }

        let file = File::open(path)
            .with_context(|| format!("Failed to open direct list: {:?}", path))?;
        let reader = BufReader::with_capacity(BUFFER_SIZE, file);

        let mut lines = Vec::new();
        for line in reader.lines() {
            lines.push(line.with_context(|| format!("Failed to read direct list: {:?}", path))?);
        }

        let filter = Self::from_lines(lines.iter().map(String::as_str))?;

        tracing::info!(
            "Loaded direct list: {} rules from {} lines",
            filter.len(),
            lines.len()
        );

        Ok(filter)
    }

    pub fn from_lines<'a>(lines: impl IntoIterator<Item = &'a str>) -> Result<Self> {
        let mut filter = Self::default();

        for line in lines {
            match parse_domain_line(line) {
                Some(ParsedDomain::Exact(d)) if is_valid_domain(&d) => {
                    filter.exact.insert(d);
                }
                Some(ParsedDomain::Suffix(d)) if is_valid_domain(&d) => {
                    filter.suffix_trie.insert(d.chars().rev().collect(), ());
                }
                _ => continue,
            }

            filter.len += 1;
            if filter.len > MAX_DOMAINS {
                anyhow::bail!("Too many domains in direct list");
            }
        }

        Ok(filter)
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn contains(&self, domain: &str) -> bool {
        if domain.is_empty() {
            return false;
        }
        let domain = domain.trim_end_matches('.').to_ascii_lowercase();
        let domain = domain.strip_prefix("www.").unwrap_or(&domain);

        if self.exact.contains(domain) {
            return true;
        }

        if self.suffix_trie.is_empty() {
            return false;
        }

        // "mail.google.com" -> "moc.elgoog.liam"; a stored "moc.elgoog" is an
        // ancestor and matches only on a label boundary.
        let reversed: String = domain.chars().rev().collect();
        let Some(subtrie) = self.suffix_trie.get_ancestor(&reversed) else {
            return false;
        };
        let Some(key) = subtrie.key() else {
            return false;
        };

        key.len() == reversed.len() || reversed.as_bytes().get(key.len()) == Some(&b'.')
    }
}

#[derive(Debug, PartialEq, Eq)]
enum ParsedDomain {
    Exact(String),
    Suffix(String),
}

fn parse_domain_line(line: &str) -> Option<ParsedDomain> {
    let mut domain = line.trim();

    if domain.is_empty() || domain.starts_with('#') || domain.starts_with("//") {
        return None;
    }

    domain = domain.strip_prefix("@@").unwrap_or(domain);
    domain = domain.strip_prefix("||").unwrap_or(domain);

    for scheme in ["https://", "http://", "wss://", "ws://"] {
        if let Some(rest) = domain.strip_prefix(scheme) {
            domain = rest;
            break;
        }
    }

    if let Some(idx) = domain.find(&['/', ':', '?', '#', '^'][..]) {
        domain = &domain[..idx];
    }

    domain = domain.split_whitespace().next()?;
    domain = domain.trim_end_matches('.');
    domain = domain.strip_prefix("www.").unwrap_or(domain);

    if domain.is_empty() {
        return None;
    }

    let domain = domain.to_ascii_lowercase();

    // `*example.com` is treated like `*.example.com`: the boundary stays a dot.
    if let Some(d) = domain.strip_prefix("*.") {
        Some(ParsedDomain::Suffix(d.to_string()))
    } else if let Some(d) = domain.strip_prefix('.') {
        Some(ParsedDomain::Suffix(d.to_string()))
    } else if let Some(d) = domain.strip_prefix('*') {
        Some(ParsedDomain::Suffix(d.to_string()))
    } else {
        Some(ParsedDomain::Exact(domain))
    }
}

fn is_valid_domain(domain: &str) -> bool {
    if domain.is_empty() || domain.len() > MAX_DOMAIN_LENGTH {
        return false;
    }
    if domain.starts_with('.') || domain.ends_with('.') {
        return false;
    }
    domain.split('.').all(|label| {
        !label.is_empty()
            && label.len() <= MAX_LABEL_LENGTH
            && label
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    })
}
