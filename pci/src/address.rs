// SPDX-License-Identifier: Apache-2.0

//! PCI device addressing.
//!
//! Addresses use the `[domain:]bus:slot.function` (DBSF) notation, e.g.
//! `0000:03:00.1`. Components are kept as the lowercase hex strings the
//! kernel hands out: every consumer in this workspace compares and indexes
//! addresses as strings, and sysfs itself is the source of truth for which
//! strings exist.
//!
//! Parsing never fails loudly. Kernel and tool output routinely mixes full
//! and short forms with other text, and a scan must not abort because one
//! directory entry is not an address; malformed input yields the all-empty
//! [`Address`], which callers test with [`Address::is_empty`].

use std::sync::LazyLock;

use regex::Regex;

static ADDRESS_RE: LazyLock<Regex> = LazyLock::new(|| {
    #[allow(clippy::unwrap_used)] // the pattern is a compile-time constant
    Regex::new(r"^(([0-9a-f]{0,4}):)?([0-9a-f]{2}):([0-9a-f]{2})\.([0-9a-f])$").unwrap()
});

static NET_ADDRESS_RE: LazyLock<Regex> = LazyLock::new(|| {
    #[allow(clippy::unwrap_used)]
    Regex::new(r"(([0-9a-f]{0,4}):)?([0-9a-f]{2}):([0-9a-f]{2})\.([0-9a-f])/net").unwrap()
});

/// A PCI address split into its DBSF components.
///
/// The canonical rendering is `dddd:bb:ss.f` lowercase. The default value
/// (all components empty) means "unparsed"; [`std::fmt::Display`] renders it
/// as the empty string.
#[derive(Clone, Debug, Default, Eq, Hash, PartialEq, Ord, PartialOrd)]
#[derive(serde::Serialize, serde::Deserialize)]
#[serde(from = "String", into = "String")]
pub struct Address {
    pub domain: String,
    pub bus: String,
    pub slot: String,
    pub function: String,
}

impl Address {
    /// Parse a `[DDDD:]BB:SS.F` string, case-insensitively.
    ///
    /// The domain defaults to `"0000"` when the short form is given. Input
    /// that does not match the grammar yields the all-empty address; this
    /// never panics and never errors.
    #[must_use]
    pub fn parse(text: &str) -> Address {
        Self::from_captures(&ADDRESS_RE, &text.to_lowercase())
    }

    /// Recover an address embedded in a sysfs `…/<addr>/net` path.
    ///
    /// Used when walking interface-name symlinks, whose targets contain the
    /// owning device's address followed by `/net`.
    #[must_use]
    pub fn parse_net(text: &str) -> Address {
        Self::from_captures(&NET_ADDRESS_RE, &text.to_lowercase())
    }

    fn from_captures(re: &Regex, lowered: &str) -> Address {
        let Some(caps) = re.captures(lowered) else {
            return Address::default();
        };
        let domain = match caps.get(2) {
            Some(m) if !m.as_str().is_empty() => m.as_str().to_string(),
            _ => "0000".to_string(),
        };
        Address {
            domain,
            bus: caps[3].to_string(),
            slot: caps[4].to_string(),
            function: caps[5].to_string(),
        }
    }

    /// True when no component is populated, i.e. parsing failed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.domain.is_empty()
            && self.bus.is_empty()
            && self.slot.is_empty()
            && self.function.is_empty()
    }

    /// The bus component with at most one leading zero stripped.
    ///
    /// Kernel and tool output is inconsistent about `"0a"`-vs-`"a"`-style
    /// bus numbering; this canonicalizes toward the short style. The zero is
    /// only stripped when followed by further decimal digits, so `"0a"`
    /// stays `"0a"`.
    #[must_use]
    pub fn bus_trimmed(&self) -> String {
        let mut chars = self.bus.chars();
        match (chars.next(), chars.next()) {
            (Some('0'), Some(next)) if next.is_ascii_digit() => self.bus[1..].to_string(),
            _ => self.bus.clone(),
        }
    }
}

impl std::fmt::Display for Address {
    /// Renders `domain:bus:slot.function`, or `""` unless all four
    /// components are present.
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.domain.is_empty()
            || self.bus.is_empty()
            || self.slot.is_empty()
            || self.function.is_empty()
        {
            return Ok(());
        }
        write!(
            f,
            "{}:{}:{}.{}",
            self.domain, self.bus, self.slot, self.function
        )
    }
}

impl From<String> for Address {
    fn from(value: String) -> Self {
        Address::parse(&value)
    }
}

impl From<&str> for Address {
    fn from(value: &str) -> Self {
        Address::parse(value)
    }
}

impl From<Address> for String {
    fn from(value: Address) -> String {
        value.to_string()
    }
}
