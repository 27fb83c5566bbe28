use std::cmp::Ordering;
use std::fmt::{Display, Formatter};
use std::str::FromStr;

use anyhow::{Error, bail};

/// A bare or full JID: `[local@]domain[/resource]`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Jid {
    local: Option<String>,
    domain: String,
    resource: Option<String>,
}

impl Jid {
    pub fn new(local: Option<String>, domain: String, resource: Option<String>) -> Self {
        Self {
            local,
            domain,
            resource,
        }
    }

    pub fn local(&self) -> Option<&str> {
        self.local.as_deref()
    }

    pub fn domain(&self) -> &str {
        &self.domain
    }

    pub fn resource(&self) -> Option<&str> {
        self.resource.as_deref()
    }

    /// Returns a copy of this JID bound to `resource`.
    pub fn bind(&self, resource: String) -> Jid {
        Jid {
            local: self.local.clone(),
            domain: self.domain.clone(),
            resource: Some(resource),
        }
    }

    /// Returns the bare JID (local@domain, no resource).
    pub fn to_bare(&self) -> Jid {
        Jid {
            local: self.local.clone(),
            domain: self.domain.clone(),
            resource: None,
        }
    }

    pub fn is_bare(&self) -> bool {
        self.resource.is_none()
    }
}

impl FromStr for Jid {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            bail!("Could not parse JID: empty string");
        }

        let (prefix, resource) = match s.split_once('/') {
            Some((prefix, resource)) => {
                if resource.is_empty() {
                    bail!("Could not parse JID \"{s}\": empty resource");
                }
                (prefix, Some(resource.to_string()))
            }
            None => (s, None),
        };

        if prefix.is_empty() {
            bail!("Could not parse JID \"{s}\": empty domain");
        }

        let (local, domain) = match prefix.rsplit_once('@') {
            Some((local, domain)) => {
                if local.is_empty() {
                    bail!("Could not parse JID \"{s}\": empty local part");
                }
                if domain.is_empty() {
                    bail!("Could not parse JID \"{s}\": empty domain");
                }
                (Some(local.to_string()), domain.to_string())
            }
            None => (None, prefix.to_string()),
        };

        Ok(Jid {
            local,
            domain,
            resource,
        })
    }
}

impl Display for Jid {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match &self.local {
            Some(local) => write!(f, "{}@{}", local, self.domain)?,
            None => write!(f, "{}", self.domain)?,
        }

        if let Some(resource) = &self.resource {
            write!(f, "/{}", resource)?;
        }

        Ok(())
    }
}

impl PartialOrd for Jid {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Jid {
    fn cmp(&self, other: &Self) -> Ordering {
        self.domain
            .cmp(&other.domain)
            .then_with(|| self.local.cmp(&other.local))
            .then_with(|| self.resource.cmp(&other.resource))
    }
}

/// A JID-shaped route pattern: any field may be an exact value, `*`
/// (matches anything present or absent), or left unset (matches
/// anything, including absence).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JidPattern {
    local: Option<String>,
    domain: String,
    resource: Option<String>,
}

impl JidPattern {
    pub fn new(local: Option<String>, domain: String, resource: Option<String>) -> Self {
        Self {
            local,
            domain,
            resource,
        }
    }

    pub fn matches(&self, jid: &Jid) -> bool {
        Self::field_matches(Some(&self.domain), Some(jid.domain()))
            && Self::field_matches(self.local.as_deref(), jid.local())
            && Self::field_matches(self.resource.as_deref(), jid.resource())
    }

    fn field_matches(pattern: Option<&str>, value: Option<&str>) -> bool {
        match pattern {
            None => true,
            Some("*") => true,
            Some(pattern) => value == Some(pattern),
        }
    }
}

impl From<Jid> for JidPattern {
    fn from(jid: Jid) -> Self {
        JidPattern {
            local: jid.local,
            domain: jid.domain,
            resource: jid.resource,
        }
    }
}

impl From<&Jid> for JidPattern {
    fn from(jid: &Jid) -> Self {
        JidPattern::from(jid.clone())
    }
}

impl FromStr for JidPattern {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            bail!("Could not parse JID pattern: empty string");
        }

        let (prefix, resource) = match s.split_once('/') {
            Some((prefix, resource)) => (prefix, Some(resource.to_string())),
            None => (s, None),
        };

        let (local, domain) = match prefix.rsplit_once('@') {
            Some((local, domain)) => (Some(local.to_string()), domain.to_string()),
            None => (None, prefix.to_string()),
        };

        if domain.is_empty() {
            bail!("Could not parse JID pattern \"{s}\": empty domain");
        }

        Ok(JidPattern {
            local,
            domain,
            resource,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fail_on_empty_string() {
        assert!("".parse::<Jid>().is_err());
    }

    #[test]
    fn parses_bare_jid() {
        let jid: Jid = "alice@example.com".parse().unwrap();
        assert_eq!(jid.local(), Some("alice"));
        assert_eq!(jid.domain(), "example.com");
        assert_eq!(jid.resource(), None);
    }

    #[test]
    fn parses_full_jid() {
        let jid: Jid = "alice@example.com/phone".parse().unwrap();
        assert_eq!(jid.local(), Some("alice"));
        assert_eq!(jid.domain(), "example.com");
        assert_eq!(jid.resource(), Some("phone"));
    }

    #[test]
    fn parses_domain_only_jid() {
        let jid: Jid = "example.com".parse().unwrap();
        assert_eq!(jid.local(), None);
        assert_eq!(jid.domain(), "example.com");
        assert_eq!(jid.resource(), None);
    }

    #[test]
    fn splits_on_last_at_and_first_slash() {
        // local part containing '@' (rare but legal-ish in the wild) must
        // not be confused with the domain separator; resource must split
        // on the *first* slash even if it itself contains one.
        let jid: Jid = "a@b@example.com/res/with/slashes".parse().unwrap();
        assert_eq!(jid.local(), Some("a@b"));
        assert_eq!(jid.domain(), "example.com");
        assert_eq!(jid.resource(), Some("res/with/slashes"));
    }

    #[test]
    fn display_round_trips() {
        for s in ["example.com", "alice@example.com", "alice@example.com/phone"] {
            let jid: Jid = s.parse().unwrap();
            assert_eq!(jid.to_string(), s);
        }
    }

    #[test]
    fn bind_sets_resource() {
        let jid: Jid = "alice@example.com".parse().unwrap();
        let bound = jid.bind("phone".to_string());
        assert_eq!(bound.to_string(), "alice@example.com/phone");
    }

    #[test]
    fn to_bare_drops_resource() {
        let jid: Jid = "alice@example.com/phone".parse().unwrap();
        assert_eq!(jid.to_bare().to_string(), "alice@example.com");
    }

    #[test]
    fn ordering_is_lexicographic_by_domain_then_local_then_resource() {
        let a: Jid = "b@a.example.com".parse().unwrap();
        let b: Jid = "a@b.example.com".parse().unwrap();
        assert!(a < b, "domain comparison should dominate");

        let c: Jid = "alice@example.com".parse().unwrap();
        let d: Jid = "bob@example.com".parse().unwrap();
        assert!(c < d);

        let e: Jid = "alice@example.com".parse().unwrap();
        let f: Jid = "alice@example.com/resource".parse().unwrap();
        assert!(e < f, "absent resource sorts before a present one");
    }

    #[test]
    fn pattern_wildcard_domain_matches_anything() {
        let pattern: JidPattern = "*".parse().unwrap();
        assert!(pattern.matches(&"alice@example.com/phone".parse().unwrap()));
    }

    #[test]
    fn pattern_exact_fields_must_match() {
        let pattern: JidPattern = "alice@example.com/phone".parse().unwrap();
        assert!(pattern.matches(&"alice@example.com/phone".parse().unwrap()));
        assert!(!pattern.matches(&"alice@example.com/desktop".parse().unwrap()));
        assert!(!pattern.matches(&"bob@example.com/phone".parse().unwrap()));
    }

    #[test]
    fn pattern_absent_local_matches_any_local() {
        let pattern: JidPattern = "example.com".parse().unwrap();
        assert!(pattern.matches(&"alice@example.com".parse().unwrap()));
        assert!(pattern.matches(&"example.com".parse().unwrap()));
    }

    #[test]
    fn pattern_present_local_requires_target_local() {
        let pattern: JidPattern = "alice@example.com".parse().unwrap();
        assert!(!pattern.matches(&"example.com".parse().unwrap()));
    }
}
