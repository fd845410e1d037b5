//! Typed firewall rule list.
//!
//! Rules travel over the admin API and through the store as single lines
//! of `key=value` tokens, e.g.
//! `action=accept proto=tcp dsthost=example.org dstports=443-443`.
//! A trailing `comment=` token swallows the rest of the line.

use qubesd_common::{QubesError, QubesResult};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Accept,
    Drop,
}

impl Action {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Accept => "accept",
            Self::Drop => "drop",
        }
    }

    pub fn parse(raw: &str) -> QubesResult<Self> {
        match raw {
            "accept" => Ok(Self::Accept),
            "drop" => Ok(Self::Drop),
            _ => Err(QubesError::invalid_value(format!(
                "unknown action: {:?}",
                raw
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Proto {
    Tcp,
    Udp,
    Icmp,
}

impl Proto {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Tcp => "tcp",
            Self::Udp => "udp",
            Self::Icmp => "icmp",
        }
    }

    pub fn parse(raw: &str) -> QubesResult<Self> {
        match raw {
            "tcp" => Ok(Self::Tcp),
            "udp" => Ok(Self::Udp),
            "icmp" => Ok(Self::Icmp),
            _ => Err(QubesError::invalid_value(format!(
                "unknown proto: {:?}",
                raw
            ))),
        }
    }
}

/// Inclusive destination port range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortRange {
    pub start: u16,
    pub end: u16,
}

impl PortRange {
    pub fn parse(raw: &str) -> QubesResult<Self> {
        let (start, end) = match raw.split_once('-') {
            Some((a, b)) => (a, b),
            None => (raw, raw),
        };
        let start: u16 = start
            .parse()
            .map_err(|_| QubesError::invalid_value(format!("invalid port: {:?}", raw)))?;
        let end: u16 = end
            .parse()
            .map_err(|_| QubesError::invalid_value(format!("invalid port: {:?}", raw)))?;
        if start == 0 || end < start {
            return Err(QubesError::invalid_value(format!(
                "invalid port range: {:?}",
                raw
            )));
        }
        Ok(Self { start, end })
    }
}

impl fmt::Display for PortRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.start, self.end)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rule {
    pub action: Action,
    pub dsthost: Option<String>,
    pub proto: Option<Proto>,
    pub dstports: Option<PortRange>,
    pub icmptype: Option<u8>,
    pub specialtarget: Option<String>,
    /// Unix timestamp after which the rule no longer applies.
    pub expire: Option<u64>,
    pub comment: Option<String>,
}

impl Rule {
    pub fn accept() -> Self {
        Self {
            action: Action::Accept,
            dsthost: None,
            proto: None,
            dstports: None,
            icmptype: None,
            specialtarget: None,
            expire: None,
            comment: None,
        }
    }

    pub fn parse(line: &str) -> QubesResult<Self> {
        let mut action = None;
        let mut rule = Rule::accept();

        let mut rest = line.trim();
        while !rest.is_empty() {
            let (token, tail) = match rest.split_once(' ') {
                Some((t, tail)) => (t, tail.trim_start()),
                None => (rest, ""),
            };
            let (key, value) = token.split_once('=').ok_or_else(|| {
                QubesError::invalid_value(format!("malformed rule token: {:?}", token))
            })?;
            match key {
                "action" => action = Some(Action::parse(value)?),
                "dsthost" | "dst4" | "dst6" => rule.dsthost = Some(value.to_string()),
                "proto" => rule.proto = Some(Proto::parse(value)?),
                "dstports" => rule.dstports = Some(PortRange::parse(value)?),
                "icmptype" => {
                    rule.icmptype = Some(value.parse().map_err(|_| {
                        QubesError::invalid_value(format!("invalid icmptype: {:?}", value))
                    })?)
                }
                "specialtarget" => rule.specialtarget = Some(value.to_string()),
                "expire" => {
                    rule.expire = Some(value.parse().map_err(|_| {
                        QubesError::invalid_value(format!("invalid expire: {:?}", value))
                    })?)
                }
                "comment" => {
                    // comment swallows the rest of the line
                    let mut comment = value.to_string();
                    if !tail.is_empty() {
                        comment.push(' ');
                        comment.push_str(tail);
                    }
                    rule.comment = Some(comment);
                    rest = "";
                    continue;
                }
                _ => {
                    return Err(QubesError::invalid_value(format!(
                        "unknown rule key: {:?}",
                        key
                    )))
                }
            }
            rest = tail;
        }

        rule.action =
            action.ok_or_else(|| QubesError::invalid_value("rule is missing an action"))?;
        if rule.dstports.is_some() && !matches!(rule.proto, Some(Proto::Tcp) | Some(Proto::Udp)) {
            return Err(QubesError::invalid_value(
                "dstports requires proto=tcp or proto=udp",
            ));
        }
        if rule.icmptype.is_some() && rule.proto != Some(Proto::Icmp) {
            return Err(QubesError::invalid_value("icmptype requires proto=icmp"));
        }
        Ok(rule)
    }

    pub fn to_line(&self) -> String {
        let mut parts = vec![format!("action={}", self.action.as_str())];
        if let Some(h) = &self.dsthost {
            parts.push(format!("dsthost={}", h));
        }
        if let Some(p) = &self.proto {
            parts.push(format!("proto={}", p.as_str()));
        }
        if let Some(p) = &self.dstports {
            parts.push(format!("dstports={}", p));
        }
        if let Some(t) = &self.icmptype {
            parts.push(format!("icmptype={}", t));
        }
        if let Some(t) = &self.specialtarget {
            parts.push(format!("specialtarget={}", t));
        }
        if let Some(e) = &self.expire {
            parts.push(format!("expire={}", e));
        }
        if let Some(c) = &self.comment {
            parts.push(format!("comment={}", c));
        }
        parts.join(" ")
    }
}

/// Ordered rule list with a default policy applied after the last rule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Firewall {
    pub policy: Action,
    pub rules: Vec<Rule>,
}

impl Default for Firewall {
    fn default() -> Self {
        Self {
            policy: Action::Accept,
            rules: Vec::new(),
        }
    }
}

impl Firewall {
    pub fn parse_rules<'a>(lines: impl Iterator<Item = &'a str>) -> QubesResult<Vec<Rule>> {
        lines
            .filter(|l| !l.trim().is_empty())
            .map(Rule::parse)
            .collect()
    }

    pub fn rule_lines(&self) -> Vec<String> {
        self.rules.iter().map(Rule::to_line).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_full_rule() {
        let rule =
            Rule::parse("action=accept proto=tcp dsthost=example.org dstports=443-443").unwrap();
        assert_eq!(rule.action, Action::Accept);
        assert_eq!(rule.proto, Some(Proto::Tcp));
        assert_eq!(rule.dsthost.as_deref(), Some("example.org"));
        assert_eq!(rule.dstports, Some(PortRange { start: 443, end: 443 }));
    }

    #[test]
    fn roundtrip() {
        let line = "action=drop proto=udp dsthost=10.0.0.0/8 dstports=53-53";
        let rule = Rule::parse(line).unwrap();
        let rule2 = Rule::parse(&rule.to_line()).unwrap();
        assert_eq!(rule, rule2);
    }

    #[test]
    fn comment_swallows_rest() {
        let rule = Rule::parse("action=accept comment=allow my web server").unwrap();
        assert_eq!(rule.comment.as_deref(), Some("allow my web server"));
    }

    #[test]
    fn single_port_is_a_range() {
        let rule = Rule::parse("action=accept proto=tcp dstports=22").unwrap();
        assert_eq!(rule.dstports, Some(PortRange { start: 22, end: 22 }));
    }

    #[test]
    fn invalid_rules() {
        assert!(Rule::parse("proto=tcp").is_err());
        assert!(Rule::parse("action=accept dstports=80").is_err());
        assert!(Rule::parse("action=accept icmptype=8").is_err());
        assert!(Rule::parse("action=accept nonsense=1").is_err());
        assert!(Rule::parse("action=accept proto=tcp dstports=80-22").is_err());
    }
}
