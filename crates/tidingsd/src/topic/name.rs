//! Topic naming
//!
//! Clients address topics by names that depend on who is asking; the
//! cluster routes on a canonical *routing name*:
//!
//! | client name  | routing name      | kind      |
//! |--------------|-------------------|-----------|
//! | `me`         | `usr<self>`       | self      |
//! | `fnd`        | `fnd<self>`       | discovery |
//! | `usr<other>` | `p2p<a>.<b>`      | pairwise  |
//! | `grp<id>`    | `grp<id>`         | group     |
//! | `chn<id>`    | `chn<id>`         | broadcast |
//!
//! In a pairwise name `a < b`, so both parties resolve to the same topic.

use crate::error::{Error, Result};
use std::fmt;

/// Topic category
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TopicKind {
    /// A user's own topic
    Me,
    /// A user's discovery topic
    Fnd,
    Group,
    /// Broadcast channel, only owners publish
    Channel,
    /// Conversation between two users
    P2p,
}

impl TopicKind {
    /// Kinds created on first use instead of requiring an existing record
    pub fn is_implicit(self) -> bool {
        matches!(self, TopicKind::Me | TopicKind::Fnd | TopicKind::P2p)
    }
}

impl fmt::Display for TopicKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            TopicKind::Me => "me",
            TopicKind::Fnd => "fnd",
            TopicKind::Group => "grp",
            TopicKind::Channel => "chn",
            TopicKind::P2p => "p2p",
        })
    }
}

/// Canonical topic identity
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TopicName {
    routing: String,
    kind: TopicKind,
}

fn valid_id(id: &str) -> bool {
    !id.is_empty() && id.len() <= 64 && id.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'_')
}

fn check_id<'a>(id: &'a str, what: &str) -> Result<&'a str> {
    if valid_id(id) {
        Ok(id)
    } else {
        Err(Error::Validation(format!("malformed {} '{}'", what, id)))
    }
}

impl TopicName {
    /// Resolve a client-facing name on behalf of `principal`
    pub fn resolve(name: &str, principal: &str) -> Result<Self> {
        check_id(principal, "principal")?;
        match name {
            "me" => return Ok(Self::new(format!("usr{}", principal), TopicKind::Me)),
            "fnd" => return Ok(Self::new(format!("fnd{}", principal), TopicKind::Fnd)),
            _ => {}
        }
        if let Some(other) = name.strip_prefix("usr") {
            let other = check_id(other, "user id")?;
            if other == principal {
                return Err(Error::Validation("use 'me' to address your own topic".into()));
            }
            return Ok(Self::p2p(principal, other));
        }
        let parsed = Self::from_routing(name)?;
        if parsed.kind == TopicKind::Me || parsed.kind == TopicKind::Fnd {
            // usr/fnd routing names are only reachable through 'me' and 'fnd'
            return Err(Error::Validation(format!("invalid topic name '{}'", name)));
        }
        Ok(parsed)
    }

    /// Parse a routing name received from a peer
    pub fn from_routing(name: &str) -> Result<Self> {
        let (prefix, rest) = name
            .char_indices()
            .nth(3)
            .map(|(i, _)| name.split_at(i))
            .ok_or_else(|| Error::Validation(format!("invalid topic name '{}'", name)))?;
        match prefix {
            "usr" => Ok(Self::new(format!("usr{}", check_id(rest, "user id")?), TopicKind::Me)),
            "fnd" => Ok(Self::new(format!("fnd{}", check_id(rest, "user id")?), TopicKind::Fnd)),
            "grp" => Ok(Self::new(format!("grp{}", check_id(rest, "group id")?), TopicKind::Group)),
            "chn" => Ok(Self::new(
                format!("chn{}", check_id(rest, "channel id")?),
                TopicKind::Channel,
            )),
            "p2p" => {
                let (a, b) = rest
                    .split_once('.')
                    .ok_or_else(|| Error::Validation(format!("invalid topic name '{}'", name)))?;
                let a = check_id(a, "user id")?;
                let b = check_id(b, "user id")?;
                if a >= b {
                    return Err(Error::Validation(format!("non-canonical topic name '{}'", name)));
                }
                Ok(Self::p2p(a, b))
            }
            _ => Err(Error::Validation(format!("invalid topic name '{}'", name))),
        }
    }

    fn new(routing: String, kind: TopicKind) -> Self {
        Self { routing, kind }
    }

    fn p2p(x: &str, y: &str) -> Self {
        let (a, b) = if x < y { (x, y) } else { (y, x) };
        Self::new(format!("p2p{}.{}", a, b), TopicKind::P2p)
    }

    pub fn as_str(&self) -> &str {
        &self.routing
    }

    pub fn kind(&self) -> TopicKind {
        self.kind
    }

    /// The user a self or discovery topic belongs to
    pub fn owner_principal(&self) -> Option<&str> {
        match self.kind {
            TopicKind::Me | TopicKind::Fnd => Some(&self.routing[3..]),
            _ => None,
        }
    }

    /// Both parties of a pairwise topic
    pub fn parties(&self) -> Option<(&str, &str)> {
        match self.kind {
            TopicKind::P2p => self.routing[3..].split_once('.'),
            _ => None,
        }
    }
}

impl fmt::Display for TopicName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.routing)
    }
}
