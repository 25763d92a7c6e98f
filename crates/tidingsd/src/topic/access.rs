//! Subscription access modes

use crate::error::Error;
use bitflags::bitflags;
use std::fmt;
use std::str::FromStr;

bitflags! {
    /// Permission bits a principal holds on a topic
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct AccessMode: u8 {
        /// Join (attach to the topic)
        const JOIN = 0b0000_0001;
        /// Read messages
        const READ = 0b0000_0010;
        /// Publish messages
        const WRITE = 0b0000_0100;
        /// Receive presence notifications
        const PRES = 0b0000_1000;
        /// Approve join requests
        const APPROVE = 0b0001_0000;
        /// Invite others
        const SHARE = 0b0010_0000;
        /// Delete messages
        const DELETE = 0b0100_0000;
        /// Full control
        const OWNER = 0b1000_0000;
    }
}

const LETTERS: [(char, AccessMode); 8] = [
    ('J', AccessMode::JOIN),
    ('R', AccessMode::READ),
    ('W', AccessMode::WRITE),
    ('P', AccessMode::PRES),
    ('A', AccessMode::APPROVE),
    ('S', AccessMode::SHARE),
    ('D', AccessMode::DELETE),
    ('O', AccessMode::OWNER),
];

impl AccessMode {
    /// Ordinary group member
    pub const GROUP_MEMBER: AccessMode = AccessMode::JOIN
        .union(AccessMode::READ)
        .union(AccessMode::WRITE)
        .union(AccessMode::PRES)
        .union(AccessMode::SHARE);

    /// Broadcast channel reader
    pub const CHANNEL_READER: AccessMode = AccessMode::JOIN.union(AccessMode::READ);

    /// Party of a pairwise conversation
    pub const P2P_PARTY: AccessMode = AccessMode::JOIN
        .union(AccessMode::READ)
        .union(AccessMode::WRITE)
        .union(AccessMode::PRES);

    /// Topic owner
    pub const FULL: AccessMode = AccessMode::all();

    pub fn can_join(self) -> bool {
        self.contains(AccessMode::JOIN)
    }

    pub fn can_read(self) -> bool {
        self.contains(AccessMode::READ)
    }

    pub fn can_write(self) -> bool {
        self.contains(AccessMode::WRITE)
    }

    pub fn is_owner(self) -> bool {
        self.contains(AccessMode::OWNER)
    }
}

impl fmt::Display for AccessMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return f.write_str("N");
        }
        for (letter, bit) in LETTERS {
            if self.contains(bit) {
                write!(f, "{}", letter)?;
            }
        }
        Ok(())
    }
}

impl FromStr for AccessMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.eq_ignore_ascii_case("n") {
            return Ok(AccessMode::empty());
        }
        if s.is_empty() {
            return Err(Error::Validation("empty access mode".into()));
        }
        let mut mode = AccessMode::empty();
        for c in s.chars() {
            let upper = c.to_ascii_uppercase();
            let bit = LETTERS
                .iter()
                .find(|(letter, _)| *letter == upper)
                .map(|(_, bit)| *bit)
                .ok_or_else(|| Error::Validation(format!("invalid access mode '{}'", s)))?;
            mode |= bit;
        }
        Ok(mode)
    }
}
