//! Pod identity parsing.
//!
//! The fan-out layer keys every reply by a composite string
//! `"<group> #<index>"`. Group names may themselves contain `" #"`, so the
//! split always happens on the last occurrence.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::IdentityError;

const SEPARATOR: &str = " #";

/// One live pod: its group name plus its sequence index within the group.
///
/// Ordering is by group first, then index, so a `BTreeMap<PodIdentity, _>`
/// iterates pods group by group in index order.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PodIdentity {
    pub group: String,
    pub index: u32,
}

impl PodIdentity {
    pub fn new(group: impl Into<String>, index: u32) -> Self {
        Self {
            group: group.into(),
            index,
        }
    }

    /// Parse the wire form, splitting on the last `" #"`.
    pub fn parse(raw: &str) -> Result<Self, IdentityError> {
        let (group, index) = raw
            .rsplit_once(SEPARATOR)
            .ok_or_else(|| IdentityError::MissingSeparator(raw.to_string()))?;

        if group.is_empty() {
            return Err(IdentityError::EmptyGroup(raw.to_string()));
        }

        let index = index
            .trim()
            .parse::<u32>()
            .map_err(|_| IdentityError::InvalidIndex(raw.to_string()))?;

        Ok(Self::new(group, index))
    }
}

impl fmt::Display for PodIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}{}", self.group, SEPARATOR, self.index)
    }
}

impl FromStr for PodIdentity {
    type Err = IdentityError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for PodIdentity {
    type Error = IdentityError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<PodIdentity> for String {
    fn from(id: PodIdentity) -> Self {
        id.to_string()
    }
}
