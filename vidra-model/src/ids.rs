use std::fmt::{self, Display, Formatter};

/// Hash of an item's content as reported by the scanner that found it.
///
/// Two discoveries with the same fingerprint refer to the same bytes, even
/// when they live at different locations.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ContentFingerprint(pub String);

impl ContentFingerprint {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for ContentFingerprint {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Content identity of a resource, derived from its fingerprint.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ContentId(pub String);

impl ContentId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&ContentFingerprint> for ContentId {
    fn from(fingerprint: &ContentFingerprint) -> Self {
        ContentId(fingerprint.0.clone())
    }
}

impl Display for ContentId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of a work in an external metadata catalog.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct WorkId(pub String);

impl WorkId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for WorkId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Name of a registered identification provider, carried on discover events
/// so the orchestrator knows which provider to route a batch to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ProviderRef(pub String);

impl ProviderRef {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for ProviderRef {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
