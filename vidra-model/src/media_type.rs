use std::fmt::{self, Display, Formatter};

/// Simple enum for media types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum MediaType {
    /// Movie media type
    Movie,
    /// Series media type
    Series,
    /// Season media type
    Season,
    /// Episode media type
    Episode,
    /// Plain folder grouping other items
    Folder,
}

impl MediaType {
    /// Component types only exist as part of a parent item and can only be
    /// identified once the parent's identification is known.
    pub fn is_component(&self) -> bool {
        matches!(self, MediaType::Season | MediaType::Episode)
    }
}

impl Display for MediaType {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            MediaType::Movie => write!(f, "Movie"),
            MediaType::Series => write!(f, "Series"),
            MediaType::Season => write!(f, "Season"),
            MediaType::Episode => write!(f, "Episode"),
            MediaType::Folder => write!(f, "Folder"),
        }
    }
}
