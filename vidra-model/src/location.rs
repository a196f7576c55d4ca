use url::Url;

use crate::error::{ModelError, Result};

/// Normalize a location to folder form (path ending in `/`).
///
/// Discover-event bases always refer to a directory; normalizing up front
/// keeps the prefix checks in the diff engine purely textual.
pub fn folder_form(location: &Url) -> Result<Url> {
    if location.cannot_be_a_base() {
        return Err(ModelError::InvalidLocation(location.to_string()));
    }
    if location.path().ends_with('/') {
        return Ok(location.clone());
    }
    let mut folder = location.clone();
    let path = format!("{}/", location.path());
    folder.set_path(&path);
    Ok(folder)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn appends_trailing_slash() {
        let url = Url::parse("file:///media/movies").unwrap();
        let folder = folder_form(&url).unwrap();
        assert_eq!(folder.as_str(), "file:///media/movies/");
    }

    #[test]
    fn already_folder_form_unchanged() {
        let url = Url::parse("file:///media/movies/").unwrap();
        let folder = folder_form(&url).unwrap();
        assert_eq!(folder, url);
    }

    #[test]
    fn rejects_cannot_be_a_base() {
        let url = Url::parse("mailto:someone@example.com").unwrap();
        assert!(folder_form(&url).is_err());
    }
}
