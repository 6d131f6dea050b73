//! Decoded response records.
//!
//! Maps are ordered (`BTreeMap`) so that serializing the same response twice
//! yields the same bytes, which the response cache relies on to detect
//! "nothing changed".

use std::{collections::BTreeMap, ops::Deref};

use serde::{Deserialize, Serialize};

/// A tag bag: tag name to the ordered list of its values.
///
/// Songs in the queue carry exactly one `file` value as their identity.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Song(BTreeMap<String, Vec<String>>);

impl Song {
    /// The tag holding a song's identity.
    pub const FILE: &'static str = "file";

    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends `value` to the values of `tag`.
    pub fn push(&mut self, tag: impl Into<String>, value: impl Into<String>) {
        self.0.entry(tag.into()).or_default().push(value.into());
    }

    /// All values of `tag`, in response order.
    #[must_use]
    pub fn values(&self, tag: &str) -> Option<&[String]> {
        self.0.get(tag).map(Vec::as_slice)
    }

    /// The first value of `tag`.
    #[must_use]
    pub fn first(&self, tag: &str) -> Option<&str> {
        self.values(tag)
            .and_then(|values| values.first())
            .map(String::as_str)
    }

    #[must_use]
    pub fn file(&self) -> Option<&str> {
        self.first(Self::FILE)
    }

    #[must_use]
    pub fn into_inner(self) -> BTreeMap<String, Vec<String>> {
        self.0
    }
}

impl Deref for Song {
    type Target = BTreeMap<String, Vec<String>>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl<K, V> FromIterator<(K, V)> for Song
where
    K: Into<String>,
    V: Into<String>,
{
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut song = Song::new();
        for (tag, value) in iter {
            song.push(tag, value);
        }
        song
    }
}

/// An audio output as reported by `outputs`.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Output {
    pub id: u32,
    pub name: String,
    pub plugin: String,
    pub enabled: bool,
    /// Runtime attributes such as `dop` or `allowed_formats`.
    pub attributes: BTreeMap<String, String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn repeated_tags_accumulate() {
        let song: Song = [
            ("file", "a.flac"),
            ("Artist", "Foo"),
            ("Artist", "Bar"),
        ]
        .into_iter()
        .collect();

        assert_eq!(song.file(), Some("a.flac"));
        assert_eq!(
            song.values("Artist"),
            Some(&["Foo".to_string(), "Bar".to_string()][..])
        );
        assert_eq!(song.first("Title"), None);
    }

    #[test]
    fn serializes_deterministically() {
        let a: Song = [("b", "2"), ("a", "1")].into_iter().collect();
        let b: Song = [("a", "1"), ("b", "2")].into_iter().collect();
        assert_eq!(
            serde_json::to_vec(&a).unwrap(),
            serde_json::to_vec(&b).unwrap()
        );
        assert_eq!(serde_json::to_string(&a).unwrap(), r#"{"a":["1"],"b":["2"]}"#);
    }
}
