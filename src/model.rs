use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid numeric id: {0:?}")]
pub struct IdParseError(pub String);

/// Numeric item identifier. Travels as a decimal string on the wire and in storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct ItemId(pub u64);

impl fmt::Display for ItemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for ItemId {
    type Err = IdParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim()
            .parse::<u64>()
            .map(ItemId)
            .map_err(|_| IdParseError(s.to_string()))
    }
}

impl From<ItemId> for String {
    fn from(id: ItemId) -> Self {
        id.to_string()
    }
}

impl TryFrom<String> for ItemId {
    type Error = IdParseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

/// Last successfully processed item. Bounds the next fetch (`id > cursor`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct Cursor(pub u64);

impl Cursor {
    /// Move the cursor forward to `id`. Never moves it backwards.
    pub fn advance(self, id: ItemId) -> Cursor {
        Cursor(self.0.max(id.0))
    }

    /// True if `id` has already been covered by this cursor.
    pub fn covers(&self, id: ItemId) -> bool {
        id.0 <= self.0
    }
}

impl fmt::Display for Cursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for Cursor {
    type Err = IdParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.parse::<ItemId>().map(|id| Cursor(id.0))
    }
}

impl From<Cursor> for String {
    fn from(c: Cursor) -> Self {
        c.to_string()
    }
}

impl TryFrom<String> for Cursor {
    type Error = IdParseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

/// `[start, end)` span of a hashtag in a message, in characters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HashtagSpan {
    pub start: usize,
    pub end: usize,
    pub text: String,
}

/// A message as returned by the feed. Immutable once fetched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawItem {
    pub id: ItemId,
    pub created_at: DateTime<Utc>,
    pub full_text: String,
    pub hashtags: Vec<HashtagSpan>,
    pub reply_to: Option<ItemId>,
    pub permalink: String,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub enum Label {
    #[default]
    Unset,
    Negative,
    Positive,
}

impl Label {
    pub fn as_str(&self) -> &'static str {
        match self {
            Label::Unset => "unset",
            Label::Negative => "negative",
            Label::Positive => "positive",
        }
    }

    pub fn parse_label(s: &str) -> Option<Label> {
        match s {
            "unset" => Some(Label::Unset),
            "negative" => Some(Label::Negative),
            "positive" => Some(Label::Positive),
            _ => None,
        }
    }
}

/// Answer of the remote classifier for one text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteVerdict {
    pub score: f64,
    pub label: Label,
    pub version: String,
}

/// Pipeline state for one item. Lexical fields are filled before remote ones.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessingRecord {
    pub item: RawItem,
    pub text_without_tags: String,
    pub text_highlighted: String,
    pub lexical_score: f64,
    pub lexical_label: Label,
    pub lexical_version: String,
    pub remote_score: Option<f64>,
    pub remote_label: Label,
    /// `None` when the remote classifier was not consulted or did not answer.
    pub remote_version: Option<String>,
}

impl ProcessingRecord {
    pub fn new(item: RawItem, text_without_tags: String) -> Self {
        Self {
            item,
            text_without_tags,
            text_highlighted: String::new(),
            lexical_score: 0.0,
            lexical_label: Label::Unset,
            lexical_version: String::new(),
            remote_score: None,
            remote_label: Label::Unset,
            remote_version: None,
        }
    }

    pub fn id(&self) -> ItemId {
        self.item.id
    }

    /// Trust the remote classifier when it answered, otherwise the lexical one.
    pub fn shall_publish(&self) -> bool {
        self.remote_label == Label::Positive
            || (self.remote_label == Label::Unset && self.lexical_label == Label::Positive)
    }
}
