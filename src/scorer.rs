//! Lexical relevance scorer.
//!
//! Scores a message by counting whitespace-separated tokens that contain a
//! relevant term (case-insensitive substring match), unless the same token
//! also contains an irrelevant term. Any blacklisted term anywhere in the
//! text forces the score to zero.
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};

/// Wraps matched tokens in the highlighted output (Slack bold).
pub const HIGHLIGHT_MARKER: char = '*';

/// Word fragments that indicate a search-and-rescue operation.
pub const DEFAULT_RELEVANT: &[&str] = &[
    "savn", // -a, -et, -ede
    "sakn", // -a, -et
    "teaksjon", // le-, lei-
    "leite",
    "leting",
    "leter",
    "søk",
    "redningsaksjon",
    "redning",
    "redningsoppdrag",
    "bekymringsmelding",
    "borte",
    "sist sett", // never matches a single token, kept for the denominator
    "værfast",
    "helikopter",
    "chc",
    "luftamb",
    "snøscooter",
    "firehjul",
    "4-hjul",
    "hundepatrulje",
    "redningshund",
    "ekvipasje",
    "dement",
    "beskrivelse",
    "signalement",
    "kledd",
    "skred",
    "røde",
    "kors",
    "hjelpekorps",
    "hjelpemannskap",
    "alpin",
    "redningsgruppe",
    "byfjell",
    "turgåer",
    "frivillige",
    "forsv", // forsvunnet, forsvant
    "funn",
    "behold",
    "behald",
    "rette", // komme til rette
    "iført",
    "hår",
    "skårfast",
    "turfølge",
];

/// Tokens containing one of these never count, even if they contain a relevant term.
pub const DEFAULT_IRRELEVANT: &[&str] = &[
    "forsøk",
    "undersøk",
    "ansøk",
    "asylsøk",
    "besøk",
    "søknad",
    "oppsøk",
    "søksmål",
    "saksøk",
    "borttatt",
    "spredning",
    "redningsarbeid",
    "forsvar",
    "opprette",
    "deretter",
    "rettelse",
    "korskirke",
    "rossleitet",
    "paradisleitet",
    "korsrygg",
    "kyskskreda",
    "skredestranda",
    "kveldsfesteskredo",
    "skredhaugen",
];

/// Any of these anywhere in the text zeroes the score.
pub const DEFAULT_BLACKLIST: &[&str] = &[
    "narkoti",
    "hasj",
    "røyk",
    "tørrkoking",
    "brann ", // brannvesen is fine
    "brenn",
    "innbrudd",
    "gjernings",
    "tyve",
    "pålegg",
    "håra", // place name in Hardanger
    "trafikkulykke",
    "trafikkuhell",
    "bevæpnet",
    "kanin",
    "stjål",
    "rettelse",
];

static DEFAULT_TERMS: Lazy<TermLists> =
    Lazy::new(|| TermLists::new(DEFAULT_RELEVANT, DEFAULT_IRRELEVANT, DEFAULT_BLACKLIST));

/// The three term lists, stored lowercased.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TermLists {
    relevant: Vec<String>,
    irrelevant: Vec<String>,
    blacklist: Vec<String>,
}

impl TermLists {
    pub fn new<S: AsRef<str>>(relevant: &[S], irrelevant: &[S], blacklist: &[S]) -> Self {
        let lower = |terms: &[S]| -> Vec<String> {
            terms
                .iter()
                .map(|t| t.as_ref().to_lowercase())
                .filter(|t| !t.is_empty())
                .collect()
        };
        Self {
            relevant: lower(relevant),
            irrelevant: lower(irrelevant),
            blacklist: lower(blacklist),
        }
    }

    pub fn relevant(&self) -> &[String] {
        &self.relevant
    }

    pub fn irrelevant(&self) -> &[String] {
        &self.irrelevant
    }

    pub fn blacklist(&self) -> &[String] {
        &self.blacklist
    }
}

impl Default for TermLists {
    fn default() -> Self {
        DEFAULT_TERMS.clone()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct LexicalScore {
    pub value: f64,
    pub highlighted: String,
}

#[derive(Debug, Clone, Default)]
pub struct LexicalScorer {
    terms: TermLists,
}

impl LexicalScorer {
    pub fn new(terms: TermLists) -> Self {
        Self { terms }
    }

    pub fn terms(&self) -> &TermLists {
        &self.terms
    }

    /// Score `text` into `[0, 1]` and return it with matched tokens highlighted.
    ///
    /// The denominator is `min(relevant terms, words in text)`: a short message
    /// saturates once every word is a trigger, a long one once every known
    /// trigger has been seen. The blacklist zeroes the value but leaves the
    /// highlighting untouched.
    pub fn score(&self, text: &str) -> LexicalScore {
        let mut matched = 0usize;
        let mut pieces: Vec<String> = Vec::new();
        for token in text.split_whitespace() {
            if self.token_matches(token) {
                matched += 1;
                pieces.push(format!("{HIGHLIGHT_MARKER}{token}{HIGHLIGHT_MARKER}"));
            } else {
                pieces.push(token.to_string());
            }
        }
        let highlighted = pieces.join(" ").trim().to_string();

        let denominator = self.terms.relevant.len().min(count_words(text));
        let mut value = if denominator == 0 {
            0.0
        } else {
            (matched as f64 / denominator as f64).min(1.0)
        };

        let lower = text.to_lowercase();
        if self.terms.blacklist.iter().any(|b| lower.contains(b.as_str())) {
            value = 0.0;
        }

        LexicalScore { value, highlighted }
    }

    fn token_matches(&self, token: &str) -> bool {
        let lower = token.to_lowercase();
        self.terms.relevant.iter().any(|r| lower.contains(r.as_str()))
            && !self.terms.irrelevant.iter().any(|i| lower.contains(i.as_str()))
    }
}

/// Number of whitespace-separated words; runs of whitespace count as one gap.
pub fn count_words(text: &str) -> usize {
    text.split_whitespace().count()
}

/// Remove highlight markers; inverse of the highlighting applied by [`LexicalScorer::score`].
pub fn strip_highlight(highlighted: &str) -> String {
    highlighted
        .split(' ')
        .map(|tok| {
            tok.strip_prefix(HIGHLIGHT_MARKER)
                .and_then(|t| t.strip_suffix(HIGHLIGHT_MARKER))
                .unwrap_or(tok)
        })
        .collect::<Vec<_>>()
        .join(" ")
}
