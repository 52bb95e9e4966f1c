use crate::catalog::types::{PrimaryKey, Value};
use compact_str::CompactString;
use im::{OrdMap, OrdSet};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{BTreeSet, HashMap};
use std::ops::Bound;

/// Matching knobs shared by the index and the per-row matcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchOptions {
    /// Maximum Levenshtein distance for a fuzzy token hit; 0 disables fuzzy.
    pub fuzzy_max_edits: usize,
    /// Query tokens shorter than this only match exactly, by prefix or by
    /// substring.
    pub fuzzy_min_token_len: usize,
    pub substring: bool,
}

impl Default for SearchOptions {
    fn default() -> Self {
        Self {
            fuzzy_max_edits: 1,
            fuzzy_min_token_len: 4,
            substring: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchTier {
    Fuzzy,
    Token,
    ExactPrefix,
}

/// Relevance of one row for one search term. Greater is better.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Relevance {
    pub tier: MatchTier,
    pub exact_tokens: u32,
    pub edit_distance: u32,
}

impl Ord for Relevance {
    fn cmp(&self, other: &Self) -> Ordering {
        self.tier
            .cmp(&other.tier)
            .then(self.exact_tokens.cmp(&other.exact_tokens))
            .then(other.edit_distance.cmp(&self.edit_distance))
    }
}

impl PartialOrd for Relevance {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Lowercase alphanumeric runs.
pub fn tokenize(text: &str) -> Vec<CompactString> {
    let mut tokens = Vec::new();
    let mut current = CompactString::default();
    for ch in text.chars() {
        if ch.is_alphanumeric() {
            current.extend(ch.to_lowercase());
        } else if !current.is_empty() {
            tokens.push(std::mem::take(&mut current));
        }
    }
    if !current.is_empty() {
        tokens.push(current);
    }
    tokens
}

/// Tokens rejoined by single spaces; the form used for prefix comparison of
/// whole field values.
pub fn normalize(text: &str) -> String {
    tokenize(text)
        .iter()
        .map(|t| t.as_str())
        .collect::<Vec<_>>()
        .join(" ")
}

/// Levenshtein distance that gives up once the distance exceeds `max`.
pub fn bounded_levenshtein(a: &str, b: &str, max: usize) -> Option<usize> {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    if a.len().abs_diff(b.len()) > max {
        return None;
    }
    if a.is_empty() || b.is_empty() {
        let d = a.len().max(b.len());
        return (d <= max).then_some(d);
    }

    let mut prev_row: Vec<usize> = (0..=b.len()).collect();
    let mut curr_row: Vec<usize> = vec![0; b.len() + 1];
    for i in 1..=a.len() {
        curr_row[0] = i;
        let mut row_min = curr_row[0];
        for j in 1..=b.len() {
            let cost = usize::from(a[i - 1] != b[j - 1]);
            curr_row[j] = (curr_row[j - 1] + 1)
                .min(prev_row[j] + 1)
                .min(prev_row[j - 1] + cost);
            row_min = row_min.min(curr_row[j]);
        }
        if row_min > max {
            return None;
        }
        std::mem::swap(&mut prev_row, &mut curr_row);
    }
    let d = prev_row[b.len()];
    (d <= max).then_some(d)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TokenHit {
    Exact,
    Prefix,
    Substring,
    Edit(usize),
}

impl TokenHit {
    // Higher is better.
    fn rank(self) -> (u8, std::cmp::Reverse<usize>) {
        match self {
            TokenHit::Exact => (3, std::cmp::Reverse(0)),
            TokenHit::Prefix => (2, std::cmp::Reverse(0)),
            TokenHit::Substring => (1, std::cmp::Reverse(0)),
            TokenHit::Edit(d) => (0, std::cmp::Reverse(d)),
        }
    }
}

/// A parsed search term.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchQuery {
    pub term: String,
    normalized: String,
    tokens: Vec<CompactString>,
    options: SearchOptions,
}

impl SearchQuery {
    /// Returns `None` when the term contains no searchable characters.
    pub fn parse(term: &str, options: SearchOptions) -> Option<Self> {
        let tokens = tokenize(term);
        if tokens.is_empty() {
            return None;
        }
        Some(Self {
            term: term.to_string(),
            normalized: normalize(term),
            tokens,
            options,
        })
    }

    pub fn tokens(&self) -> &[CompactString] {
        &self.tokens
    }

    fn hit(&self, query_token: &str, row_token: &str) -> Option<TokenHit> {
        if row_token == query_token {
            return Some(TokenHit::Exact);
        }
        if row_token.starts_with(query_token) {
            return Some(TokenHit::Prefix);
        }
        if self.options.substring && row_token.contains(query_token) {
            return Some(TokenHit::Substring);
        }
        if self.options.fuzzy_max_edits > 0
            && query_token.chars().count() >= self.options.fuzzy_min_token_len
        {
            return bounded_levenshtein(query_token, row_token, self.options.fuzzy_max_edits)
                .map(TokenHit::Edit);
        }
        None
    }

    /// Scores a row given the values of its bound search columns. `None`
    /// means the row does not match.
    pub fn score<'a>(&self, fields: impl IntoIterator<Item = &'a Value>) -> Option<Relevance> {
        let texts: Vec<String> = fields.into_iter().filter_map(Value::search_text).collect();
        let row_tokens: Vec<CompactString> = texts.iter().flat_map(|t| tokenize(t)).collect();

        let mut all_token_level = true;
        let mut exact_tokens = 0u32;
        let mut edit_distance = 0u32;
        for qt in &self.tokens {
            let best = row_tokens
                .iter()
                .filter_map(|rt| self.hit(qt, rt))
                .max_by_key(|hit| hit.rank())?;
            match best {
                TokenHit::Exact => exact_tokens += 1,
                TokenHit::Prefix => {}
                TokenHit::Substring => all_token_level = false,
                TokenHit::Edit(d) => {
                    all_token_level = false;
                    edit_distance += d as u32;
                }
            }
        }

        let exact_prefix = texts
            .iter()
            .any(|t| normalize(t).starts_with(self.normalized.as_str()));
        let tier = if exact_prefix {
            MatchTier::ExactPrefix
        } else if all_token_level {
            MatchTier::Token
        } else {
            MatchTier::Fuzzy
        };
        Some(Relevance {
            tier,
            exact_tokens,
            edit_distance,
        })
    }
}

/// Inverted index over one searchable column, with a bigram side index over
/// the vocabulary for substring and fuzzy lookups.
#[derive(Debug, Clone, Default)]
pub struct SearchIndex {
    postings: OrdMap<CompactString, OrdSet<PrimaryKey>>,
    grams: OrdMap<CompactString, OrdSet<CompactString>>,
}

impl SearchIndex {
    pub fn insert(&mut self, value: &Value, pk: &PrimaryKey) {
        let Some(text) = value.search_text() else {
            return;
        };
        for token in distinct(tokenize(&text)) {
            let mut pks = match self.postings.get(&token) {
                Some(pks) => pks.clone(),
                None => {
                    self.add_grams(&token);
                    OrdSet::new()
                }
            };
            pks.insert(pk.clone());
            self.postings.insert(token, pks);
        }
    }

    pub fn remove(&mut self, value: &Value, pk: &PrimaryKey) {
        let Some(text) = value.search_text() else {
            return;
        };
        for token in distinct(tokenize(&text)) {
            let Some(mut pks) = self.postings.get(&token).cloned() else {
                continue;
            };
            pks.remove(pk);
            if pks.is_empty() {
                self.postings.remove(&token);
                self.remove_grams(&token);
            } else {
                self.postings.insert(token, pks);
            }
        }
    }

    pub fn vocabulary_len(&self) -> usize {
        self.postings.len()
    }

    fn add_grams(&mut self, token: &CompactString) {
        for gram in bigrams(token) {
            let mut tokens = self.grams.get(&gram).cloned().unwrap_or_default();
            tokens.insert(token.clone());
            self.grams.insert(gram, tokens);
        }
    }

    fn remove_grams(&mut self, token: &CompactString) {
        for gram in bigrams(token) {
            let Some(mut tokens) = self.grams.get(&gram).cloned() else {
                continue;
            };
            tokens.remove(token);
            if tokens.is_empty() {
                self.grams.remove(&gram);
            } else {
                self.grams.insert(gram, tokens);
            }
        }
    }

    /// Rows holding some token that `query_token` can match under `query`'s
    /// options. A superset of what the row matcher accepts for this token.
    pub fn candidates(&self, query: &SearchQuery, query_token: &str) -> BTreeSet<PrimaryKey> {
        let mut tokens: BTreeSet<&CompactString> = BTreeSet::new();
        let start = CompactString::from(query_token);
        for (token, _) in self.postings.range((Bound::Included(start), Bound::Unbounded)) {
            if !token.starts_with(query_token) {
                break;
            }
            tokens.insert(token);
        }

        let fuzzy = query.options.fuzzy_max_edits > 0
            && query_token.chars().count() >= query.options.fuzzy_min_token_len;
        if query.options.substring || fuzzy {
            let edits = fuzzy.then_some(query.options.fuzzy_max_edits);
            match self.gram_candidates(query_token, edits) {
                Some(found) => tokens.extend(found.into_iter().filter(|t| query.hit(query_token, t).is_some())),
                None => tokens.extend(self.postings.keys().filter(|t| query.hit(query_token, t).is_some())),
            }
        }

        let mut out = BTreeSet::new();
        for token in tokens {
            if let Some(pks) = self.postings.get(token) {
                out.extend(pks.iter().cloned());
            }
        }
        out
    }

    /// Vocabulary tokens that may contain `query_token` or lie within
    /// `fuzzy_edits` of it. `None` when the grams cannot narrow the search.
    fn gram_candidates(&self, query_token: &str, fuzzy_edits: Option<usize>) -> Option<BTreeSet<&CompactString>> {
        let grams = bigrams(query_token);
        if grams.is_empty() {
            if fuzzy_edits.is_some() {
                return None;
            }
            // a longer token holding this character has a gram holding it
            let ch = query_token.chars().next()?;
            return Some(
                self.grams
                    .iter()
                    .filter(|(gram, _)| gram.contains(ch))
                    .flat_map(|(_, tokens)| tokens.iter())
                    .collect(),
            );
        }
        // each edit breaks at most two of the query's distinct grams
        let needed = match fuzzy_edits {
            Some(edits) => grams.len().checked_sub(2 * edits).filter(|n| *n > 0)?,
            None => grams.len(),
        };
        let mut shared: HashMap<&CompactString, usize> = HashMap::new();
        for gram in &grams {
            if let Some(tokens) = self.grams.get(gram) {
                for token in tokens.iter() {
                    *shared.entry(token).or_default() += 1;
                }
            }
        }
        Some(
            shared
                .into_iter()
                .filter(|(_, n)| *n >= needed)
                .map(|(token, _)| token)
                .collect(),
        )
    }
}

fn bigrams(token: &str) -> BTreeSet<CompactString> {
    let chars: Vec<char> = token.chars().collect();
    chars.windows(2).map(|w| w.iter().copied().collect()).collect()
}

fn distinct(tokens: Vec<CompactString>) -> BTreeSet<CompactString> {
    tokens.into_iter().collect()
}
