//! Fuzzy name matching for symbol and file lookup.
//!
//! A scoring ladder combines match types in priority order: exact (1.0),
//! prefix (0.9), camel/snake token match (≤0.8), contains (0.7), and
//! LCS-based fuzzy (≤0.6, query coverage with a small consecutive-run
//! bonus). Matches at or below 0.3 are dropped. Each match reports its type
//! and character-index highlights.

use serde::Serialize;

pub const SCORE_THRESHOLD: f32 = 0.3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchType {
    Exact,
    Prefix,
    Token,
    Contains,
    Fuzzy,
}

impl MatchType {
    pub fn label(&self) -> &'static str {
        match self {
            MatchType::Exact => "exact",
            MatchType::Prefix => "prefix",
            MatchType::Token => "token",
            MatchType::Contains => "contains",
            MatchType::Fuzzy => "fuzzy",
        }
    }
}

/// A successful match: score, how it matched, and which candidate character
/// indices to highlight.
#[derive(Debug, Clone, Serialize)]
pub struct FuzzyMatch {
    pub score: f32,
    pub match_type: MatchType,
    pub indices: Vec<usize>,
}

/// Score `candidate` against `query`, case-insensitively. Returns the best
/// match type, or `None` when every type scores at or below the threshold.
pub fn match_name(query: &str, candidate: &str) -> Option<FuzzyMatch> {
    if query.is_empty() || candidate.is_empty() {
        return None;
    }
    let q: Vec<char> = query.to_lowercase().chars().collect();
    let c: Vec<char> = candidate.to_lowercase().chars().collect();

    // Exact
    if q == c {
        return Some(FuzzyMatch {
            score: 1.0,
            match_type: MatchType::Exact,
            indices: (0..c.len()).collect(),
        });
    }

    // Prefix
    if c.len() > q.len() && c[..q.len()] == q[..] {
        return Some(FuzzyMatch {
            score: 0.9,
            match_type: MatchType::Prefix,
            indices: (0..q.len()).collect(),
        });
    }

    // Camel/snake token match
    if let Some(m) = token_match(&q, candidate) {
        return Some(m);
    }

    // Contains
    if let Some(pos) = find_subslice(&c, &q) {
        return Some(FuzzyMatch {
            score: 0.7,
            match_type: MatchType::Contains,
            indices: (pos..pos + q.len()).collect(),
        });
    }

    // LCS-based fuzzy
    let (lcs_len, indices) = lcs_indices(&q, &c);
    if lcs_len == 0 {
        return None;
    }
    let coverage = lcs_len as f32 / q.len() as f32;
    let run = longest_common_substring(&q, &c) as f32 / q.len() as f32;
    let score = 0.6 * (0.9 * coverage + 0.1 * run);
    if score <= SCORE_THRESHOLD {
        return None;
    }
    Some(FuzzyMatch { score, match_type: MatchType::Fuzzy, indices })
}

// ---------------------------------------------------------------------------
// Token matching
// ---------------------------------------------------------------------------

/// Split an identifier into lowercase word tokens with their start indices:
/// `handleLogin` → [("handle",0), ("login",6)], `do_work` → [("do",0), ("work",3)].
pub fn split_tokens(name: &str) -> Vec<(String, usize)> {
    let chars: Vec<char> = name.chars().collect();
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut start = 0usize;

    for (i, &ch) in chars.iter().enumerate() {
        if ch == '_' || ch == '-' || ch == '.' {
            if !current.is_empty() {
                tokens.push((std::mem::take(&mut current), start));
            }
            continue;
        }
        let boundary = i > 0
            && ch.is_uppercase()
            && (chars[i - 1].is_lowercase()
                || (i + 1 < chars.len() && chars[i + 1].is_lowercase() && chars[i - 1].is_uppercase()));
        if boundary && !current.is_empty() {
            tokens.push((std::mem::take(&mut current), start));
        }
        if current.is_empty() {
            start = i;
        }
        current.extend(ch.to_lowercase());
    }
    if !current.is_empty() {
        tokens.push((current, start));
    }
    tokens
}

/// Match the query against token initials ("hl" → handleLogin) or in-order
/// token prefixes ("han log" is not supported; the query is one word).
fn token_match(q: &[char], candidate: &str) -> Option<FuzzyMatch> {
    let tokens = split_tokens(candidate);
    if tokens.len() < 2 {
        return None;
    }

    // Initials: each query char consumes one token's first letter, in order.
    if q.len() <= tokens.len() {
        let initials: Vec<char> = tokens.iter().filter_map(|(t, _)| t.chars().next()).collect();
        if initials[..q.len()] == q[..] {
            let score = 0.8 * (q.len() as f32 / tokens.len() as f32);
            if score > SCORE_THRESHOLD {
                return Some(FuzzyMatch {
                    score,
                    match_type: MatchType::Token,
                    indices: tokens[..q.len()].iter().map(|&(_, i)| i).collect(),
                });
            }
        }
    }

    // Greedy in-order token-prefix consumption: "getusr" → get + usr(user).
    let mut qi = 0usize;
    let mut indices = Vec::new();
    let mut matched_tokens = 0usize;
    for (token, token_start) in &tokens {
        if qi >= q.len() {
            break;
        }
        let tchars: Vec<char> = token.chars().collect();
        let mut consumed = 0usize;
        while consumed < tchars.len() && qi < q.len() && tchars[consumed] == q[qi] {
            indices.push(token_start + consumed);
            consumed += 1;
            qi += 1;
        }
        if consumed > 0 {
            matched_tokens += 1;
        }
    }
    if qi == q.len() && matched_tokens >= 2 {
        let score = 0.8 * (matched_tokens as f32 / tokens.len() as f32).min(1.0) * 0.95;
        if score > SCORE_THRESHOLD {
            return Some(FuzzyMatch { score, match_type: MatchType::Token, indices });
        }
    }
    None
}

// ---------------------------------------------------------------------------
// Subsequence machinery
// ---------------------------------------------------------------------------

fn find_subslice(haystack: &[char], needle: &[char]) -> Option<usize> {
    if needle.len() > haystack.len() {
        return None;
    }
    (0..=haystack.len() - needle.len()).find(|&i| haystack[i..i + needle.len()] == needle[..])
}

/// Longest common subsequence length plus the candidate indices of one
/// optimal alignment (for highlights).
fn lcs_indices(q: &[char], c: &[char]) -> (usize, Vec<usize>) {
    let n = q.len();
    let m = c.len();
    let mut dp = vec![vec![0usize; m + 1]; n + 1];
    for i in 1..=n {
        for j in 1..=m {
            dp[i][j] = if q[i - 1] == c[j - 1] {
                dp[i - 1][j - 1] + 1
            } else {
                dp[i - 1][j].max(dp[i][j - 1])
            };
        }
    }
    // Backtrack for indices.
    let mut indices = Vec::new();
    let (mut i, mut j) = (n, m);
    while i > 0 && j > 0 {
        if q[i - 1] == c[j - 1] {
            indices.push(j - 1);
            i -= 1;
            j -= 1;
        } else if dp[i - 1][j] >= dp[i][j - 1] {
            i -= 1;
        } else {
            j -= 1;
        }
    }
    indices.reverse();
    (dp[n][m], indices)
}

/// Length of the longest common contiguous substring.
fn longest_common_substring(q: &[char], c: &[char]) -> usize {
    let mut best = 0usize;
    let mut prev = vec![0usize; c.len() + 1];
    for &qc in q {
        let mut row = vec![0usize; c.len() + 1];
        for (j, &cc) in c.iter().enumerate() {
            if qc == cc {
                row[j + 1] = prev[j] + 1;
                best = best.max(row[j + 1]);
            }
        }
        prev = row;
    }
    best
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exact_beats_everything() {
        let m = match_name("main", "main").unwrap();
        assert_eq!(m.match_type, MatchType::Exact);
        assert_eq!(m.score, 1.0);
        assert_eq!(m.indices, vec![0, 1, 2, 3]);
    }

    #[test]
    fn exact_is_case_insensitive() {
        let m = match_name("HandleLogin", "handlelogin").unwrap();
        assert_eq!(m.match_type, MatchType::Exact);
    }

    #[test]
    fn prefix_scores_below_exact() {
        let m = match_name("hand", "handleLogin").unwrap();
        assert_eq!(m.match_type, MatchType::Prefix);
        assert_eq!(m.score, 0.9);
        assert_eq!(m.indices, vec![0, 1, 2, 3]);
    }

    #[test]
    fn contains_scores_point_seven() {
        let m = match_name("login", "handleLoginFlow").unwrap();
        assert_eq!(m.match_type, MatchType::Contains);
        assert_eq!(m.score, 0.7);
        assert_eq!(m.indices, (6..11).collect::<Vec<_>>());
    }

    #[test]
    fn initials_token_match() {
        let m = match_name("hl", "handleLogin").unwrap();
        assert_eq!(m.match_type, MatchType::Token);
        assert!(m.score <= 0.8 && m.score > 0.7, "score {}", m.score);
        assert_eq!(m.indices, vec![0, 6]);
    }

    #[test]
    fn snake_case_tokens() {
        let tokens = split_tokens("do_heavy_work");
        assert_eq!(
            tokens,
            vec![("do".to_string(), 0), ("heavy".to_string(), 3), ("work".to_string(), 9)]
        );
        let m = match_name("dhw", "do_heavy_work").unwrap();
        assert_eq!(m.match_type, MatchType::Token);
    }

    #[test]
    fn fuzzy_subsequence_scores_under_point_six() {
        let m = match_name("hndl", "handleLogin").unwrap();
        assert_eq!(m.match_type, MatchType::Fuzzy);
        assert!(m.score <= 0.6);
        assert!(m.score > SCORE_THRESHOLD);
        // Highlights land on h, n, d, l.
        assert_eq!(m.indices.len(), 4);
    }

    #[test]
    fn unrelated_names_fall_below_threshold() {
        assert!(match_name("hndl", "unrelated").is_none());
        assert!(match_name("zzz", "handleLogin").is_none());
    }

    #[test]
    fn handler_family_scores_equally_for_hndl() {
        // All four share the full subsequence and the "ndl" run, so the fuzzy
        // ladder gives them the same score; ordering falls to the caller's
        // name tie-break.
        let names = ["handleLogin", "handleLogout", "handler", "handlerOf"];
        let scores: Vec<f32> =
            names.iter().map(|n| match_name("hndl", n).unwrap().score).collect();
        for pair in scores.windows(2) {
            assert!((pair[0] - pair[1]).abs() < 1e-6, "scores {scores:?}");
        }
    }

    #[test]
    fn camel_split_handles_acronyms() {
        let tokens = split_tokens("parseHTTPResponse");
        let words: Vec<&str> = tokens.iter().map(|(t, _)| t.as_str()).collect();
        assert_eq!(words, vec!["parse", "http", "response"]);
    }
}
