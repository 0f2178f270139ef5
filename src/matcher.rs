//! Incremental token matching
//!
//! Lookahead acquisition and regex literals need an answer the high-level
//! regex API cannot give: "no match *yet*, bring more bytes" versus "no
//! match, ever". `TokenMatcher` steps a dense DFA byte by byte over the
//! available input and reports one of four outcomes: a unique longest
//! match, a tie between two candidates of equal length, a definitive
//! non-match, or a request for more input.
//!
//! ## Design
//!
//! All candidate patterns of one lookahead site are compiled into a single
//! anchored multi-pattern DFA (`MatchKind::All`, so every pattern reports
//! its matches, not just the leftmost-first winner). While the DFA can
//! still make progress at the end of the available bytes and the stream
//! can still grow, nothing is decided: a longer match may yet appear.
//! Once the DFA dies, can no longer leave its state, or the input is
//! final, the longest recorded match wins; two different patterns ending
//! at the same longest offset are a tie, which acquisition turns into an
//! ambiguity error. Zero-length matches are ignored, so a pattern like
//! `a*` can never produce an empty token.

use std::collections::HashMap;

use regex_automata::dfa::{dense, Automaton, StartKind};
use regex_automata::util::syntax;
use regex_automata::{Anchored, Input, MatchKind};

use crate::error::GrammarError;
use crate::grammar::TokenId;

/// Result of scanning the currently available bytes
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum ScanOutcome {
    /// A unique longest match of `len` bytes for `token`
    Match { token: TokenId, len: usize },
    /// Two or more candidates matched with the same longest length
    Tie { len: usize },
    /// No candidate can match, no matter what arrives later
    NoMatch {
        /// Whether the DFA was still alive when the input ran out; at
        /// end-of-data an alive non-match means "wanted more bytes"
        alive: bool,
    },
    /// Not decidable from the available bytes; only returned while the
    /// input can still grow
    NeedMore,
}

/// An anchored multi-pattern DFA over a fixed candidate set
pub(crate) struct TokenMatcher {
    dfa: dense::DFA<Vec<u32>>,
    /// Pattern index to token id
    tokens: Vec<TokenId>,
}

impl std::fmt::Debug for TokenMatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenMatcher")
            .field("tokens", &self.tokens)
            .finish()
    }
}

impl TokenMatcher {
    pub(crate) fn new(candidates: &[(TokenId, String)]) -> Result<Self, GrammarError> {
        let patterns: Vec<&str> = candidates.iter().map(|(_, p)| p.as_str()).collect();
        let tokens: Vec<TokenId> = candidates.iter().map(|(t, _)| *t).collect();
        let dfa = dense::Builder::new()
            .configure(
                dense::Config::new()
                    .match_kind(MatchKind::All)
                    .start_kind(StartKind::Anchored),
            )
            .syntax(syntax::Config::new().unicode(false).utf8(false))
            .build_many(&patterns)
            .map_err(|e| GrammarError::InvalidPattern {
                pattern: patterns.join("|"),
                message: e.to_string(),
            })?;
        Ok(TokenMatcher { dfa, tokens })
    }

    /// Whether every byte transition out of `sid` lands in the dead state
    fn quiescent(&self, sid: regex_automata::util::primitives::StateID) -> bool {
        (0u8..=255).all(|b| self.dfa.is_dead_state(self.dfa.next_state(sid, b)))
    }

    /// Scan `avail` from its start; `at_final` means no more bytes can come
    pub(crate) fn scan(&self, avail: &[u8], at_final: bool) -> ScanOutcome {
        let input = Input::new(avail).anchored(Anchored::Yes);
        let mut sid = match self.dfa.start_state_forward(&input) {
            Ok(sid) => sid,
            Err(_) => return ScanOutcome::NoMatch { alive: false },
        };

        // Longest match end recorded per pattern. Dense DFA match states
        // are delayed by one byte: a match flagged after consuming the
        // byte at index `at` ends at offset `at`.
        let mut ends: HashMap<usize, usize> = HashMap::new();
        let mut dead = false;
        for (at, &byte) in avail.iter().enumerate() {
            sid = self.dfa.next_state(sid, byte);
            if self.dfa.is_special_state(sid) {
                if self.dfa.is_dead_state(sid) {
                    dead = true;
                    break;
                }
                if self.dfa.is_match_state(sid) {
                    for i in 0..self.dfa.match_len(sid) {
                        let pid = self.dfa.match_pattern(sid, i).as_usize();
                        ends.insert(pid, at);
                    }
                }
            }
        }

        if !dead {
            if at_final {
                let eoi = self.dfa.next_eoi_state(sid);
                if self.dfa.is_match_state(eoi) {
                    for i in 0..self.dfa.match_len(eoi) {
                        let pid = self.dfa.match_pattern(eoi, i).as_usize();
                        ends.insert(pid, avail.len());
                    }
                }
            } else if self.quiescent(sid) {
                // Entry into the dead state lags the last match flag by
                // one transition. A state whose every outgoing byte leads
                // to the dead state cannot flag anything further, so the
                // recorded matches are final even though input may grow.
                dead = true;
            } else {
                return ScanOutcome::NeedMore;
            }
        }

        let best = ends
            .iter()
            .filter(|(_, &end)| end > 0)
            .max_by_key(|(_, &end)| end);
        match best {
            None => ScanOutcome::NoMatch { alive: !dead },
            Some((&pid, &end)) => {
                let tied = ends.iter().any(|(&p, &e)| p != pid && e == end);
                if tied {
                    ScanOutcome::Tie { len: end }
                } else {
                    ScanOutcome::Match {
                        token: self.tokens[pid],
                        len: end,
                    }
                }
            }
        }
    }
}
