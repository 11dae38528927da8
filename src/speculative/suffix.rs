//! Suffix-automaton draft proposer.
//!
//! Maintains a per-request suffix automaton over the token history,
//! extended incrementally as tokens are generated. Proposals come from
//! the longest suffix of the recent context that also occurred earlier in
//! the sequence: the tokens that followed the earliest such occurrence
//! are proposed as the draft.
//!
//! Compared to the brute-force n-gram scan this answers repeated-pattern
//! queries against long histories without rescanning them; the automaton
//! grows by amortized O(1) states per appended token. Lives entirely on
//! CPU, zero model involvement.

use std::collections::HashMap;

use crate::core::request::{Request, RequestId};
use crate::error::Result;

use super::proposer::{DraftProposal, DraftProposer};

/// Configuration for the suffix proposer.
#[derive(Debug, Clone)]
pub struct SuffixConfig {
    /// Minimum suffix match length for a valid proposal.
    pub min_match_length: usize,
    /// Longest suffix of the context tried for matching.
    pub context_window: usize,
}

impl Default for SuffixConfig {
    fn default() -> Self {
        Self {
            min_match_length: 3,
            context_window: 32,
        }
    }
}

/// One automaton state: transitions, suffix link, and the earliest end
/// position of any occurrence of the state's strings.
#[derive(Debug, Clone, Default)]
struct SamState {
    len: usize,
    link: Option<usize>,
    next: HashMap<u32, usize>,
    first_end: usize,
}

/// Suffix automaton over a token sequence, extended one token at a time.
#[derive(Debug)]
struct SuffixAutomaton {
    states: Vec<SamState>,
    last: usize,
    /// Number of tokens consumed so far.
    size: usize,
}

impl SuffixAutomaton {
    fn new() -> Self {
        Self {
            states: vec![SamState::default()],
            last: 0,
            size: 0,
        }
    }

    /// Append one token (standard online construction).
    fn extend(&mut self, token: u32) {
        let position = self.size;
        self.size += 1;

        let cur = self.states.len();
        self.states.push(SamState {
            len: self.states[self.last].len + 1,
            link: None,
            next: HashMap::new(),
            first_end: position,
        });

        let mut p = Some(self.last);
        while let Some(pi) = p {
            if self.states[pi].next.contains_key(&token) {
                break;
            }
            self.states[pi].next.insert(token, cur);
            p = self.states[pi].link;
        }

        match p {
            None => self.states[cur].link = Some(0),
            Some(pi) => {
                let q = self.states[pi].next[&token];
                if self.states[pi].len + 1 == self.states[q].len {
                    self.states[cur].link = Some(q);
                } else {
                    let clone = self.states.len();
                    let cloned = SamState {
                        len: self.states[pi].len + 1,
                        link: self.states[q].link,
                        next: self.states[q].next.clone(),
                        first_end: self.states[q].first_end,
                    };
                    self.states.push(cloned);

                    let mut w = Some(pi);
                    while let Some(wi) = w {
                        if self.states[wi].next.get(&token) != Some(&q) {
                            break;
                        }
                        self.states[wi].next.insert(token, clone);
                        w = self.states[wi].link;
                    }
                    self.states[q].link = Some(clone);
                    self.states[cur].link = Some(clone);
                }
            }
        }
        self.last = cur;
    }

    /// Walk `needle` from the root; Some(state) if it is a substring.
    fn walk(&self, needle: &[u32]) -> Option<usize> {
        let mut state = 0usize;
        for token in needle {
            state = *self.states[state].next.get(token)?;
        }
        Some(state)
    }

    /// Earliest end position (index of the last token) of any occurrence
    /// of the string that reaches `state`.
    fn first_end(&self, state: usize) -> usize {
        self.states[state].first_end
    }
}

/// Draft proposer backed by per-request suffix automata.
#[derive(Debug, Default)]
pub struct SuffixProposer {
    config: SuffixConfig,
    automata: HashMap<RequestId, SuffixAutomaton>,
}

impl SuffixProposer {
    pub fn new(config: SuffixConfig) -> Self {
        Self {
            config,
            automata: HashMap::new(),
        }
    }

    /// Extend the request's automaton to cover its full history.
    fn sync(&mut self, request_id: RequestId, tokens: &[u32]) -> &SuffixAutomaton {
        let automaton = self
            .automata
            .entry(request_id)
            .or_insert_with(SuffixAutomaton::new);
        for &token in &tokens[automaton.size..] {
            automaton.extend(token);
        }
        automaton
    }
}

impl DraftProposer for SuffixProposer {
    fn propose(&mut self, req: &Request, max_tokens: usize) -> Result<DraftProposal> {
        let tokens = req.all_token_ids();
        let total = tokens.len();
        let min_len = self.config.min_match_length;
        let window = self.config.context_window;
        let automaton = self.sync(req.request_id(), &tokens);

        if total < min_len + 1 || max_tokens == 0 {
            return Ok(DraftProposal::empty(req.request_id()));
        }

        // Longest suffix first; a proper earlier occurrence needs the
        // match to end before the final position.
        let longest_try = window.min(total - 1);
        let mut continuation: &[u32] = &[];
        for match_len in (min_len..=longest_try).rev() {
            let suffix = &tokens[total - match_len..];
            let Some(state) = automaton.walk(suffix) else {
                continue;
            };
            let end = automaton.first_end(state);
            if end < total - 1 {
                let start = end + 1;
                let take = max_tokens.min(total - start);
                continuation = &tokens[start..start + take];
                break;
            }
        }

        let scores = vec![1.0; continuation.len()];
        Ok(DraftProposal {
            request_id: req.request_id(),
            tokens: continuation.to_vec(),
            scores,
            probs: None,
        })
    }

    fn on_request_finished(&mut self, request_id: RequestId) {
        self.automata.remove(&request_id);
    }

    fn name(&self) -> &'static str {
        "suffix"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SamplingConfig;

    fn build(tokens: &[u32]) -> SuffixAutomaton {
        let mut automaton = SuffixAutomaton::new();
        for &t in tokens {
            automaton.extend(t);
        }
        automaton
    }

    #[test]
    fn walk_finds_substrings() {
        let automaton = build(&[1, 2, 3, 1, 2, 4]);
        assert!(automaton.walk(&[1, 2]).is_some());
        assert!(automaton.walk(&[2, 3, 1]).is_some());
        assert!(automaton.walk(&[3, 2]).is_none());
        assert!(automaton.walk(&[5]).is_none());
    }

    #[test]
    fn first_end_is_earliest_occurrence() {
        let automaton = build(&[7, 8, 9, 7, 8]);
        // [7, 8] first occurs ending at index 1.
        let state = automaton.walk(&[7, 8]).unwrap();
        assert_eq!(automaton.first_end(state), 1);
        // [8, 9] occurs once, ending at index 2.
        let state = automaton.walk(&[8, 9]).unwrap();
        assert_eq!(automaton.first_end(state), 2);
    }

    #[test]
    fn proposes_continuation_of_repeated_pattern() {
        let mut proposer = SuffixProposer::new(SuffixConfig {
            min_match_length: 3,
            context_window: 16,
        });
        // [1, 2, 3] repeats; after its first occurrence came 100.
        let mut req = Request::new(1, vec![1, 2, 3, 100, 200], SamplingConfig::default());
        for t in [1, 2, 3] {
            req.append_token(t);
        }

        let proposal = proposer.propose(&req, 2).unwrap();
        assert_eq!(proposal.tokens, vec![100, 200]);
        assert!(proposal.probs.is_none());
    }

    #[test]
    fn degrades_to_empty_without_repeats() {
        let mut proposer = SuffixProposer::default();
        let req = Request::new(1, vec![1, 2, 3, 4, 5, 6], SamplingConfig::default());
        let proposal = proposer.propose(&req, 4).unwrap();
        assert!(proposal.is_empty());
    }

    #[test]
    fn incremental_extension_matches_batch_build() {
        let tokens = [4u32, 2, 4, 2, 4, 7, 4, 2];
        let batch = build(&tokens);

        let mut incremental = SuffixAutomaton::new();
        for &t in &tokens[..3] {
            incremental.extend(t);
        }
        for &t in &tokens[3..] {
            incremental.extend(t);
        }

        for needle in [&[4u32, 2][..], &[2, 4][..], &[4, 7, 4][..], &[7, 2][..]] {
            assert_eq!(
                batch.walk(needle).is_some(),
                incremental.walk(needle).is_some()
            );
        }
    }

    #[test]
    fn finished_request_state_is_dropped() {
        let mut proposer = SuffixProposer::default();
        let mut req = Request::new(9, vec![1, 2, 1, 2, 1], SamplingConfig::default());
        req.append_token(2);
        let _ = proposer.propose(&req, 2).unwrap();
        assert!(proposer.automata.contains_key(&9));

        proposer.on_request_finished(9);
        assert!(proposer.automata.contains_key(&9) == false);
    }
}
