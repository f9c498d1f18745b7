//! Aho–Corasick pattern store.
//!
//! Surface forms are inserted byte-wise into a trie. `build` blocks the
//! requested forms and then links every node to its longest proper suffix
//! that is also a trie node (failure link) and to the nearest suffix that
//! ends a live surface form (dictionary link). Scanning follows goto/failure
//! transitions once per input byte and walks dictionary links only when they
//! lead to a match, so a scan costs O(text length + matches).
//!
//! Patterns are valid UTF-8, and UTF-8 is self-synchronizing, so every
//! reported span starts and ends on character boundaries of the scanned text.

use std::collections::{BTreeSet, HashSet, VecDeque};

use super::types::{Binding, MatchSpan};

const ROOT: u32 = 0;
const NONE: u32 = u32::MAX;

#[derive(Debug, Clone)]
struct Node {
    // Sorted by byte
    edges: Vec<(u8, u32)>,
    fail: u32,
    // Index into the pattern table, or NONE
    output: u32,
    dict: u32,
    depth: u32,
}

impl Node {
    fn new(depth: u32) -> Self {
        Node {
            edges: Vec::new(),
            fail: ROOT,
            output: NONE,
            dict: NONE,
            depth,
        }
    }

    fn next(&self, byte: u8) -> Option<u32> {
        self.edges
            .binary_search_by_key(&byte, |(b, _)| *b)
            .ok()
            .map(|idx| self.edges[idx].1)
    }
}

/// Mutable phase of a pattern store: accepts `insert` and `block`.
#[derive(Debug, Clone)]
pub struct PatternStoreBuilder {
    nodes: Vec<Node>,
    bindings: Vec<BTreeSet<Binding>>,
    blocked: HashSet<String>,
}

impl Default for PatternStoreBuilder {
    fn default() -> Self {
        PatternStoreBuilder {
            nodes: vec![Node::new(0)],
            bindings: Vec::new(),
            blocked: HashSet::new(),
        }
    }
}

impl PatternStoreBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `(entity_type, identifier)` for `surface_form`.
    ///
    /// Re-inserting a surface form extends its binding set; inserting the same
    /// pair twice is a no-op. Returns `false` for the empty string, which is
    /// never matched.
    pub fn insert(&mut self, surface_form: &str, entity_type: i32, identifier: &str) -> bool {
        if surface_form.is_empty() {
            return false;
        }

        let mut state = ROOT;
        for &byte in surface_form.as_bytes() {
            state = match self.nodes[state as usize].next(byte) {
                Some(next) => next,
                None => self.add_edge(state, byte),
            };
        }

        let node = &mut self.nodes[state as usize];
        if node.output == NONE {
            node.output = self.bindings.len() as u32;
            self.bindings.push(BTreeSet::new());
        }
        self.bindings[node.output as usize].insert(Binding::new(entity_type, identifier));
        true
    }

    /// Excludes `surface_form` from every scan of the built store, whether it
    /// was inserted before or after this call.
    pub fn block(&mut self, surface_form: &str) {
        self.blocked.insert(surface_form.to_string());
    }

    pub fn is_blocked(&self, surface_form: &str) -> bool {
        self.blocked.contains(surface_form)
    }

    /// Number of distinct surface forms inserted so far.
    pub fn surface_form_count(&self) -> usize {
        self.bindings.len()
    }

    fn add_edge(&mut self, from: u32, byte: u8) -> u32 {
        let id = self.nodes.len() as u32;
        let depth = self.nodes[from as usize].depth + 1;
        self.nodes.push(Node::new(depth));

        let edges = &mut self.nodes[from as usize].edges;
        let pos = edges.partition_point(|(b, _)| *b < byte);
        edges.insert(pos, (byte, id));
        id
    }

    fn find(&self, surface_form: &str) -> Option<u32> {
        let mut state = ROOT;
        for &byte in surface_form.as_bytes() {
            state = self.nodes[state as usize].next(byte)?;
        }
        Some(state)
    }

    /// Applies the blocks and computes failure/dictionary links.
    pub fn build(mut self) -> PatternStore {
        let mut blocked_count = 0;
        let blocked: Vec<String> = self.blocked.drain().collect();
        for surface_form in &blocked {
            if let Some(state) = self.find(surface_form) {
                let node = &mut self.nodes[state as usize];
                if node.output != NONE {
                    node.output = NONE;
                    blocked_count += 1;
                }
            }
        }

        let mut queue = VecDeque::new();
        for &(_, child) in &self.nodes[ROOT as usize].edges {
            queue.push_back(child);
        }

        while let Some(state) = queue.pop_front() {
            let edges = self.nodes[state as usize].edges.clone();
            for (byte, child) in edges {
                let mut fallback = self.nodes[state as usize].fail;
                let fail = loop {
                    if let Some(next) = self.nodes[fallback as usize].next(byte) {
                        break next;
                    }
                    if fallback == ROOT {
                        break ROOT;
                    }
                    fallback = self.nodes[fallback as usize].fail;
                };

                let target = &self.nodes[fail as usize];
                let dict = if target.output != NONE {
                    fail
                } else {
                    target.dict
                };

                let node = &mut self.nodes[child as usize];
                node.fail = fail;
                node.dict = dict;
                queue.push_back(child);
            }
        }

        let live = self
            .nodes
            .iter()
            .filter(|node| node.output != NONE)
            .count();

        PatternStore {
            nodes: self.nodes,
            bindings: self
                .bindings
                .into_iter()
                .map(|set| set.into_iter().collect())
                .collect(),
            surface_form_count: live,
            blocked_count,
        }
    }
}

/// Immutable, scan-only pattern store.
#[derive(Debug, Clone)]
pub struct PatternStore {
    nodes: Vec<Node>,
    bindings: Vec<Vec<Binding>>,
    surface_form_count: usize,
    blocked_count: usize,
}

impl PatternStore {
    pub fn builder() -> PatternStoreBuilder {
        PatternStoreBuilder::new()
    }

    /// Matchable (inserted and not blocked) surface forms.
    pub fn surface_form_count(&self) -> usize {
        self.surface_form_count
    }

    /// Inserted surface forms removed by a block.
    pub fn blocked_count(&self) -> usize {
        self.blocked_count
    }

    /// Every occurrence of every live surface form in `text`, ordered by
    /// `(start, end)`. Case-sensitive exact substring matching.
    pub fn scan(&self, text: &str) -> Vec<MatchSpan> {
        let mut spans = Vec::new();
        let mut state = ROOT;

        for (pos, &byte) in text.as_bytes().iter().enumerate() {
            state = self.step(state, byte);

            let node = &self.nodes[state as usize];
            let mut hit = if node.output != NONE { state } else { node.dict };
            while hit != NONE {
                let found = &self.nodes[hit as usize];
                spans.push(MatchSpan {
                    start: pos + 1 - found.depth as usize,
                    end: pos,
                    bindings: self.bindings[found.output as usize].clone(),
                });
                hit = found.dict;
            }
        }

        order_by_start(spans, text.len())
    }

    fn step(&self, mut state: u32, byte: u8) -> u32 {
        loop {
            if let Some(next) = self.nodes[state as usize].next(byte) {
                return next;
            }
            if state == ROOT {
                return ROOT;
            }
            state = self.nodes[state as usize].fail;
        }
    }
}

/// Reorders spans emitted in `end` order into `(start, end)` order with one
/// stable bucket pass over the start offsets.
fn order_by_start(spans: Vec<MatchSpan>, text_len: usize) -> Vec<MatchSpan> {
    if spans.len() < 2 {
        return spans;
    }

    let mut offsets = vec![0usize; text_len + 1];
    for span in &spans {
        offsets[span.start + 1] += 1;
    }
    for i in 1..offsets.len() {
        offsets[i] += offsets[i - 1];
    }

    let mut ordered: Vec<Option<MatchSpan>> = vec![None; spans.len()];
    for span in spans {
        let slot = &mut offsets[span.start];
        ordered[*slot] = Some(span);
        *slot += 1;
    }
    ordered.into_iter().flatten().collect()
}
