// SPDX-License-Identifier: MIT OR Apache-2.0

//! Token-budgeted chunker for embedding generation.
//!
//! Content is first cut into pieces that tile the whole text: paragraphs
//! for prose and captions, syntactic units for code (falling back to lines
//! when no grammar applies). Pieces above the token budget are split
//! recursively through nested syntax, then lines, then whitespace, then
//! characters. Pieces are then packed greedily into chunks, preferring to
//! break before headings and definitions, and each chunk after the first
//! repeats the tail of its predecessor as overlap.
//!
//! Every chunk satisfies `token_estimate <= floor(max_tokens * safety_margin)`
//! as measured by the estimator the chunker was built with. Concatenating
//! [`Chunk::fresh_text`] over all chunks reproduces the input exactly.

use std::ops::Range;
use std::sync::Arc;

use crate::embedding::tokens::{HeuristicEstimator, SharedEstimator, TokenEstimator};
use crate::errors::{RagError, Result};
use crate::parser::units::{SyntaxSplitter, SyntaxUnit};
use crate::types::{Chunk, ChunkId, Modality};

/// Default model token limit used when no model is known.
pub const DEFAULT_MAX_TOKENS: usize = 512;

/// Default fraction of `max_tokens` a chunk may fill.
pub const DEFAULT_SAFETY_MARGIN: f32 = 0.8;

/// Default overlap between consecutive chunks, as a fraction of the budget.
pub const DEFAULT_OVERLAP_RATIO: f32 = 0.15;

/// Configuration for the chunker.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ChunkConfig {
    /// Token limit of the model that will embed the chunks.
    pub max_tokens: usize,
    pub safety_margin: f32,
    pub overlap_ratio: f32,
}

impl Default for ChunkConfig {
    fn default() -> Self {
        Self {
            max_tokens: DEFAULT_MAX_TOKENS,
            safety_margin: DEFAULT_SAFETY_MARGIN,
            overlap_ratio: DEFAULT_OVERLAP_RATIO,
        }
    }
}

impl ChunkConfig {
    /// Creates a ChunkConfig for a model with the given token limit.
    pub fn new(max_tokens: usize) -> Result<Self> {
        let config = Self {
            max_tokens,
            ..Default::default()
        };
        config.validate()?;
        Ok(config)
    }

    /// Sets the safety margin.
    pub fn with_safety_margin(mut self, margin: f32) -> Self {
        self.safety_margin = margin;
        self
    }

    /// Sets the overlap ratio.
    pub fn with_overlap_ratio(mut self, ratio: f32) -> Self {
        self.overlap_ratio = ratio;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_tokens == 0 {
            return Err(RagError::invalid_config("max_tokens must be greater than 0"));
        }
        if !(self.safety_margin > 0.0 && self.safety_margin <= 1.0) {
            return Err(RagError::invalid_config(format!(
                "safety_margin ({}) must be in (0, 1]",
                self.safety_margin
            )));
        }
        if !(0.0..0.5).contains(&self.overlap_ratio) {
            return Err(RagError::invalid_config(format!(
                "overlap_ratio ({}) must be in [0, 0.5)",
                self.overlap_ratio
            )));
        }
        Ok(())
    }

    /// Largest token estimate a chunk may carry.
    pub fn budget(&self) -> usize {
        ((self.max_tokens as f32 * self.safety_margin).floor() as usize).max(1)
    }

    /// Largest token estimate of the overlapped prefix.
    pub fn overlap_tokens(&self) -> usize {
        (self.budget() as f32 * self.overlap_ratio).floor() as usize
    }
}

/// Splits content into chunks using one token estimator.
pub struct Chunker {
    config: ChunkConfig,
    estimator: SharedEstimator,
    splitter: SyntaxSplitter,
}

impl Chunker {
    pub fn new(config: ChunkConfig, estimator: SharedEstimator) -> Self {
        Self {
            config,
            estimator,
            splitter: SyntaxSplitter::new(),
        }
    }

    /// Chunker using the character heuristic for `modality`.
    pub fn heuristic(config: ChunkConfig, modality: Modality) -> Self {
        Self::new(config, Arc::new(HeuristicEstimator::for_modality(modality)))
    }

    pub fn config(&self) -> &ChunkConfig {
        &self.config
    }

    pub fn estimator(&self) -> &dyn TokenEstimator {
        self.estimator.as_ref()
    }

    /// Start chunking `content`.
    ///
    /// Fails with `UnsupportedContent` when the bytes are not UTF-8 text.
    /// The returned iterator is consumed once; blank content yields nothing.
    pub fn chunk<'a>(
        &'a self,
        content_id: &str,
        modality: Modality,
        content: &'a [u8],
        language: Option<&str>,
    ) -> Result<Chunks<'a>> {
        let text = std::str::from_utf8(content).map_err(|e| {
            RagError::unsupported(content_id, format!("not valid UTF-8: {}", e))
        })?;
        if text.contains('\0') {
            return Err(RagError::unsupported(content_id, "binary content (NUL byte)"));
        }

        let pieces = if text.trim().is_empty() {
            Vec::new()
        } else {
            self.pieces(content_id, text, modality, language)
        };

        let mut line_starts = vec![0];
        line_starts.extend(text.match_indices('\n').map(|(idx, _)| idx + 1));

        Ok(Chunks {
            chunker: self,
            text,
            content_id: content_id.to_string(),
            modality,
            language: language.map(str::to_string),
            pieces,
            line_starts,
            next_piece: 0,
            ordinal: 0,
            prev_fresh_start: None,
        })
    }

    fn estimate(&self, text: &str) -> usize {
        self.estimator.estimate(text)
    }

    fn pieces(
        &self,
        content_id: &str,
        text: &str,
        modality: Modality,
        language: Option<&str>,
    ) -> Vec<Piece> {
        let mut out = Vec::new();
        match modality {
            Modality::Code => {
                let units = language.map(|lang| self.splitter.split(text, lang));
                match units {
                    Some(Ok(units)) if !units.is_empty() => {
                        for unit in &units {
                            self.push_unit(text, unit, unit.is_definition, &mut out);
                        }
                    }
                    other => {
                        if let Some(Err(err)) = other {
                            tracing::debug!(
                                "{}: syntax boundaries unavailable ({}), using lines",
                                content_id,
                                err
                            );
                        }
                        self.push_span(text, 0..text.len(), false, &mut out);
                    }
                }
            }
            Modality::Prose | Modality::Caption | Modality::ImageCaption => {
                for range in paragraphs(text) {
                    let heading = is_heading(&text[range.clone()]);
                    self.push_span(text, range, heading, &mut out);
                }
            }
        }
        out
    }

    fn push_unit(&self, text: &str, unit: &SyntaxUnit, section_start: bool, out: &mut Vec<Piece>) {
        let range = unit.range.clone();
        if self.estimate(&text[range.clone()]) <= self.config.budget() {
            out.push(Piece::new(range, section_start));
        } else if !unit.children.is_empty() {
            for (idx, child) in unit.children.iter().enumerate() {
                let starts = if idx == 0 {
                    section_start
                } else {
                    child.is_definition
                };
                self.push_unit(text, child, starts, out);
            }
        } else {
            self.push_span(text, range, section_start, out);
        }
    }

    /// Split a span with no syntax information: lines, then whitespace, then characters.
    fn push_span(&self, text: &str, range: Range<usize>, section_start: bool, out: &mut Vec<Piece>) {
        if range.is_empty() {
            return;
        }
        if self.estimate(&text[range.clone()]) <= self.config.budget() {
            out.push(Piece::new(range, section_start));
            return;
        }

        let lines = lines_in(text, range.clone());
        if lines.len() > 1 {
            for (idx, line) in lines.into_iter().enumerate() {
                self.push_span(text, line, section_start && idx == 0, out);
            }
            return;
        }

        let split = whitespace_split(text, range.clone()).or_else(|| char_split(text, range.clone()));
        match split {
            Some(mid) => {
                self.push_span(text, range.start..mid, section_start, out);
                self.push_span(text, mid..range.end, false, out);
            }
            // a single character above the budget cannot be split further
            None => out.push(Piece::new(range, section_start)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Piece {
    start: usize,
    end: usize,
    section_start: bool,
}

impl Piece {
    fn new(range: Range<usize>, section_start: bool) -> Self {
        Self {
            start: range.start,
            end: range.end,
            section_start,
        }
    }
}

/// Lazy sequence of chunks for one piece of content.
pub struct Chunks<'a> {
    chunker: &'a Chunker,
    text: &'a str,
    content_id: String,
    modality: Modality,
    language: Option<String>,
    pieces: Vec<Piece>,
    line_starts: Vec<usize>,
    next_piece: usize,
    ordinal: usize,
    prev_fresh_start: Option<usize>,
}

impl Chunks<'_> {
    fn estimate(&self, range: Range<usize>) -> usize {
        self.chunker.estimate(&self.text[range])
    }

    /// 1-based line containing byte `offset`.
    fn line_of(&self, offset: usize) -> usize {
        self.line_starts.partition_point(|&start| start <= offset)
    }

    /// Earliest word boundary in the previous chunk such that the repeated
    /// text fits the overlap allowance and the whole chunk fits the budget.
    fn overlap_start(&self, prev_fresh: usize, start: usize, end: usize) -> usize {
        let config = self.chunker.config;
        let mut candidates = vec![prev_fresh];
        let mut prev_ws = false;
        for (idx, ch) in self.text[prev_fresh..start].char_indices() {
            if idx > 0 && prev_ws && !ch.is_whitespace() {
                candidates.push(prev_fresh + idx);
            }
            prev_ws = ch.is_whitespace();
        }
        candidates.push(start);

        let fits = |s: usize| {
            self.estimate(s..start) <= config.overlap_tokens()
                && self.estimate(s..end) <= config.budget()
        };
        let idx = candidates.partition_point(|&s| !fits(s));
        candidates[idx.min(candidates.len() - 1)]
    }
}

impl Iterator for Chunks<'_> {
    type Item = Chunk;

    fn next(&mut self) -> Option<Chunk> {
        let first = *self.pieces.get(self.next_piece)?;
        let budget = self.chunker.config.budget();

        let start = first.start;
        let mut end = first.end;
        let mut next = self.next_piece + 1;
        while let Some(piece) = self.pieces.get(next) {
            if piece.section_start && self.estimate(start..end) * 2 >= budget {
                break;
            }
            if self.estimate(start..piece.end) > budget {
                break;
            }
            end = piece.end;
            next += 1;
        }
        self.next_piece = next;

        let chunk_start = match self.prev_fresh_start {
            Some(prev) if self.chunker.config.overlap_tokens() > 0 => {
                self.overlap_start(prev, start, end)
            }
            _ => start,
        };
        self.prev_fresh_start = Some(start);

        let text = &self.text[chunk_start..end];
        let chunk = Chunk {
            id: ChunkId::new(&self.content_id, self.ordinal),
            content_id: self.content_id.clone(),
            ordinal: self.ordinal,
            text: text.to_string(),
            start_offset: chunk_start,
            end_offset: end,
            overlap_len: start - chunk_start,
            start_line: self.line_of(chunk_start),
            end_line: self.line_of(end.saturating_sub(1).max(chunk_start)),
            modality: self.modality,
            token_estimate: self.chunker.estimate(text),
            language: self.language.clone(),
        };
        self.ordinal += 1;
        Some(chunk)
    }
}

/// Paragraph ranges tiling `text`. A paragraph starts at a non-blank line
/// that follows a blank line or that is a markdown heading; blank lines
/// belong to the paragraph before them.
fn paragraphs(text: &str) -> Vec<Range<usize>> {
    let mut starts = vec![0];
    let mut offset = 0;
    let mut prev_blank = false;
    for line in text.split_inclusive('\n') {
        let blank = line.trim().is_empty();
        let heading = is_heading(line);
        if offset > 0 && !blank && (prev_blank || heading) {
            starts.push(offset);
        }
        prev_blank = blank;
        offset += line.len();
    }
    starts.dedup();
    starts
        .iter()
        .enumerate()
        .map(|(idx, &start)| start..starts.get(idx + 1).copied().unwrap_or(text.len()))
        .collect()
}

/// Markdown ATX heading: one to six `#` followed by whitespace.
fn is_heading(line: &str) -> bool {
    let hashes = line.bytes().take_while(|&b| b == b'#').count();
    (1..=6).contains(&hashes)
        && line[hashes..]
            .chars()
            .next()
            .is_some_and(|c| c.is_whitespace())
}

/// Line ranges (each including its newline) tiling `range`.
fn lines_in(text: &str, range: Range<usize>) -> Vec<Range<usize>> {
    let mut lines = Vec::new();
    let mut start = range.start;
    for line in text[range.clone()].split_inclusive('\n') {
        lines.push(start..start + line.len());
        start += line.len();
    }
    lines
}

/// Word boundary closest to the middle of `range`.
fn whitespace_split(text: &str, range: Range<usize>) -> Option<usize> {
    let mid = range.start + (range.end - range.start) / 2;
    let mut best: Option<usize> = None;
    let mut prev_ws = false;
    for (idx, ch) in text[range.clone()].char_indices() {
        if idx > 0 && prev_ws && !ch.is_whitespace() {
            let pos = range.start + idx;
            if best.map_or(true, |b| pos.abs_diff(mid) < b.abs_diff(mid)) {
                best = Some(pos);
            }
        }
        prev_ws = ch.is_whitespace();
    }
    best
}

/// Character boundary near the middle of `range`, if the range has two or more characters.
fn char_split(text: &str, range: Range<usize>) -> Option<usize> {
    let mut mid = range.start + (range.end - range.start) / 2;
    while mid > range.start && !text.is_char_boundary(mid) {
        mid -= 1;
    }
    if mid == range.start {
        mid = range.start + text[range.clone()].chars().next()?.len_utf8();
    }
    (mid < range.end).then_some(mid)
}
