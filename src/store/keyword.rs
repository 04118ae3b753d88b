// SPDX-License-Identifier: MIT OR Apache-2.0

//! BM25 keyword index over chunk text, built on tantivy.
//!
//! All modalities share one index; each document carries its modality as an
//! untokenized term that queries filter on.

use std::collections::BTreeSet;
use std::path::Path;

use parking_lot::Mutex;
use tantivy::{
    collector::TopDocs,
    doc,
    query::{BooleanQuery, ConstScoreQuery, Occur, Query, TermQuery},
    schema::{
        Field, IndexRecordOption, Schema, TextFieldIndexing, TextOptions, Value, STORED, STRING,
    },
    tokenizer::{
        LowerCaser, RemoveLongFilter, SimpleTokenizer, StopWordFilter, TextAnalyzer, TokenStream,
    },
    Index, IndexReader, IndexWriter, ReloadPolicy, TantivyDocument, Term,
};
use tracing::debug;

use crate::errors::Result;
use crate::types::{Chunk, ChunkId, Modality};

const ANALYZER: &str = "ragdex";
const WRITER_HEAP_BYTES: usize = 20_000_000;
const MAX_TOKEN_LEN: usize = 40;

const STOP_WORDS: &[&str] = &[
    "the", "a", "an", "and", "or", "but", "in", "on", "at", "to", "for", "of", "with", "by", "is",
    "are", "was", "were", "be", "been", "have", "has", "had", "do", "does", "did", "will",
    "would", "could", "should", "this", "that", "these", "those", "i", "you", "he", "she", "it",
    "we", "they", "me", "him", "her", "us", "them",
];

/// A keyword match, scored by BM25.
#[derive(Debug, Clone, PartialEq)]
pub struct KeywordHit {
    pub chunk_id: ChunkId,
    pub content_id: String,
    pub score: f32,
    pub text: String,
}

struct Fields {
    chunk_id: Field,
    content_id: Field,
    modality: Field,
    text: Field,
}

impl Fields {
    fn schema() -> (Schema, Self) {
        let mut builder = Schema::builder();
        let text_options = TextOptions::default()
            .set_indexing_options(
                TextFieldIndexing::default()
                    .set_tokenizer(ANALYZER)
                    .set_index_option(IndexRecordOption::WithFreqsAndPositions),
            )
            .set_stored();

        let fields = Fields {
            chunk_id: builder.add_text_field("chunk_id", STRING | STORED),
            content_id: builder.add_text_field("content_id", STRING | STORED),
            modality: builder.add_text_field("modality", STRING),
            text: builder.add_text_field("text", text_options),
        };
        (builder.build(), fields)
    }
}

fn analyzer() -> TextAnalyzer {
    TextAnalyzer::builder(SimpleTokenizer::default())
        .filter(RemoveLongFilter::limit(MAX_TOKEN_LEN))
        .filter(LowerCaser)
        .filter(StopWordFilter::remove(STOP_WORDS.iter().map(|w| w.to_string())))
        .build()
}

pub struct KeywordIndex {
    fields: Fields,
    analyzer: TextAnalyzer,
    writer: Mutex<IndexWriter>,
    reader: IndexReader,
}

impl KeywordIndex {
    /// Opens the index stored in `dir`, creating it if absent.
    pub fn open<P: AsRef<Path>>(dir: P) -> Result<Self> {
        let dir = dir.as_ref();
        std::fs::create_dir_all(dir)?;
        let (schema, fields) = Fields::schema();
        let index = if dir.join("meta.json").exists() {
            Index::open_in_dir(dir)?
        } else {
            Index::create_in_dir(dir, schema)?
        };
        Self::with_index(index, fields)
    }

    pub fn in_memory() -> Result<Self> {
        let (schema, fields) = Fields::schema();
        Self::with_index(Index::create_in_ram(schema), fields)
    }

    fn with_index(index: Index, fields: Fields) -> Result<Self> {
        let analyzer = analyzer();
        index.tokenizers().register(ANALYZER, analyzer.clone());
        let writer = index.writer_with_num_threads(1, WRITER_HEAP_BYTES)?;
        let reader = index
            .reader_builder()
            .reload_policy(ReloadPolicy::Manual)
            .try_into()?;
        Ok(Self {
            fields,
            analyzer,
            writer: Mutex::new(writer),
            reader,
        })
    }

    /// Adds or replaces the given chunks and commits.
    pub fn index_many(&self, chunks: &[Chunk]) -> Result<usize> {
        if chunks.is_empty() {
            return Ok(0);
        }
        let mut writer = self.writer.lock();
        self.add_chunks(&mut writer, chunks)?;
        writer.commit()?;
        self.reader.reload()?;
        debug!("keyword index: committed {} chunks", chunks.len());
        Ok(chunks.len())
    }

    /// Drops every chunk owned by `content_id` and adds `chunks` in the same
    /// commit, so searchers see the old version until the new one is live.
    pub fn replace_content(&self, content_id: &str, chunks: &[Chunk]) -> Result<usize> {
        let mut writer = self.writer.lock();
        writer.delete_term(Term::from_field_text(self.fields.content_id, content_id));
        self.add_chunks(&mut writer, chunks)?;
        writer.commit()?;
        self.reader.reload()?;
        debug!("keyword index: replaced {} with {} chunks", content_id, chunks.len());
        Ok(chunks.len())
    }

    fn add_chunks(&self, writer: &mut IndexWriter, chunks: &[Chunk]) -> Result<()> {
        for chunk in chunks {
            writer.delete_term(Term::from_field_text(self.fields.chunk_id, chunk.id.as_str()));
            writer.add_document(doc!(
                self.fields.chunk_id => chunk.id.as_str(),
                self.fields.content_id => chunk.content_id.as_str(),
                self.fields.modality => chunk.modality.as_str(),
                self.fields.text => chunk.text.as_str(),
            ))?;
        }
        Ok(())
    }

    /// Deletes every chunk owned by `content_id`.
    pub fn remove_content(&self, content_id: &str) -> Result<()> {
        let mut writer = self.writer.lock();
        writer.delete_term(Term::from_field_text(self.fields.content_id, content_id));
        writer.commit()?;
        self.reader.reload()?;
        Ok(())
    }

    /// Normalized, deduplicated query terms in first-seen order.
    pub fn extract_terms(&self, query: &str) -> Vec<String> {
        let mut analyzer = self.analyzer.clone();
        let mut stream = analyzer.token_stream(query);
        let mut seen = BTreeSet::new();
        let mut terms = Vec::new();
        stream.process(&mut |token| {
            if seen.insert(token.text.clone()) {
                terms.push(token.text.clone());
            }
        });
        terms
    }

    /// Top `k` chunks of `modality` matching any of `terms`, best first.
    /// Ties are broken by chunk id.
    pub fn search(&self, terms: &[String], modality: Modality, k: usize) -> Result<Vec<KeywordHit>> {
        if terms.is_empty() || k == 0 {
            return Ok(Vec::new());
        }

        let any_term: Vec<(Occur, Box<dyn Query>)> = terms
            .iter()
            .map(|t| {
                let query: Box<dyn Query> = Box::new(TermQuery::new(
                    Term::from_field_text(self.fields.text, t),
                    IndexRecordOption::WithFreqs,
                ));
                (Occur::Should, query)
            })
            .collect();
        let in_modality = TermQuery::new(
            Term::from_field_text(self.fields.modality, modality.as_str()),
            IndexRecordOption::Basic,
        );
        let filter: Box<dyn Query> = Box::new(ConstScoreQuery::new(Box::new(in_modality), 0.0));
        let matches: Box<dyn Query> = Box::new(BooleanQuery::new(any_term));
        let query = BooleanQuery::new(vec![(Occur::Must, filter), (Occur::Must, matches)]);

        let searcher = self.reader.searcher();
        let top_docs = searcher.search(&query, &TopDocs::with_limit(k))?;

        let mut hits = Vec::with_capacity(top_docs.len());
        for (score, address) in top_docs {
            let doc: TantivyDocument = searcher.doc(address)?;
            let field = |f: Field| {
                doc.get_first(f)
                    .and_then(|v| v.as_str())
                    .unwrap_or_default()
                    .to_string()
            };
            hits.push(KeywordHit {
                chunk_id: ChunkId::from(field(self.fields.chunk_id)),
                content_id: field(self.fields.content_id),
                score,
                text: field(self.fields.text),
            });
        }
        hits.sort_by(|a, b| {
            b.score
                .total_cmp(&a.score)
                .then_with(|| a.chunk_id.cmp(&b.chunk_id))
        });
        Ok(hits)
    }

    pub fn doc_count(&self) -> u64 {
        self.reader.searcher().num_docs()
    }

    pub fn modality_count(&self, modality: Modality) -> Result<usize> {
        let query = TermQuery::new(
            Term::from_field_text(self.fields.modality, modality.as_str()),
            IndexRecordOption::Basic,
        );
        Ok(self
            .reader
            .searcher()
            .search(&query, &tantivy::collector::Count)?)
    }
}
