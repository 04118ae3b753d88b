// SPDX-License-Identifier: MIT OR Apache-2.0

//! Vector and keyword storage.

pub mod hnsw;
pub mod keyword;
pub mod storage;
pub mod vector;

pub use hnsw::Hnsw;
pub use keyword::{KeywordHit, KeywordIndex};
pub use storage::{content_hash, ContentEntry, VectorStorage};
pub use vector::{VectorHit, VectorStats, VectorStore};
