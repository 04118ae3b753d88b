// SPDX-License-Identifier: MIT OR Apache-2.0

//! Indexer module - directory scanning and ingestion

pub mod index;
pub mod scanner;
