// SPDX-License-Identifier: MIT OR Apache-2.0

//! Query module - search, removal and introspection commands

pub mod search;
pub mod stats;
