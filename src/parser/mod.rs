// SPDX-License-Identifier: MIT OR Apache-2.0

//! Tree-sitter parsing used to find chunk boundaries in source code.

pub mod languages;
pub mod units;

pub use languages::{detect_language, language_for_path, LANGUAGES};
pub use units::{SyntaxError, SyntaxSplitter, SyntaxUnit};
