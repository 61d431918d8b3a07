//! Shared utility functions for outreach-forge.
//!
//! This module provides common utilities used across multiple modules,
//! including JSON extraction from generation service responses.

pub mod json_extraction;

pub use json_extraction::{
    extract_from_code_block, outermost_object_slice, parse_json_object, strip_markdown_fences,
    JsonExtractionError,
};
