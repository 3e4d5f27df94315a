//! Shared utility functions for lead-forge.

pub mod json_extraction;

pub use json_extraction::{
    analyze_json_structure, extract_last_valid_json_object, find_matching_close,
    parse_json_from_response, JsonExtractionError, JsonStructureAnalysis,
};
