//! Module and dataset name validation
//!
//! Names become file names inside the bundle container
//! (`module_states/<name>.json`, `results/<name>.json`), so they are held
//! to a portable, traversal-free alphabet.

use regex::Regex;
use std::sync::OnceLock;

use crate::error::{ReproError, Result};

const MAX_NAME_LEN: usize = 128;

fn name_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^[A-Za-z0-9][A-Za-z0-9_.\-]*$").expect("static name pattern compiles")
    })
}

/// Check that `name` is usable as a module or dataset name
pub fn validate_name(name: &str) -> Result<()> {
    let reason = if name.is_empty() {
        Some("name is empty".to_string())
    } else if name.len() > MAX_NAME_LEN {
        Some(format!("name exceeds {} bytes", MAX_NAME_LEN))
    } else if !name_pattern().is_match(name) {
        Some("only ASCII letters, digits, '_', '.' and '-' are allowed".to_string())
    } else if name.contains("..") {
        Some("name must not contain '..'".to_string())
    } else {
        None
    };

    match reason {
        Some(reason) => Err(ReproError::InvalidName {
            name: name.to_string(),
            reason,
        }),
        None => Ok(()),
    }
}
