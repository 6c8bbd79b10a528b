use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error_handling::types::ConfigError;

/// Minimum number of successful nodes a session needs to be considered usable.
///
/// A session where every expected node uploaded is always `complete`, and a
/// session where no node uploaded is always `failed`. The threshold decides the
/// space in between:
/// - `All`: anything short of full coverage is `failed`.
/// - `AtLeast(n)`: `n` or more successes is `degraded`, fewer is `failed`.
///
/// In TOML this is written as `success_threshold = "all"` or
/// `success_threshold = { at_least = 3 }`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SuccessThreshold {
    All,
    AtLeast(usize),
}

impl Default for SuccessThreshold {
    fn default() -> Self {
        SuccessThreshold::AtLeast(1)
    }
}

impl fmt::Display for SuccessThreshold {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SuccessThreshold::All => write!(f, "all"),
            SuccessThreshold::AtLeast(n) => write!(f, "{}", n),
        }
    }
}

/// Parses the command-line form: `all` or a plain integer.
impl FromStr for SuccessThreshold {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.eq_ignore_ascii_case("all") {
            return Ok(SuccessThreshold::All);
        }
        match s.parse::<usize>() {
            Ok(0) => Err(ConfigError::NotInRange(
                "success threshold must be at least 1".to_string(),
            )),
            Ok(n) => Ok(SuccessThreshold::AtLeast(n)),
            Err(_) => Err(ConfigError::InvalidValue(format!(
                "success threshold must be `all` or a positive integer, got {:?}",
                s
            ))),
        }
    }
}
