//! Name wildcards: alphanumerics, `.`, `-` and `*` (any run of characters),
//! compiled to an anchored regular expression.

use regex::Regex;

#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum PatternError {
    #[error("empty pattern")]
    Empty,
    #[error("invalid character {0:?} in pattern {1:?}")]
    InvalidChar(char, String),
    #[error("pattern {0:?} does not compile: {1}")]
    Compile(String, String),
}

#[derive(Debug, Clone)]
pub struct WildcardPattern {
    source: String,
    re: Regex,
}

impl WildcardPattern {
    pub fn compile(value: &str) -> Result<Self, PatternError> {
        if value.is_empty() {
            return Err(PatternError::Empty);
        }
        if let Some(c) = value.chars().find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '*'))) {
            return Err(PatternError::InvalidChar(c, value.to_string()));
        }
        let body: Vec<String> = value.split('*').map(regex::escape).collect();
        let expr = format!("^{}$", body.join(".*"));
        let re = Regex::new(&expr).map_err(|e| PatternError::Compile(value.to_string(), e.to_string()))?;
        Ok(Self { source: value.to_string(), re })
    }

    pub fn matches(&self, name: &str) -> bool { self.re.is_match(name) }

    pub fn as_str(&self) -> &str { &self.source }
}
