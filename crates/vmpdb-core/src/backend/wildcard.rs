//! Case-insensitive `*` / `?` wildcard matching for symbol and type names.

use regex::{Regex, RegexBuilder};

/// A compiled name pattern.
///
/// `*` matches any run of characters and `?` matches exactly one; everything
/// else matches literally, ignoring ASCII case. Patterns without wildcards
/// are compared directly.
///
/// ```rust
/// use vmpdb_core::backend::Pattern;
///
/// let pattern = Pattern::new("_EPROCESS*")?;
/// assert!(pattern.matches("_eprocess_quota_entry"));
/// assert!(!pattern.matches("_KPROCESS"));
/// # Ok::<(), regex::Error>(())
/// ```
#[derive(Debug, Clone)]
pub struct Pattern
{
    literal: String,
    regex: Option<Regex>,
}

impl Pattern
{
    /// Compile a wildcard pattern.
    ///
    /// ## Errors
    ///
    /// Returns an error if the translated expression exceeds regex limits.
    pub fn new(pattern: &str) -> Result<Self, regex::Error>
    {
        if !Self::has_wildcards(pattern) {
            return Ok(Pattern { literal: pattern.to_owned(), regex: None });
        }

        let mut expr = String::with_capacity(pattern.len() + 8);
        expr.push('^');
        let mut buf = [0u8; 4];
        for ch in pattern.chars() {
            match ch {
                '*' => expr.push_str(".*"),
                '?' => expr.push('.'),
                other => expr.push_str(&regex::escape(other.encode_utf8(&mut buf))),
            }
        }
        expr.push('$');

        let regex = RegexBuilder::new(&expr).case_insensitive(true).build()?;
        Ok(Pattern { literal: pattern.to_owned(), regex: Some(regex) })
    }

    /// Returns `true` if the text contains `*` or `?`.
    pub fn has_wildcards(text: &str) -> bool
    {
        text.contains(['*', '?'])
    }

    /// The pattern as it was written.
    pub fn as_str(&self) -> &str
    {
        &self.literal
    }

    /// Test a name against the pattern.
    pub fn matches(&self, name: &str) -> bool
    {
        match &self.regex {
            Some(regex) => regex.is_match(name),
            None => name.eq_ignore_ascii_case(&self.literal),
        }
    }
}

#[cfg(test)]
mod tests
{
    use super::*;

    #[test]
    fn test_literal_is_case_insensitive()
    {
        let pattern = Pattern::new("PsInitialSystemProcess").unwrap();
        assert!(pattern.matches("psinitialsystemprocess"));
        assert!(!pattern.matches("PsInitialSystemProcess2"));
    }

    #[test]
    fn test_question_mark_matches_one_char()
    {
        let pattern = Pattern::new("_KPRCB?").unwrap();
        assert!(pattern.matches("_KPRCB1"));
        assert!(!pattern.matches("_KPRCB"));
        assert!(!pattern.matches("_KPRCB12"));
    }

    #[test]
    fn test_regex_metacharacters_are_literal()
    {
        let pattern = Pattern::new("a.b*").unwrap();
        assert!(pattern.matches("a.bcd"));
        assert!(!pattern.matches("axbcd"));
    }
}
