//! Resource name patterns used by system reset events.

use res_bus::subject;

/// A parsed resource pattern such as `library.books.*` or `library.>`.
///
/// Invalid patterns never match.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourcePattern {
    pattern: Option<String>,
}

impl ResourcePattern {
    /// Parse a pattern.
    ///
    /// Tokens must be non-empty printable ASCII without `?`. `*` must fill a
    /// whole token and `>` may only be the last token.
    pub fn parse(pattern: &str) -> Self {
        let valid = !pattern.is_empty() && {
            let mut tokens = pattern.split('.').peekable();
            let mut ok = true;
            while let Some(token) = tokens.next() {
                let last = tokens.peek().is_none();
                ok = match token {
                    "" => false,
                    "*" => true,
                    ">" => last,
                    t => t
                        .chars()
                        .all(|c| (33..=126).contains(&(c as u32)) && !matches!(c, '?' | '*' | '>')),
                };
                if !ok {
                    break;
                }
            }
            ok
        };

        Self {
            pattern: valid.then(|| pattern.to_string()),
        }
    }

    /// Check whether the pattern parsed
    pub fn is_valid(&self) -> bool {
        self.pattern.is_some()
    }

    /// Check whether a resource name matches the pattern
    pub fn matches(&self, name: &str) -> bool {
        match self.pattern {
            Some(ref pattern) => subject::matches(pattern, name),
            None => false,
        }
    }
}
