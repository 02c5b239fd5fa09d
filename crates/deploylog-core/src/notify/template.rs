//! Placeholder substitution for subject and body templates.
//!
//! Templates use `{name}` placeholders; `{{` and `}}` produce literal braces.
//! Only the names in [`PLACEHOLDERS`] are supported.

use thiserror::Error;

/// Placeholder names accepted in notification templates.
pub const PLACEHOLDERS: [&str; 4] = ["cluster", "instance", "status", "message"];

/// Template rendering errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum TemplateError {
    /// The template references a placeholder outside the supported set.
    #[error("unknown placeholder {{{name}}}")]
    UnknownPlaceholder {
        /// The placeholder name.
        name: String,
    },

    /// A `{` was opened but never closed.
    #[error("unterminated placeholder at byte {offset}")]
    Unterminated {
        /// Byte offset of the opening brace.
        offset: usize,
    },

    /// A lone `}` without a matching `{`.
    #[error("unmatched closing brace at byte {offset}")]
    UnmatchedClose {
        /// Byte offset of the closing brace.
        offset: usize,
    },
}

/// Values substituted into a template.
#[derive(Debug, Clone, Copy)]
pub struct TemplateVars<'a> {
    /// Cluster name.
    pub cluster: &'a str,
    /// Instance name.
    pub instance: &'a str,
    /// Verdict status.
    pub status: &'a str,
    /// Free-form message.
    pub message: &'a str,
}

impl TemplateVars<'_> {
    fn get(&self, name: &str) -> Option<&str> {
        match name {
            "cluster" => Some(self.cluster),
            "instance" => Some(self.instance),
            "status" => Some(self.status),
            "message" => Some(self.message),
            _ => None,
        }
    }
}

/// Render `template` with `vars`.
pub fn render(template: &str, vars: &TemplateVars<'_>) -> Result<String, TemplateError> {
    let mut out = String::with_capacity(template.len() + 32);
    let mut rest = template.char_indices().peekable();

    while let Some((offset, ch)) = rest.next() {
        match ch {
            '{' => {
                if matches!(rest.peek(), Some((_, '{'))) {
                    rest.next();
                    out.push('{');
                    continue;
                }
                let mut name = String::new();
                let mut closed = false;
                for (_, inner) in rest.by_ref() {
                    if inner == '}' {
                        closed = true;
                        break;
                    }
                    name.push(inner);
                }
                if !closed {
                    return Err(TemplateError::Unterminated { offset });
                }
                let value = vars
                    .get(name.trim())
                    .ok_or(TemplateError::UnknownPlaceholder { name })?;
                out.push_str(value);
            },
            '}' => {
                if matches!(rest.peek(), Some((_, '}'))) {
                    rest.next();
                    out.push('}');
                } else {
                    return Err(TemplateError::UnmatchedClose { offset });
                }
            },
            other => out.push(other),
        }
    }

    Ok(out)
}

/// Check that `template` renders with the supported placeholder set.
pub fn check(template: &str) -> Result<(), TemplateError> {
    let sample = TemplateVars {
        cluster: "",
        instance: "",
        status: "",
        message: "",
    };
    render(template, &sample).map(|_| ())
}
