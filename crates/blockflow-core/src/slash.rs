//! Slash-command invocation surface: `/name arg1 "arg two" ...`.

use crate::error::FlowError;

/// Split a line into words, honouring single quotes, double quotes and
/// backslash escapes. `""` yields an empty word.
pub fn split_shell_words(line: &str) -> Result<Vec<String>, FlowError> {
    #[derive(Clone, Copy, PartialEq, Eq)]
    enum Mode {
        Normal,
        SingleQuoted,
        DoubleQuoted,
    }

    let mut words = Vec::new();
    let mut current = String::new();
    let mut in_word = false;
    let mut mode = Mode::Normal;
    let mut chars = line.chars();

    while let Some(ch) = chars.next() {
        match mode {
            Mode::Normal => match ch {
                '\'' => {
                    mode = Mode::SingleQuoted;
                    in_word = true;
                }
                '"' => {
                    mode = Mode::DoubleQuoted;
                    in_word = true;
                }
                '\\' => {
                    if let Some(next) = chars.next() {
                        current.push(next);
                    }
                    in_word = true;
                }
                c if c.is_whitespace() => {
                    if in_word {
                        words.push(std::mem::take(&mut current));
                        in_word = false;
                    }
                }
                c => {
                    current.push(c);
                    in_word = true;
                }
            },
            Mode::SingleQuoted => match ch {
                '\'' => mode = Mode::Normal,
                c => current.push(c),
            },
            Mode::DoubleQuoted => match ch {
                '"' => mode = Mode::Normal,
                '\\' => {
                    if let Some(next) = chars.next() {
                        current.push(next);
                    }
                }
                c => current.push(c),
            },
        }
    }

    if mode != Mode::Normal {
        return Err(FlowError::InvalidInvocation(format!(
            "unterminated quoted string in '{}'",
            line
        )));
    }
    if in_word {
        words.push(current);
    }
    Ok(words)
}

/// Parse `/name args...` into the command name and its positional arguments.
/// The leading `/` is optional.
pub fn parse_invocation(line: &str) -> Result<(String, Vec<String>), FlowError> {
    let mut words = split_shell_words(line)?.into_iter();
    let head = words
        .next()
        .ok_or_else(|| FlowError::InvalidInvocation("empty invocation".to_string()))?;
    let name = head.strip_prefix('/').unwrap_or(&head);
    if name.is_empty() || name.contains('/') {
        return Err(FlowError::InvalidInvocation(format!(
            "'{}' is not a command name",
            head
        )));
    }
    Ok((name.to_string(), words.collect()))
}
