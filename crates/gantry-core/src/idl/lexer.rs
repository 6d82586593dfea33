//! Tokenizer for protobuf IDL sources.
//!
//! Only the shape needed to find services survives tokenization: words
//! (identifiers, dotted names and numeric literals), string literals and
//! single-character symbols. Comments and whitespace are dropped.

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Token {
    /// Identifier, dotted type name or numeric literal.
    Word(String),
    /// Quoted string with escapes kept verbatim.
    Str(String),
    Symbol(char),
}

impl Token {
    pub(crate) fn describe(&self) -> String {
        match self {
            Token::Word(word) => format!("`{word}`"),
            Token::Str(s) => format!("string {s:?}"),
            Token::Symbol(c) => format!("`{c}`"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Lexeme {
    pub token: Token,
    pub line: usize,
}

/// A lexing failure at `line`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct LexError {
    pub line: usize,
    pub message: String,
}

fn is_word_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_' || c == '.'
}

pub(crate) fn tokenize(source: &str) -> Result<Vec<Lexeme>, LexError> {
    let mut lexemes = Vec::new();
    let mut chars = source.chars().peekable();
    let mut line = 1;

    while let Some(c) = chars.next() {
        match c {
            '\n' => line += 1,
            c if c.is_whitespace() => {}
            '/' if chars.peek() == Some(&'/') => {
                for c in chars.by_ref() {
                    if c == '\n' {
                        line += 1;
                        break;
                    }
                }
            }
            '/' if chars.peek() == Some(&'*') => {
                let start = line;
                chars.next();
                let mut closed = false;
                while let Some(c) = chars.next() {
                    match c {
                        '\n' => line += 1,
                        '*' if chars.peek() == Some(&'/') => {
                            chars.next();
                            closed = true;
                            break;
                        }
                        _ => {}
                    }
                }
                if !closed {
                    return Err(LexError {
                        line: start,
                        message: "unterminated block comment".to_string(),
                    });
                }
            }
            '"' | '\'' => {
                let quote = c;
                let start = line;
                let mut value = String::new();
                let mut closed = false;
                while let Some(c) = chars.next() {
                    match c {
                        '\\' => {
                            value.push(c);
                            if let Some(escaped) = chars.next() {
                                value.push(escaped);
                            }
                        }
                        '\n' => {
                            return Err(LexError {
                                line: start,
                                message: "newline in string literal".to_string(),
                            });
                        }
                        c if c == quote => {
                            closed = true;
                            break;
                        }
                        c => value.push(c),
                    }
                }
                if !closed {
                    return Err(LexError {
                        line: start,
                        message: "unterminated string literal".to_string(),
                    });
                }
                lexemes.push(Lexeme {
                    token: Token::Str(value),
                    line: start,
                });
            }
            c if is_word_char(c) => {
                let mut word = String::from(c);
                while let Some(&next) = chars.peek() {
                    if !is_word_char(next) {
                        break;
                    }
                    word.push(next);
                    chars.next();
                }
                lexemes.push(Lexeme {
                    token: Token::Word(word),
                    line,
                });
            }
            c if c.is_ascii_punctuation() => lexemes.push(Lexeme {
                token: Token::Symbol(c),
                line,
            }),
            other => {
                return Err(LexError {
                    line,
                    message: format!("unexpected character {other:?}"),
                });
            }
        }
    }

    Ok(lexemes)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn words(source: &str) -> Vec<Token> {
        tokenize(source)
            .unwrap()
            .into_iter()
            .map(|lexeme| lexeme.token)
            .collect()
    }

    #[test]
    fn drops_comments_and_tracks_lines() {
        let source = "// header\nsyntax /* inline */ = \"proto3\";\n/* a\n b */ package a.b;";
        let lexemes = tokenize(source).unwrap();
        let first = &lexemes[0];
        assert_eq!(first.token, Token::Word("syntax".to_string()));
        assert_eq!(first.line, 2);
        let package = lexemes
            .iter()
            .find(|l| l.token == Token::Word("package".to_string()))
            .unwrap();
        assert_eq!(package.line, 4);
    }

    #[test]
    fn keeps_string_escapes() {
        assert_eq!(
            words(r#"import 'a\'b.proto';"#),
            vec![
                Token::Word("import".to_string()),
                Token::Str(r"a\'b.proto".to_string()),
                Token::Symbol(';'),
            ]
        );
    }

    #[test]
    fn reports_unterminated_literals() {
        let err = tokenize("syntax = \"proto3;\n").unwrap_err();
        assert_eq!(err.line, 1);
        let err = tokenize("\n/* never closed").unwrap_err();
        assert_eq!(err.line, 2);
    }
}
