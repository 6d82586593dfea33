//! Statement-level parser for a single IDL file.
//!
//! The parser understands just enough of the protobuf grammar to enumerate
//! `package`, `import` and `service` declarations. `message`, `enum` and
//! `extend` bodies are skipped by brace matching; `option` statements are
//! skipped up to their terminating `;`.

use super::descriptor::{MethodDescriptor, ServiceDescriptor, StreamingKind};
use super::lexer::{Lexeme, Token, tokenize};

/// An `import` statement and where it was written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Import {
    pub path: String,
    pub line: usize,
}

/// Everything the gateway needs from one file.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct ParsedFile {
    pub package: String,
    pub imports: Vec<Import>,
    pub services: Vec<ServiceDescriptor>,
}

/// A syntax error at `line`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct SyntaxError {
    pub line: usize,
    pub message: String,
}

type Parse<T> = Result<T, SyntaxError>;

pub(crate) fn parse_source(source: &str) -> Parse<ParsedFile> {
    let lexemes = tokenize(source).map_err(|err| SyntaxError {
        line: err.line,
        message: err.message,
    })?;
    Parser::new(lexemes).file()
}

struct Parser {
    lexemes: Vec<Lexeme>,
    pos: usize,
}

impl Parser {
    fn new(lexemes: Vec<Lexeme>) -> Self {
        Self { lexemes, pos: 0 }
    }

    fn peek(&self) -> Option<&Token> {
        self.lexemes.get(self.pos).map(|lexeme| &lexeme.token)
    }

    /// Line of the next token, or of the last one at end of input.
    fn line(&self) -> usize {
        self.lexemes
            .get(self.pos)
            .or_else(|| self.lexemes.last())
            .map_or(1, |lexeme| lexeme.line)
    }

    fn error<T>(&self, message: impl Into<String>) -> Parse<T> {
        Err(SyntaxError {
            line: self.line(),
            message: message.into(),
        })
    }

    fn next(&mut self) -> Parse<Token> {
        match self.lexemes.get(self.pos) {
            Some(lexeme) => {
                self.pos += 1;
                Ok(lexeme.token.clone())
            }
            None => self.error("unexpected end of file"),
        }
    }

    fn eat_symbol(&mut self, symbol: char) -> bool {
        if self.peek() == Some(&Token::Symbol(symbol)) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn eat_word(&mut self, word: &str) -> bool {
        if matches!(self.peek(), Some(Token::Word(w)) if w == word) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect_symbol(&mut self, symbol: char) -> Parse<()> {
        let line = self.line();
        match self.next()? {
            Token::Symbol(c) if c == symbol => Ok(()),
            other => Err(SyntaxError {
                line,
                message: format!("expected `{symbol}`, found {}", other.describe()),
            }),
        }
    }

    fn expect_word(&mut self, what: &str) -> Parse<String> {
        let line = self.line();
        match self.next()? {
            Token::Word(word) => Ok(word),
            other => Err(SyntaxError {
                line,
                message: format!("expected {what}, found {}", other.describe()),
            }),
        }
    }

    fn expect_string(&mut self, what: &str) -> Parse<String> {
        let line = self.line();
        match self.next()? {
            Token::Str(value) => Ok(value),
            other => Err(SyntaxError {
                line,
                message: format!("expected {what}, found {}", other.describe()),
            }),
        }
    }

    fn file(mut self) -> Parse<ParsedFile> {
        let mut file = ParsedFile::default();

        while let Some(token) = self.peek().cloned() {
            let line = self.line();
            match token {
                Token::Symbol(';') => self.pos += 1,
                Token::Word(word) => match word.as_str() {
                    "syntax" | "edition" => {
                        self.pos += 1;
                        self.expect_symbol('=')?;
                        self.expect_string("syntax version")?;
                        self.expect_symbol(';')?;
                    }
                    "package" => {
                        self.pos += 1;
                        file.package = self.expect_word("package name")?;
                        self.expect_symbol(';')?;
                    }
                    "import" => {
                        self.pos += 1;
                        let _ = self.eat_word("public") || self.eat_word("weak");
                        let path = self.expect_string("import path")?;
                        self.expect_symbol(';')?;
                        file.imports.push(Import { path, line });
                    }
                    "option" => self.skip_statement()?,
                    "message" | "enum" | "extend" => {
                        self.pos += 1;
                        self.skip_declaration()?;
                    }
                    "service" => {
                        self.pos += 1;
                        let service = self.service(&file.package)?;
                        file.services.push(service);
                    }
                    _ => return self.error(format!("unexpected `{word}` at top level")),
                },
                other => return self.error(format!("unexpected {}", other.describe())),
            }
        }

        Ok(file)
    }

    fn service(&mut self, package: &str) -> Parse<ServiceDescriptor> {
        let name = self.expect_word("service name")?;
        self.expect_symbol('{')?;

        let mut methods = Vec::new();
        loop {
            if self.eat_symbol('}') {
                break;
            }
            if self.eat_symbol(';') {
                continue;
            }
            if self.eat_word("rpc") {
                methods.push(self.method()?);
            } else if matches!(self.peek(), Some(Token::Word(w)) if w == "option") {
                self.skip_statement()?;
            } else {
                let found = match self.peek() {
                    Some(token) => token.describe(),
                    None => "end of file".to_string(),
                };
                return self.error(format!("expected `rpc` in service {name}, found {found}"));
            }
        }

        Ok(ServiceDescriptor {
            package: package.to_owned(),
            name,
            methods,
        })
    }

    fn method(&mut self) -> Parse<MethodDescriptor> {
        let name = self.expect_word("method name")?;
        let (client_streaming, input_type) = self.message_type()?;
        if !self.eat_word("returns") {
            return self.error(format!("expected `returns` after request of {name}"));
        }
        let (server_streaming, output_type) = self.message_type()?;

        if self.peek() == Some(&Token::Symbol('{')) {
            self.skip_block()?;
            self.eat_symbol(';');
        } else {
            self.expect_symbol(';')?;
        }

        Ok(MethodDescriptor {
            name,
            kind: StreamingKind::from_flags(client_streaming, server_streaming),
            input_type,
            output_type,
        })
    }

    /// `( [stream] Type )`
    fn message_type(&mut self) -> Parse<(bool, String)> {
        self.expect_symbol('(')?;
        let mut ty = self.expect_word("message type")?;
        let mut streaming = false;
        // `stream` is only a keyword when a type name follows it.
        if ty == "stream" && matches!(self.peek(), Some(Token::Word(_))) {
            streaming = true;
            ty = self.expect_word("message type")?;
        }
        self.expect_symbol(')')?;
        Ok((streaming, ty))
    }

    /// Skips a `message`/`enum`/`extend` header and its body.
    fn skip_declaration(&mut self) -> Parse<()> {
        while self.peek() != Some(&Token::Symbol('{')) {
            self.next()?;
        }
        self.skip_block()
    }

    /// Skips from `{` to its matching `}`.
    fn skip_block(&mut self) -> Parse<()> {
        let start = self.line();
        self.expect_symbol('{')?;
        let mut depth = 1usize;
        while depth > 0 {
            match self.next() {
                Ok(Token::Symbol('{')) => depth += 1,
                Ok(Token::Symbol('}')) => depth -= 1,
                Ok(_) => {}
                Err(_) => {
                    return Err(SyntaxError {
                        line: start,
                        message: "unbalanced `{`".to_string(),
                    });
                }
            }
        }
        Ok(())
    }

    /// Skips to the `;` ending the current statement, stepping over
    /// aggregate option values in braces.
    fn skip_statement(&mut self) -> Parse<()> {
        loop {
            match self.peek() {
                Some(Token::Symbol(';')) => {
                    self.pos += 1;
                    return Ok(());
                }
                Some(Token::Symbol('{')) => self.skip_block()?,
                Some(_) => self.pos += 1,
                None => return self.error("expected `;`"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ECHO: &str = r#"
syntax = "proto3";

package pkg;

import "google/protobuf/empty.proto";
import public "shared/types.proto";

option go_package = "example.com/pkg";
option (custom.file_opt) = { name: "x" nested { a: 1 } };

message Message {
  string msg = 1;
  message Inner { int32 value = 1 [deprecated = true]; }
  map<string, Inner> items = 2;
}

enum Mode { MODE_UNSPECIFIED = 0; MODE_ON = 1; }

service Echo {
  option deprecated = false;

  rpc Say (Message) returns (Message);
  rpc Upload (stream Message) returns (Message) {}
  rpc Watch (Message) returns (stream .pkg.Message) {
    option idempotency_level = NO_SIDE_EFFECTS;
  };
  rpc Chat (stream Message) returns (stream Message);
}
"#;

    #[test]
    fn collects_package_imports_and_methods_in_order() {
        let file = parse_source(ECHO).unwrap();
        assert_eq!(file.package, "pkg");
        assert_eq!(
            file.imports,
            vec![
                Import {
                    path: "google/protobuf/empty.proto".to_string(),
                    line: 6
                },
                Import {
                    path: "shared/types.proto".to_string(),
                    line: 7
                },
            ]
        );

        let [service] = file.services.as_slice() else {
            panic!("expected one service, got {:?}", file.services);
        };
        assert_eq!(service.full_name(), "pkg.Echo");

        let methods: Vec<_> = service
            .methods
            .iter()
            .map(|m| (m.name.as_str(), m.kind))
            .collect();
        assert_eq!(
            methods,
            vec![
                ("Say", StreamingKind::Unary),
                ("Upload", StreamingKind::ClientStreaming),
                ("Watch", StreamingKind::ServerStreaming),
                ("Chat", StreamingKind::BidiStreaming),
            ]
        );
        assert_eq!(service.methods[2].output_type, ".pkg.Message");
    }

    #[test]
    fn type_named_stream_is_not_a_marker() {
        let file = parse_source("service S { rpc M (stream) returns (stream stream); }").unwrap();
        let method = &file.services[0].methods[0];
        assert_eq!(method.kind, StreamingKind::ServerStreaming);
        assert_eq!(method.input_type, "stream");
        assert_eq!(method.output_type, "stream");
        assert_eq!(file.services[0].full_name(), "S");
    }

    #[test]
    fn reports_line_of_the_offending_token() {
        let err = parse_source("syntax = \"proto3\";\n\nservice Echo {\n  rpc Say (Message) gives (Message);\n}\n")
            .unwrap_err();
        assert_eq!(err.line, 4);
        assert!(err.message.contains("returns"), "{}", err.message);
    }

    #[test]
    fn rejects_unbalanced_blocks() {
        let err = parse_source("message M {\n  message N {\n}\n").unwrap_err();
        assert_eq!(err.line, 1);
    }

    #[test]
    fn rejects_unknown_top_level_statement() {
        let err = parse_source("syntax = \"proto3\";\nservise Echo {}\n").unwrap_err();
        assert_eq!(err.line, 2);
    }
}
