//! Two-state scanner for the statement dialect
//!
//! The lexer only distinguishes statement boundaries from statement bodies. It never
//! looks inside a statement: everything between the leading token and the `;`
//! terminator is kept verbatim for the template engine to parse.

/* ===================== Tokens ===================== */

/// Token classification
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenKind {
    /// CR or LF between statements
    LineSeparator,
    /// Space (or any other non-tab whitespace) between statements
    Space,
    /// Tab between statements
    Tab,
    /// Leading text of a generic statement
    BlockOpen,
    /// The `;` terminating a statement
    BlockClose,
    /// Leading text of a statement calling straight into a capability module
    DirectCall,
    /// Statement body, passed through unchanged
    Keep,
    /// Produces no output (LF of a CRLF pair, stray terminators)
    Ignore,
}

/// A classified slice of the script
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Token {
    pub kind: TokenKind,
    pub value: String,
    /// Byte offset of the match in the script
    pub position: usize,
}

/* ===================== Lexer ===================== */

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Closed,
    Open,
}

/// Statement lexer
///
/// Holds the capability identifiers it should recognise as direct calls, already
/// suffixed with `.` so matching is a plain prefix test.
#[derive(Debug, Clone)]
pub struct Lexer {
    prefixes: Vec<String>,
}

impl Lexer {
    pub fn new<I, S>(capabilities: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            prefixes: capabilities
                .into_iter()
                .map(|id| format!("{}.", id.as_ref()))
                .collect(),
        }
    }

    /// Split `input` into tokens
    ///
    /// Each catchable character (`;`, CR, LF, tab, whitespace) is a match of its own;
    /// every maximal run of other characters is one free-text match.
    pub fn tokenize(&self, input: &str) -> Vec<Token> {
        let mut scan = Scan {
            lexer: self,
            state: State::Closed,
            previous: "",
            tokens: Vec::new(),
        };

        let mut text_start: Option<usize> = None;

        for (offset, ch) in input.char_indices() {
            if !is_catchable(ch) {
                text_start.get_or_insert(offset);
                continue;
            }

            if let Some(start) = text_start.take() {
                scan.push(&input[start..offset], start);
            }

            let end = offset + ch.len_utf8();
            scan.push(&input[offset..end], offset);
        }

        if let Some(start) = text_start {
            scan.push(&input[start..], start);
        }

        scan.tokens
    }

    fn is_direct_call(&self, text: &str) -> bool {
        text.contains('.') && self.prefixes.iter().any(|prefix| text.starts_with(prefix))
    }
}

/// Characters that always form a match on their own
fn is_catchable(ch: char) -> bool {
    ch == ';' || ch.is_whitespace()
}

/// Mutable scanning state for one `tokenize` call
struct Scan<'a> {
    lexer: &'a Lexer,
    state: State,
    previous: &'a str,
    tokens: Vec<Token>,
}

impl<'a> Scan<'a> {
    fn push(&mut self, value: &'a str, position: usize) {
        let kind = match self.state {
            State::Open => self.classify_open(value),
            State::Closed => self.classify_closed(value),
        };

        self.previous = value;
        self.tokens.push(Token {
            kind,
            value: value.to_string(),
            position,
        });
    }

    fn classify_open(&mut self, value: &str) -> TokenKind {
        if value == ";" {
            self.state = State::Closed;
            return TokenKind::BlockClose;
        }

        TokenKind::Keep
    }

    fn classify_closed(&mut self, value: &str) -> TokenKind {
        match value {
            ";" => TokenKind::Ignore,
            "\n" if self.previous == "\r" => TokenKind::Ignore,
            "\r" | "\n" => TokenKind::LineSeparator,
            "\t" => TokenKind::Tab,
            _ if value.chars().all(char::is_whitespace) => TokenKind::Space,
            _ => {
                self.state = State::Open;
                if self.lexer.is_direct_call(value) {
                    TokenKind::DirectCall
                } else {
                    TokenKind::BlockOpen
                }
            }
        }
    }
}
