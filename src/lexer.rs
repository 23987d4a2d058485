use crate::config::LexerConfig;

/// Token kinds produced inside expression and statement bodies, plus the
/// structural open/close/text tokens.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenKind {
    Text,
    ExpressionOpen,
    ExpressionClose,
    StatementOpen,
    StatementClose,
    LineStatementOpen,
    LineStatementClose,
    Id,
    Number,
    Str,
    /// A balanced `[...]` or `{...}` span handed to the JSON parser.
    JsonLiteral,
    Comma,
    /// A standalone `.` for member access on a computed value; dots
    /// inside identifiers are absorbed into the `Id` token.
    Dot,
    LeftParen,
    RightParen,
    Assign,
    Pipe,
    Plus,
    Minus,
    Times,
    Slash,
    Percent,
    Power,
    Eq,
    NotEq,
    Gt,
    Gte,
    Lt,
    Lte,
    Unknown,
    Eof,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Token {
    pub kind: TokenKind,
    pub pos: usize,
    pub len: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Text,
    Expression,
    Statement,
    Line,
}

#[derive(Clone, Copy, PartialEq)]
enum Opener {
    Expression,
    Statement,
    Comment,
    Line,
}

#[derive(Clone, Copy, PartialEq)]
enum Strip {
    /// `-` modifier: remove all preceding whitespace.
    Force,
    /// `+` modifier: keep whitespace even under `lstrip_blocks`.
    Keep,
    Default,
}

/// Character-level tokeniser with runtime-configurable delimiters.
///
/// Walks the source in two modes: free text (searching for the next
/// opening delimiter, applying whitespace-control) and delimiter bodies
/// (producing expression tokens). Comments are consumed here and never
/// reach the parser.
pub struct Lexer<'s> {
    config: &'s LexerConfig,
    source: &'s str,
    pos: usize,
    state: State,
    peeked: Option<Token>,
}

impl<'s> Lexer<'s> {
    pub fn new(config: &'s LexerConfig, source: &'s str) -> Lexer<'s> {
        Lexer {
            config,
            source,
            pos: 0,
            state: State::Text,
            peeked: None,
        }
    }

    pub fn source(&self) -> &'s str {
        self.source
    }

    pub fn text(&self, token: &Token) -> &'s str {
        &self.source[token.pos..token.pos + token.len]
    }

    pub fn next_token(&mut self) -> Token {
        match self.peeked.take() {
            Some(t) => t,
            None => self.scan(),
        }
    }

    pub fn peek_token(&mut self) -> Token {
        if self.peeked.is_none() {
            let t = self.scan();
            self.peeked = Some(t);
        }
        self.peeked.unwrap_or(Token {
            kind: TokenKind::Eof,
            pos: self.source.len(),
            len: 0,
        })
    }

    fn scan(&mut self) -> Token {
        match self.state {
            State::Text => self.scan_text(),
            State::Expression | State::Statement | State::Line => self.scan_body(),
        }
    }

    /// Finds the earliest opener of any kind at or after `from`. Prefers
    /// the longer delimiter when two match at the same index.
    fn find_opener(&self, from: usize) -> Option<(usize, Opener)> {
        let mut best: Option<(usize, Opener, usize)> = None;
        let mut consider = |idx: Option<usize>, opener: Opener, len: usize| {
            if let Some(i) = idx {
                let better = match best {
                    None => true,
                    Some((bi, _, blen)) => i < bi || (i == bi && len > blen),
                };
                if better {
                    best = Some((i, opener, len));
                }
            }
        };

        let find = |pat: &str| {
            if pat.is_empty() {
                return None;
            }
            self.source[from..].find(pat).map(|i| from + i)
        };
        consider(
            find(&self.config.expression_open),
            Opener::Expression,
            self.config.expression_open.len(),
        );
        consider(
            find(&self.config.statement_open),
            Opener::Statement,
            self.config.statement_open.len(),
        );
        consider(
            find(&self.config.comment_open),
            Opener::Comment,
            self.config.comment_open.len(),
        );

        // line statements only open at the start of a line
        let ls = &self.config.line_statement;
        if !ls.is_empty() {
            let mut search = from;
            while let Some(i) = self.source[search..].find(ls.as_str()) {
                let abs = search + i;
                if abs == 0 || self.source.as_bytes()[abs - 1] == b'\n' {
                    consider(Some(abs), Opener::Line, ls.len());
                    break;
                }
                search = abs + 1;
            }
        }

        best.map(|(i, o, _)| (i, o))
    }

    /// The opener's strip modifier and total length including it.
    fn opener_shape(&self, idx: usize, opener: Opener) -> (Strip, usize) {
        let base = match opener {
            Opener::Expression => self.config.expression_open.len(),
            Opener::Statement => self.config.statement_open.len(),
            Opener::Comment => self.config.comment_open.len(),
            Opener::Line => return (Strip::Default, self.config.line_statement.len()),
        };
        let rest = &self.source[idx + base..];
        if rest.starts_with('-') {
            (Strip::Force, base + 1)
        } else if rest.starts_with('+') && opener != Opener::Expression {
            (Strip::Keep, base + 1)
        } else {
            (Strip::Default, base)
        }
    }

    fn scan_text(&mut self) -> Token {
        loop {
            let start = self.pos;
            if start >= self.source.len() {
                return Token {
                    kind: TokenKind::Eof,
                    pos: self.source.len(),
                    len: 0,
                };
            }

            match self.find_opener(start) {
                None => {
                    self.pos = self.source.len();
                    return Token {
                        kind: TokenKind::Text,
                        pos: start,
                        len: self.source.len() - start,
                    };
                }
                Some((idx, opener)) if idx > start => {
                    let (strip, _) = self.opener_shape(idx, opener);
                    let text = &self.source[start..idx];
                    let len = self.stripped_text_len(text, opener, strip);
                    self.pos = idx;
                    if len == 0 {
                        continue;
                    }
                    return Token {
                        kind: TokenKind::Text,
                        pos: start,
                        len,
                    };
                }
                Some((idx, opener)) => {
                    let (_, total_len) = self.opener_shape(idx, opener);
                    self.pos = idx + total_len;
                    match opener {
                        Opener::Expression => {
                            self.state = State::Expression;
                            return Token {
                                kind: TokenKind::ExpressionOpen,
                                pos: idx,
                                len: total_len,
                            };
                        }
                        Opener::Statement => {
                            self.state = State::Statement;
                            return Token {
                                kind: TokenKind::StatementOpen,
                                pos: idx,
                                len: total_len,
                            };
                        }
                        Opener::Line => {
                            self.state = State::Line;
                            return Token {
                                kind: TokenKind::LineStatementOpen,
                                pos: idx,
                                len: total_len,
                            };
                        }
                        Opener::Comment => {
                            self.skip_comment();
                            continue;
                        }
                    }
                }
            }
        }
    }

    /// Applies the whitespace-control rules to a pending text span and
    /// returns the length to keep.
    fn stripped_text_len(&self, text: &str, opener: Opener, strip: Strip) -> usize {
        match strip {
            Strip::Force => text.trim_end().len(),
            Strip::Keep => text.len(),
            Strip::Default => {
                let block_tag = matches!(opener, Opener::Statement | Opener::Comment);
                if self.config.lstrip_blocks && block_tag {
                    let stripped = text.trim_end_matches(|c| c == ' ' || c == '\t');
                    if stripped.is_empty() || stripped.ends_with('\n') {
                        stripped.len()
                    } else {
                        text.len()
                    }
                } else {
                    text.len()
                }
            }
        }
    }

    fn skip_comment(&mut self) {
        let close = &self.config.comment_close;
        match self.source[self.pos..].find(close.as_str()) {
            Some(i) => {
                let abs = self.pos + i;
                let rstrip = abs > self.pos && self.source.as_bytes()[abs - 1] == b'-';
                self.pos = abs + close.len();
                self.after_block_close(rstrip, true);
            }
            None => {
                self.pos = self.source.len();
            }
        }
    }

    /// Whitespace handling after a statement or comment close.
    fn after_block_close(&mut self, rstrip: bool, block_tag: bool) {
        if rstrip {
            let rest = &self.source[self.pos..];
            self.pos += rest.len() - rest.trim_start().len();
        } else if block_tag && self.config.trim_blocks {
            if self.source[self.pos..].starts_with("\r\n") {
                self.pos += 2;
            } else if self.source[self.pos..].starts_with('\n') {
                self.pos += 1;
            }
        }
    }

    fn scan_body(&mut self) -> Token {
        let bytes = self.source.as_bytes();
        while self.pos < bytes.len() {
            let b = bytes[self.pos];
            let skip = match self.state {
                State::Line => b == b' ' || b == b'\t' || b == b'\r',
                _ => b == b' ' || b == b'\t' || b == b'\r' || b == b'\n',
            };
            if !skip {
                break;
            }
            self.pos += 1;
        }

        if self.pos >= bytes.len() {
            if self.state == State::Line {
                self.state = State::Text;
                return Token {
                    kind: TokenKind::LineStatementClose,
                    pos: self.source.len(),
                    len: 0,
                };
            }
            return Token {
                kind: TokenKind::Eof,
                pos: self.source.len(),
                len: 0,
            };
        }

        let rest = &self.source[self.pos..];

        // closing delimiters take precedence over operator characters
        match self.state {
            State::Line => {
                if rest.starts_with('\n') {
                    let t = Token {
                        kind: TokenKind::LineStatementClose,
                        pos: self.pos,
                        len: 1,
                    };
                    self.pos += 1;
                    self.state = State::Text;
                    return t;
                }
            }
            State::Expression => {
                let close = &self.config.expression_close;
                if rest.starts_with('-') && rest[1..].starts_with(close.as_str()) {
                    let t = Token {
                        kind: TokenKind::ExpressionClose,
                        pos: self.pos,
                        len: close.len() + 1,
                    };
                    self.pos += close.len() + 1;
                    self.state = State::Text;
                    self.after_block_close(true, false);
                    return t;
                }
                if rest.starts_with(close.as_str()) {
                    let t = Token {
                        kind: TokenKind::ExpressionClose,
                        pos: self.pos,
                        len: close.len(),
                    };
                    self.pos += close.len();
                    self.state = State::Text;
                    return t;
                }
            }
            State::Statement => {
                let close = &self.config.statement_close;
                if rest.starts_with('-') && rest[1..].starts_with(close.as_str()) {
                    let t = Token {
                        kind: TokenKind::StatementClose,
                        pos: self.pos,
                        len: close.len() + 1,
                    };
                    self.pos += close.len() + 1;
                    self.state = State::Text;
                    self.after_block_close(true, true);
                    return t;
                }
                if rest.starts_with(close.as_str()) {
                    let t = Token {
                        kind: TokenKind::StatementClose,
                        pos: self.pos,
                        len: close.len(),
                    };
                    self.pos += close.len();
                    self.state = State::Text;
                    self.after_block_close(false, true);
                    return t;
                }
            }
            State::Text => {}
        }

        let start = self.pos;
        let c = match rest.chars().next() {
            Some(c) => c,
            None => {
                return Token {
                    kind: TokenKind::Eof,
                    pos: self.source.len(),
                    len: 0,
                }
            }
        };

        let two = |kind| Token {
            kind,
            pos: start,
            len: 2,
        };
        let one = |kind| Token {
            kind,
            pos: start,
            len: 1,
        };

        let token = if c.is_ascii_alphabetic() || c == '_' {
            self.scan_id()
        } else if c.is_ascii_digit() {
            self.scan_number()
        } else if c == '"' {
            self.scan_string()
        } else if c == '[' || c == '{' {
            self.scan_json_literal()
        } else if rest.starts_with("==") {
            self.pos += 2;
            two(TokenKind::Eq)
        } else if rest.starts_with("!=") {
            self.pos += 2;
            two(TokenKind::NotEq)
        } else if rest.starts_with(">=") {
            self.pos += 2;
            two(TokenKind::Gte)
        } else if rest.starts_with("<=") {
            self.pos += 2;
            two(TokenKind::Lte)
        } else {
            self.pos += c.len_utf8();
            match c {
                ',' => one(TokenKind::Comma),
                '.' => one(TokenKind::Dot),
                '(' => one(TokenKind::LeftParen),
                ')' => one(TokenKind::RightParen),
                '=' => one(TokenKind::Assign),
                '|' => one(TokenKind::Pipe),
                '+' => one(TokenKind::Plus),
                '-' => one(TokenKind::Minus),
                '*' => one(TokenKind::Times),
                '/' => one(TokenKind::Slash),
                '%' => one(TokenKind::Percent),
                '^' => one(TokenKind::Power),
                '>' => one(TokenKind::Gt),
                '<' => one(TokenKind::Lt),
                _ => Token {
                    kind: TokenKind::Unknown,
                    pos: start,
                    len: c.len_utf8(),
                },
            }
        };
        token
    }

    fn scan_id(&mut self) -> Token {
        let start = self.pos;
        let bytes = self.source.as_bytes();
        while self.pos < bytes.len() {
            let b = bytes[self.pos];
            if b.is_ascii_alphanumeric() || b == b'_' || b == b'.' {
                self.pos += 1;
            } else {
                break;
            }
        }
        Token {
            kind: TokenKind::Id,
            pos: start,
            len: self.pos - start,
        }
    }

    fn scan_number(&mut self) -> Token {
        let start = self.pos;
        let bytes = self.source.as_bytes();
        while self.pos < bytes.len() && bytes[self.pos].is_ascii_digit() {
            self.pos += 1;
        }
        if self.pos + 1 < bytes.len()
            && bytes[self.pos] == b'.'
            && bytes[self.pos + 1].is_ascii_digit()
        {
            self.pos += 1;
            while self.pos < bytes.len() && bytes[self.pos].is_ascii_digit() {
                self.pos += 1;
            }
        }
        if self.pos < bytes.len() && (bytes[self.pos] == b'e' || bytes[self.pos] == b'E') {
            let mut peek = self.pos + 1;
            if peek < bytes.len() && (bytes[peek] == b'+' || bytes[peek] == b'-') {
                peek += 1;
            }
            if peek < bytes.len() && bytes[peek].is_ascii_digit() {
                self.pos = peek;
                while self.pos < bytes.len() && bytes[self.pos].is_ascii_digit() {
                    self.pos += 1;
                }
            }
        }
        Token {
            kind: TokenKind::Number,
            pos: start,
            len: self.pos - start,
        }
    }

    fn scan_string(&mut self) -> Token {
        let start = self.pos;
        let bytes = self.source.as_bytes();
        self.pos += 1;
        while self.pos < bytes.len() {
            match bytes[self.pos] {
                b'\\' => self.pos = (self.pos + 2).min(bytes.len()),
                b'"' => {
                    self.pos += 1;
                    break;
                }
                _ => self.pos += 1,
            }
        }
        Token {
            kind: TokenKind::Str,
            pos: start,
            len: self.pos - start,
        }
    }

    fn scan_json_literal(&mut self) -> Token {
        let start = self.pos;
        let bytes = self.source.as_bytes();
        let mut depth = 0usize;
        let mut in_str = false;
        let mut escaped = false;
        while self.pos < bytes.len() {
            let b = bytes[self.pos];
            self.pos += 1;
            if in_str {
                if escaped {
                    escaped = false;
                } else if b == b'\\' {
                    escaped = true;
                } else if b == b'"' {
                    in_str = false;
                }
            } else {
                match b {
                    b'"' => in_str = true,
                    b'[' | b'{' => depth += 1,
                    b']' | b'}' => {
                        depth = depth.saturating_sub(1);
                        if depth == 0 {
                            break;
                        }
                    }
                    _ => {}
                }
            }
        }
        Token {
            kind: TokenKind::JsonLiteral,
            pos: start,
            len: self.pos - start,
        }
    }

    /// After `{% raw %}`, locates the matching `endraw` statement and
    /// returns the verbatim content span. The scanner must not have a
    /// pending peeked token when this is called.
    pub fn find_raw_end(&mut self) -> Option<(usize, usize)> {
        self.peeked = None;
        let start = self.pos;
        let open = self.config.statement_open.clone();
        let close = self.config.statement_close.clone();
        let mut from = start;
        while let Some(i) = self.source[from..].find(open.as_str()) {
            let abs = from + i;
            let mut j = abs + open.len();
            let mut lstrip = false;
            if self.source[j..].starts_with('-') {
                lstrip = true;
                j += 1;
            } else if self.source[j..].starts_with('+') {
                j += 1;
            }
            j += self.source[j..].len() - self.source[j..].trim_start().len();
            if self.source[j..].starts_with("endraw") {
                j += "endraw".len();
                j += self.source[j..].len() - self.source[j..].trim_start().len();
                let mut rstrip = false;
                if self.source[j..].starts_with('-') && self.source[j + 1..].starts_with(close.as_str()) {
                    rstrip = true;
                    j += 1;
                }
                if self.source[j..].starts_with(close.as_str()) {
                    j += close.len();
                    let content = &self.source[start..abs];
                    let length = if lstrip {
                        content.trim_end().len()
                    } else {
                        content.len()
                    };
                    self.pos = j;
                    self.state = State::Text;
                    self.after_block_close(rstrip, true);
                    return Some((start, length));
                }
            }
            from = abs + 1;
        }
        None
    }
}
