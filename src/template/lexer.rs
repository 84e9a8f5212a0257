//! Character-scanning lexer for SQL templates.
//!
//! Regex is deliberately avoided here: the input is arbitrary SQL and
//! string literals must come through untouched.

/// One lexical unit of a template.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Token {
    pub kind: TokenKind,
    pub text: String,
    /// Set on `Brace` tokens; a matching `(`/`)` pair shares one id.
    pub group: Option<u32>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TokenKind {
    Space,
    Newline,
    Word,
    Str,
    Parameter,
    Dash,
    Brace,
}

impl Token {
    fn new(kind: TokenKind, text: impl Into<String>) -> Self {
        Token {
            kind,
            text: text.into(),
            group: None,
        }
    }
}

/// Characters that terminate a word on their own.
const SINGLES: &str = "()'\"\n ";
/// Characters that terminate a word only when doubled.
const DOUBLES: &str = "{}-";

/// Lex raw template text. Empty input yields no tokens.
pub fn lex(content: &str) -> Vec<Token> {
    let chars: Vec<char> = content.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;
    let mut brace_group: u32 = 0;

    while i < chars.len() {
        let p = chars[i];
        let p1 = chars.get(i + 1).copied();
        if p == '\'' || p == '"' {
            let (next, t) = lex_string(i, &chars, p);
            i = next;
            tokens.push(t);
        } else if p == '-' && p1 == Some('-') {
            let (next, t) = lex_dash(i, &chars);
            i = next;
            tokens.push(t);
        } else if p == '{' && p1 == Some('{') {
            let (next, t) = lex_parameter(i, &chars);
            i = next;
            tokens.push(t);
        } else if p == ' ' {
            let (next, t) = lex_spaces(i, &chars);
            i = next;
            tokens.push(t);
        } else if p == '(' || p == ')' {
            let mut t = Token::new(TokenKind::Brace, p);
            if p == '(' {
                brace_group += 1;
                t.group = Some(brace_group);
            } else {
                t.group = Some(brace_group);
                brace_group = brace_group.saturating_sub(1);
            }
            tokens.push(t);
            i += 1;
        } else if p == '\n' {
            tokens.push(Token::new(TokenKind::Newline, p));
            i += 1;
        } else {
            let (next, t) = lex_word(i, &chars);
            i = next;
            tokens.push(t);
        }
    }
    tokens
}

/// A `--…--` directive; the text keeps both delimiters.
fn lex_dash(start: usize, chars: &[char]) -> (usize, Token) {
    let mut text = String::from("--");
    let mut i = start + 2;
    while i < chars.len() {
        if chars[i] == '-' && chars.get(i + 1) == Some(&'-') {
            text.push_str("--");
            i += 2;
            break;
        }
        text.push(chars[i]);
        i += 1;
    }
    (i, Token::new(TokenKind::Dash, text))
}

/// A `{{…}}` parameter reference; the text keeps both brace pairs.
fn lex_parameter(start: usize, chars: &[char]) -> (usize, Token) {
    let mut text = String::from("{{");
    let mut i = start + 2;
    while i < chars.len() {
        if chars[i] == '}' && chars.get(i + 1) == Some(&'}') {
            text.push_str("}}");
            i += 2;
            break;
        }
        text.push(chars[i]);
        i += 1;
    }
    (i, Token::new(TokenKind::Parameter, text))
}

/// A quote-delimited string literal with doubled-quote escaping.
fn lex_string(start: usize, chars: &[char], quote: char) -> (usize, Token) {
    let mut text = String::new();
    text.push(quote);
    let mut i = start + 1;
    while i < chars.len() {
        if chars[i] == quote {
            if chars.get(i + 1) == Some(&quote) {
                text.push(quote);
                text.push(quote);
                i += 2;
                continue;
            }
            text.push(quote);
            i += 1;
            break;
        }
        text.push(chars[i]);
        i += 1;
    }
    (i, Token::new(TokenKind::Str, text))
}

fn lex_spaces(start: usize, chars: &[char]) -> (usize, Token) {
    let mut i = start;
    while i < chars.len() && chars[i] == ' ' {
        i += 1;
    }
    let text: String = chars[start..i].iter().collect();
    (i, Token::new(TokenKind::Space, text))
}

fn lex_word(start: usize, chars: &[char]) -> (usize, Token) {
    let mut i = start;
    while i < chars.len() {
        let p = chars[i];
        let doubled = chars.get(i + 1) == Some(&p);
        if SINGLES.contains(p) || (DOUBLES.contains(p) && doubled) {
            break;
        }
        i += 1;
    }
    let text: String = chars[start..i].iter().collect();
    (i, Token::new(TokenKind::Word, text))
}
