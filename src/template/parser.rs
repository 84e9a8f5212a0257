//! Turns a template token stream into declared parameters plus ordered twigs.

use crate::error::BuildError;
use crate::template::lexer::{Token, TokenKind};
use regex::Regex;
use std::sync::OnceLock;

/// A parameter declared in the `--(name type, …)--` header. Type may be empty.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ParamDecl {
    pub name: String,
    pub ty: String,
}

/// One token of a twig after parsing. Text tokens are re-emitted verbatim
/// by the compiler; the others drive placeholder and guard handling.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TwigToken {
    Text(String),
    Param { name: String, nullable: bool },
    GroupOpen { group: u32, guard: Option<String> },
    GroupClose { group: u32 },
}

/// One statement unit, bound to exactly one connection.
#[derive(Clone, Debug)]
pub struct Twig {
    pub tokens: Vec<TwigToken>,
    /// Resolved parameter references in occurrence order (may repeat).
    pub parameters: Vec<ParamDecl>,
    pub connection: String,
    /// Parameters guarded by a `({{p}} is null or …)` brace group.
    pub nullable: Vec<String>,
}

#[derive(Clone, Debug, Default)]
pub struct Template {
    /// Declared parameters in declaration order.
    pub params: Vec<ParamDecl>,
    pub twigs: Vec<Twig>,
}

fn decl_rx() -> &'static Regex {
    static RX: OnceLock<Regex> = OnceLock::new();
    RX.get_or_init(|| {
        Regex::new(r"(?P<name>[$_.A-Za-z0-9\[\]]+)(\s+(?P<type>\w+))?").expect("decl regex")
    })
}

fn sql_rx() -> &'static Regex {
    static RX: OnceLock<Regex> = OnceLock::new();
    RX.get_or_init(|| Regex::new(r"--sql\(\s*(?P<name>\w+)?\s*\)--").expect("sql regex"))
}

fn guard_rx() -> &'static Regex {
    static RX: OnceLock<Regex> = OnceLock::new();
    RX.get_or_init(|| {
        Regex::new(r"(?i)^\(\s*\{\{(?P<name>[A-Za-z0-9_.$-]*?)\}\}\s+is\s+null\s+or")
            .expect("guard regex")
    })
}

struct OpenGroup {
    group: u32,
    /// Index of the `GroupOpen` token within the twig under construction.
    idx: usize,
    content: String,
}

#[derive(Default)]
struct RawTwig {
    tokens: Vec<TwigToken>,
    param_names: Vec<String>,
    has_word: bool,
    connection: Option<String>,
    nullable: Vec<String>,
    open: Vec<OpenGroup>,
}

impl RawTwig {
    fn push(&mut self, token: TwigToken, raw: &str) {
        if let TwigToken::GroupOpen { group, .. } = token {
            self.open.push(OpenGroup {
                group,
                idx: self.tokens.len(),
                content: String::new(),
            });
        }
        for g in &mut self.open {
            g.content.push_str(raw);
        }
        self.tokens.push(token);
    }

    fn close_group(&mut self, group: u32) {
        let Some(pos) = self.open.iter().rposition(|g| g.group == group) else {
            return;
        };
        let open = self.open.remove(pos);
        if let Some(c) = guard_rx().captures(&open.content) {
            let name = c["name"].to_lowercase();
            self.nullable.push(name.clone());
            self.tokens[open.idx] = TwigToken::GroupOpen {
                group,
                guard: Some(name),
            };
        }
    }

    fn finish(self, declared: &[ParamDecl], branch: &str) -> Result<Option<Twig>, BuildError> {
        if !self.has_word {
            // A twig with no word token is dropped, even if it holds
            // whitespace or parameter tokens.
            return Ok(None);
        }
        let mut parameters = Vec::with_capacity(self.param_names.len());
        for name in self.param_names {
            match declared.iter().find(|d| d.name == name) {
                Some(d) => parameters.push(d.clone()),
                None => {
                    return Err(BuildError::UndeclaredParameter {
                        branch: branch.to_string(),
                        name,
                    })
                }
            }
        }
        Ok(Some(Twig {
            tokens: self.tokens,
            parameters,
            connection: self.connection.unwrap_or_else(|| "db".to_string()),
            nullable: self.nullable,
        }))
    }
}

/// Parse the declaration header from `--(…)--` text.
fn parse_declaration(text: &str) -> Vec<ParamDecl> {
    let inner = &text[3..text.len() - 3];
    let mut params = Vec::new();
    for part in inner.split(',') {
        if let Some(c) = decl_rx().captures(part) {
            params.push(ParamDecl {
                name: c["name"].trim().to_lowercase(),
                ty: c.name("type").map(|m| m.as_str().to_string()).unwrap_or_default(),
            });
        }
    }
    params
}

/// Parse lexed tokens for one branch template. `branch` names the template
/// in build errors (`<branch>.sql`).
pub fn parse(tokens: &[Token], branch: &str) -> Result<Template, BuildError> {
    let mut declared: Vec<ParamDecl> = Vec::new();
    let mut twigs: Vec<Twig> = Vec::new();
    let mut twig = RawTwig::default();
    let mut i = 0;

    while i < tokens.len() {
        let token = &tokens[i];
        match token.kind {
            TokenKind::Dash => {
                let text = &token.text;
                if i == 0 && text.starts_with("--(") && text.ends_with(")--") {
                    declared = parse_declaration(text);
                    i += 1;
                    continue;
                }
                // Any other dash directive separates statements.
                if let Some(t) = std::mem::take(&mut twig).finish(&declared, branch)? {
                    twigs.push(t);
                }
                if let Some(c) = sql_rx().captures(text) {
                    twig.connection = c.name("name").map(|m| m.as_str().to_string());
                }
            }
            TokenKind::Parameter => {
                let name = token.text[2..token.text.len() - 2].trim().to_lowercase();
                twig.param_names.push(name.clone());
                // `{{p}} is null` collapses into one nullable parameter token.
                let is_null_tail = tokens.get(i + 1).map(|t| t.kind) == Some(TokenKind::Space)
                    && tokens.get(i + 2).map(|t| t.text.as_str()) == Some("is")
                    && tokens.get(i + 3).map(|t| t.kind) == Some(TokenKind::Space)
                    && tokens.get(i + 4).map(|t| t.text.as_str()) == Some("null");
                if is_null_tail {
                    let raw = format!("{{{{{name}}}}} is null");
                    twig.push(
                        TwigToken::Param {
                            name,
                            nullable: true,
                        },
                        &raw,
                    );
                    i += 4;
                } else {
                    let raw = format!("{{{{{name}}}}}");
                    twig.push(
                        TwigToken::Param {
                            name,
                            nullable: false,
                        },
                        &raw,
                    );
                }
            }
            TokenKind::Brace => {
                let group = token.group.unwrap_or(0);
                if token.text == "(" {
                    twig.push(TwigToken::GroupOpen { group, guard: None }, "(");
                } else {
                    twig.push(TwigToken::GroupClose { group }, ")");
                    twig.close_group(group);
                }
            }
            TokenKind::Word => {
                twig.has_word = true;
                twig.push(TwigToken::Text(token.text.clone()), &token.text);
            }
            TokenKind::Space | TokenKind::Newline | TokenKind::Str => {
                twig.push(TwigToken::Text(token.text.clone()), &token.text);
            }
        }
        i += 1;
    }

    if let Some(t) = twig.finish(&declared, branch)? {
        twigs.push(t);
    }

    Ok(Template {
        params: declared,
        twigs,
    })
}
