//! Renders a parsed twig into executable SQL for the current request,
//! collapsing null-guarded groups and collecting bind metadata.

use crate::template::parser::{ParamDecl, Twig, TwigToken};

/// Placeholder style of the backing driver.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Placeholder {
    /// `?` for each bind.
    Question,
    /// `%s` for each bind.
    Percent,
    /// `$1`, `$2`, … numbered binds.
    Numbered,
}

impl Placeholder {
    fn token(self, n: usize) -> String {
        match self {
            Placeholder::Question => "?".to_string(),
            Placeholder::Percent => "%s".to_string(),
            Placeholder::Numbered => format!("${n}"),
        }
    }
}

/// SQL text plus the parameters to bind, in placeholder order.
#[derive(Clone, Debug)]
pub struct CompiledTwig {
    pub sql: String,
    pub parameters: Vec<ParamDecl>,
}

/// Compile one twig against the current parameter values. `is_null` reports
/// whether a named parameter is null for this request; a null-guarded group
/// whose parameter is null collapses to `1 = 1` and binds nothing.
pub fn compile(
    twig: &Twig,
    placeholder: Placeholder,
    mut is_null: impl FnMut(&str) -> bool,
) -> CompiledTwig {
    let mut meta = twig.parameters.iter();
    let mut sql = String::new();
    let mut parameters: Vec<ParamDecl> = Vec::new();
    let mut skip: Option<u32> = None;

    for token in &twig.tokens {
        match token {
            TwigToken::GroupOpen { group, guard } => {
                if skip.is_none() {
                    if let Some(name) = guard {
                        if is_null(name) {
                            sql.push_str("1 = 1");
                            skip = Some(*group);
                            continue;
                        }
                    }
                }
                if skip.is_none() {
                    sql.push('(');
                }
            }
            TwigToken::GroupClose { group } => {
                if skip == Some(*group) {
                    skip = None;
                    continue;
                }
                if skip.is_none() {
                    sql.push(')');
                }
            }
            TwigToken::Param { nullable, .. } => {
                // Parameter metadata advances per occurrence even when the
                // occurrence lands inside a skipped group.
                let decl = meta.next();
                if skip.is_some() {
                    continue;
                }
                if *nullable {
                    sql.push_str("1 = 2");
                } else if let Some(decl) = decl {
                    parameters.push(decl.clone());
                    sql.push_str(&placeholder.token(parameters.len()));
                }
            }
            TwigToken::Text(text) => {
                if skip.is_none() {
                    sql.push_str(text);
                }
            }
        }
    }

    // Interior text is re-emitted verbatim; only the outer whitespace left
    // behind by directive lines is dropped.
    CompiledTwig {
        sql: sql.trim().to_string(),
        parameters,
    }
}
