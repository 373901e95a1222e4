//! `#{name}` placeholders in command templates.
//!
//! `##` renders a literal `#`, so `##{x}` is the text `#{x}`.

use std::{borrow::Borrow, borrow::Cow, collections::HashMap, hash::Hash};

pub type Result = std::result::Result<String, InterpError>;

#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum InterpError {
    #[error("Undefined variable '{0}' at {1}")]
    UndefinedVar(String, usize),

    #[error("Unclosed brace (found open brace at {})", .0+1)]
    UnclosedBrace(usize),
}

/// Renders `template`, resolving each placeholder through `lookup`.
/// Positions in errors are 1-based character offsets of the opening brace.
pub fn interp_with<'a, F>(template: &str, mut lookup: F) -> Result
where
    F: FnMut(&str) -> Option<Cow<'a, str>>,
{
    let mut res = String::with_capacity(template.len() * 2);
    let mut chars = template.chars().enumerate().peekable();

    while let Some((_, c)) = chars.next() {
        if c != '#' {
            res.push(c);
            continue;
        }
        match chars.peek() {
            Some((_, '#')) => {
                chars.next();
                res.push('#');
            }
            Some(&(brace, '{')) => {
                chars.next();
                let mut name = String::new();
                let closed = loop {
                    match chars.next() {
                        Some((_, '}')) => break true,
                        Some((_, ch)) => name.push(ch),
                        None => break false,
                    }
                };
                if !closed {
                    return Err(InterpError::UnclosedBrace(brace));
                }
                match lookup(&name) {
                    Some(value) => res.push_str(&value),
                    None => return Err(InterpError::UndefinedVar(name, brace + 1)),
                }
            }
            _ => res.push(c),
        }
    }

    Ok(res)
}

pub fn interp<K, V>(template: &str, variables: &HashMap<K, V>) -> Result
where
    K: Borrow<str> + Hash + Eq,
    V: AsRef<str>,
{
    interp_with(template, |name| {
        variables.get(name).map(|v| Cow::Borrowed(v.as_ref()))
    })
}
