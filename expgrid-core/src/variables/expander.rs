// Variable Expander
// Resolves formulas against a store with memoization and cycle detection

use crate::expression::evaluate_arithmetic;
use crate::variables::store::{Definition, Scope, VariableStore};
use crate::variables::value::{format_number, Value};
use crate::variables::VariableError;

use std::collections::{BTreeMap, HashMap};

/// A resolved variable: lists are returned as-is, never flattened
#[derive(Debug, Clone, PartialEq)]
pub enum Resolved {
    Scalar(Value),
    List(Vec<Value>),
}

impl Resolved {
    pub fn as_scalar(&self) -> Option<&Value> {
        match self {
            Resolved::Scalar(v) => Some(v),
            Resolved::List(_) => None,
        }
    }
}

/// Resolves variables visible from one store.
///
/// Results are memoized per `(scope, name)` for the lifetime of the expander,
/// so each context (one experiment instance) gets its own expander while the
/// store itself stays shared and read-only.
pub struct Expander<'s> {
    store: &'s VariableStore,
    cache: HashMap<(Scope, String), Resolved>,
}

impl<'s> Expander<'s> {
    pub fn new(store: &'s VariableStore) -> Self {
        Self {
            store,
            cache: HashMap::new(),
        }
    }

    pub fn store(&self) -> &'s VariableStore {
        self.store
    }

    /// Resolve a variable by name
    pub fn resolve(&mut self, name: &str) -> Result<Resolved, VariableError> {
        self.resolve_in(name, &mut Vec::new())
    }

    /// Resolve a variable that must be a scalar
    pub fn resolve_scalar(&mut self, name: &str) -> Result<Value, VariableError> {
        self.resolve_scalar_in(name, &mut Vec::new())
    }

    /// Substitute every `{ref}` in `text`
    pub fn expand(&mut self, text: &str) -> Result<String, VariableError> {
        self.substitute(text, &mut Vec::new())
    }

    /// Substitute references, then evaluate the result if it is arithmetic
    pub fn expand_value(&mut self, text: &str) -> Result<Value, VariableError> {
        let substituted = self.substitute(text, &mut Vec::new())?;
        Ok(text_to_value(substituted))
    }

    /// Resolve every visible variable to a scalar
    pub fn resolve_all(&mut self) -> Result<BTreeMap<String, Value>, VariableError> {
        self.store
            .visible_names()
            .into_iter()
            .map(|name| {
                let value = self.resolve_scalar(&name)?;
                Ok((name, value))
            })
            .collect()
    }

    fn resolve_in(
        &mut self,
        name: &str,
        visiting: &mut Vec<String>,
    ) -> Result<Resolved, VariableError> {
        let store = self.store;
        let Some((scope, definition)) = store.lookup(name) else {
            return Err(VariableError::UndefinedVariable {
                name: name.to_string(),
                referenced_by: visiting.last().cloned(),
            });
        };

        let key = (scope, name.to_string());
        if let Some(cached) = self.cache.get(&key) {
            return Ok(cached.clone());
        }

        if let Some(start) = visiting.iter().position(|v| v == name) {
            let mut cycle = visiting[start..].to_vec();
            cycle.push(name.to_string());
            return Err(VariableError::CircularReference { cycle });
        }

        visiting.push(name.to_string());
        let result = match definition {
            Definition::Scalar(Value::String(s)) => Ok(Resolved::Scalar(text_to_value(s.clone()))),
            Definition::Scalar(value) => Ok(Resolved::Scalar(value.clone())),
            Definition::List(items) => Ok(Resolved::List(items.clone())),
            Definition::Formula(formula) => self
                .substitute(formula, visiting)
                .map(|text| Resolved::Scalar(text_to_value(text))),
        };
        visiting.pop();

        let resolved = result?;
        self.cache.insert(key, resolved.clone());
        Ok(resolved)
    }

    fn resolve_scalar_in(
        &mut self,
        name: &str,
        visiting: &mut Vec<String>,
    ) -> Result<Value, VariableError> {
        match self.resolve_in(name, visiting)? {
            Resolved::Scalar(value) => Ok(value),
            Resolved::List(_) => Err(VariableError::ListInterpolation {
                name: name.to_string(),
                referenced_by: visiting.last().cloned(),
            }),
        }
    }

    fn substitute(
        &mut self,
        text: &str,
        visiting: &mut Vec<String>,
    ) -> Result<String, VariableError> {
        let chars: Vec<char> = text.chars().collect();
        let mut out = String::with_capacity(text.len());
        let mut i = 0;

        while i < chars.len() {
            let c = chars[i];
            let next = chars.get(i + 1).copied();

            // \{ and \} are literal braces
            if c == '\\' && matches!(next, Some('{') | Some('}')) {
                out.extend(next);
                i += 2;
                continue;
            }

            // ${VAR} belongs to the shell
            if c == '$' && next == Some('{') {
                match matching_brace(&chars, i + 1) {
                    Some(end) => {
                        out.extend(&chars[i..=end]);
                        i = end + 1;
                    }
                    None => {
                        out.extend(&chars[i..]);
                        i = chars.len();
                    }
                }
                continue;
            }

            if c == '{' {
                if let Some(end) = matching_brace(&chars, i) {
                    let inner: String = chars[i + 1..end].iter().collect();
                    let name = self.substitute(&inner, visiting)?;
                    if is_variable_name(&name) {
                        let value = self.resolve_scalar_in(&name, visiting)?;
                        out.push_str(&value.as_string());
                    } else {
                        out.push('{');
                        out.push_str(&name);
                        out.push('}');
                    }
                    i = end + 1;
                    continue;
                }
            }

            out.push(c);
            i += 1;
        }

        Ok(out)
    }
}

/// Index of the `}` closing the brace at `open`
pub(crate) fn matching_brace(chars: &[char], open: usize) -> Option<usize> {
    let mut depth = 0usize;
    for (offset, &c) in chars[open..].iter().enumerate() {
        match c {
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(open + offset);
                }
            }
            _ => {}
        }
    }
    None
}

/// Names are word characters plus `-` and `.`; anything else in braces is
/// literal text such as an awk program.
pub fn is_variable_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_alphanumeric() || matches!(c, '_' | '-' | '.'))
}

/// Turn fully substituted text into a value. A plain number whose rendering
/// would differ from its text ("3.10", "1.0") stays a string.
fn text_to_value(text: String) -> Value {
    if let Some(n) = parse_plain_number(&text) {
        return if format_number(n) == text {
            Value::Number(n)
        } else {
            Value::String(text)
        };
    }
    if let Some(n) = evaluate_arithmetic(&text) {
        return Value::Number(n);
    }
    Value::String(text)
}

fn parse_plain_number(text: &str) -> Option<f64> {
    let digits = text.strip_prefix('-').unwrap_or(text);
    let well_formed = !digits.is_empty()
        && digits.chars().all(|c| c.is_ascii_digit() || c == '.')
        && digits.chars().filter(|&c| c == '.').count() <= 1
        && !(digits.len() > 1 && digits.starts_with('0') && !digits.starts_with("0."));
    if well_formed {
        text.parse().ok()
    } else {
        None
    }
}
