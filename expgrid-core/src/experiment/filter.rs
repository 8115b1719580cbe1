// Instance Filters
// Run-time selection by predicate and tag

use crate::expression::{evaluate_predicate, Lexer, Token};
use crate::experiment::instance::ExperimentInstance;
use crate::variables::expander::matching_brace;
use crate::variables::{
    Definition, Expander, Scope, Value, VariableError, VariableLayer, VariableStore,
};

use std::collections::BTreeMap;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum FilterError {
    #[error("{instance}: predicate '{predicate}': {source}")]
    Variable {
        instance: String,
        predicate: String,
        #[source]
        source: VariableError,
    },

    #[error("{instance}: predicate '{predicate}': {message}")]
    Evaluation {
        instance: String,
        predicate: String,
        message: String,
    },
}

/// Selection filters supplied on the command line
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Filters {
    /// All must hold
    pub include_where: Vec<String>,
    /// Any one excludes
    pub exclude_where: Vec<String>,
    /// Instance must carry every tag
    pub tags: Vec<String>,
}

impl Filters {
    pub fn is_empty(&self) -> bool {
        self.include_where.is_empty() && self.exclude_where.is_empty() && self.tags.is_empty()
    }

    /// Exclusion wins over inclusion
    pub fn matches(&self, instance: &ExperimentInstance) -> Result<bool, FilterError> {
        if !self.tags.iter().all(|t| instance.tags.contains(t)) {
            return Ok(false);
        }
        if self.is_empty() {
            return Ok(true);
        }

        let store = instance_store(&instance.variables);
        let mut expander = Expander::new(&store);
        let namespace = instance.namespace();

        for predicate in &self.exclude_where {
            if check_predicate(&mut expander, &namespace, predicate)? {
                return Ok(false);
            }
        }
        for predicate in &self.include_where {
            if !check_predicate(&mut expander, &namespace, predicate)? {
                return Ok(false);
            }
        }
        Ok(true)
    }
}

/// Store holding already-resolved values, so substitution never re-evaluates
fn instance_store(variables: &BTreeMap<String, Value>) -> VariableStore {
    let mut layer = VariableLayer::new(Scope::Experiment, "instance");
    for (name, value) in variables {
        layer.set(name.clone(), Definition::Scalar(value.clone()));
    }
    VariableStore::new().with_layer(layer)
}

/// Substitute `{refs}` in a predicate and evaluate it
pub fn check_predicate(
    expander: &mut Expander<'_>,
    instance: &str,
    predicate: &str,
) -> Result<bool, FilterError> {
    let text =
        substitute_operands(expander, predicate).map_err(|source| FilterError::Variable {
            instance: instance.to_string(),
            predicate: predicate.to_string(),
            source,
        })?;

    evaluate_predicate(&text).map_err(|e| FilterError::Evaluation {
        instance: instance.to_string(),
        predicate: predicate.to_string(),
        message: e.message,
    })
}

/// Substitute `{refs}` so every value stays one operand. Outside quotes, a
/// string that would not lex as a single token (a path, text with spaces) is
/// inserted as a quoted literal. Inside quotes, the value is escaped.
fn substitute_operands(
    expander: &mut Expander<'_>,
    predicate: &str,
) -> Result<String, VariableError> {
    let chars: Vec<char> = predicate.chars().collect();
    let mut out = String::with_capacity(predicate.len());
    let mut quote: Option<char> = None;
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        match quote {
            Some(_) if c == '\\' => {
                out.push(c);
                out.extend(chars.get(i + 1));
                i += 2;
                continue;
            }
            Some(q) if c == q => quote = None,
            None if c == '\'' || c == '"' => quote = Some(c),
            _ => {}
        }

        if c == '{' {
            if let Some(end) = matching_brace(&chars, i) {
                let reference: String = chars[i..=end].iter().collect();
                match quote {
                    Some(q) => out.push_str(&escape(&expander.expand(&reference)?, q)),
                    None => out.push_str(&operand(&expander.expand_value(&reference)?)),
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

fn operand(value: &Value) -> String {
    let text = value.as_string();
    match value {
        Value::String(_) if !is_single_operand(&text) => format!("\"{}\"", escape(&text, '"')),
        _ => text,
    }
}

fn is_single_operand(text: &str) -> bool {
    matches!(
        Lexer::new(text).tokenize().as_deref(),
        Ok([Token::Number(_) | Token::Word(_) | Token::True | Token::False, Token::Eof])
    )
}

fn escape(text: &str, quote: char) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        if c == '\\' || c == quote {
            out.push('\\');
        }
        out.push(c);
    }
    out
}
