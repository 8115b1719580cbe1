// Matrix Combinator
// Enumerates value tuples from matrix axes, zip groups and leftover vectors

use crate::variables::{Definition, Expander, VariableError, VariableStore, Value};

use std::collections::BTreeSet;
use thiserror::Error;

/// Label used for vectors no matrix consumes
pub const IMPLICIT_ZIP: &str = "unconsumed vectors";

/// Errors raised while enumerating tuples. All of them are configuration
/// errors detected before any instance exists.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum CombinatorError {
    #[error("zip '{zip}' has members of different lengths: {}", describe_lengths(.lengths))]
    ZipLengthMismatch {
        zip: String,
        lengths: Vec<(String, usize)>,
    },

    #[error("axis '{axis}' refers to '{variable}', which is not a list")]
    NotAList { axis: String, variable: String },

    #[error("axis '{axis}' is neither a variable nor a zip group")]
    UnknownAxis { axis: String },

    #[error("'{name}' is used by more than one matrix axis or zip group")]
    AxisReused { name: String },

    #[error("matrices produce different numbers of tuples: {lengths:?}")]
    MatrixLengthMismatch { lengths: Vec<usize> },

    #[error(transparent)]
    Variable(#[from] VariableError),
}

fn describe_lengths(lengths: &[(String, usize)]) -> String {
    lengths
        .iter()
        .map(|(name, len)| format!("{}={}", name, len))
        .collect::<Vec<_>>()
        .join(", ")
}

/// One concrete assignment of list variables to single values
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Tuple {
    values: Vec<(String, Value)>,
}

impl Tuple {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: impl Into<String>, value: Value) -> Self {
        self.values.push((name.into(), value));
        self
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.values.iter().find(|(n, _)| n == name).map(|(_, v)| v)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.values.iter().map(|(n, v)| (n.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    fn merged(&self, other: &Tuple) -> Tuple {
        let mut values = self.values.clone();
        values.extend(other.values.iter().cloned());
        Tuple { values }
    }
}

/// How one template combines its vectors
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CombinationPlan {
    /// Each inner list is one matrix: axes crossed in declared order
    pub matrices: Vec<Vec<String>>,
}

impl CombinationPlan {
    pub fn single(axes: Vec<String>) -> Self {
        Self {
            matrices: vec![axes],
        }
    }
}

/// Enumerates tuples from the list variables visible in a store.
///
/// The store is only consulted to classify names as list, zip or scalar and
/// to follow `{ref}` indirections in axis names.
pub struct Combinator<'s> {
    store: &'s VariableStore,
}

impl<'s> Combinator<'s> {
    pub fn new(store: &'s VariableStore) -> Self {
        Self { store }
    }

    /// Cartesian product over axes in declared order
    pub fn matrix(&self, axes: &[String]) -> Result<Vec<Tuple>, CombinatorError> {
        let mut used = BTreeSet::new();
        self.matrix_tracking(axes, &mut used)
    }

    /// Lock-step tuples of a zip group
    pub fn zip(&self, name: &str) -> Result<Vec<Tuple>, CombinatorError> {
        let mut used = BTreeSet::new();
        self.zip_tracking(name, &mut used)
    }

    /// Every tuple for one template: the matrix product first, then the
    /// vectors no matrix consumed, zipped together and crossed inside it
    pub fn expand(&self, plan: &CombinationPlan) -> Result<Vec<Tuple>, CombinatorError> {
        let mut used = BTreeSet::new();

        let mut products = Vec::with_capacity(plan.matrices.len());
        for axes in &plan.matrices {
            products.push(self.matrix_tracking(axes, &mut used)?);
        }
        let matrix_tuples = zip_products(products)?;

        let leftovers = self.implicit_zip(&used)?;

        Ok(match (matrix_tuples, leftovers) {
            (None, None) => vec![Tuple::new()],
            (Some(outer), None) => outer,
            (None, Some(inner)) => inner,
            (Some(outer), Some(inner)) => outer
                .iter()
                .flat_map(|o| inner.iter().map(move |i| o.merged(i)))
                .collect(),
        })
    }

    fn matrix_tracking(
        &self,
        axes: &[String],
        used: &mut BTreeSet<String>,
    ) -> Result<Vec<Tuple>, CombinatorError> {
        let mut tuples = vec![Tuple::new()];

        for raw_axis in axes {
            let axis = self.axis_name(raw_axis)?;
            let values = if self.store.zip(&axis).is_some() {
                self.zip_tracking(&axis, used)?
            } else {
                self.claim(&axis, used)?;
                self.list_tuples(raw_axis, &axis)?
            };

            tuples = tuples
                .iter()
                .flat_map(|t| values.iter().map(move |v| t.merged(v)))
                .collect();
        }

        Ok(tuples)
    }

    fn zip_tracking(
        &self,
        name: &str,
        used: &mut BTreeSet<String>,
    ) -> Result<Vec<Tuple>, CombinatorError> {
        let members = self
            .store
            .zip(name)
            .ok_or_else(|| CombinatorError::UnknownAxis {
                axis: name.to_string(),
            })?;

        self.claim(name, used)?;
        let mut columns = Vec::with_capacity(members.len());
        for raw_member in members {
            let member = self.axis_name(raw_member)?;
            self.claim(&member, used)?;
            columns.push((member.clone(), self.list_values(raw_member, &member)?));
        }

        lockstep(name, columns)
    }

    /// Zip every visible vector that no matrix consumed
    fn implicit_zip(
        &self,
        used: &BTreeSet<String>,
    ) -> Result<Option<Vec<Tuple>>, CombinatorError> {
        let mut claimed = used.clone();
        let mut groups: Vec<Vec<Tuple>> = Vec::new();
        let mut lengths = Vec::new();

        for zip in self.store.visible_zips() {
            if claimed.contains(&zip) {
                continue;
            }
            let tuples = self.zip_tracking(&zip, &mut claimed)?;
            lengths.push((zip, tuples.len()));
            groups.push(tuples);
        }

        for name in self.store.list_variables() {
            if claimed.contains(&name) {
                continue;
            }
            let tuples = self.list_tuples(&name, &name)?;
            lengths.push((name, tuples.len()));
            groups.push(tuples);
        }

        if groups.is_empty() {
            return Ok(None);
        }
        if lengths.iter().any(|(_, len)| *len != lengths[0].1) {
            return Err(CombinatorError::ZipLengthMismatch {
                zip: IMPLICIT_ZIP.to_string(),
                lengths,
            });
        }

        let len = lengths[0].1;
        Ok(Some(
            (0..len)
                .map(|i| {
                    groups
                        .iter()
                        .fold(Tuple::new(), |acc, group| acc.merged(&group[i]))
                })
                .collect(),
        ))
    }

    /// Follow a `{ref}` indirection to the real variable or zip name
    fn axis_name(&self, raw: &str) -> Result<String, CombinatorError> {
        if !raw.contains('{') {
            return Ok(raw.to_string());
        }
        Ok(Expander::new(self.store).expand(raw)?)
    }

    fn claim(&self, name: &str, used: &mut BTreeSet<String>) -> Result<(), CombinatorError> {
        if used.insert(name.to_string()) {
            Ok(())
        } else {
            Err(CombinatorError::AxisReused {
                name: name.to_string(),
            })
        }
    }

    fn list_values(&self, axis: &str, name: &str) -> Result<Vec<Value>, CombinatorError> {
        match self.store.lookup(name) {
            Some((_, Definition::List(values))) => Ok(values.clone()),
            Some(_) => Err(CombinatorError::NotAList {
                axis: axis.to_string(),
                variable: name.to_string(),
            }),
            None => Err(CombinatorError::UnknownAxis {
                axis: axis.to_string(),
            }),
        }
    }

    fn list_tuples(&self, axis: &str, name: &str) -> Result<Vec<Tuple>, CombinatorError> {
        Ok(self
            .list_values(axis, name)?
            .into_iter()
            .map(|v| Tuple::new().with(name, v))
            .collect())
    }
}

fn lockstep(zip: &str, columns: Vec<(String, Vec<Value>)>) -> Result<Vec<Tuple>, CombinatorError> {
    let Some(len) = columns.first().map(|(_, values)| values.len()) else {
        return Ok(Vec::new());
    };

    if columns.iter().any(|(_, values)| values.len() != len) {
        return Err(CombinatorError::ZipLengthMismatch {
            zip: zip.to_string(),
            lengths: columns
                .iter()
                .map(|(name, values)| (name.clone(), values.len()))
                .collect(),
        });
    }

    Ok((0..len)
        .map(|i| {
            columns
                .iter()
                .fold(Tuple::new(), |t, (name, values)| {
                    t.with(name.clone(), values[i].clone())
                })
        })
        .collect())
}

/// Several matrices run side by side and must agree on length
fn zip_products(products: Vec<Vec<Tuple>>) -> Result<Option<Vec<Tuple>>, CombinatorError> {
    let Some(first_len) = products.first().map(Vec::len) else {
        return Ok(None);
    };

    if products.iter().any(|p| p.len() != first_len) {
        return Err(CombinatorError::MatrixLengthMismatch {
            lengths: products.iter().map(Vec::len).collect(),
        });
    }

    Ok(Some(
        (0..first_len)
            .map(|i| {
                products
                    .iter()
                    .fold(Tuple::new(), |acc, p| acc.merged(&p[i]))
            })
            .collect(),
    ))
}
