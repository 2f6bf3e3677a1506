//! Joins per-group feature outputs onto the master entity list, one-hot encodes categoricals,
//! and emits the wide numeric table plus its manifest.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::fs::File;
use std::path::Path;

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::features::{FeatureGroupTable, FeatureManifest, FeatureSet, FeatureValue};

/// Category assigned to an entity that has no value for a categorical column.
pub const UNKNOWN_CATEGORY: &str = "unknown";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CategoricalSpec {
    pub column: String,
    pub prefix: String,
    /// Fixed enumeration; when `None` the observed values are used, sorted.
    pub categories: Option<Vec<String>>,
}

impl CategoricalSpec {
    pub fn new(column: impl Into<String>, prefix: impl Into<String>) -> Self {
        Self {
            column: column.into(),
            prefix: prefix.into(),
            categories: None,
        }
    }

    /// Encoded under the column's own name, e.g. `contract_type_One year`.
    pub fn same_prefix(column: impl Into<String>) -> Self {
        let column = column.into();
        Self::new(column.clone(), column)
    }

    pub fn with_categories<I, S>(mut self, categories: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.categories = Some(categories.into_iter().map(Into::into).collect());
        self
    }
}

/// Per-entity training label, keyed by entity id.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Labels {
    pub column: String,
    pub values: HashMap<String, f64>,
}

impl Labels {
    pub fn new(column: impl Into<String>) -> Self {
        Self {
            column: column.into(),
            values: HashMap::new(),
        }
    }

    pub fn insert(&mut self, entity_id: impl Into<String>, churned: bool) {
        self.values
            .insert(entity_id.into(), if churned { 1.0 } else { 0.0 });
    }
}

#[derive(Debug, Error)]
pub enum AssemblyError {
    #[error("column '{column}' is produced by both '{first}' and '{second}'")]
    DuplicateColumn {
        column: String,
        first: String,
        second: String,
    },
    #[error("group '{group}' has more than one row for entity '{entity_id}'")]
    DuplicateEntity { group: String, entity_id: String },
    #[error("categorical column '{0}' is not produced by any group")]
    UnknownCategorical(String),
    #[error("column '{column}' holds category '{value}' for '{entity_id}' but is not declared categorical")]
    UndeclaredCategory {
        column: String,
        entity_id: String,
        value: String,
    },
    #[error("column '{column}' is categorical but holds a number for '{entity_id}'")]
    NumberInCategoricalColumn { column: String, entity_id: String },
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
}

/// The assembled feature table. Row `i` belongs to `entity_ids[i]`.
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureTable {
    pub id_column: String,
    pub columns: Vec<String>,
    pub entity_ids: Vec<String>,
    pub rows: Vec<Vec<f64>>,
    pub target_column: String,
    pub targets: Vec<Option<f64>>,
}

impl FeatureTable {
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn row(&self, entity_id: &str) -> Option<&[f64]> {
        self.entity_ids
            .iter()
            .position(|id| id == entity_id)
            .map(|idx| self.rows[idx].as_slice())
    }

    /// Unknown entities get an all-zero row rather than an error.
    pub fn row_or_default(&self, entity_id: &str) -> Vec<f64> {
        self.row(entity_id)
            .map(<[f64]>::to_vec)
            .unwrap_or_else(|| vec![0.0; self.columns.len()])
    }

    pub fn value(&self, entity_id: &str, column: &str) -> Option<f64> {
        let col = self.columns.iter().position(|name| name == column)?;
        self.row(entity_id).map(|row| row[col])
    }

    pub fn row_map(&self, entity_id: &str) -> Option<HashMap<String, f64>> {
        self.row(entity_id).map(|row| {
            self.columns
                .iter()
                .cloned()
                .zip(row.iter().copied())
                .collect()
        })
    }

    /// Header is `id, features..., target`; a missing label is written as an empty cell.
    pub fn write_csv(&self, path: &Path) -> Result<(), AssemblyError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let mut writer = csv::Writer::from_writer(File::create(path)?);

        let mut header = Vec::with_capacity(self.columns.len() + 2);
        header.push(self.id_column.as_str());
        header.extend(self.columns.iter().map(String::as_str));
        header.push(self.target_column.as_str());
        writer.write_record(&header)?;

        for ((entity_id, row), target) in self.entity_ids.iter().zip(&self.rows).zip(&self.targets) {
            let mut record = Vec::with_capacity(row.len() + 2);
            record.push(entity_id.clone());
            record.extend(row.iter().map(f64::to_string));
            record.push(target.map(|value| value.to_string()).unwrap_or_default());
            writer.write_record(&record)?;
        }
        writer.flush()?;

        info!(
            component = "assembly",
            event = "assembly.table.written",
            path = %path.display(),
            rows = self.rows.len(),
            columns = self.columns.len()
        );
        Ok(())
    }
}

struct ColumnLayout {
    /// (column, owning group index)
    numeric: Vec<(&'static str, usize)>,
    /// Parallel to the categorical specs.
    categorical: Vec<usize>,
}

fn column_layout(
    groups: &[FeatureGroupTable],
    categorical: &[CategoricalSpec],
) -> Result<ColumnLayout, AssemblyError> {
    let mut owner: HashMap<&'static str, usize> = HashMap::new();
    let mut ordered: Vec<(&'static str, usize)> = Vec::new();

    for (group_idx, group) in groups.iter().enumerate() {
        let mut names: Vec<&'static str> = Vec::new();
        let mut seen_here = HashSet::new();
        let sources = group.defaults.iter().chain(group.rows.iter().map(|(_, set)| set));
        for set in sources {
            for name in set.names() {
                if seen_here.insert(name) {
                    names.push(name);
                }
            }
        }

        for name in names {
            if let Some(first) = owner.get(name) {
                return Err(AssemblyError::DuplicateColumn {
                    column: name.to_string(),
                    first: groups[*first].group.to_string(),
                    second: group.group.to_string(),
                });
            }
            owner.insert(name, group_idx);
            ordered.push((name, group_idx));
        }
    }

    let categorical_names: HashSet<&str> =
        categorical.iter().map(|spec| spec.column.as_str()).collect();
    let numeric = ordered
        .iter()
        .copied()
        .filter(|(name, _)| !categorical_names.contains(name))
        .collect();
    let categorical = categorical
        .iter()
        .map(|spec| {
            owner
                .get(spec.column.as_str())
                .copied()
                .ok_or_else(|| AssemblyError::UnknownCategorical(spec.column.clone()))
        })
        .collect::<Result<Vec<_>, _>>()?;

    Ok(ColumnLayout { numeric, categorical })
}

fn lookup<'a>(
    groups: &'a [FeatureGroupTable],
    indexes: &[HashMap<&str, &'a FeatureSet>],
    group_idx: usize,
    entity_id: &str,
) -> Option<&'a FeatureSet> {
    indexes[group_idx]
        .get(entity_id)
        .copied()
        .or(groups[group_idx].defaults.as_ref())
}

/// Left-joins every group onto `entity_ids`. An entity missing from a group takes the group's
/// defaults when it has them, otherwise 0 for numbers and `unknown` for categories. Encoded
/// columns follow all numeric columns, in `categorical` order.
pub fn assemble(
    id_column: &str,
    entity_ids: &[String],
    groups: &[FeatureGroupTable],
    categorical: &[CategoricalSpec],
    labels: &Labels,
    simulated: &[&str],
) -> Result<(FeatureTable, FeatureManifest), AssemblyError> {
    let layout = column_layout(groups, categorical)?;

    let mut indexes: Vec<HashMap<&str, &FeatureSet>> = Vec::with_capacity(groups.len());
    let master: HashSet<&str> = entity_ids.iter().map(String::as_str).collect();
    for group in groups {
        let mut index = HashMap::with_capacity(group.rows.len());
        for (entity_id, set) in &group.rows {
            if index.insert(entity_id.as_str(), set).is_some() {
                return Err(AssemblyError::DuplicateEntity {
                    group: group.group.to_string(),
                    entity_id: entity_id.clone(),
                });
            }
        }
        let outside_master = index.keys().filter(|id| !master.contains(*id)).count();
        if outside_master > 0 {
            debug!(
                component = "assembly",
                event = "assembly.rows.outside_master",
                group = group.group,
                rows = outside_master
            );
        }
        indexes.push(index);
    }

    let mut numeric_rows: Vec<Vec<f64>> = Vec::with_capacity(entity_ids.len());
    let mut category_rows: Vec<Vec<String>> = Vec::with_capacity(entity_ids.len());
    for entity_id in entity_ids {
        let mut numbers = Vec::with_capacity(layout.numeric.len());
        for (column, group_idx) in &layout.numeric {
            let found = lookup(groups, &indexes, *group_idx, entity_id).and_then(|set| set.get(column));
            let value = match found {
                Some(FeatureValue::Number(value)) => *value,
                Some(FeatureValue::Category(value)) => {
                    return Err(AssemblyError::UndeclaredCategory {
                        column: column.to_string(),
                        entity_id: entity_id.clone(),
                        value: value.clone(),
                    })
                }
                None => 0.0,
            };
            numbers.push(value);
        }

        let mut categories = Vec::with_capacity(categorical.len());
        for (spec, group_idx) in categorical.iter().zip(&layout.categorical) {
            let found =
                lookup(groups, &indexes, *group_idx, entity_id).and_then(|set| set.get(&spec.column));
            let value = match found {
                Some(FeatureValue::Category(value)) => value.clone(),
                Some(FeatureValue::Number(_)) => {
                    return Err(AssemblyError::NumberInCategoricalColumn {
                        column: spec.column.clone(),
                        entity_id: entity_id.clone(),
                    })
                }
                None => UNKNOWN_CATEGORY.to_string(),
            };
            categories.push(value);
        }

        numeric_rows.push(numbers);
        category_rows.push(categories);
    }

    let mut columns: Vec<String> = layout
        .numeric
        .iter()
        .map(|(name, _)| name.to_string())
        .collect();
    let mut taken: HashSet<String> = columns.iter().cloned().collect();
    let mut vocabularies: Vec<Vec<String>> = Vec::with_capacity(categorical.len());
    let mut encoded_columns = Vec::new();
    for (spec_idx, spec) in categorical.iter().enumerate() {
        let vocabulary: Vec<String> = match &spec.categories {
            Some(fixed) => fixed.clone(),
            None => category_rows
                .iter()
                .map(|row| row[spec_idx].clone())
                .collect::<BTreeSet<_>>()
                .into_iter()
                .collect(),
        };
        for category in &vocabulary {
            let column = format!("{}_{}", spec.prefix, category);
            if !taken.insert(column.clone()) {
                return Err(AssemblyError::DuplicateColumn {
                    column,
                    first: "numeric".to_string(),
                    second: spec.column.clone(),
                });
            }
            encoded_columns.push(column.clone());
            columns.push(column);
        }
        vocabularies.push(vocabulary);
    }

    let mut rows = Vec::with_capacity(entity_ids.len());
    let mut out_of_vocabulary = 0_usize;
    for (numbers, categories) in numeric_rows.into_iter().zip(&category_rows) {
        let mut row = numbers;
        row.reserve(encoded_columns.len());
        for (vocabulary, value) in vocabularies.iter().zip(categories) {
            let mut hit = false;
            for category in vocabulary {
                let is_match = category == value;
                hit |= is_match;
                row.push(if is_match { 1.0 } else { 0.0 });
            }
            if !hit {
                out_of_vocabulary += 1;
            }
        }
        rows.push(row);
    }
    if out_of_vocabulary > 0 {
        warn!(
            component = "assembly",
            event = "assembly.encode.out_of_vocabulary",
            cells = out_of_vocabulary
        );
    }

    let targets = entity_ids
        .iter()
        .map(|entity_id| labels.values.get(entity_id).copied())
        .collect();

    let simulated_columns = simulated
        .iter()
        .filter(|name| taken.contains(**name))
        .map(|name| name.to_string())
        .collect();
    let manifest = FeatureManifest::new(
        columns.clone(),
        labels.column.clone(),
        categorical.iter().map(|spec| spec.column.clone()).collect(),
        simulated_columns,
    );

    info!(
        component = "assembly",
        event = "assembly.finish",
        entities = entity_ids.len(),
        groups = groups.len(),
        columns = columns.len(),
        encoded = encoded_columns.len()
    );

    Ok((
        FeatureTable {
            id_column: id_column.to_string(),
            columns,
            entity_ids: entity_ids.to_vec(),
            rows,
            target_column: labels.column.clone(),
            targets,
        },
        manifest,
    ))
}
