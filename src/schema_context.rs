//! Schema context for the weekly HTS table
//!
//! Column descriptions come from a CSV data dictionary keyed by
//! `parent + name`. The dictionary is rendered as a Python dict literal and
//! appended to a fixed narrative; the prompt wording was tuned against that
//! exact text, so the rendering is kept byte-compatible.

use crate::error::{QueryError, Result};
use csv::ReaderBuilder;
use std::collections::HashMap;
use std::path::Path;
use tracing::{debug, warn};

/// Narrative description of the HTS tables. The sentences are joined
/// without separators on purpose.
pub const HTS_TABLE_TEXT: &str = concat!(
    "This table gives information regarding HIV Testing Services (HTS).",
    "Users may ask about positive tests and positivity rates. Positive tests are those where finalhivtestresult is positive. Negative tests are those where finalhivtestresult is negative or missing or null",
    "If a user asks about positivity rate (or similar), calculate it as the number of positive tests divided by the total number of tests for the specified group",
);

/// One dictionary row: every CSV field in header order
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnDescriptor {
    pub fields: Vec<(String, Option<String>)>,
}

#[cfg(test)]
impl ColumnDescriptor {
    fn get(&self, field: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(name, _)| name == field)
            .and_then(|(_, value)| value.as_deref())
    }

    fn description(&self) -> Option<&str> {
        self.get("description")
    }
}

/// Column dictionary in first-insertion key order
#[derive(Debug, Clone, Default)]
pub struct DataDictionary {
    order: Vec<String>,
    entries: HashMap<String, ColumnDescriptor>,
}

impl DataDictionary {
    /// Load the dictionary from a CSV file with a header row.
    pub fn load(path: &Path) -> Result<Self> {
        let mut reader = ReaderBuilder::new()
            .flexible(true)
            .from_path(path)
            .map_err(|e| QueryError::DictionaryLoad(format!("{}: {}", path.display(), e)))?;

        let headers: Vec<String> = reader
            .headers()
            .map_err(|e| QueryError::DictionaryLoad(format!("{}: {}", path.display(), e)))?
            .iter()
            .map(|h| h.to_string())
            .collect();

        let column_index = |wanted: &str| {
            headers.iter().position(|h| h == wanted).ok_or_else(|| {
                QueryError::DictionaryLoad(format!("{} has no '{}' column", path.display(), wanted))
            })
        };
        let parent_idx = column_index("parent")?;
        let name_idx = column_index("name")?;

        let mut dictionary = DataDictionary::default();
        for (line, record) in reader.records().enumerate() {
            let record = record.map_err(|e| QueryError::DictionaryLoad(format!("{}: {}", path.display(), e)))?;
            if record.len() > headers.len() {
                warn!(row = line + 1, "Dictionary row has extra fields; ignoring them");
            }

            let (parent, name) = match (record.get(parent_idx), record.get(name_idx)) {
                (Some(parent), Some(name)) => (parent, name),
                _ => {
                    return Err(QueryError::DictionaryLoad(format!(
                        "{}: row {} is missing parent or name",
                        path.display(),
                        line + 1
                    )))
                }
            };

            let fields = headers
                .iter()
                .enumerate()
                .map(|(i, header)| (header.clone(), record.get(i).map(|v| v.to_string())))
                .collect();
            dictionary.insert(format!("{}{}", parent, name), ColumnDescriptor { fields });
        }

        if dictionary.is_empty() {
            warn!(path = %path.display(), "Data dictionary has no entries");
        }
        debug!(path = %path.display(), entries = dictionary.len(), "Loaded data dictionary");
        Ok(dictionary)
    }

    /// Insert or overwrite; an overwritten key keeps its original position.
    pub fn insert(&mut self, key: String, descriptor: ColumnDescriptor) {
        if self.entries.insert(key.clone(), descriptor).is_none() {
            self.order.push(key);
        }
    }

    #[cfg(test)]
    fn get(&self, key: &str) -> Option<&ColumnDescriptor> {
        self.entries.get(key)
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Render as a Python dict literal, e.g. `{'key': {'col': 'value'}}`.
    pub fn to_python_repr(&self) -> String {
        let entries: Vec<String> = self
            .order
            .iter()
            .filter_map(|key| self.entries.get(key).map(|d| (key, d)))
            .map(|(key, descriptor)| {
                let fields: Vec<String> = descriptor
                    .fields
                    .iter()
                    .map(|(name, value)| {
                        let value = value.as_deref().map(py_repr_str).unwrap_or_else(|| "None".to_string());
                        format!("{}: {}", py_repr_str(name), value)
                    })
                    .collect();
                format!("{}: {{{}}}", py_repr_str(key), fields.join(", "))
            })
            .collect();
        format!("{{{}}}", entries.join(", "))
    }
}

/// Quote a string the way Python's `repr` does.
fn py_repr_str(s: &str) -> String {
    let quote = if s.contains('\'') && !s.contains('"') { '"' } else { '\'' };
    let mut out = String::with_capacity(s.len() + 2);
    out.push(quote);
    for ch in s.chars() {
        match ch {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if c == quote => {
                out.push('\\');
                out.push(c);
            }
            c if (c as u32) < 0x20 || c as u32 == 0x7f => out.push_str(&format!("\\x{:02x}", c as u32)),
            c => out.push(c),
        }
    }
    out.push(quote);
    out
}

/// Full table context handed to the synthesizer. The dictionary is re-read
/// on every call.
pub fn build_context(table_name: &str, dictionary_path: &Path) -> Result<String> {
    let dictionary = DataDictionary::load(dictionary_path)?;
    debug!(table = %table_name, entries = dictionary.len(), "Built schema context");
    Ok(context_from(&dictionary))
}

pub fn context_from(dictionary: &DataDictionary) -> String {
    format!(
        "description of the table: {}. These are columns in the table and their descriptions: {}",
        HTS_TABLE_TEXT,
        dictionary.to_python_repr()
    )
}
