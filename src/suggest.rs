//! Autocomplete aggregation.
//!
//! Merges four candidate sources — the engine's own completer, table and
//! column names from the catalog, and static keyword/function lists — scores
//! them against the token under the cursor, and deduplicates
//! case-insensitively on the upper-cased canonical form. Sources degrade
//! independently: a failed catalog probe just means fewer candidates.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::Arc;

use arrow_array::{Array, StringArray};
use futures::StreamExt;
use serde::Serialize;
use tracing::debug;

use crate::cancel::CancelToken;
use crate::exec::StreamingExecutor;
use crate::types::QueryParam;

const ENGINE_SQL: &str = "SELECT suggestion FROM sql_auto_complete(?)";
const TABLES_SQL: &str = "SELECT table_name FROM information_schema.tables \
     WHERE table_name ILIKE ? ORDER BY table_name";
const COLUMNS_SQL: &str = "SELECT DISTINCT column_name FROM information_schema.columns \
     WHERE column_name ILIKE ?";

const KEYWORDS: &[&str] = &[
    "SELECT", "FROM", "WHERE", "GROUP", "BY", "ORDER", "HAVING", "LIMIT", "OFFSET", "JOIN",
    "INNER", "LEFT", "RIGHT", "FULL", "OUTER", "CROSS", "ON", "USING", "AS", "DISTINCT", "ALL",
    "UNION", "EXCEPT", "INTERSECT", "WITH", "RECURSIVE", "INSERT", "INTO", "VALUES", "UPDATE",
    "SET", "DELETE", "CREATE", "TABLE", "VIEW", "DROP", "ALTER", "AND", "OR", "NOT", "NULL",
    "IS", "IN", "EXISTS", "BETWEEN", "LIKE", "ILIKE", "CASE", "WHEN", "THEN", "ELSE", "END",
    "ASC", "DESC", "PRIMARY", "KEY", "DEFAULT", "TRUE", "FALSE", "COPY", "TO", "PRAGMA",
    "EXPLAIN", "ANALYZE", "DESCRIBE", "SHOW",
];

const FUNCTIONS: &[&str] = &[
    "COUNT", "SUM", "AVG", "MIN", "MAX", "COALESCE", "NULLIF", "ABS", "ROUND", "FLOOR", "CEIL",
    "LENGTH", "LOWER", "UPPER", "TRIM", "LTRIM", "RTRIM", "REPLACE", "SUBSTRING", "CONCAT",
    "SPLIT_PART", "REGEXP_MATCHES", "REGEXP_REPLACE", "DATE_TRUNC", "DATE_PART", "STRFTIME",
    "STRPTIME", "NOW", "CURRENT_DATE", "CURRENT_TIMESTAMP", "EXTRACT", "CAST", "TRY_CAST",
    "ROW_NUMBER", "RANK", "DENSE_RANK", "LAG", "LEAD", "FIRST_VALUE", "LAST_VALUE", "UNNEST",
    "GENERATE_SERIES", "READ_CSV", "READ_PARQUET", "READ_JSON",
];

/// One ranked completion candidate. `text` is always the upper-cased
/// canonical form.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Suggestion {
    pub text: String,
    pub kind: SuggestionKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SuggestionKind {
    Keyword,
    Function,
    Table,
    Column,
    Engine,
}

struct SuggestInner {
    exec: StreamingExecutor,
    limit: usize,
}

#[derive(Clone)]
pub struct Autocomplete {
    inner: Arc<SuggestInner>,
}

impl Autocomplete {
    pub fn new(exec: StreamingExecutor, limit: usize) -> Self {
        Self {
            inner: Arc::new(SuggestInner { exec, limit }),
        }
    }

    /// Rank completions for the token under the cursor.
    ///
    /// `partial` is the token being typed; `full_text` is the whole statement,
    /// which the engine's completer uses for context. A fired cancel token
    /// returns no suggestions at all.
    pub async fn suggest(
        &self,
        partial: &str,
        full_text: &str,
        cancel: Option<&CancelToken>,
    ) -> Vec<Suggestion> {
        match cancel {
            Some(token) => {
                tokio::select! {
                    biased;
                    _ = token.cancelled() => Vec::new(),
                    suggestions = self.gather(partial, full_text) => suggestions,
                }
            }
            None => self.gather(partial, full_text).await,
        }
    }

    async fn gather(&self, partial: &str, full_text: &str) -> Vec<Suggestion> {
        let pattern = format!("%{partial}%");
        let (engine, tables, columns) = tokio::join!(
            self.collect_strings(ENGINE_SQL, &[QueryParam::from(full_text)]),
            self.collect_strings(TABLES_SQL, &[QueryParam::Text(pattern.clone())]),
            self.collect_strings(COLUMNS_SQL, &[QueryParam::Text(pattern.clone())]),
        );

        let mut merged: HashMap<String, (i64, SuggestionKind)> = HashMap::new();
        for text in &engine {
            add_candidate(&mut merged, partial, text, SuggestionKind::Engine);
        }
        for text in &tables {
            add_candidate(&mut merged, partial, text, SuggestionKind::Table);
        }
        for text in &columns {
            add_candidate(&mut merged, partial, text, SuggestionKind::Column);
        }
        for text in KEYWORDS {
            add_candidate(&mut merged, partial, text, SuggestionKind::Keyword);
        }
        for text in FUNCTIONS {
            add_candidate(&mut merged, partial, text, SuggestionKind::Function);
        }

        let mut ranked: Vec<(i64, Suggestion)> = merged
            .into_iter()
            .map(|(text, (score, kind))| (score, Suggestion { text, kind }))
            .collect();
        ranked.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| a.1.text.cmp(&b.1.text)));
        ranked.truncate(self.inner.limit);
        ranked.into_iter().map(|(_, suggestion)| suggestion).collect()
    }

    /// Stream the first column of `sql` as strings, treating any failure as
    /// an empty source.
    async fn collect_strings(&self, sql: &str, params: &[QueryParam]) -> Vec<String> {
        let mut out = Vec::new();
        let mut stream = match self.inner.exec.run(sql, params).await {
            Ok(stream) => stream,
            Err(err) => {
                debug!(error = %err, "suggestion source unavailable");
                return out;
            }
        };
        while let Some(batch) = stream.next().await {
            let batch = match batch {
                Ok(batch) => batch,
                Err(err) => {
                    debug!(error = %err, "suggestion source failed mid-stream");
                    break;
                }
            };
            if batch.num_columns() == 0 {
                continue;
            }
            let Some(column) = batch.column(0).as_any().downcast_ref::<StringArray>() else {
                continue;
            };
            for i in 0..column.len() {
                if !column.is_null(i) {
                    out.push(column.value(i).to_string());
                }
            }
        }
        out
    }
}

fn add_candidate(
    merged: &mut HashMap<String, (i64, SuggestionKind)>,
    partial: &str,
    text: &str,
    kind: SuggestionKind,
) {
    // Engine completers pad candidates with trailing whitespace.
    let text = text.trim();
    if text.is_empty() {
        return;
    }
    let Some(score) = fuzzy_score(partial, text) else {
        return;
    };
    match merged.entry(text.to_uppercase()) {
        Entry::Occupied(mut slot) => {
            if score > slot.get().0 {
                *slot.get_mut() = (score, kind);
            }
        }
        Entry::Vacant(slot) => {
            slot.insert((score, kind));
        }
    }
}

/// Case-insensitive match quality: exact beats prefix beats substring beats
/// subsequence, with longer candidates docked inside each band. `None`
/// means no match at all.
fn fuzzy_score(pattern: &str, candidate: &str) -> Option<i64> {
    if pattern.is_empty() {
        return Some(0);
    }
    let pattern = pattern.to_uppercase();
    let candidate = candidate.to_uppercase();
    let penalty = candidate.len().min(50) as i64;
    if candidate == pattern {
        return Some(1000);
    }
    if candidate.starts_with(&pattern) {
        return Some(800 - penalty);
    }
    if candidate.contains(&pattern) {
        return Some(500 - penalty);
    }
    let mut chars = candidate.chars();
    if pattern.chars().all(|p| chars.any(|c| c == p)) {
        return Some(100 - penalty);
    }
    None
}
