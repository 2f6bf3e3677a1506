//! Uploaded event files: parsing (CSV, JSON, XLSX), the validation gate, and conversion to events.

use std::collections::{BTreeMap, HashSet};
use std::io::{Cursor, Read};

use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tracing::{info, warn};
use zip::ZipArchive;

use crate::events::{is_null_text, parse_optional_f64, parse_timestamp, Event};

pub const REQUIRED_UPLOAD_COLUMNS: [&str; 3] = ["user_id", "event_timestamp", "event_type"];
pub const SESSION_DURATION_COLUMNS: [&str; 2] = ["session_duration", "session_duration_seconds"];
pub const MIN_UPLOAD_ROWS: usize = 100;
pub const MIN_UPLOAD_USERS: usize = 10;
pub const MAX_UPLOAD_BYTES: usize = 50 * 1024 * 1024;
/// Decompressed size limit for a single workbook part.
const MAX_XLSX_ENTRY_BYTES: usize = 4 * MAX_UPLOAD_BYTES;
/// Zero-based index of column XFD, the last column a worksheet can hold.
const MAX_XLSX_COLUMN_INDEX: usize = 16_383;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum UploadFormat {
    Csv,
    Xlsx,
    Json,
}

impl UploadFormat {
    pub fn from_filename(filename: &str) -> Result<Self, UploadError> {
        let extension = filename
            .rsplit_once('.')
            .map(|(_, ext)| ext.to_ascii_lowercase())
            .unwrap_or_default();
        match extension.as_str() {
            "csv" => Ok(Self::Csv),
            "xlsx" => Ok(Self::Xlsx),
            "json" => Ok(Self::Json),
            _ => Err(UploadError::UnsupportedFileType(format!(".{extension}"))),
        }
    }
}

#[derive(Debug, Error)]
pub enum UploadError {
    #[error("unsupported file type: {0}")]
    UnsupportedFileType(String),
    #[error("file too large: {size} bytes (max {limit})")]
    TooLarge { size: usize, limit: usize },
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("zip error: {0}")]
    Zip(#[from] zip::result::ZipError),
    #[error("JSON upload must be an array of records or an object of columns")]
    UnsupportedJsonShape,
    #[error("workbook has no worksheet")]
    MissingWorksheet,
    #[error("invalid cell reference '{0}'")]
    InvalidCellReference(String),
}

/// Column-oriented view of an uploaded file. Null cells are `None`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawTable {
    columns: Vec<String>,
    rows: Vec<Vec<Option<String>>>,
}

impl RawTable {
    pub fn new<I, S>(columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            columns: columns.into_iter().map(Into::into).collect(),
            rows: Vec::new(),
        }
    }

    /// Short rows are padded with nulls; extra cells are dropped.
    pub fn push_row<I, S>(&mut self, cells: I)
    where
        I: IntoIterator<Item = Option<S>>,
        S: Into<String>,
    {
        let mut row: Vec<Option<String>> = cells
            .into_iter()
            .take(self.columns.len())
            .map(|cell| cell.map(Into::into).and_then(normalize_cell))
            .collect();
        row.resize(self.columns.len(), None);
        self.rows.push(row);
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.column_index(name).is_some()
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|column| column == name)
    }

    pub fn value(&self, row: usize, column: &str) -> Option<&str> {
        let idx = self.column_index(column)?;
        self.rows.get(row)?.get(idx)?.as_deref()
    }

    /// Every cell of `column` in row order, or `None` when the column is absent.
    pub fn column_values<'a>(
        &'a self,
        column: &str,
    ) -> Option<impl Iterator<Item = Option<&'a str>> + 'a> {
        let idx = self.column_index(column)?;
        Some(self.rows.iter().map(move |row| row[idx].as_deref()))
    }
}

fn normalize_cell(raw: String) -> Option<String> {
    let trimmed = raw.trim();
    if is_null_text(trimmed) {
        None
    } else {
        Some(trimmed.to_string())
    }
}

/// Applies the file-type gate and size limit, then parses by extension.
pub fn parse_upload(filename: &str, bytes: &[u8]) -> Result<RawTable, UploadError> {
    let format = UploadFormat::from_filename(filename)?;
    if bytes.len() > MAX_UPLOAD_BYTES {
        return Err(UploadError::TooLarge {
            size: bytes.len(),
            limit: MAX_UPLOAD_BYTES,
        });
    }

    let table = match format {
        UploadFormat::Csv => parse_csv(bytes)?,
        UploadFormat::Json => parse_json(bytes)?,
        UploadFormat::Xlsx => parse_xlsx(bytes)?,
    };
    info!(
        component = "upload",
        event = "upload.parsed",
        filename = filename,
        format = ?format,
        bytes = bytes.len(),
        rows = table.len(),
        columns = table.columns().len()
    );
    Ok(table)
}

pub fn parse_csv(bytes: &[u8]) -> Result<RawTable, UploadError> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(bytes);
    let headers = reader.headers()?.clone();
    let mut table = RawTable::new(headers.iter());
    for record in reader.records() {
        let record = record?;
        table.push_row(record.iter().map(Some));
    }
    Ok(table)
}

/// Accepts an array of records, or an object of columns whose values are arrays or
/// index-keyed objects.
pub fn parse_json(bytes: &[u8]) -> Result<RawTable, UploadError> {
    match serde_json::from_slice::<Value>(bytes)? {
        Value::Array(records) => {
            let mut columns: Vec<String> = Vec::new();
            for record in &records {
                let Value::Object(fields) = record else {
                    return Err(UploadError::UnsupportedJsonShape);
                };
                for key in fields.keys() {
                    if !columns.contains(key) {
                        columns.push(key.clone());
                    }
                }
            }
            let mut table = RawTable::new(columns.clone());
            for record in &records {
                table.push_row(
                    columns
                        .iter()
                        .map(|column| record.get(column).and_then(json_cell)),
                );
            }
            Ok(table)
        }
        Value::Object(by_column) => {
            let mut columns = Vec::with_capacity(by_column.len());
            let mut cells: Vec<Vec<Option<String>>> = Vec::with_capacity(by_column.len());
            for (column, values) in by_column {
                let values = match values {
                    Value::Array(items) => items.iter().map(json_cell).collect(),
                    Value::Object(by_index) => {
                        let mut indexed: Vec<(u64, Option<String>)> = by_index
                            .iter()
                            .map(|(idx, value)| (idx.parse().unwrap_or(u64::MAX), json_cell(value)))
                            .collect();
                        indexed.sort_by_key(|(idx, _)| *idx);
                        indexed.into_iter().map(|(_, cell)| cell).collect()
                    }
                    _ => return Err(UploadError::UnsupportedJsonShape),
                };
                columns.push(column);
                cells.push(values);
            }

            let height = cells.iter().map(Vec::len).max().unwrap_or(0);
            let mut table = RawTable::new(columns);
            for row in 0..height {
                table.push_row(cells.iter().map(|column| column.get(row).cloned().flatten()));
            }
            Ok(table)
        }
        _ => Err(UploadError::UnsupportedJsonShape),
    }
}

fn json_cell(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(text) => Some(text.clone()),
        Value::Bool(flag) => Some(flag.to_string()),
        Value::Number(number) => Some(number.to_string()),
        other => Some(other.to_string()),
    }
}

/// Reads the first worksheet. Shared strings, inline strings and plain values are supported;
/// numeric `event_timestamp` cells are treated as Excel serial dates.
pub fn parse_xlsx(bytes: &[u8]) -> Result<RawTable, UploadError> {
    let mut archive = ZipArchive::new(Cursor::new(bytes))?;

    let shared_strings = match read_entry(&mut archive, "xl/sharedStrings.xml", MAX_XLSX_ENTRY_BYTES)? {
        Some(xml) => elements(&xml, "si")
            .into_iter()
            .map(|(_, inner)| text_runs(inner))
            .collect(),
        None => Vec::new(),
    };

    let sheet_name = first_worksheet(&archive).ok_or(UploadError::MissingWorksheet)?;
    let sheet = read_entry(&mut archive, &sheet_name, MAX_XLSX_ENTRY_BYTES)?
        .ok_or(UploadError::MissingWorksheet)?;

    let mut grid: Vec<BTreeMap<usize, (String, bool)>> = Vec::new();
    for (_, row_xml) in elements(&sheet, "row") {
        let mut row = BTreeMap::new();
        let mut next_col = 0;
        for (attrs, inner) in elements(row_xml, "c") {
            let col = match attr(attrs, "r") {
                Some(reference) => column_index_of(reference)?,
                None if next_col > MAX_XLSX_COLUMN_INDEX => {
                    return Err(UploadError::InvalidCellReference(format!(
                        "implicit column {}",
                        next_col + 1
                    )));
                }
                None => next_col,
            };
            next_col = col + 1;
            let cell_type = attr(attrs, "t").unwrap_or("n");
            let value = match cell_type {
                "s" => first_text(inner, "v")
                    .and_then(|idx| idx.trim().parse::<usize>().ok())
                    .and_then(|idx| shared_strings.get(idx).cloned()),
                "inlineStr" => elements(inner, "is")
                    .first()
                    .map(|(_, is)| text_runs(is)),
                _ => first_text(inner, "v").map(unescape),
            };
            if let Some(value) = value {
                row.insert(col, (value, cell_type == "n"));
            }
        }
        grid.push(row);
    }

    let mut rows = grid.into_iter();
    let Some(header) = rows.next() else {
        return Ok(RawTable::default());
    };
    let width = header.keys().next_back().map_or(0, |last| last + 1);
    let columns: Vec<String> = (0..width)
        .map(|col| {
            header
                .get(&col)
                .map(|(name, _)| name.clone())
                .unwrap_or_else(|| format!("column_{}", col + 1))
        })
        .collect();
    let timestamp_col = columns.iter().position(|c| c == "event_timestamp");

    let mut table = RawTable::new(columns);
    for mut row in rows {
        if let Some(ts_col) = timestamp_col {
            let serial = match row.get(&ts_col) {
                Some((value, true)) => value.parse::<f64>().ok().and_then(excel_serial_to_timestamp),
                _ => None,
            };
            if let Some(ts) = serial {
                row.insert(ts_col, (ts.to_rfc3339(), false));
            }
        }
        table.push_row((0..width).map(|col| row.remove(&col).map(|(value, _)| value)));
    }
    Ok(table)
}

fn read_entry<R: Read + std::io::Seek>(
    archive: &mut ZipArchive<R>,
    name: &str,
    limit: usize,
) -> Result<Option<String>, UploadError> {
    let mut entry = match archive.by_name(name) {
        Ok(entry) => entry,
        Err(zip::result::ZipError::FileNotFound) => return Ok(None),
        Err(err) => return Err(err.into()),
    };
    let mut xml = String::new();
    entry
        .by_ref()
        .take(limit as u64 + 1)
        .read_to_string(&mut xml)?;
    if xml.len() > limit {
        return Err(UploadError::TooLarge {
            size: xml.len(),
            limit,
        });
    }
    Ok(Some(xml))
}

fn first_worksheet<R: Read + std::io::Seek>(archive: &ZipArchive<R>) -> Option<String> {
    let mut sheets: Vec<&str> = archive
        .file_names()
        .filter(|name| name.starts_with("xl/worksheets/") && name.ends_with(".xml"))
        .filter(|name| !name.contains("/_rels/"))
        .collect();
    // sheet2.xml sorts after sheet10.xml lexically, so order by the numeric suffix.
    sheets.sort_by_key(|name| {
        let digits: String = name.chars().filter(char::is_ascii_digit).collect();
        (digits.parse::<u64>().unwrap_or(u64::MAX), name.to_string())
    });
    sheets.first().map(|name| name.to_string())
}

/// `(attributes, inner)` of every non-nested `<tag>` element, including self-closing ones.
fn elements<'a>(xml: &'a str, tag: &str) -> Vec<(&'a str, &'a str)> {
    let open = format!("<{tag}");
    let close = format!("</{tag}>");
    let mut found = Vec::new();
    let mut rest = xml;
    while let Some(start) = rest.find(&open) {
        let after = &rest[start + open.len()..];
        let boundary = after.chars().next();
        if !matches!(boundary, Some(' ' | '>' | '/' | '\t' | '\n' | '\r')) {
            rest = after;
            continue;
        }
        let Some(tag_end) = after.find('>') else {
            break;
        };
        let attrs = &after[..tag_end];
        if let Some(attrs) = attrs.strip_suffix('/') {
            found.push((attrs, ""));
            rest = &after[tag_end + 1..];
            continue;
        }
        let body = &after[tag_end + 1..];
        let Some(body_end) = body.find(&close) else {
            break;
        };
        found.push((attrs, &body[..body_end]));
        rest = &body[body_end + close.len()..];
    }
    found
}

fn attr<'a>(attrs: &'a str, name: &str) -> Option<&'a str> {
    let needle = format!("{name}=\"");
    let mut offset = 0;
    while let Some(pos) = attrs[offset..].find(&needle) {
        let start = offset + pos;
        let preceded_by_space = start == 0
            || attrs[..start]
                .chars()
                .next_back()
                .is_some_and(char::is_whitespace);
        let value_start = start + needle.len();
        if preceded_by_space {
            let value_len = attrs[value_start..].find('"')?;
            return Some(&attrs[value_start..value_start + value_len]);
        }
        offset = value_start;
    }
    None
}

fn first_text<'a>(xml: &'a str, tag: &str) -> Option<&'a str> {
    elements(xml, tag).first().map(|(_, inner)| *inner)
}

fn text_runs(xml: &str) -> String {
    elements(xml, "t")
        .into_iter()
        .map(|(_, text)| unescape(text))
        .collect()
}

/// Decodes the predefined XML entities and numeric character references in one pass, so
/// `&amp;lt;` stays `&lt;`. Unrecognised references are kept verbatim.
fn unescape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(amp) = rest.find('&') {
        out.push_str(&rest[..amp]);
        let tail = &rest[amp..];
        let decoded = tail
            .find(';')
            .and_then(|semi| entity_char(&tail[1..semi]).map(|ch| (ch, semi)));
        match decoded {
            Some((ch, semi)) => {
                out.push(ch);
                rest = &tail[semi + 1..];
            }
            None => {
                out.push('&');
                rest = &tail[1..];
            }
        }
    }
    out.push_str(rest);
    out
}

fn entity_char(name: &str) -> Option<char> {
    match name {
        "lt" => Some('<'),
        "gt" => Some('>'),
        "quot" => Some('"'),
        "apos" => Some('\''),
        "amp" => Some('&'),
        _ => {
            let code = match name.strip_prefix('#')? {
                hex if hex.starts_with(['x', 'X']) => u32::from_str_radix(&hex[1..], 16).ok()?,
                dec => dec.parse::<u32>().ok()?,
            };
            char::from_u32(code)
        }
    }
}

fn column_index_of(reference: &str) -> Result<usize, UploadError> {
    let invalid = || UploadError::InvalidCellReference(reference.to_string());
    let letters: String = reference
        .chars()
        .take_while(char::is_ascii_alphabetic)
        .collect();
    if letters.is_empty() {
        return Err(invalid());
    }
    let number = letters
        .to_ascii_uppercase()
        .bytes()
        .try_fold(0_usize, |acc, b| {
            acc.checked_mul(26)?.checked_add(usize::from(b - b'A' + 1))
        })
        .ok_or_else(invalid)?;
    match number - 1 {
        index if index <= MAX_XLSX_COLUMN_INDEX => Ok(index),
        _ => Err(invalid()),
    }
}

fn excel_serial_to_timestamp(serial: f64) -> Option<DateTime<Utc>> {
    if !(1.0..2_958_466.0).contains(&serial) {
        return None;
    }
    let epoch = NaiveDate::from_ymd_opt(1899, 12, 30)?.and_hms_opt(0, 0, 0)?;
    let millis = (serial * 86_400_000.0).round() as i64;
    Some((epoch + Duration::milliseconds(millis)).and_utc())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum IssueKind {
    Schema,
    Volume,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationIssue {
    #[error("missing required columns: {}", .0.join(", "))]
    MissingColumns(Vec<String>),
    #[error("column '{column}' has {count} null values")]
    NullValues { column: String, count: usize },
    #[error("insufficient data: {rows} events (minimum {min})")]
    InsufficientRows { rows: usize, min: usize },
    #[error("insufficient users: {users} (minimum {min})")]
    InsufficientUsers { users: usize, min: usize },
}

impl ValidationIssue {
    pub fn kind(&self) -> IssueKind {
        match self {
            Self::MissingColumns(_) | Self::NullValues { .. } => IssueKind::Schema,
            Self::InsufficientRows { .. } | Self::InsufficientUsers { .. } => IssueKind::Volume,
        }
    }
}

/// Every violated rule, not just the first.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("upload rejected with {} validation error(s)", .errors.len())]
pub struct ValidationFailure {
    pub errors: Vec<ValidationIssue>,
    pub warnings: Vec<String>,
}

impl ValidationFailure {
    pub fn has_kind(&self, kind: IssueKind) -> bool {
        self.errors.iter().any(|issue| issue.kind() == kind)
    }

    pub fn error_messages(&self) -> Vec<String> {
        self.errors.iter().map(ToString::to_string).collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ValidationReport {
    pub rows: usize,
    pub unique_users: usize,
    pub warnings: Vec<String>,
}

pub fn validate(table: &RawTable) -> Result<ValidationReport, ValidationFailure> {
    let mut errors = Vec::new();
    let mut warnings = Vec::new();

    let missing: Vec<String> = REQUIRED_UPLOAD_COLUMNS
        .iter()
        .filter(|column| !table.has_column(column))
        .map(|column| column.to_string())
        .collect();
    if !missing.is_empty() {
        errors.push(ValidationIssue::MissingColumns(missing));
    }

    for column in REQUIRED_UPLOAD_COLUMNS {
        if let Some(values) = table.column_values(column) {
            let count = values.filter(Option::is_none).count();
            if count > 0 {
                errors.push(ValidationIssue::NullValues {
                    column: column.to_string(),
                    count,
                });
            }
        }
    }

    if let Some(values) = table.column_values("event_timestamp") {
        let unparseable = values
            .flatten()
            .filter(|raw| parse_timestamp(raw).is_none())
            .count();
        if unparseable > 0 {
            warnings.push(format!(
                "{unparseable} event_timestamp values could not be parsed and will be dropped"
            ));
        }
    }

    if table.len() < MIN_UPLOAD_ROWS {
        errors.push(ValidationIssue::InsufficientRows {
            rows: table.len(),
            min: MIN_UPLOAD_ROWS,
        });
    }

    let unique_users = table
        .column_values("user_id")
        .map(|values| values.flatten().collect::<HashSet<_>>().len())
        .unwrap_or(0);
    if unique_users < MIN_UPLOAD_USERS {
        errors.push(ValidationIssue::InsufficientUsers {
            users: unique_users,
            min: MIN_UPLOAD_USERS,
        });
    }

    let mut missing_optional = Vec::new();
    if !SESSION_DURATION_COLUMNS.iter().any(|c| table.has_column(c)) {
        missing_optional.push("session_duration");
    }
    for column in ["donation_amount", "content_category"] {
        if !table.has_column(column) {
            missing_optional.push(column);
        }
    }
    if !missing_optional.is_empty() {
        warnings.push(format!(
            "optional columns missing (may reduce accuracy): {}",
            missing_optional.join(", ")
        ));
    }

    if errors.is_empty() {
        info!(
            component = "upload",
            event = "upload.validation.passed",
            rows = table.len(),
            unique_users = unique_users,
            warnings = warnings.len()
        );
        Ok(ValidationReport {
            rows: table.len(),
            unique_users,
            warnings,
        })
    } else {
        warn!(
            component = "upload",
            event = "upload.validation.failed",
            rows = table.len(),
            unique_users = unique_users,
            errors = errors.len()
        );
        Err(ValidationFailure { errors, warnings })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UploadSummary {
    pub total_events: usize,
    pub unique_users: usize,
    pub date_range: Option<(DateTime<Utc>, DateTime<Utc>)>,
    /// First-seen order.
    pub event_types: Vec<String>,
}

pub fn summarize(table: &RawTable) -> UploadSummary {
    let unique_users = table
        .column_values("user_id")
        .map(|values| values.flatten().collect::<HashSet<_>>().len())
        .unwrap_or(0);

    let date_range = table.column_values("event_timestamp").and_then(|values| {
        values
            .flatten()
            .filter_map(parse_timestamp)
            .fold(None, |range, ts| match range {
                None => Some((ts, ts)),
                Some((lo, hi)) => Some((ts.min(lo), ts.max(hi))),
            })
    });

    let mut event_types: Vec<String> = Vec::new();
    if let Some(values) = table.column_values("event_type") {
        for value in values.flatten() {
            if !event_types.iter().any(|seen| seen == value) {
                event_types.push(value.to_string());
            }
        }
    }

    UploadSummary {
        total_events: table.len(),
        unique_users,
        date_range,
        event_types,
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct UploadedEvents {
    pub events: Vec<Event>,
    pub has_session_duration: bool,
    pub has_donation_amount: bool,
    pub rows_dropped: usize,
}

/// Rows with a null user, type or unparseable timestamp are dropped; optional numeric cells
/// that do not parse become null.
pub fn table_to_events(table: &RawTable) -> UploadedEvents {
    let duration_column = SESSION_DURATION_COLUMNS
        .iter()
        .copied()
        .find(|column| table.has_column(column));
    let has_donation_amount = table.has_column("donation_amount");

    let mut uploaded = UploadedEvents {
        has_session_duration: duration_column.is_some(),
        has_donation_amount,
        ..UploadedEvents::default()
    };

    for row in 0..table.len() {
        let user_id = table.value(row, "user_id");
        let event_type = table.value(row, "event_type");
        let timestamp = table.value(row, "event_timestamp").and_then(parse_timestamp);
        let (Some(user_id), Some(event_type), Some(timestamp)) = (user_id, event_type, timestamp)
        else {
            uploaded.rows_dropped += 1;
            continue;
        };

        let mut event = Event::new(user_id, timestamp, event_type);
        if let Some(seconds) = duration_column
            .and_then(|column| table.value(row, column))
            .and_then(parse_optional_f64)
        {
            event = event.with_duration(seconds);
        }
        if let Some(amount) = table
            .value(row, "donation_amount")
            .and_then(parse_optional_f64)
        {
            event = event.with_donation(amount);
        }
        if let Some(category) = table.value(row, "content_category") {
            event = event.with_category(category);
        }
        uploaded.events.push(event);
    }

    if uploaded.rows_dropped > 0 {
        warn!(
            component = "upload",
            event = "upload.rows.dropped",
            rows_dropped = uploaded.rows_dropped,
            rows_kept = uploaded.events.len()
        );
    }
    uploaded
}
