//! Contact book helpers: email normalization and CSV import parsing.
//! Merging into the store happens in the engine; this module only turns
//! raw input into [`ClientSighting`]s.

use crate::limits::*;
use crate::model::{ClientSighting, ClientSource};

/// Lowercased, trimmed email used as the client key.
pub fn normalize_email(raw: &str) -> String {
    raw.trim().to_lowercase()
}

/// Cheap shape check: one `@`, something on both sides, a dot in the domain.
pub fn is_valid_email(email: &str) -> bool {
    if email.is_empty() || email.len() > MAX_EMAIL_LEN || email.chars().any(char::is_whitespace) {
        return false;
    }
    let Some((local, domain)) = email.split_once('@') else {
        return false;
    };
    !local.is_empty()
        && !domain.contains('@')
        && domain.contains('.')
        && !domain.starts_with('.')
        && !domain.ends_with('.')
}

fn clean(value: Option<&str>, max: usize) -> Option<String> {
    let v = value?.trim();
    if v.is_empty() {
        return None;
    }
    Some(v.chars().take(max).collect())
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ImportReport {
    /// New client records.
    pub imported: usize,
    /// Rows that matched an existing client.
    pub merged: usize,
    /// Rows without a usable email.
    pub skipped: usize,
}

#[derive(Debug)]
pub enum ImportError {
    Io(std::io::Error),
    MissingEmailColumn,
    UnterminatedQuote { line: usize },
    TooManyRows,
}

impl std::fmt::Display for ImportError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ImportError::Io(e) => write!(f, "cannot read import file: {e}"),
            ImportError::MissingEmailColumn => write!(f, "no email column in header"),
            ImportError::UnterminatedQuote { line } => {
                write!(f, "unterminated quoted field starting on line {line}")
            }
            ImportError::TooManyRows => write!(f, "more than {MAX_IMPORT_ROWS} rows"),
        }
    }
}

impl std::error::Error for ImportError {}

impl From<std::io::Error> for ImportError {
    fn from(e: std::io::Error) -> Self {
        ImportError::Io(e)
    }
}

/// Split CSV text into records. Handles quoted fields with embedded commas,
/// newlines and doubled quotes. Also accepts `;` when the header uses it.
pub fn parse_records(input: &str) -> Result<Vec<Vec<String>>, ImportError> {
    let input = input.strip_prefix('\u{feff}').unwrap_or(input);
    let first_line = input.lines().next().unwrap_or("");
    let delimiter = if first_line.matches(';').count() > first_line.matches(',').count() {
        ';'
    } else {
        ','
    };

    let mut records = Vec::new();
    let mut record = Vec::new();
    let mut field = String::new();
    let mut in_quotes = false;
    let mut quote_line = 0;
    let mut line = 1;
    let mut chars = input.chars().peekable();

    while let Some(c) = chars.next() {
        if in_quotes {
            match c {
                '"' if chars.peek() == Some(&'"') => {
                    chars.next();
                    field.push('"');
                }
                '"' => in_quotes = false,
                '\n' => {
                    line += 1;
                    field.push(c);
                }
                _ => field.push(c),
            }
            continue;
        }
        match c {
            '"' if field.is_empty() => {
                in_quotes = true;
                quote_line = line;
            }
            c if c == delimiter => record.push(std::mem::take(&mut field)),
            '\r' => {}
            '\n' => {
                line += 1;
                record.push(std::mem::take(&mut field));
                if record.iter().any(|f| !f.trim().is_empty()) {
                    records.push(std::mem::take(&mut record));
                } else {
                    record.clear();
                }
            }
            _ => field.push(c),
        }
    }
    if in_quotes {
        return Err(ImportError::UnterminatedQuote { line: quote_line });
    }
    if !field.is_empty() || !record.is_empty() {
        record.push(field);
        if record.iter().any(|f| !f.trim().is_empty()) {
            records.push(record);
        }
    }
    Ok(records)
}

fn column(header: &[String], aliases: &[&str]) -> Option<usize> {
    header.iter().position(|h| {
        let h = h.trim().to_lowercase();
        aliases.contains(&h.as_str())
    })
}

/// Parsed CSV import: usable sightings plus the count of rows without an email.
#[derive(Debug, Default)]
pub struct CsvImport {
    pub sightings: Vec<ClientSighting>,
    pub skipped: usize,
}

/// Turn a contacts CSV into sightings. The header row must name an email
/// column; name and phone columns are optional.
pub fn parse_csv(input: &str) -> Result<CsvImport, ImportError> {
    let mut records = parse_records(input)?.into_iter();
    let header = records.next().ok_or(ImportError::MissingEmailColumn)?;
    let email_col = column(&header, &["email", "e-mail", "mail", "email address"])
        .ok_or(ImportError::MissingEmailColumn)?;
    let name_col = column(&header, &["name", "full name", "nome", "guest"]);
    let phone_col = column(&header, &["phone", "telephone", "tel", "mobile", "telefono"]);

    let mut out = CsvImport::default();
    for (n, row) in records.enumerate() {
        if n >= MAX_IMPORT_ROWS {
            return Err(ImportError::TooManyRows);
        }
        let get = |col: Option<usize>| col.and_then(|i| row.get(i)).map(String::as_str);
        let email = normalize_email(get(Some(email_col)).unwrap_or(""));
        if !is_valid_email(&email) {
            out.skipped += 1;
            continue;
        }
        out.sightings.push(ClientSighting {
            email,
            name: clean(get(name_col), MAX_NAME_LEN),
            phone: clean(get(phone_col), MAX_PHONE_LEN),
            source: ClientSource::Csv,
            visit: None,
        });
    }
    Ok(out)
}

/// Sighting for a past email recipient, or `None` when the address is unusable.
pub fn sighting_from_recipient(email: &str, name: Option<&str>) -> Option<ClientSighting> {
    let email = normalize_email(email);
    is_valid_email(&email).then(|| ClientSighting {
        email,
        name: clean(name, MAX_NAME_LEN),
        phone: None,
        source: ClientSource::EmailHistory,
        visit: None,
    })
}
