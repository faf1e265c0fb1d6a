//! The persisted CSV dataset: `id,label,definition,asset`.

use std::fs;
use std::io::{self, BufWriter, Write};
use std::mem::take;
use std::path::Path;

use camino::Utf8Path;

use crate::domain::{Record, RecordId};
use crate::error::HarvestError;

pub const HEADER: [&str; 4] = ["id", "label", "definition", "asset"];

/// Reads a dataset written by [`write_records`]. Rows may carry three or four
/// fields; an empty or missing fourth field means the asset is unresolved.
pub fn load_dataset(path: &Utf8Path) -> Result<Vec<Record>, HarvestError> {
    let text = match fs::read_to_string(path.as_std_path()) {
        Ok(text) => text,
        Err(err) if err.kind() == io::ErrorKind::NotFound => {
            return Err(HarvestError::DatasetNotFound(path.to_string()));
        }
        Err(err) => {
            return Err(HarvestError::Filesystem(format!("read {path}: {err}")));
        }
    };
    parse_records(path.as_str(), &text)
}

pub fn parse_records(source: &str, text: &str) -> Result<Vec<Record>, HarvestError> {
    let rows = parse_rows(text);
    let mut rows = rows.into_iter().enumerate();
    let malformed = |line: usize, message: String| HarvestError::DatasetFormat {
        path: source.to_string(),
        line,
        message,
    };

    match rows.next() {
        Some((_, header)) if header.len() >= 3 && header[0].trim_start_matches('\u{feff}') == HEADER[0] => {}
        Some(_) => return Err(malformed(1, "missing `id,label,definition` header".to_string())),
        None => return Ok(Vec::new()),
    }

    let mut records = Vec::new();
    for (index, row) in rows {
        let line = index + 1;
        if row.len() < 3 || row.len() > 4 {
            return Err(malformed(line, format!("expected 3 or 4 fields, found {}", row.len())));
        }
        let mut fields = row.into_iter();
        let id: RecordId = fields
            .next()
            .unwrap_or_default()
            .parse()
            .map_err(|err: HarvestError| malformed(line, err.to_string()))?;
        let label = fields.next().unwrap_or_default();
        let definition = fields.next().unwrap_or_default();
        let asset = fields.next().filter(|value| !value.is_empty());
        records.push(Record {
            id,
            label,
            definition,
            asset,
        });
    }
    Ok(records)
}

pub fn write_records<'a, W: Write>(
    writer: W,
    records: impl IntoIterator<Item = &'a Record>,
) -> io::Result<()> {
    let mut writer = BufWriter::new(writer);
    let header: Vec<String> = HEADER.iter().map(|name| name.to_string()).collect();
    write_row(&mut writer, &header)?;
    for record in records {
        write_row(
            &mut writer,
            &[
                record.id.to_string(),
                record.label.clone(),
                record.definition.clone(),
                record.asset.clone().unwrap_or_default(),
            ],
        )?;
    }
    writer.flush()
}

/// Writes `records` to a temporary file beside `target`, syncs it and renames
/// it over `target`. Until the rename succeeds the old file is untouched.
pub fn persist_atomic<'a>(
    target: &Utf8Path,
    records: impl IntoIterator<Item = &'a Record>,
) -> Result<(), HarvestError> {
    persist_with(target, records, |_| Ok(()))
}

pub(crate) fn persist_with<'a, F>(
    target: &Utf8Path,
    records: impl IntoIterator<Item = &'a Record>,
    before_rename: F,
) -> Result<(), HarvestError>
where
    F: FnOnce(&Path) -> io::Result<()>,
{
    let parent = dataset_dir(target);
    let mut temp = tempfile::Builder::new()
        .prefix(".dataset-")
        .suffix(".csv.tmp")
        .tempfile_in(parent.as_std_path())
        .map_err(|err| HarvestError::Persist(format!("create temp file in {parent}: {err}")))?;
    write_records(temp.as_file_mut(), records)
        .map_err(|err| HarvestError::Persist(format!("write temp dataset: {err}")))?;
    // Temp files start out owner-only; the dataset keeps the mode it had.
    let permissions = match fs::metadata(target.as_std_path()) {
        Ok(meta) => Some(meta.permissions()),
        Err(_) => fresh_permissions(),
    };
    if let Some(permissions) = permissions {
        temp.as_file()
            .set_permissions(permissions)
            .map_err(|err| HarvestError::Persist(format!("set dataset permissions: {err}")))?;
    }
    temp.as_file()
        .sync_all()
        .map_err(|err| HarvestError::Persist(format!("sync temp dataset: {err}")))?;
    before_rename(temp.path()).map_err(|err| HarvestError::Persist(err.to_string()))?;
    temp.persist(target.as_std_path())
        .map_err(|err| HarvestError::Persist(format!("rename over {target}: {}", err.error)))?;
    Ok(())
}

#[cfg(unix)]
fn fresh_permissions() -> Option<fs::Permissions> {
    use std::os::unix::fs::PermissionsExt;
    Some(fs::Permissions::from_mode(0o644))
}

#[cfg(not(unix))]
fn fresh_permissions() -> Option<fs::Permissions> {
    None
}

/// Directory a dataset's temporary file goes into; empty parents mean the
/// working directory.
pub fn dataset_dir(target: &Utf8Path) -> &Utf8Path {
    match target.parent() {
        Some(parent) if !parent.as_str().is_empty() => parent,
        _ => Utf8Path::new("."),
    }
}

fn needs_quotes(field: &str) -> bool {
    field.contains(',') || field.contains('"') || field.contains('\n') || field.contains('\r')
}

fn write_row<W: Write>(w: &mut W, row: &[String]) -> io::Result<()> {
    let mut first = true;
    for cell in row {
        if !first {
            w.write_all(b",")?;
        } else {
            first = false;
        }
        if needs_quotes(cell) {
            write!(w, "\"{}\"", cell.replace('"', "\"\""))?;
        } else {
            w.write_all(cell.as_bytes())?;
        }
    }
    w.write_all(b"\n")
}

/// Quote-aware CSV splitting; tolerates CRLF and a missing final newline.
fn parse_rows(text: &str) -> Vec<Vec<String>> {
    let mut rows = Vec::new();
    let mut field = String::new();
    let mut row = Vec::new();
    let mut in_quotes = false;
    let mut chars = text.chars().peekable();

    while let Some(ch) = chars.next() {
        match ch {
            '"' if in_quotes => {
                if matches!(chars.peek(), Some('"')) {
                    chars.next();
                    field.push('"');
                } else {
                    in_quotes = false;
                }
            }
            '"' if field.is_empty() => in_quotes = true,
            ',' if !in_quotes => row.push(take(&mut field)),
            '\n' | '\r' if !in_quotes => {
                if ch == '\r' && matches!(chars.peek(), Some('\n')) {
                    chars.next();
                }
                row.push(take(&mut field));
                if !(row.len() == 1 && row[0].is_empty()) {
                    rows.push(take(&mut row));
                } else {
                    row.clear();
                }
            }
            _ => field.push(ch),
        }
    }

    if !field.is_empty() || !row.is_empty() {
        row.push(field);
        rows.push(row);
    }
    rows
}
