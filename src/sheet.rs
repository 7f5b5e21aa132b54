//! Workbook ingestion: `.xlsx` → relational tables.
//!
//! Parses worksheet cells straight out of the OOXML archive (ZIP entries,
//! shared strings, inline strings, numeric cells), infers a SQL type per
//! column, and materializes one SQLite table per sheet under a
//! caller-chosen schema name. Reingesting the same schema+sheet replaces
//! the table.
//!
//! Physical table names are `"{schema}__{table}"` so multiple schemas
//! coexist in the single backing store.

use quick_xml::events::Event;
use sqlx::SqlitePool;
use std::io::Read;
use thiserror::Error;
use tracing::{info, warn};

use crate::models::{ColumnDef, ColumnType, TableDef};

/// Maximum sheets to process in a workbook.
const MAX_SHEETS: usize = 100;
/// Maximum decompressed bytes to read from a single ZIP entry (zip-bomb protection).
const MAX_XML_ENTRY_BYTES: u64 = 50 * 1024 * 1024;

/// Workbook parsing error. No panic; the caller reports and skips.
#[derive(Debug, Error)]
pub enum SheetError {
    #[error("workbook archive error: {0}")]
    Archive(String),
    #[error("workbook xml error: {0}")]
    Xml(String),
}

/// A cell value as read from a worksheet.
#[derive(Debug, Clone, PartialEq)]
pub enum CellValue {
    Text(String),
    Number(f64),
    Empty,
}

/// One parsed worksheet: name plus rows of cells.
#[derive(Debug, Clone)]
pub struct Sheet {
    pub name: String,
    pub rows: Vec<Vec<CellValue>>,
}

/// Parse all worksheets from `.xlsx` bytes.
pub fn parse_workbook(bytes: &[u8]) -> Result<Vec<Sheet>, SheetError> {
    let mut archive = zip::ZipArchive::new(std::io::Cursor::new(bytes))
        .map_err(|e| SheetError::Archive(e.to_string()))?;

    let shared_strings = read_shared_strings(&mut archive)?;
    let names = read_sheet_names(&mut archive)?;
    let files = list_worksheet_files(&mut archive);

    let mut sheets = Vec::new();
    for (idx, file) in files.into_iter().take(MAX_SHEETS).enumerate() {
        let xml = read_zip_entry_bounded(&mut archive, &file, MAX_XML_ENTRY_BYTES)?;
        let rows = parse_sheet_xml(&xml, &shared_strings)?;
        let name = names
            .get(idx)
            .cloned()
            .unwrap_or_else(|| format!("sheet{}", idx + 1));
        sheets.push(Sheet { name, rows });
    }

    Ok(sheets)
}

fn read_zip_entry_bounded(
    archive: &mut zip::ZipArchive<std::io::Cursor<&[u8]>>,
    name: &str,
    max_bytes: u64,
) -> Result<Vec<u8>, SheetError> {
    let entry = archive
        .by_name(name)
        .map_err(|e| SheetError::Archive(e.to_string()))?;
    let mut out = Vec::new();
    entry
        .take(max_bytes)
        .read_to_end(&mut out)
        .map_err(|e| SheetError::Archive(e.to_string()))?;
    if out.len() as u64 >= max_bytes {
        return Err(SheetError::Archive(format!(
            "ZIP entry {} exceeds size limit ({} bytes)",
            name, max_bytes
        )));
    }
    Ok(out)
}

/// Sheet names in `xl/workbook.xml` order. Paired positionally with the
/// `sheetN.xml` files, which covers workbooks with default rels.
fn read_sheet_names(
    archive: &mut zip::ZipArchive<std::io::Cursor<&[u8]>>,
) -> Result<Vec<String>, SheetError> {
    let xml = match read_zip_entry_bounded(archive, "xl/workbook.xml", MAX_XML_ENTRY_BYTES) {
        Ok(xml) => xml,
        Err(_) => return Ok(Vec::new()),
    };

    let mut names = Vec::new();
    let mut reader = quick_xml::Reader::from_reader(xml.as_slice());
    reader.config_mut().trim_text(true);
    let mut buf = Vec::new();
    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) | Ok(Event::Empty(e)) => {
                if e.local_name().as_ref() == b"sheet" {
                    for attr in e.attributes().flatten() {
                        if attr.key.as_ref() == b"name" {
                            let value = attr
                                .unescape_value()
                                .map(|v| v.into_owned())
                                .unwrap_or_default();
                            names.push(value);
                        }
                    }
                }
            }
            Ok(Event::Eof) => break,
            Err(e) => return Err(SheetError::Xml(e.to_string())),
            _ => {}
        }
        buf.clear();
    }
    Ok(names)
}

fn list_worksheet_files(archive: &mut zip::ZipArchive<std::io::Cursor<&[u8]>>) -> Vec<String> {
    let mut names: Vec<String> = archive
        .file_names()
        .filter(|n| n.starts_with("xl/worksheets/sheet") && n.ends_with(".xml"))
        .map(|s| s.to_string())
        .collect();
    names.sort_by_key(|name| {
        name.trim_start_matches("xl/worksheets/sheet")
            .trim_end_matches(".xml")
            .parse::<u32>()
            .unwrap_or(u32::MAX)
    });
    names
}

fn read_shared_strings(
    archive: &mut zip::ZipArchive<std::io::Cursor<&[u8]>>,
) -> Result<Vec<String>, SheetError> {
    // Workbooks without any string cells have no sharedStrings part.
    let xml = match read_zip_entry_bounded(archive, "xl/sharedStrings.xml", MAX_XML_ENTRY_BYTES) {
        Ok(xml) => xml,
        Err(_) => return Ok(Vec::new()),
    };

    let mut strings = Vec::new();
    let mut reader = quick_xml::Reader::from_reader(xml.as_slice());
    reader.config_mut().trim_text(true);
    let mut buf = Vec::new();
    let mut in_si = false;
    let mut current = String::new();
    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) => {
                if e.local_name().as_ref() == b"si" {
                    in_si = true;
                    current.clear();
                } else if in_si && e.local_name().as_ref() == b"t" {
                    if let Ok(Event::Text(te)) = reader.read_event_into(&mut buf) {
                        current.push_str(te.unescape().unwrap_or_default().as_ref());
                    }
                }
            }
            Ok(Event::End(e)) => {
                if e.local_name().as_ref() == b"si" {
                    in_si = false;
                    strings.push(std::mem::take(&mut current));
                }
            }
            Ok(Event::Eof) => break,
            Err(e) => return Err(SheetError::Xml(e.to_string())),
            _ => {}
        }
        buf.clear();
    }
    Ok(strings)
}

/// Cell content kind, from the `t` attribute of `<c>`.
#[derive(Debug, Clone, Copy, PartialEq)]
enum CellKind {
    Number,
    SharedString,
    FormulaString,
    InlineString,
    Bool,
}

fn parse_sheet_xml(xml: &[u8], shared_strings: &[String]) -> Result<Vec<Vec<CellValue>>, SheetError> {
    let mut rows: Vec<Vec<CellValue>> = Vec::new();
    let mut current_row: Vec<CellValue> = Vec::new();
    let mut in_row = false;

    let mut cell_kind = CellKind::Number;
    let mut cell_col: usize = 0;
    let mut pending = CellValue::Empty;
    let mut in_v = false;
    let mut in_inline_t = false;

    let mut reader = quick_xml::Reader::from_reader(xml);
    reader.config_mut().trim_text(true);
    let mut buf = Vec::new();

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) => match e.local_name().as_ref() {
                b"row" => {
                    in_row = true;
                    current_row = Vec::new();
                }
                b"c" if in_row => {
                    cell_kind = CellKind::Number;
                    cell_col = current_row.len();
                    pending = CellValue::Empty;
                    for attr in e.attributes().flatten() {
                        match attr.key.as_ref() {
                            b"t" => {
                                cell_kind = match attr.value.as_ref() {
                                    b"s" => CellKind::SharedString,
                                    b"str" => CellKind::FormulaString,
                                    b"inlineStr" => CellKind::InlineString,
                                    b"b" => CellKind::Bool,
                                    _ => CellKind::Number,
                                };
                            }
                            b"r" => {
                                if let Some(col) = column_index(
                                    attr.unescape_value().unwrap_or_default().as_ref(),
                                ) {
                                    cell_col = col;
                                }
                            }
                            _ => {}
                        }
                    }
                }
                b"v" => in_v = true,
                b"t" if cell_kind == CellKind::InlineString => in_inline_t = true,
                _ => {}
            },
            Ok(Event::Text(te)) => {
                let raw = te.unescape().unwrap_or_default();
                let raw = raw.trim();
                if in_v {
                    pending = decode_cell_value(cell_kind, raw, shared_strings);
                } else if in_inline_t {
                    pending = CellValue::Text(raw.to_string());
                }
            }
            Ok(Event::End(e)) => match e.local_name().as_ref() {
                b"row" => {
                    in_row = false;
                    rows.push(std::mem::take(&mut current_row));
                }
                b"c" if in_row => {
                    while current_row.len() < cell_col {
                        current_row.push(CellValue::Empty);
                    }
                    let value = std::mem::replace(&mut pending, CellValue::Empty);
                    if current_row.len() == cell_col {
                        current_row.push(value);
                    } else if cell_col < current_row.len() {
                        current_row[cell_col] = value;
                    }
                }
                b"v" => in_v = false,
                b"t" => in_inline_t = false,
                _ => {}
            },
            Ok(Event::Empty(e)) => {
                if e.local_name().as_ref() == b"row" && !in_row {
                    rows.push(Vec::new());
                }
            }
            Ok(Event::Eof) => break,
            Err(e) => return Err(SheetError::Xml(e.to_string())),
            _ => {}
        }
        buf.clear();
    }

    Ok(rows)
}

fn decode_cell_value(kind: CellKind, raw: &str, shared_strings: &[String]) -> CellValue {
    if raw.is_empty() {
        return CellValue::Empty;
    }
    match kind {
        CellKind::SharedString => raw
            .parse::<usize>()
            .ok()
            .and_then(|i| shared_strings.get(i))
            .map(|s| CellValue::Text(s.clone()))
            .unwrap_or(CellValue::Empty),
        CellKind::FormulaString => CellValue::Text(raw.to_string()),
        CellKind::InlineString => CellValue::Text(raw.to_string()),
        CellKind::Bool => CellValue::Text(if raw == "1" { "TRUE" } else { "FALSE" }.to_string()),
        CellKind::Number => raw
            .parse::<f64>()
            .map(CellValue::Number)
            .unwrap_or_else(|_| CellValue::Text(raw.to_string())),
    }
}

/// Zero-based column index from a cell reference like `"B2"`.
fn column_index(cell_ref: &str) -> Option<usize> {
    let letters: String = cell_ref.chars().take_while(|c| c.is_ascii_alphabetic()).collect();
    if letters.is_empty() {
        return None;
    }
    let mut col = 0usize;
    for c in letters.chars() {
        col = col * 26 + (c.to_ascii_uppercase() as usize - 'A' as usize + 1);
    }
    Some(col - 1)
}

// ============ Table materialization ============

/// Sanitize a name into a valid lowercase SQL identifier. Names that do
/// not start with a letter or underscore get the given prefix.
pub fn sanitize_identifier(name: &str, prefix: &str) -> String {
    let replaced = name.trim().replace(' ', "_");
    let mut sanitized: String = replaced
        .chars()
        .map(|c| if c.is_alphanumeric() || c == '_' { c } else { '_' })
        .collect::<String>()
        .to_lowercase();
    let starts_ok = sanitized
        .chars()
        .next()
        .map(|c| c.is_ascii_alphabetic() || c == '_')
        .unwrap_or(false);
    if !starts_ok {
        sanitized = format!("{}_{}", prefix, sanitized);
    }
    sanitized
}

/// Infer one SQL type per column by scanning the data rows.
pub fn infer_column_types(rows: &[Vec<CellValue>], column_count: usize) -> Vec<ColumnType> {
    (0..column_count)
        .map(|col| {
            let mut any = false;
            let mut all_integer = true;
            let mut all_numeric = true;

            for row in rows {
                match row.get(col) {
                    Some(CellValue::Number(n)) => {
                        any = true;
                        if n.fract() != 0.0 || n.abs() >= 9.0e15 {
                            all_integer = false;
                        }
                    }
                    Some(CellValue::Text(_)) => {
                        any = true;
                        all_integer = false;
                        all_numeric = false;
                    }
                    Some(CellValue::Empty) | None => {}
                }
            }

            if !any {
                ColumnType::Text
            } else if all_integer {
                ColumnType::Integer
            } else if all_numeric {
                ColumnType::Real
            } else {
                ColumnType::Text
            }
        })
        .collect()
}

fn header_names(header: &[CellValue]) -> Vec<String> {
    let mut seen: std::collections::HashMap<String, usize> = std::collections::HashMap::new();
    header
        .iter()
        .enumerate()
        .map(|(i, cell)| {
            let raw = match cell {
                CellValue::Text(s) => s.clone(),
                CellValue::Number(n) => format_number(*n),
                CellValue::Empty => format!("col_{}", i + 1),
            };
            let name = sanitize_identifier(&raw, "col");
            let count = seen.entry(name.clone()).or_insert(0);
            *count += 1;
            if *count > 1 {
                format!("{}_{}", name, count)
            } else {
                name
            }
        })
        .collect()
}

fn format_number(n: f64) -> String {
    if n.fract() == 0.0 && n.abs() < 9.0e15 {
        format!("{}", n as i64)
    } else {
        format!("{}", n)
    }
}

/// Ingest every non-empty worksheet of an `.xlsx` workbook as a table
/// under `schema_name`, replacing previous contents. Returns the created
/// table definitions.
pub async fn ingest_workbook(
    pool: &SqlitePool,
    schema_name: &str,
    bytes: &[u8],
) -> anyhow::Result<Vec<TableDef>> {
    let sheets = parse_workbook(bytes)?;
    let schema_ident = sanitize_identifier(schema_name, "schema");

    let mut tables = Vec::new();
    for sheet in sheets {
        if sheet.rows.is_empty() {
            warn!(sheet = %sheet.name, "skipping empty worksheet");
            continue;
        }

        let table_name = sanitize_identifier(&sheet.name, "table");
        let physical_name = format!("{}__{}", schema_ident, table_name);

        let columns_names = header_names(&sheet.rows[0]);
        let data = &sheet.rows[1..];
        let types = infer_column_types(data, columns_names.len());
        let columns: Vec<ColumnDef> = columns_names
            .iter()
            .zip(types.iter())
            .map(|(name, column_type)| ColumnDef {
                name: name.clone(),
                column_type: *column_type,
            })
            .collect();

        let row_count = create_and_fill_table(pool, &physical_name, &columns, data).await?;

        let columns_json = serde_json::to_string(&columns)?;
        sqlx::query(
            r#"
            INSERT INTO tabular_tables (schema_name, table_name, physical_name, columns_json, row_count, created_at)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT(schema_name, table_name) DO UPDATE SET
                physical_name = excluded.physical_name,
                columns_json = excluded.columns_json,
                row_count = excluded.row_count,
                created_at = excluded.created_at
            "#,
        )
        .bind(schema_name)
        .bind(&table_name)
        .bind(&physical_name)
        .bind(&columns_json)
        .bind(row_count)
        .bind(chrono::Utc::now().timestamp())
        .execute(pool)
        .await?;

        info!(
            schema = schema_name,
            table = %table_name,
            rows = row_count,
            columns = columns.len(),
            "created table from worksheet"
        );

        tables.push(TableDef {
            schema: schema_name.to_string(),
            name: table_name,
            physical_name,
            columns,
            row_count,
        });
    }

    Ok(tables)
}

async fn create_and_fill_table(
    pool: &SqlitePool,
    physical_name: &str,
    columns: &[ColumnDef],
    data: &[Vec<CellValue>],
) -> anyhow::Result<i64> {
    let column_defs: Vec<String> = columns
        .iter()
        .map(|c| format!("\"{}\" {}", c.name, c.column_type.as_sql()))
        .collect();
    let create_sql = format!(
        "CREATE TABLE \"{}\" ({})",
        physical_name,
        column_defs.join(", ")
    );
    let placeholders: Vec<&str> = columns.iter().map(|_| "?").collect();
    let insert_sql = format!(
        "INSERT INTO \"{}\" VALUES ({})",
        physical_name,
        placeholders.join(", ")
    );

    let mut tx = pool.begin().await?;

    sqlx::query(&format!("DROP TABLE IF EXISTS \"{}\"", physical_name))
        .execute(&mut *tx)
        .await?;
    sqlx::query(&create_sql).execute(&mut *tx).await?;

    let mut row_count = 0i64;
    for row in data {
        let mut query = sqlx::query(&insert_sql);
        for (i, column) in columns.iter().enumerate() {
            let cell = row.get(i).unwrap_or(&CellValue::Empty);
            query = match column.column_type {
                ColumnType::Integer => query.bind(cell_as_integer(cell)),
                ColumnType::Real => query.bind(cell_as_real(cell)),
                ColumnType::Text => query.bind(cell_as_text(cell)),
            };
        }
        query.execute(&mut *tx).await?;
        row_count += 1;
    }

    tx.commit().await?;
    Ok(row_count)
}

fn cell_as_integer(cell: &CellValue) -> Option<i64> {
    match cell {
        CellValue::Number(n) => Some(*n as i64),
        CellValue::Text(s) => s.trim().parse().ok(),
        CellValue::Empty => None,
    }
}

fn cell_as_real(cell: &CellValue) -> Option<f64> {
    match cell {
        CellValue::Number(n) => Some(*n),
        CellValue::Text(s) => s.trim().parse().ok(),
        CellValue::Empty => None,
    }
}

fn cell_as_text(cell: &CellValue) -> Option<String> {
    match cell {
        CellValue::Number(n) => Some(format_number(*n)),
        CellValue::Text(s) => Some(s.clone()),
        CellValue::Empty => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    /// Build a minimal single-sheet xlsx in memory.
    fn build_test_workbook() -> Vec<u8> {
        let cursor = std::io::Cursor::new(Vec::new());
        let mut archive = zip::ZipWriter::new(cursor);
        let options = zip::write::SimpleFileOptions::default();

        archive.start_file("xl/workbook.xml", options).unwrap();
        archive
            .write_all(
                br#"<?xml version="1.0"?><workbook><sheets><sheet name="sales" sheetId="1"/></sheets></workbook>"#,
            )
            .unwrap();

        archive.start_file("xl/sharedStrings.xml", options).unwrap();
        archive
            .write_all(
                br#"<?xml version="1.0"?><sst><si><t>region</t></si><si><t>amount</t></si><si><t>north</t></si><si><t>south</t></si></sst>"#,
            )
            .unwrap();

        archive
            .start_file("xl/worksheets/sheet1.xml", options)
            .unwrap();
        archive
            .write_all(
                br#"<?xml version="1.0"?><worksheet><sheetData>
                <row r="1"><c r="A1" t="s"><v>0</v></c><c r="B1" t="s"><v>1</v></c></row>
                <row r="2"><c r="A2" t="s"><v>2</v></c><c r="B2"><v>100</v></c></row>
                <row r="3"><c r="A3" t="s"><v>3</v></c><c r="B3"><v>250</v></c></row>
                </sheetData></worksheet>"#,
            )
            .unwrap();

        let cursor = archive.finish().unwrap();
        cursor.into_inner()
    }

    #[test]
    fn test_parse_workbook_cells() {
        let bytes = build_test_workbook();
        let sheets = parse_workbook(&bytes).unwrap();
        assert_eq!(sheets.len(), 1);
        assert_eq!(sheets[0].name, "sales");
        assert_eq!(sheets[0].rows.len(), 3);
        assert_eq!(sheets[0].rows[0][0], CellValue::Text("region".to_string()));
        assert_eq!(sheets[0].rows[1][1], CellValue::Number(100.0));
    }

    #[test]
    fn test_parse_two_sheet_workbook() {
        let cursor = std::io::Cursor::new(Vec::new());
        let mut archive = zip::ZipWriter::new(cursor);
        let options = zip::write::SimpleFileOptions::default();

        archive.start_file("xl/workbook.xml", options).unwrap();
        archive
            .write_all(
                br#"<workbook><sheets><sheet name="east" sheetId="1"/><sheet name="west" sheetId="2"/></sheets></workbook>"#,
            )
            .unwrap();
        archive
            .start_file("xl/worksheets/sheet1.xml", options)
            .unwrap();
        archive
            .write_all(br#"<worksheet><sheetData><row r="1"><c r="A1"><v>1</v></c></row></sheetData></worksheet>"#)
            .unwrap();
        archive
            .start_file("xl/worksheets/sheet2.xml", options)
            .unwrap();
        archive
            .write_all(br#"<worksheet><sheetData><row r="1"><c r="A1"><v>2</v></c></row></sheetData></worksheet>"#)
            .unwrap();
        let bytes = archive.finish().unwrap().into_inner();

        let sheets = parse_workbook(&bytes).unwrap();
        assert_eq!(sheets.len(), 2);
        assert_eq!(sheets[0].name, "east");
        assert_eq!(sheets[1].name, "west");
        assert_eq!(sheets[0].rows[0][0], CellValue::Number(1.0));
        assert_eq!(sheets[1].rows[0][0], CellValue::Number(2.0));
    }

    #[test]
    fn test_invalid_archive_errors() {
        let err = parse_workbook(b"not a zip").unwrap_err();
        assert!(matches!(err, SheetError::Archive(_)));
    }

    #[test]
    fn test_column_index() {
        assert_eq!(column_index("A1"), Some(0));
        assert_eq!(column_index("B2"), Some(1));
        assert_eq!(column_index("Z9"), Some(25));
        assert_eq!(column_index("AA10"), Some(26));
        assert_eq!(column_index("123"), None);
    }

    #[test]
    fn test_sparse_row_pads_missing_cells() {
        // Row with only column C populated.
        let xml = br#"<worksheet><sheetData>
            <row r="1"><c r="C1"><v>7</v></c></row>
            </sheetData></worksheet>"#;
        let rows = parse_sheet_xml(xml, &[]).unwrap();
        assert_eq!(
            rows[0],
            vec![CellValue::Empty, CellValue::Empty, CellValue::Number(7.0)]
        );
    }

    #[test]
    fn test_inline_string_cell() {
        let xml = br#"<worksheet><sheetData>
            <row r="1"><c r="A1" t="inlineStr"><is><t>hello</t></is></c></row>
            </sheetData></worksheet>"#;
        let rows = parse_sheet_xml(xml, &[]).unwrap();
        assert_eq!(rows[0][0], CellValue::Text("hello".to_string()));
    }

    #[test]
    fn test_sanitize_identifier() {
        assert_eq!(sanitize_identifier("Sales Report!", "table"), "sales_report_");
        assert_eq!(sanitize_identifier("2024 data", "table"), "table_2024_data");
        assert_eq!(sanitize_identifier("", "col"), "col_");
        assert_eq!(sanitize_identifier("Region", "col"), "region");
    }

    #[test]
    fn test_infer_column_types() {
        let rows = vec![
            vec![
                CellValue::Text("north".into()),
                CellValue::Number(10.0),
                CellValue::Number(1.5),
            ],
            vec![
                CellValue::Text("south".into()),
                CellValue::Number(20.0),
                CellValue::Empty,
            ],
        ];
        let types = infer_column_types(&rows, 3);
        assert_eq!(
            types,
            vec![ColumnType::Text, ColumnType::Integer, ColumnType::Real]
        );
    }

    #[test]
    fn test_infer_all_empty_column_is_text() {
        let rows = vec![vec![CellValue::Empty], vec![CellValue::Empty]];
        assert_eq!(infer_column_types(&rows, 1), vec![ColumnType::Text]);
    }

    #[test]
    fn test_header_names_dedupe() {
        let header = vec![
            CellValue::Text("Amount".into()),
            CellValue::Text("amount".into()),
            CellValue::Empty,
        ];
        let names = header_names(&header);
        assert_eq!(names, vec!["amount", "amount_2", "col_3"]);
    }
}
