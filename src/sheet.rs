//! Uploaded spreadsheets as rows of text cells.
//!
//! XLSX workbooks are read straight out of the zip container; only the parts
//! needed for cell text are touched (workbook, its relationships, shared
//! strings and the first worksheet). Anything that is not a zip is treated as
//! CSV text.

use std::borrow::Cow;
use std::collections::BTreeMap;
use std::io::{Cursor, Read};

use thiserror::Error;
use zip::ZipArchive;

/// Decompressed size cap for a single workbook part.
const MAX_PART_BYTES: u64 = 64 * 1024 * 1024;

const ZIP_MAGIC: &[u8] = b"PK\x03\x04";
const OLE_MAGIC: &[u8] = &[0xD0, 0xCF, 0x11, 0xE0];

#[derive(Debug, Error)]
pub enum SheetError {
    #[error("arquivo xlsx inválido: {0}")]
    Zip(#[from] zip::result::ZipError),

    #[error("parte ausente na planilha: {0}")]
    MissingPart(String),

    #[error("parte da planilha muito grande: {0}")]
    PartTooLarge(String),

    #[error("xml inválido em {part}: {message}")]
    Xml { part: String, message: String },

    #[error("csv inválido: {0}")]
    Csv(#[from] csv::Error),

    #[error("planilhas .xls antigas não são suportadas; salve como .xlsx ou .csv")]
    LegacyXls,

    #[error("erro de leitura: {0}")]
    Io(#[from] std::io::Error),
}

pub type Rows = Vec<Vec<String>>;

/// Reads the first worksheet. Row `i` of the result is file row `i + 1`.
pub fn read_rows(bytes: &[u8]) -> Result<Rows, SheetError> {
    if bytes.starts_with(ZIP_MAGIC) {
        read_xlsx(bytes)
    } else if bytes.starts_with(OLE_MAGIC) {
        Err(SheetError::LegacyXls)
    } else {
        read_csv(bytes)
    }
}

// ---------- CSV ----------

fn decode_text(bytes: &[u8]) -> Cow<'_, str> {
    let bytes = bytes.strip_prefix(b"\xEF\xBB\xBF").unwrap_or(bytes);
    match std::str::from_utf8(bytes) {
        Ok(s) => Cow::Borrowed(s),
        // Spreadsheet tools on Windows still export Latin-1.
        Err(_) => Cow::Owned(bytes.iter().map(|&b| b as char).collect()),
    }
}

fn sniff_delimiter(text: &str) -> u8 {
    let first = text.lines().next().unwrap_or("");
    if first.contains(';') && !first.contains(',') {
        b';'
    } else {
        b','
    }
}

fn read_csv(bytes: &[u8]) -> Result<Rows, SheetError> {
    let text = decode_text(bytes);
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .delimiter(sniff_delimiter(&text))
        .from_reader(text.as_bytes());
    let mut rows = Vec::new();
    for record in reader.records() {
        let record = record?;
        rows.push(record.iter().map(str::to_string).collect());
    }
    Ok(rows)
}

// ---------- XLSX ----------

fn read_part<R: Read + std::io::Seek>(
    archive: &mut ZipArchive<R>,
    name: &str,
) -> Result<Option<String>, SheetError> {
    let file = match archive.by_name(name) {
        Ok(f) => f,
        Err(zip::result::ZipError::FileNotFound) => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    let mut buf = Vec::new();
    file.take(MAX_PART_BYTES + 1).read_to_end(&mut buf)?;
    if buf.len() as u64 > MAX_PART_BYTES {
        return Err(SheetError::PartTooLarge(name.to_string()));
    }
    Ok(Some(decode_text(&buf).into_owned()))
}

fn read_xlsx(bytes: &[u8]) -> Result<Rows, SheetError> {
    let mut archive = ZipArchive::new(Cursor::new(bytes))?;
    let sheet_path = first_sheet_path(&mut archive)?;
    let shared = match read_part(&mut archive, "xl/sharedStrings.xml")? {
        Some(xml) => parse_shared_strings(&xml),
        None => Vec::new(),
    };
    let sheet_xml = read_part(&mut archive, &sheet_path)?
        .ok_or_else(|| SheetError::MissingPart(sheet_path.clone()))?;
    parse_sheet(&sheet_xml, &shared).map_err(|message| SheetError::Xml {
        part: sheet_path,
        message,
    })
}

fn first_sheet_path<R: Read + std::io::Seek>(archive: &mut ZipArchive<R>) -> Result<String, SheetError> {
    const FALLBACK: &str = "xl/worksheets/sheet1.xml";
    let Some(workbook) = read_part(archive, "xl/workbook.xml")? else {
        return Ok(FALLBACK.to_string());
    };
    let rel_id = XmlScanner::new(&workbook).find_map(|ev| match ev {
        XmlEvent::Start(tag) | XmlEvent::Empty(tag) if tag.local_name() == "sheet" => {
            tag.attr_where(|k| k == "r:id" || k.ends_with(":id"))
        }
        _ => None,
    });
    let Some(rel_id) = rel_id else {
        return Ok(FALLBACK.to_string());
    };
    let Some(rels) = read_part(archive, "xl/_rels/workbook.xml.rels")? else {
        return Ok(FALLBACK.to_string());
    };
    let target = XmlScanner::new(&rels).find_map(|ev| match ev {
        XmlEvent::Start(tag) | XmlEvent::Empty(tag)
            if tag.local_name() == "Relationship" && tag.attr("Id").as_deref() == Some(rel_id.as_str()) =>
        {
            tag.attr("Target")
        }
        _ => None,
    });
    Ok(match target {
        Some(t) if t.starts_with('/') => t.trim_start_matches('/').to_string(),
        Some(t) => format!("xl/{}", t),
        None => FALLBACK.to_string(),
    })
}

fn parse_shared_strings(xml: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut current: Option<String> = None;
    let mut in_text = false;
    // Phonetic hints repeat the text in a <t> of their own.
    let mut in_phonetic = false;
    for ev in XmlScanner::new(xml) {
        match ev {
            XmlEvent::Start(tag) => match tag.local_name() {
                "si" => current = Some(String::new()),
                "t" => in_text = !in_phonetic,
                "rPh" => in_phonetic = true,
                _ => {}
            },
            XmlEvent::Empty(tag) if tag.local_name() == "si" => out.push(String::new()),
            XmlEvent::End(name) => match local(name) {
                "si" => out.push(current.take().unwrap_or_default()),
                "t" => in_text = false,
                "rPh" => in_phonetic = false,
                _ => {}
            },
            XmlEvent::Text(text) if in_text => {
                if let Some(s) = current.as_mut() {
                    s.push_str(&text);
                }
            }
            _ => {}
        }
    }
    out
}

/// Worksheet bounds of the xlsx format (column XFD, row 1048576).
const MAX_COLUMNS: usize = 16_384;
const MAX_ROWS: usize = 1_048_576;
/// Upper bound on cells materialized by the dense row expansion.
const MAX_DENSE_CELLS: usize = 1 << 21;

/// Zero-based column index from a reference such as `C12`. `Ok(None)` when
/// the reference has no column letters.
fn column_index(cell_ref: &str) -> Result<Option<usize>, String> {
    let letters = cell_ref.bytes().take_while(|b| b.is_ascii_alphabetic());
    let mut n = 0usize;
    for b in letters {
        let digit = (b.to_ascii_uppercase() - b'A' + 1) as usize;
        n = n
            .checked_mul(26)
            .and_then(|v| v.checked_add(digit))
            .filter(|v| *v <= MAX_COLUMNS)
            .ok_or_else(|| format!("cell reference {:?} is beyond column XFD", cell_ref))?;
    }
    Ok(n.checked_sub(1))
}

fn row_number(raw: Option<String>, previous: usize) -> Result<usize, String> {
    let n = match raw {
        Some(r) => r
            .trim()
            .parse::<usize>()
            .map_err(|_| format!("bad row reference {:?}", r))?,
        None => previous + 1,
    };
    if (1..=MAX_ROWS).contains(&n) {
        Ok(n)
    } else {
        Err(format!("row {} is outside 1..={}", n, MAX_ROWS))
    }
}

fn cell_column(raw: Option<String>, next_col: usize) -> Result<usize, String> {
    let col = match raw {
        Some(r) => column_index(&r)?.unwrap_or(next_col),
        None => next_col,
    };
    if col >= MAX_COLUMNS {
        return Err(format!("column {} is beyond column XFD", col + 1));
    }
    Ok(col)
}

struct PendingCell {
    col: usize,
    kind: Option<String>,
    value: String,
    inline: String,
}

fn parse_sheet(xml: &str, shared: &[String]) -> Result<Rows, String> {
    let mut grid: BTreeMap<usize, BTreeMap<usize, String>> = BTreeMap::new();
    let mut row_no = 0usize;
    let mut next_col = 0usize;
    let mut cell: Option<PendingCell> = None;
    let mut in_value = false;
    let mut in_inline_text = false;

    for ev in XmlScanner::new(xml) {
        match ev {
            XmlEvent::Start(tag) | XmlEvent::Empty(tag) if tag.local_name() == "row" => {
                row_no = row_number(tag.attr("r"), row_no)?;
                next_col = 0;
            }
            XmlEvent::Start(tag) if tag.local_name() == "c" => {
                let col = cell_column(tag.attr("r"), next_col)?;
                next_col = col + 1;
                cell = Some(PendingCell {
                    col,
                    kind: tag.attr("t"),
                    value: String::new(),
                    inline: String::new(),
                });
            }
            XmlEvent::Empty(tag) if tag.local_name() == "c" => {
                let col = cell_column(tag.attr("r"), next_col)?;
                next_col = col + 1;
            }
            XmlEvent::Start(tag) if tag.local_name() == "v" => in_value = cell.is_some(),
            XmlEvent::Start(tag) if tag.local_name() == "t" => in_inline_text = cell.is_some(),
            XmlEvent::Text(text) => {
                if let Some(c) = cell.as_mut() {
                    if in_value {
                        c.value.push_str(&text);
                    } else if in_inline_text {
                        c.inline.push_str(&text);
                    }
                }
            }
            XmlEvent::End(name) => match local(name) {
                "v" => in_value = false,
                "t" => in_inline_text = false,
                "c" => {
                    if let Some(c) = cell.take() {
                        let text = cell_text(&c, shared)?;
                        if row_no == 0 {
                            row_no = 1;
                        }
                        grid.entry(row_no).or_default().insert(c.col, text);
                    }
                }
                _ => {}
            },
            _ => {}
        }
    }

    let last_row = grid.keys().next_back().copied().unwrap_or(0);
    let dense_cells: usize = grid
        .values()
        .map(|cells| cells.keys().next_back().map(|c| c + 1).unwrap_or(0))
        .sum();
    if dense_cells > MAX_DENSE_CELLS {
        return Err(format!("sheet spans {} cells, limit is {}", dense_cells, MAX_DENSE_CELLS));
    }
    let mut rows: Rows = vec![Vec::new(); last_row];
    for (r, cells) in grid {
        let width = cells.keys().next_back().map(|c| c + 1).unwrap_or(0);
        let mut dense = vec![String::new(); width];
        for (c, v) in cells {
            dense[c] = v;
        }
        rows[r - 1] = dense;
    }
    Ok(rows)
}

fn cell_text(c: &PendingCell, shared: &[String]) -> Result<String, String> {
    match c.kind.as_deref() {
        Some("s") => {
            let idx: usize = c
                .value
                .trim()
                .parse()
                .map_err(|_| format!("bad shared string index {:?}", c.value))?;
            shared
                .get(idx)
                .cloned()
                .ok_or_else(|| format!("shared string {} out of range", idx))
        }
        Some("inlineStr") => Ok(c.inline.clone()),
        Some("b") => Ok(match c.value.trim() {
            "1" => "TRUE".to_string(),
            _ => "FALSE".to_string(),
        }),
        _ => Ok(c.value.clone()),
    }
}

// ---------- minimal XML scanning ----------

fn local(name: &str) -> &str {
    name.rsplit(':').next().unwrap_or(name)
}

fn named_entity(name: &str) -> Option<char> {
    match name {
        "lt" => Some('<'),
        "gt" => Some('>'),
        "amp" => Some('&'),
        "quot" => Some('"'),
        "apos" => Some('\''),
        _ => None,
    }
}

fn unescape(raw: &str) -> Cow<'_, str> {
    if !raw.contains('&') {
        return Cow::Borrowed(raw);
    }
    let mut out = String::with_capacity(raw.len());
    let mut rest = raw;
    while let Some(amp) = rest.find('&') {
        out.push_str(&rest[..amp]);
        let after = &rest[amp + 1..];
        let decoded = after.find(';').and_then(|semi| {
            let entity = &after[..semi];
            let ch = if let Some(hex) = entity.strip_prefix("#x").or_else(|| entity.strip_prefix("#X")) {
                u32::from_str_radix(hex, 16).ok().and_then(char::from_u32)
            } else if let Some(dec) = entity.strip_prefix('#') {
                dec.parse::<u32>().ok().and_then(char::from_u32)
            } else {
                named_entity(entity)
            };
            ch.map(|c| (c, semi))
        });
        match decoded {
            Some((c, semi)) => {
                out.push(c);
                rest = &after[semi + 1..];
            }
            None => {
                out.push('&');
                rest = after;
            }
        }
    }
    out.push_str(rest);
    Cow::Owned(out)
}

struct Tag<'a> {
    name: &'a str,
    attrs: &'a str,
}

impl<'a> Tag<'a> {
    fn local_name(&self) -> &'a str {
        local(self.name)
    }

    fn attr(&self, key: &str) -> Option<String> {
        self.attr_where(|k| k == key)
    }

    fn attr_where(&self, want: impl Fn(&str) -> bool) -> Option<String> {
        let mut rest = self.attrs;
        loop {
            rest = rest.trim_start();
            let eq = rest.find('=')?;
            let key = rest[..eq].trim();
            let after = rest[eq + 1..].trim_start();
            let quote = after.chars().next()?;
            if quote != '"' && quote != '\'' {
                return None;
            }
            let body = &after[1..];
            let end = body.find(quote)?;
            if want(key) {
                return Some(unescape(&body[..end]).into_owned());
            }
            rest = &body[end + 1..];
        }
    }
}

enum XmlEvent<'a> {
    Start(Tag<'a>),
    Empty(Tag<'a>),
    End(&'a str),
    Text(Cow<'a, str>),
}

struct XmlScanner<'a> {
    src: &'a str,
    pos: usize,
}

impl<'a> XmlScanner<'a> {
    fn new(src: &'a str) -> Self {
        Self { src, pos: 0 }
    }
}

impl<'a> Iterator for XmlScanner<'a> {
    type Item = XmlEvent<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let rest = self.src.get(self.pos..)?;
            if rest.is_empty() {
                return None;
            }
            if !rest.starts_with('<') {
                let end = rest.find('<').unwrap_or(rest.len());
                self.pos += end;
                return Some(XmlEvent::Text(unescape(&rest[..end])));
            }
            if let Some(body) = rest.strip_prefix("<![CDATA[") {
                let end = body.find("]]>").unwrap_or(body.len());
                self.pos += "<![CDATA[".len() + end + "]]>".len().min(body.len() - end);
                return Some(XmlEvent::Text(Cow::Borrowed(&body[..end])));
            }
            if rest.starts_with("<!--") {
                let end = rest.find("-->").map(|i| i + 3).unwrap_or(rest.len());
                self.pos += end;
                continue;
            }
            let Some(close) = rest.find('>') else {
                self.pos = self.src.len();
                return None;
            };
            let inner = &rest[1..close];
            self.pos += close + 1;
            if inner.starts_with('?') || inner.starts_with('!') {
                continue;
            }
            if let Some(name) = inner.strip_prefix('/') {
                return Some(XmlEvent::End(name.trim()));
            }
            let (inner, empty) = match inner.strip_suffix('/') {
                Some(i) => (i, true),
                None => (inner, false),
            };
            let split = inner
                .find(|c: char| c.is_ascii_whitespace())
                .unwrap_or(inner.len());
            let tag = Tag {
                name: &inner[..split],
                attrs: &inner[split..],
            };
            return Some(if empty {
                XmlEvent::Empty(tag)
            } else {
                XmlEvent::Start(tag)
            });
        }
    }
}

#[cfg(test)]
pub(crate) mod fixtures {
    use std::io::Write;

    use zip::write::FileOptions;
    use zip::ZipWriter;

    fn escape(s: &str) -> String {
        s.replace('&', "&amp;").replace('<', "&lt;").replace('>', "&gt;")
    }

    fn col_name(i: usize) -> String {
        let mut n = i + 1;
        let mut out = Vec::new();
        while n > 0 {
            let rem = (n - 1) % 26;
            out.push((b'A' + rem as u8) as char);
            n = (n - 1) / 26;
        }
        out.iter().rev().collect()
    }

    /// A one-sheet workbook using shared strings for every non-empty cell.
    pub fn xlsx(rows: &[Vec<&str>]) -> Vec<u8> {
        let mut shared: Vec<String> = Vec::new();
        let mut sheet = String::from(
            r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?><worksheet xmlns="http://schemas.openxmlformats.org/spreadsheetml/2006/main"><sheetData>"#,
        );
        for (r, row) in rows.iter().enumerate() {
            sheet.push_str(&format!(r#"<row r="{}">"#, r + 1));
            for (c, value) in row.iter().enumerate() {
                if value.is_empty() {
                    continue;
                }
                let idx = shared.len();
                shared.push(escape(value));
                sheet.push_str(&format!(
                    r#"<c r="{}{}" t="s"><v>{}</v></c>"#,
                    col_name(c),
                    r + 1,
                    idx
                ));
            }
            sheet.push_str("</row>");
        }
        sheet.push_str("</sheetData></worksheet>");

        let sst = format!(
            r#"<?xml version="1.0" encoding="UTF-8"?><sst xmlns="http://schemas.openxmlformats.org/spreadsheetml/2006/main" count="{0}" uniqueCount="{0}">{1}</sst>"#,
            shared.len(),
            shared
                .iter()
                .map(|s| format!("<si><t>{}</t></si>", s))
                .collect::<String>()
        );
        let workbook = r#"<?xml version="1.0" encoding="UTF-8"?><workbook xmlns="http://schemas.openxmlformats.org/spreadsheetml/2006/main" xmlns:r="http://schemas.openxmlformats.org/officeDocument/2006/relationships"><sheets><sheet name="Presencas" sheetId="1" r:id="rId1"/></sheets></workbook>"#;
        let rels = r#"<?xml version="1.0" encoding="UTF-8"?><Relationships xmlns="http://schemas.openxmlformats.org/package/2006/relationships"><Relationship Id="rId1" Type="http://schemas.openxmlformats.org/officeDocument/2006/relationships/worksheet" Target="worksheets/sheet1.xml"/></Relationships>"#;

        let mut zip = ZipWriter::new(std::io::Cursor::new(Vec::new()));
        let opts = FileOptions::default();
        for (name, body) in [
            ("xl/workbook.xml", workbook.to_string()),
            ("xl/_rels/workbook.xml.rels", rels.to_string()),
            ("xl/sharedStrings.xml", sst),
            ("xl/worksheets/sheet1.xml", sheet),
        ] {
            zip.start_file(name, opts).expect("start file");
            zip.write_all(body.as_bytes()).expect("write part");
        }
        zip.finish().expect("finish zip").into_inner()
    }
}
