#![allow(dead_code)]

use serde_json::{json, Value};
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::time::{SystemTime, UNIX_EPOCH};
use zip::write::FileOptions;
use zip::ZipWriter;

pub fn temp_dir(prefix: &str) -> PathBuf {
    let p = std::env::temp_dir().join(format!(
        "{}-{}",
        prefix,
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock")
            .as_nanos()
    ));
    std::fs::create_dir_all(&p).expect("create temp dir");
    p
}

pub fn spawn_sidecar() -> (Child, ChildStdin, BufReader<ChildStdout>) {
    let exe = env!("CARGO_BIN_EXE_dojod");
    let mut child = Command::new(exe)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn dojod");
    let stdin = child.stdin.take().expect("child stdin");
    let stdout = child.stdout.take().expect("child stdout");
    (child, stdin, BufReader::new(stdout))
}

pub fn request(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: Value,
) -> Value {
    let payload = json!({
        "id": id,
        "method": method,
        "params": params,
    });
    writeln!(stdin, "{}", payload).expect("write request");
    stdin.flush().expect("flush request");

    let mut line = String::new();
    reader.read_line(&mut line).expect("read response line");
    assert!(!line.trim().is_empty(), "empty response for {}", method);
    let value: Value = serde_json::from_str(line.trim()).expect("parse response json");
    assert_eq!(value.get("id").and_then(|v| v.as_str()), Some(id));
    value
}

pub fn request_ok(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: Value,
) -> Value {
    let value = request(stdin, reader, id, method, params);
    assert_eq!(
        value.get("ok").and_then(|v| v.as_bool()),
        Some(true),
        "{} failed: {}",
        method,
        value
    );
    value.get("result").cloned().unwrap_or(Value::Null)
}

/// Returns the `error` object of a failed response.
pub fn request_err(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: Value,
) -> Value {
    let value = request(stdin, reader, id, method, params);
    assert_eq!(
        value.get("ok").and_then(|v| v.as_bool()),
        Some(false),
        "{} unexpectedly succeeded: {}",
        method,
        value
    );
    value.get("error").cloned().unwrap_or(Value::Null)
}

/// A running sidecar with a freshly selected workspace.
pub struct Sidecar {
    pub child: Child,
    pub stdin: ChildStdin,
    pub reader: BufReader<ChildStdout>,
    pub workspace: PathBuf,
    next_id: u64,
}

impl Sidecar {
    pub fn start(prefix: &str) -> Self {
        let workspace = temp_dir(prefix);
        let (child, stdin, reader) = spawn_sidecar();
        let mut s = Sidecar {
            child,
            stdin,
            reader,
            workspace,
            next_id: 0,
        };
        let path = s.workspace.to_string_lossy().to_string();
        s.ok("workspace.select", json!({ "path": path }));
        s
    }

    fn id(&mut self) -> String {
        self.next_id += 1;
        self.next_id.to_string()
    }

    pub fn ok(&mut self, method: &str, params: Value) -> Value {
        let id = self.id();
        request_ok(&mut self.stdin, &mut self.reader, &id, method, params)
    }

    pub fn err(&mut self, method: &str, params: Value) -> Value {
        let id = self.id();
        request_err(&mut self.stdin, &mut self.reader, &id, method, params)
    }

    pub fn student(&mut self, id: &str, name: &str, created_at: &str) -> String {
        let result = self.ok(
            "students.create",
            json!({
                "id": id,
                "name": name,
                "email": format!("{}@dojo.test", name.to_lowercase().replace(' ', ".")),
                "createdAt": created_at
            }),
        );
        result["studentId"].as_str().expect("studentId").to_string()
    }

    pub fn group(&mut self, name: &str) -> String {
        let result = self.ok("groups.create", json!({ "name": name }));
        result["groupId"].as_str().expect("groupId").to_string()
    }

    pub fn enroll(&mut self, student_id: &str, group_id: &str, status: &str) -> String {
        let result = self.ok(
            "enrollments.create",
            json!({ "studentId": student_id, "groupId": group_id, "status": status }),
        );
        result["enrollmentId"].as_str().expect("enrollmentId").to_string()
    }

    /// Class on the given group (or none) plus one session of it.
    pub fn session(&mut self, group_id: Option<&str>) -> String {
        let class = self.ok(
            "classes.create",
            json!({
                "name": "Jiu-Jitsu Adulto",
                "weekday": 2,
                "startTime": "19:00",
                "endTime": "20:30",
                "groupId": group_id
            }),
        );
        let class_id = class["classId"].as_str().expect("classId").to_string();
        let session = self.ok(
            "sessions.create",
            json!({ "classId": class_id, "date": "2024-03-05", "status": "agendada" }),
        );
        session["sessionId"].as_str().expect("sessionId").to_string()
    }

    pub fn records(&mut self, session_id: &str) -> Vec<Value> {
        let result = self.ok("attendance.list", json!({ "classSessionId": session_id }));
        result["records"].as_array().cloned().unwrap_or_default()
    }
}

/// Single-sheet XLSX workbook with every non-empty cell as an inline string.
pub fn write_xlsx(path: &std::path::Path, rows: &[Vec<&str>]) {
    let mut sheet = String::from(
        r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?><worksheet xmlns="http://schemas.openxmlformats.org/spreadsheetml/2006/main"><sheetData>"#,
    );
    for (r, row) in rows.iter().enumerate() {
        sheet.push_str(&format!(r#"<row r="{}">"#, r + 1));
        for (c, value) in row.iter().enumerate() {
            if value.is_empty() {
                continue;
            }
            let col = (b'A' + c as u8) as char;
            let escaped = value
                .replace('&', "&amp;")
                .replace('<', "&lt;")
                .replace('>', "&gt;");
            sheet.push_str(&format!(
                r#"<c r="{}{}" t="inlineStr"><is><t>{}</t></is></c>"#,
                col,
                r + 1,
                escaped
            ));
        }
        sheet.push_str("</row>");
    }
    sheet.push_str("</sheetData></worksheet>");

    let workbook = r#"<?xml version="1.0" encoding="UTF-8"?><workbook xmlns="http://schemas.openxmlformats.org/spreadsheetml/2006/main" xmlns:r="http://schemas.openxmlformats.org/officeDocument/2006/relationships"><sheets><sheet name="Presencas" sheetId="1" r:id="rId1"/></sheets></workbook>"#;
    let rels = r#"<?xml version="1.0" encoding="UTF-8"?><Relationships xmlns="http://schemas.openxmlformats.org/package/2006/relationships"><Relationship Id="rId1" Type="http://schemas.openxmlformats.org/officeDocument/2006/relationships/worksheet" Target="worksheets/sheet1.xml"/></Relationships>"#;

    let file = std::fs::File::create(path).expect("create xlsx");
    let mut zip = ZipWriter::new(file);
    for (name, body) in [
        ("xl/workbook.xml", workbook.to_string()),
        ("xl/_rels/workbook.xml.rels", rels.to_string()),
        ("xl/worksheets/sheet1.xml", sheet),
    ] {
        zip.start_file(name, FileOptions::default()).expect("start part");
        zip.write_all(body.as_bytes()).expect("write part");
    }
    zip.finish().expect("finish xlsx");
}
