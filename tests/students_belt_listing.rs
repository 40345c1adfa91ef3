mod test_support;

use serde_json::{json, Value};
use test_support::Sidecar;

fn find<'a>(students: &'a [Value], id: &str) -> &'a Value {
    students
        .iter()
        .find(|s| s["id"] == id)
        .unwrap_or_else(|| panic!("student {} not listed", id))
}

#[test]
fn listing_resolves_belts_from_every_source() {
    let mut s = Sidecar::start("dojod-students-belts");
    s.ok(
        "students.create",
        json!({
            "id": "legacy", "name": "Lia Legado", "email": "lia@dojo.test",
            "currentRank": "Marrom", "currentDegree": 0,
            "createdAt": "2024-01-01T00:00:00Z"
        }),
    );
    s.ok(
        "students.create",
        json!({
            "id": "text", "name": "Tiago Texto", "email": "tiago@dojo.test",
            "profile": { "beltName": "AMARELA", "degree": 2 },
            "createdAt": "2024-01-02T00:00:00Z"
        }),
    );
    s.ok(
        "students.create",
        json!({
            "id": "unknown", "name": "Uma Desconhecida", "email": "uma@dojo.test",
            "profile": { "beltName": "purple", "degree": 1 },
            "createdAt": "2024-01-03T00:00:00Z"
        }),
    );
    let graded = s.student("graded", "Gil Graduado", "2024-01-04T00:00:00Z");
    s.ok(
        "gradings.create",
        json!({
            "studentId": graded, "previousRank": "branca", "newRank": "cinza", "newDegree": 1,
            "date": "2024-02-01", "status": "pendente", "createdAt": "2024-02-01T00:00:00Z"
        }),
    );
    s.ok(
        "gradings.create",
        json!({
            "studentId": graded, "previousRank": "cinza", "newRank": "amarela", "newDegree": 0,
            "date": "2024-03-01", "status": "pendente", "createdAt": "2024-03-01T00:00:00Z"
        }),
    );
    s.student("plain", "Paulo Puro", "2024-01-05T00:00:00Z");

    let result = s.ok("students.list", json!({}));
    let students = result["students"].as_array().expect("students");
    assert_eq!(students.len(), 5);
    assert_eq!(students[0]["id"], "plain");

    let legacy = &find(students, "legacy")["belt"];
    assert_eq!(legacy["rankKey"], "marrom");
    assert_eq!(legacy["label"], "Marrom");
    assert_eq!(legacy["source"], "legacyRank");

    let text = &find(students, "text")["belt"];
    assert_eq!(text["label"], "Amarela • 2º grau");
    assert_eq!(text["source"], "profileRank");

    let unknown = &find(students, "unknown")["belt"];
    assert_eq!(unknown["rankKey"], "branca");
    assert_eq!(unknown["degree"], 1);
    assert_eq!(unknown["color"], "#ffffff");

    let graded_belt = &find(students, "graded")["belt"];
    assert_eq!(graded_belt["rankKey"], "amarela");
    assert_eq!(graded_belt["label"], "Amarela");
    assert_eq!(graded_belt["source"], "grading");

    let plain = &find(students, "plain")["belt"];
    assert_eq!(plain["label"], "Branca");
    assert_eq!(plain["source"], "fallback");

    let history = s.ok("gradings.list", json!({ "studentId": graded }));
    let gradings = history["gradings"].as_array().expect("gradings");
    assert_eq!(gradings.len(), 2);
    assert_eq!(gradings[0]["newRank"], "amarela");
    assert_eq!(gradings[0]["previousRank"], "cinza");
}

#[test]
fn listing_filters_by_search_and_status() {
    let mut s = Sidecar::start("dojod-students-filter");
    s.student("a", "Ana Souza", "2024-01-01T00:00:00Z");
    s.ok(
        "students.create",
        json!({
            "id": "b", "name": "Bruno Souza", "email": "bruno@dojo.test", "active": false,
            "createdAt": "2024-01-02T00:00:00Z"
        }),
    );
    s.student("c", "Carla Dias", "2024-01-03T00:00:00Z");

    let souza = s.ok("students.list", json!({ "search": "souza" }));
    let ids: Vec<&str> = souza["students"]
        .as_array()
        .expect("students")
        .iter()
        .filter_map(|v| v["id"].as_str())
        .collect();
    assert_eq!(ids, vec!["b", "a"]);

    let active = s.ok("students.list", json!({ "search": "souza", "status": "ativo" }));
    assert_eq!(active["students"].as_array().map(Vec::len), Some(1));

    let err = s.err("students.list", json!({ "status": "talvez" }));
    assert_eq!(err["code"], "bad_params");
}

#[test]
fn belt_edits_are_validated() {
    let mut s = Sidecar::start("dojod-students-edit");
    let id = s.student("a", "Ana", "2024-01-01T00:00:00Z");
    let err = s.err("students.updateBelt", json!({ "studentId": id, "beltId": 999 }));
    assert_eq!(err["code"], "bad_params");
    let err = s.err("students.updateBelt", json!({ "studentId": "ghost", "beltName": "azul" }));
    assert_eq!(err["code"], "not_found");

    s.ok("students.updateBelt", json!({ "studentId": id, "beltId": 9, "degree": 8 }));
    let list = s.ok("students.list", json!({}));
    let belt = &list["students"][0]["belt"];
    assert_eq!(belt["rankKey"], "preta");
    assert_eq!(belt["degree"], 6);
    assert_eq!(belt["label"], "Preta • 6º grau");
    assert_eq!(belt["source"], "catalogLink");
}

#[test]
fn grading_degrees_must_fit_a_belt_degree() {
    let mut s = Sidecar::start("dojod-grading-degree");
    let id = s.student("a", "Ana", "2024-01-01T00:00:00Z");
    for degree in [json!(-1), json!(4_294_967_296u64)] {
        let err = s.err(
            "gradings.create",
            json!({ "studentId": id, "newRank": "azul", "newDegree": degree, "date": "2024-02-01" }),
        );
        assert_eq!(err["code"], "bad_params");
    }
    let err = s.err(
        "students.updateBelt",
        json!({ "studentId": id, "beltName": "azul", "degree": -2 }),
    );
    assert_eq!(err["code"], "bad_params");

    s.ok(
        "gradings.create",
        json!({ "studentId": id, "newRank": "azul", "newDegree": 4, "date": "2024-02-01" }),
    );
    let list = s.ok("gradings.list", json!({ "studentId": id }));
    assert_eq!(list["gradings"].as_array().map(Vec::len), Some(1));
}
