mod test_support;

use serde_json::json;
use test_support::*;

#[test]
fn router_dispatch_smoke_covers_handler_families() {
    let workspace = temp_dir("datesync-router-smoke");
    let ext_path = workspace.join("records.sqlite3");
    let _ = create_external_db(&ext_path);

    let (mut child, mut stdin, mut reader) = spawn_sidecar();

    let health = request(&mut stdin, &mut reader, "1", "health", json!({}));
    assert_eq!(health["ok"].as_bool(), Some(true));
    assert!(health["result"]["version"].is_string());

    for (id, method, params) in [
        (
            "2",
            "workspace.select",
            json!({ "path": workspace.to_string_lossy() }),
        ),
        ("3", "setup.get", json!({})),
        (
            "4",
            "setup.update",
            json!({
                "section": "datesync",
                "patch": {
                    "dbType": "sqlite",
                    "dbName": ext_path.to_string_lossy(),
                    "assessmentsTable": "assessments",
                    "extensionsTable": "student_extensions"
                }
            }),
        ),
        ("5", "dates.preview", json!({})),
        ("6", "dates.run", json!({})),
    ] {
        let value = request(&mut stdin, &mut reader, id, method, params);
        let code = value["error"]["code"].as_str().unwrap_or("");
        assert_ne!(code, "not_implemented", "unexpected unknown method {}", method);
    }

    let unknown = request(&mut stdin, &mut reader, "7", "dates.nope", json!({}));
    assert_eq!(unknown["error"]["code"].as_str(), Some("not_implemented"));

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}
