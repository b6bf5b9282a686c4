//! Smoke test of the full exchange flow through the installed binary.

use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use serde_json::Value;

fn temp_db() -> PathBuf {
    std::env::temp_dir().join(format!(
        "toolshare-cli-smoke-{}.sqlite3",
        std::process::id()
    ))
}

fn toolshare(db_path: &Path, args: &[&str]) -> Output {
    let mut command = Command::new(env!("CARGO_BIN_EXE_toolshare"));
    command.arg("--db").arg(db_path);
    for arg in args {
        command.arg(arg);
    }
    match command.output() {
        Ok(output) => output,
        Err(err) => panic!("failed to execute toolshare {args:?}: {err}"),
    }
}

fn json_ok(db_path: &Path, args: &[&str]) -> Value {
    let output = toolshare(db_path, args);
    assert!(
        output.status.success(),
        "command {args:?} failed: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    match serde_json::from_slice(&output.stdout) {
        Ok(value) => value,
        Err(err) => panic!(
            "command {args:?} printed invalid JSON: {err}\n{}",
            String::from_utf8_lossy(&output.stdout)
        ),
    }
}

fn json_err(db_path: &Path, args: &[&str]) -> Value {
    let output = toolshare(db_path, args);
    assert!(
        !output.status.success(),
        "command {args:?} unexpectedly succeeded"
    );
    match serde_json::from_slice(&output.stderr) {
        Ok(value) => value,
        Err(err) => panic!(
            "command {args:?} printed invalid error JSON: {err}\n{}",
            String::from_utf8_lossy(&output.stderr)
        ),
    }
}

#[test]
fn exchange_flow_through_the_binary() {
    let db_path = temp_db();
    let _ = std::fs::remove_file(&db_path);

    json_ok(&db_path, &["init"]);

    let owner = json_ok(
        &db_path,
        &[
            "user", "register", "--username", "u1", "--email", "u1@example.com", "--password",
            "pw1",
        ],
    );
    let borrower = json_ok(
        &db_path,
        &[
            "user", "register", "--username", "u2", "--email", "u2@example.com", "--password",
            "pw2",
        ],
    );
    let owner_id = owner["user_id"].to_string();
    let borrower_id = borrower["user_id"].to_string();

    let tool = json_ok(
        &db_path,
        &[
            "tool", "add", "--owner", &owner_id, "--name", "press", "--category", "shop",
        ],
    );
    let tool_id = tool["tool_id"].to_string();

    let reservation = json_ok(
        &db_path,
        &[
            "reservation",
            "create",
            "--tool-id",
            &tool_id,
            "--borrower",
            &borrower_id,
            "--start",
            "2024-06-01T00:00:00Z",
            "--end",
            "2024-06-05T00:00:00Z",
        ],
    );
    let reservation_id = reservation["reservation_id"].to_string();
    assert_eq!(reservation["status"], "pending");

    // Overlapping follow-up is rejected with the stable envelope kind.
    let conflict = json_err(
        &db_path,
        &[
            "reservation",
            "create",
            "--tool-id",
            &tool_id,
            "--borrower",
            &borrower_id,
            "--start",
            "2024-06-03T00:00:00Z",
            "--end",
            "2024-06-04T00:00:00Z",
        ],
    );
    assert_eq!(conflict["error"]["kind"], "booking_conflict");

    // Self-booking gets its own kind.
    let self_booking = json_err(
        &db_path,
        &[
            "reservation",
            "create",
            "--tool-id",
            &tool_id,
            "--borrower",
            &owner_id,
            "--start",
            "2024-07-01T00:00:00Z",
            "--end",
            "2024-07-02T00:00:00Z",
        ],
    );
    assert_eq!(self_booking["error"]["kind"], "self_booking");

    for status in ["approved", "completed"] {
        json_ok(
            &db_path,
            &[
                "reservation",
                "status",
                "--reservation-id",
                &reservation_id,
                "--status",
                status,
                "--actor",
                &owner_id,
            ],
        );
    }

    let out_of_range = json_err(
        &db_path,
        &[
            "rating",
            "add",
            "--reservation-id",
            &reservation_id,
            "--rater",
            &borrower_id,
            "--score",
            "6",
        ],
    );
    assert_eq!(out_of_range["error"]["kind"], "invalid_score");

    let rating = json_ok(
        &db_path,
        &[
            "rating",
            "add",
            "--reservation-id",
            &reservation_id,
            "--rater",
            &borrower_id,
            "--score",
            "5",
        ],
    );
    assert_eq!(rating["rated_user_id"].to_string(), owner_id);

    let user = json_ok(&db_path, &["user", "show", "--user-id", &owner_id]);
    assert_eq!(user["trust_score"], 5.0);

    let top = json_ok(&db_path, &["report", "top-rated"]);
    assert_eq!(top[0]["username"], "u1");

    let _ = std::fs::remove_file(&db_path);
}
