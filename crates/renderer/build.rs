use std::env;
use std::process::Command;

use time::OffsetDateTime;
use time::macros::format_description;

fn git_short_sha() -> Option<String> {
    let out = Command::new("git")
        .args(["rev-parse", "--short=8", "HEAD"])
        .output()
        .ok()?;
    if !out.status.success() {
        return None;
    }
    let sha = String::from_utf8(out.stdout).ok()?.trim().to_string();
    (!sha.is_empty()).then_some(sha)
}

fn main() {
    println!("cargo:rerun-if-env-changed=SOURCE_DATE_EPOCH");
    println!("cargo:rerun-if-changed=../../.git/HEAD");

    let built = env::var("SOURCE_DATE_EPOCH")
        .ok()
        .and_then(|v| v.parse::<i64>().ok())
        .and_then(|secs| OffsetDateTime::from_unix_timestamp(secs).ok())
        .unwrap_or_else(OffsetDateTime::now_utc);
    let build_date = built
        .format(format_description!("[year]-[month]-[day]"))
        .unwrap_or_else(|_| "unknown-date".to_string());

    println!(
        "cargo:rustc-env=GIT_SHA={}",
        git_short_sha().unwrap_or_else(|| "unknown".to_string())
    );
    println!("cargo:rustc-env=BUILD_DATE={build_date}");
}
