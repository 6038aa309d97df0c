use std::fs;
use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

fn main() {
    println!("cargo:rerun-if-changed=Cargo.toml");
    println!("cargo:rerun-if-changed=build.rs");
    println!("cargo:rerun-if-changed=src");

    let build_ts = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    println!("cargo:rerun-if-env-changed=SPECAVG_RELEASE_TAG");

    // Shown by `specavg --version`.
    let pkg_version = std::env::var("CARGO_PKG_VERSION").unwrap_or_default();
    let version_line = match std::env::var("SPECAVG_RELEASE_TAG") {
        Ok(tag) if !tag.trim().is_empty() => {
            format!("{pkg_version} ({}, built {build_ts})", tag.trim())
        }
        _ => format!("{pkg_version} (built {build_ts})"),
    };
    println!("cargo:rustc-env=SPECAVG_VERSION_LINE={version_line}");

    enforce_engine_presentation_boundary();
}

fn enforce_engine_presentation_boundary() {
    // Keep the numeric library free of terminal output and CLI parsing; only
    // the binary entry point may print.
    let forbidden = [
        "comfy_table",
        "clap::",
        "println!",
        "eprintln!",
        "std::process::exit",
    ];
    let binary_entry = PathBuf::from("src").join("main.rs");

    let mut violations = Vec::new();
    let mut stack = vec![PathBuf::from("src")];
    while let Some(dir) = stack.pop() {
        let entries = match fs::read_dir(&dir) {
            Ok(e) => e,
            Err(_) => continue,
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_dir() {
                stack.push(path);
                continue;
            }
            if path.extension().and_then(|s| s.to_str()) != Some("rs") || path == binary_entry {
                continue;
            }
            let rel = path.to_string_lossy().to_string();
            let src = match fs::read_to_string(&path) {
                Ok(s) => s,
                Err(_) => continue,
            };
            for (line_no, line) in src.lines().enumerate() {
                for token in &forbidden {
                    if line.contains(token) {
                        violations.push(format!(
                            "{}:{} contains forbidden token '{}'",
                            rel,
                            line_no + 1,
                            token
                        ));
                    }
                }
            }
        }
    }

    if !violations.is_empty() {
        eprintln!("\nerror: presentation code detected in specavg library modules:");
        for v in violations {
            eprintln!("  - {v}");
        }
        panic!("presentation leakage in specavg library modules");
    }
}
