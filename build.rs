use std::env;
use std::process::Command;

fn main() {
    println!("cargo:rerun-if-changed=build.rs");
    println!("cargo:rerun-if-env-changed=GIT_COMMIT");

    // An explicit GIT_COMMIT (e.g. from CI) wins over asking git.
    if env::var("GIT_COMMIT").is_ok() {
        return;
    }

    let output = Command::new("git")
        .args(["rev-parse", "--short=12", "HEAD"])
        .output();

    match output {
        Ok(out) if out.status.success() => {
            let commit = String::from_utf8_lossy(&out.stdout).trim().to_string();
            if !commit.is_empty() {
                println!("cargo:rustc-env=GIT_COMMIT={commit}");
            }
        }
        _ => println!("cargo:warning=git unavailable, commit hash will be reported as unknown"),
    }
}
