use std::process::Command;

/// Trimmed stdout of a successful command, or `"unknown"`.
fn command_output(program: &str, args: &[&str]) -> String {
    Command::new(program)
        .args(args)
        .output()
        .ok()
        .filter(|o| o.status.success())
        .map(|o| String::from_utf8_lossy(&o.stdout).trim().to_string())
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "unknown".to_string())
}

fn main() {
    let describe = command_output("git", &["describe", "--always", "--dirty", "--abbrev=10"]);
    let build_date = command_output("date", &["-u", "+%Y-%m-%d"]);
    let target = std::env::var("TARGET").unwrap_or_else(|_| "unknown".to_string());

    println!("cargo:rustc-env=VOCU_TTS_GIT_HASH={describe}");
    println!("cargo:rustc-env=VOCU_TTS_BUILD_DATE={build_date}");
    println!("cargo:rustc-env=VOCU_TTS_TARGET={target}");

    println!("cargo:rerun-if-changed=.git/HEAD");
    println!("cargo:rerun-if-changed=.git/index");
}
