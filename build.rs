use std::collections::BTreeSet;
use std::env;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

const PREFIX: &[u8] = b"VOXTALLY_";

fn collect_rs_files(dir: &Path, out: &mut Vec<PathBuf>) -> std::io::Result<()> {
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if path.is_dir() {
            collect_rs_files(&path, out)?;
        } else if path.extension().and_then(|ext| ext.to_str()) == Some("rs") {
            out.push(path);
        }
    }
    Ok(())
}

fn is_env_char(byte: u8) -> bool {
    byte.is_ascii_uppercase() || byte.is_ascii_digit() || byte == b'_'
}

/// Collect `VOXTALLY_*` tokens that start a word, so identifiers such as
/// `GENERATED_VOXTALLY_...` do not leak into the allowlist.
fn collect_env_keys(source: &str, out: &mut BTreeSet<String>) {
    let bytes = source.as_bytes();
    let n = PREFIX.len();
    let mut i = 0usize;
    while i + n <= bytes.len() {
        let starts_word =
            i == 0 || !(is_env_char(bytes[i - 1]) || bytes[i - 1].is_ascii_lowercase());
        if starts_word && &bytes[i..i + n] == PREFIX {
            let mut j = i + n;
            while j < bytes.len() && is_env_char(bytes[j]) {
                j += 1;
            }
            if j > i + n {
                if let Some(raw) = source.get(i..j) {
                    out.insert(raw.to_string());
                }
                i = j;
                continue;
            }
        }
        i += 1;
    }
}

fn write_generated_allowlist() -> std::io::Result<()> {
    let mut rs_files = Vec::new();
    collect_rs_files(Path::new("src"), &mut rs_files)?;

    let mut keys = BTreeSet::new();
    for file in rs_files {
        if let Ok(content) = fs::read_to_string(&file) {
            collect_env_keys(&content, &mut keys);
        }
    }
    // stderr line tag, not a variable
    keys.remove("VOXTALLY_WARN");

    let out_dir = env::var("OUT_DIR").expect("OUT_DIR is set by cargo");
    let generated = Path::new(&out_dir).join("voxtally_env_allowlist.rs");
    let mut f = fs::File::create(generated)?;
    writeln!(f, "pub const GENERATED_VOXTALLY_ENV_ALLOWLIST: &[&str] = &[")?;
    for key in keys {
        writeln!(f, "    \"{key}\",")?;
    }
    writeln!(f, "];")?;
    Ok(())
}

fn main() {
    write_generated_allowlist().expect("failed to generate VOXTALLY env allowlist");

    let now = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .expect("system clock before unix epoch");
    let build_id = format!("{:x}-{:x}", now.as_secs(), now.subsec_nanos());

    println!("cargo:rustc-env=BUILD_UUID={build_id}");
    println!("cargo:rerun-if-changed=build.rs");
    println!("cargo:rerun-if-changed=src");
}
