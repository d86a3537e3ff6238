//! Operator-visible degradation lines on stderr, one `KEY=value` record per
//! line so they stay greppable next to the tracing output.

fn sanitize_value(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut prev_sep = false;
    for ch in value.chars() {
        if ch.is_ascii_whitespace() {
            if !out.is_empty() && !prev_sep {
                out.push('_');
                prev_sep = true;
            }
        } else if ch.is_ascii_graphic() {
            out.push(ch);
            prev_sep = false;
        }
    }
    let trimmed = out.trim_matches('_');
    if trimmed.is_empty() {
        "na".to_string()
    } else {
        trimmed.to_string()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct WarnEvent<'a> {
    pub code: &'a str,
    pub stage: &'a str,
    pub path: &'a str,
    pub reason: &'a str,
    pub err: &'a str,
}

pub fn format_line(event: &WarnEvent<'_>) -> String {
    format!(
        "VOXTALLY_WARN code={} stage={} path={} reason={} err={}",
        sanitize_value(event.code),
        sanitize_value(event.stage),
        sanitize_value(event.path),
        sanitize_value(event.reason),
        sanitize_value(event.err),
    )
}

pub fn emit(event: WarnEvent<'_>) {
    eprintln!("{}", format_line(&event));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_value_rewrites_whitespace() {
        assert_eq!(sanitize_value("a b\tc"), "a_b_c");
    }

    #[test]
    fn sanitize_value_falls_back_for_empty() {
        assert_eq!(sanitize_value("   "), "na");
    }

    #[test]
    fn line_carries_every_key() {
        let line = format_line(&WarnEvent {
            code: "CACHE_RESET",
            stage: "cache-load",
            path: "/tmp/cache file.json",
            reason: "",
            err: "expected value at line 1",
        });
        assert_eq!(
            line,
            "VOXTALLY_WARN code=CACHE_RESET stage=cache-load path=/tmp/cache_file.json reason=na err=expected_value_at_line_1"
        );
    }
}
