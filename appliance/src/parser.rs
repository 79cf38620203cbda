use std::collections::HashMap;

use crate::error::{ApplianceError, Result};

/// Join continuation lines (RouterOS wraps long `key=value` output onto a
/// following line that starts with whitespace) back into single logical
/// lines, then split each logical line into one record.
fn unwrap_continuations(raw: &str) -> Vec<String> {
    let mut logical = Vec::new();
    for line in raw.lines() {
        if line.starts_with(' ') || line.starts_with('\t') {
            if let Some(last) = logical.last_mut() {
                let joined: &mut String = last;
                joined.push(' ');
                joined.push_str(line.trim());
                continue;
            }
        }
        logical.push(line.to_string());
    }
    logical
}

/// Split a logical line into `key=value` pairs. Values may be double-quoted
/// to contain spaces (`comment="production db"`).
fn split_fields(line: &str) -> HashMap<String, String> {
    let mut fields = HashMap::new();
    let bytes = line.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        while i < bytes.len() && bytes[i] == b' ' {
            i += 1;
        }
        let key_start = i;
        while i < bytes.len() && bytes[i] != b'=' && bytes[i] != b' ' {
            i += 1;
        }
        if i >= bytes.len() || bytes[i] != b'=' {
            // no '=' found for this token; skip to next space-delimited word
            while i < bytes.len() && bytes[i] != b' ' {
                i += 1;
            }
            continue;
        }
        let key = line[key_start..i].to_string();
        i += 1; // skip '='
        let value = if i < bytes.len() && bytes[i] == b'"' {
            i += 1;
            let val_start = i;
            while i < bytes.len() && bytes[i] != b'"' {
                i += 1;
            }
            let val = line[val_start..i].to_string();
            i += 1; // skip closing quote
            val
        } else {
            let val_start = i;
            while i < bytes.len() && bytes[i] != b' ' {
                i += 1;
            }
            line[val_start..i].to_string()
        };
        if !key.is_empty() {
            fields.insert(key, value);
        }
    }
    fields
}

/// Parse `/disk print detail`-style output into one record per disk/export.
/// Blank lines and index-only header lines are skipped; a record is any
/// logical line containing at least one `key=value` pair.
pub fn parse_records(raw: &str) -> Vec<HashMap<String, String>> {
    unwrap_continuations(raw)
        .into_iter()
        .filter_map(|line| {
            let fields = split_fields(&line);
            if fields.is_empty() {
                None
            } else {
                Some(fields)
            }
        })
        .collect()
}

/// Parse the single-record output of a `print` for one known slot. Returns
/// `NotFound` if the appliance reported no matching rows (RouterOS prints
/// nothing, not an error, when a `find` filter matches zero rows).
pub fn parse_single(raw: &str, slot: &str) -> Result<HashMap<String, String>> {
    let mut records = parse_records(raw);
    if records.is_empty() {
        return Err(ApplianceError::NotFound {
            slot: slot.to_string(),
        });
    }
    Ok(records.remove(0))
}

/// Classify a raw stderr line from the appliance CLI into a sentinel error
/// kind. RouterOS-derived CLIs report errors as free text; this is the one
/// place in the crate that is allowed to match on substrings of that text.
pub fn classify_failure(slot: &str, stderr: &str) -> ApplianceError {
    let lower = stderr.to_lowercase();
    if lower.contains("no such item") || lower.contains("not found") {
        ApplianceError::NotFound {
            slot: slot.to_string(),
        }
    } else if lower.contains("already have") || lower.contains("already exists") {
        ApplianceError::AlreadyExists {
            slot: slot.to_string(),
        }
    } else if lower.contains("out of disk space") || lower.contains("not enough") {
        ApplianceError::ResourceExhausted(stderr.to_string())
    } else if lower.contains("invalid value") || lower.contains("bad argument") {
        ApplianceError::InvalidParameter(stderr.to_string())
    } else if lower.contains("timeout")
        || lower.contains("connection")
        || lower.contains("broken pipe")
        || lower.contains("eof")
    {
        ApplianceError::TransientTransport(stderr.to_string())
    } else {
        ApplianceError::Terminal(stderr.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn joins_continuation_lines() {
        let raw = "0 name=\"pvc-aaa\" size=1073741824\n    nqn=\"nqn.2024-01.local.rds:pvc-\\\n    aaa\"";
        let lines = unwrap_continuations(raw);
        assert_eq!(lines.len(), 1);
    }

    #[test]
    fn parses_quoted_and_bare_values() {
        let raw = "0 name=\"pvc-aaa\" size=1073741824 comment=\"prod db\"";
        let records = parse_records(raw);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].get("name").unwrap(), "pvc-aaa");
        assert_eq!(records[0].get("size").unwrap(), "1073741824");
        assert_eq!(records[0].get("comment").unwrap(), "prod db");
    }

    #[test]
    fn empty_output_is_not_found() {
        let err = parse_single("", "pvc-missing").unwrap_err();
        assert!(matches!(err, ApplianceError::NotFound { .. }));
    }

    #[test]
    fn classifies_transient_vs_terminal() {
        assert!(matches!(
            classify_failure("pvc-aaa", "connection reset by peer"),
            ApplianceError::TransientTransport(_)
        ));
        assert!(matches!(
            classify_failure("pvc-aaa", "no such item"),
            ApplianceError::NotFound { .. }
        ));
        assert!(matches!(
            classify_failure("pvc-aaa", "out of disk space on pool"),
            ApplianceError::ResourceExhausted(_)
        ));
        assert!(matches!(
            classify_failure("pvc-aaa", "something unexpected happened"),
            ApplianceError::Terminal(_)
        ));
    }
}
