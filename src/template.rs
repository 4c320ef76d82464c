//! Idempotent writers for managed configuration files.
//!
//! Managed files may be hand-edited between runs (comments, ordering, extra entries), so the
//! writers here never regenerate a whole file the operator may own. For Hadoop-style XML
//! property files, `upsert_property` inserts or replaces exactly one `<property>` element. For
//! plain-text files, `upsert_marker_block` owns only the region between two sentinel lines.
//! Files generated wholly by this tool go through `write_generated_file`.
//!
//! Ownership/backup discipline: a managed file carries an ownership marker (the "Generated by"
//! comment, or the begin marker itself). On the first mutation of a pre-existing file that lacks
//! the marker, a timestamped `.bak.<timestamp>` copy is made before anything is touched. A run
//! that changes nothing writes nothing and makes no backup.

use std::path::Path;

use chrono::offset::Local;
use failure_derive::Fail;
use log::{debug, info};

/// The ownership marker embedded in every file this tool generates or takes over.
pub const OWNERSHIP_MARKER: &str = "Generated by clusterup";

#[derive(Debug, Fail)]
pub enum TemplateError {
    #[fail(display = "cannot establish <configuration> root in {}: {}", path, reason)]
    BadRoot { path: String, reason: String },

    #[fail(
        display = "{}: found begin marker `{}` but no matching end marker `{}`",
        path, begin, end
    )]
    UnterminatedBlock {
        path: String,
        begin: String,
        end: String,
    },

    #[fail(display = "{}: malformed <property> element around `{}`", path, around)]
    MalformedProperty { path: String, around: String },
}

/// Escape a string for use inside an XML text node.
pub fn xml_escape(s: &str) -> String {
    s.replace('&', "&amp;").replace('<', "&lt;").replace('>', "&gt;")
}

fn xml_skeleton() -> String {
    format!(
        "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n<!-- {} -->\n<configuration>\n</configuration>\n",
        OWNERSHIP_MARKER
    )
}

/// The canonical rendering of one property element, from `<property>` through `</property>`.
fn property_element(name: &str, value: &str) -> String {
    format!(
        "<property>\n    <name>{}</name>\n    <value>{}</value>\n  </property>",
        name, value
    )
}

/// Ensure the named property exists in the XML property file with the given value.
///
/// Inserts the property if absent, replaces its element if present; every other byte of the file
/// is left untouched. A missing file is created from a minimal skeleton; a file without the
/// `<configuration>` wrapper is wrapped rather than discarded. Returns whether the file changed.
pub fn upsert_property(path: &Path, name: &str, value: &str) -> Result<bool, failure::Error> {
    let existed = path.exists();
    let original = if existed {
        std::fs::read_to_string(path)?
    } else {
        String::new()
    };

    let mut content = if existed {
        ensure_configuration_root(path, &original)?
    } else {
        xml_skeleton()
    };

    let name = xml_escape(name);
    let value = xml_escape(value);
    let element = property_element(&name, &value);

    let needle = format!("<name>{}</name>", name);
    if let Some(name_at) = content.find(&needle) {
        // Replace the enclosing <property> element with the canonical rendering.
        let start = content[..name_at]
            .rfind("<property>")
            .ok_or_else(|| TemplateError::MalformedProperty {
                path: path.display().to_string(),
                around: name.clone(),
            })?;
        let end_tag = "</property>";
        let end = content[name_at..]
            .find(end_tag)
            .map(|i| name_at + i + end_tag.len())
            .ok_or_else(|| TemplateError::MalformedProperty {
                path: path.display().to_string(),
                around: name.clone(),
            })?;

        content.replace_range(start..end, &element);
    } else {
        // Insert a fresh element just before the closing root tag.
        let close_at = content
            .rfind("</configuration>")
            .expect("root wrapper was just established");
        let mut insert = format!("  {}\n", element);
        if close_at > 0 && content.as_bytes()[close_at - 1] != b'\n' {
            insert.insert(0, '\n');
        }
        content.insert_str(close_at, &insert);
    }

    write_if_changed(path, existed, &original, &content, OWNERSHIP_MARKER)
}

/// Wrap or validate the `<configuration>` root, also making sure the ownership marker comment is
/// present so later runs know the file is managed.
fn ensure_configuration_root(path: &Path, original: &str) -> Result<String, failure::Error> {
    let mut content = if original.contains("<configuration>") {
        if !original.contains("</configuration>") {
            return Err(TemplateError::BadRoot {
                path: path.display().to_string(),
                reason: "unterminated <configuration> element".into(),
            }
            .into());
        }
        original.to_owned()
    } else if original.contains("</configuration>") {
        return Err(TemplateError::BadRoot {
            path: path.display().to_string(),
            reason: "</configuration> appears without an opening <configuration>".into(),
        }
        .into());
    } else {
        // Wrap the existing content rather than discarding it.
        let mut wrapped = String::new();
        let body = if let Some(rest) = original.strip_prefix("<?xml") {
            // Keep the declaration line on top of the wrapper.
            let decl_end = rest.find('\n').map(|i| i + 5 + 1).unwrap_or(original.len());
            wrapped.push_str(&original[..decl_end]);
            &original[decl_end..]
        } else {
            original
        };
        wrapped.push_str("<configuration>\n");
        wrapped.push_str(body);
        if !body.is_empty() && !body.ends_with('\n') {
            wrapped.push('\n');
        }
        wrapped.push_str("</configuration>\n");
        wrapped
    };

    if !content.contains(OWNERSHIP_MARKER) {
        let marker = format!("<!-- {} -->\n", OWNERSHIP_MARKER);
        let at = if content.starts_with("<?xml") {
            content.find('\n').map(|i| i + 1).unwrap_or(0)
        } else {
            0
        };
        content.insert_str(at, &marker);
    }

    Ok(content)
}

/// Replace the region bounded by the two exact marker lines (inclusive) with a fresh region
/// containing `body`, appended at end-of-file. Bytes outside the region are never touched.
/// Returns whether the file changed.
pub fn upsert_marker_block(
    path: &Path,
    begin: &str,
    end: &str,
    body: &str,
) -> Result<bool, failure::Error> {
    let existed = path.exists();
    let original = if existed {
        std::fs::read_to_string(path)?
    } else {
        String::new()
    };

    let mut content = match find_line(&original, begin) {
        Some(begin_at) => {
            let after_begin = begin_at + begin.len();
            let end_at = find_line(&original[after_begin..], end)
                .map(|i| after_begin + i)
                .ok_or_else(|| TemplateError::UnterminatedBlock {
                    path: path.display().to_string(),
                    begin: begin.into(),
                    end: end.into(),
                })?;

            // Drop the whole region including the end marker line's newline.
            let mut region_end = end_at + end.len();
            if original[region_end..].starts_with('\n') {
                region_end += 1;
            }
            format!("{}{}", &original[..begin_at], &original[region_end..])
        }
        None => original.clone(),
    };

    if !content.is_empty() && !content.ends_with('\n') {
        content.push('\n');
    }
    content.push_str(begin);
    content.push('\n');
    content.push_str(body);
    if !body.is_empty() && !body.ends_with('\n') {
        content.push('\n');
    }
    content.push_str(end);
    content.push('\n');

    write_if_changed(path, existed, &original, &content, begin)
}

/// Write a file this tool owns wholly. `content` must contain the ownership marker (callers put
/// it in a leading comment). Same backup/no-op discipline as the targeted writers.
pub fn write_generated_file(path: &Path, content: &str) -> Result<bool, failure::Error> {
    assert!(content.contains(OWNERSHIP_MARKER));

    let existed = path.exists();
    let original = if existed {
        std::fs::read_to_string(path)?
    } else {
        String::new()
    };

    write_if_changed(path, existed, &original, content, OWNERSHIP_MARKER)
}

/// Find the byte offset of `marker` occurring as an exact, whole line.
fn find_line(text: &str, marker: &str) -> Option<usize> {
    let mut offset = 0;
    for line in text.split('\n') {
        if line == marker {
            return Some(offset);
        }
        offset += line.len() + 1;
    }
    None
}

/// `ownership_marker` is the string whose presence in the pre-existing file proves this tool
/// already owns it (and therefore a backup already exists from the takeover).
fn write_if_changed(
    path: &Path,
    existed: bool,
    original: &str,
    content: &str,
    ownership_marker: &str,
) -> Result<bool, failure::Error> {
    if existed && original == content {
        debug!("{}: already up to date", path.display());
        return Ok(false);
    }

    if existed && !original.contains(ownership_marker) {
        backup(path)?;
    }

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, content)?;
    debug!("{}: updated", path.display());

    Ok(true)
}

fn backup(path: &Path) -> Result<(), failure::Error> {
    let backup_path = format!(
        "{}.bak.{}",
        path.display(),
        Local::now().format("%Y%m%d-%H%M%S")
    );
    std::fs::copy(path, &backup_path)?;
    info!("{}: backed up to {}", path.display(), backup_path);
    Ok(())
}
