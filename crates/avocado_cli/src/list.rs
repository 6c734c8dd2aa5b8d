//! `avocado list`: what references resolve to, without running anything.

use std::collections::BTreeMap;
use std::io;

use avocado_resolver::{ReferenceResolution, ResolutionResult};
use avocado_utils::runnable::{Runnable, Tags};
use termcolor::{Color, ColorSpec, WriteColor};

/// `fast,net:ipv4,net:ipv6`
fn format_tags(tags: &Tags) -> String {
    let mut parts = Vec::new();
    for (key, values) in tags {
        if values.is_empty() {
            parts.push(key.clone());
        } else {
            parts.extend(values.iter().map(|value| format!("{key}:{value}")));
        }
    }
    parts.join(",")
}

fn pad(writer: &mut impl io::Write, used: usize, width: usize) -> io::Result<()> {
    write!(writer, "{:1$}", "", width.saturating_sub(used) + 1)
}

fn write_kind(writer: &mut impl WriteColor, kind: &str) -> io::Result<()> {
    writer.set_color(ColorSpec::new().set_fg(Some(Color::Cyan)))?;
    write!(writer, "{kind}")?;
    writer.reset()
}

/// Writes one line per resolved runnable. Verbose listings add a header, a
/// tags column, a count per kind and every reference that did not resolve.
pub fn render(
    writer: &mut impl WriteColor,
    resolutions: &[ReferenceResolution],
    verbose: bool,
) -> io::Result<()> {
    let runnables: Vec<&Runnable> = resolutions.iter().flat_map(|r| &r.resolutions).collect();
    let uris: Vec<&str> = runnables
        .iter()
        .map(|r| r.uri.as_deref().unwrap_or_default())
        .collect();

    let header_kind = if verbose { "Type".len() } else { 0 };
    let kind_width = runnables
        .iter()
        .map(|r| r.kind.len())
        .chain([header_kind])
        .max()
        .unwrap_or_default();
    let uri_width = uris.iter().map(|u| u.len()).chain(["Test".len()]).max().unwrap_or_default();

    if verbose {
        write!(writer, "Type")?;
        pad(writer, "Type".len(), kind_width)?;
        write!(writer, "Test")?;
        pad(writer, "Test".len(), uri_width)?;
        writeln!(writer, "Tag(s)")?;
    }

    for (runnable, uri) in runnables.iter().zip(&uris) {
        write_kind(writer, &runnable.kind)?;
        pad(writer, runnable.kind.len(), kind_width)?;
        let tags = format_tags(&runnable.tags);
        if verbose && !tags.is_empty() {
            write!(writer, "{uri}")?;
            pad(writer, uri.len(), uri_width)?;
            writeln!(writer, "{tags}")?;
        } else {
            writeln!(writer, "{uri}")?;
        }
    }

    if !verbose {
        return Ok(());
    }

    let mut by_kind: BTreeMap<&str, usize> = BTreeMap::new();
    for runnable in &runnables {
        *by_kind.entry(runnable.kind.as_str()).or_default() += 1;
    }
    if !by_kind.is_empty() {
        writeln!(writer)?;
        writeln!(writer, "TEST TYPES SUMMARY")?;
        writeln!(writer, "==================")?;
        for (kind, count) in by_kind {
            writeln!(writer, "{kind}: {count}")?;
        }
    }

    let unresolved: Vec<&ReferenceResolution> = resolutions
        .iter()
        .filter(|r| r.result != ResolutionResult::Success)
        .collect();
    if !unresolved.is_empty() {
        writeln!(writer)?;
        writeln!(writer, "UNRESOLVED REFERENCES")?;
        writeln!(writer, "=====================")?;
        for resolution in unresolved {
            write!(writer, "{} ({})", resolution.reference, resolution.result)?;
            if let Some(origin) = &resolution.origin {
                write!(writer, " by {origin}")?;
            }
            match resolution.info.as_deref() {
                Some(info) if !info.is_empty() => writeln!(writer, ": {info}")?,
                _ => writeln!(writer)?,
            }
        }
    }
    Ok(())
}
