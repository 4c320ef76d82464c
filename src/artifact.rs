//! Download, extraction, and symlink management for the JDK/Hadoop/Spark tarballs.
//!
//! Installs are versioned: the archive's top-level directory determines a versioned install
//! path under the install base (e.g. `/opt/hadoop-3.3.6`), and a stable symlink (e.g.
//! `/opt/hadoop`) points at the active version. Downloads are cached by filename only -- an
//! upstream that changes content behind the same filename will be silently reused from cache.

use std::path::{Path, PathBuf};
use std::process::Command;

use failure_derive::Fail;
use log::{debug, info};

use crate::common::run_local;

#[derive(Debug, Fail)]
pub enum InstallError {
    #[fail(display = "cannot derive a tarball filename from url `{}`", url)]
    BadUrl { url: String },

    #[fail(display = "downloaded archive {} is not a readable compressed tar", path)]
    CorruptArchive { path: String },

    #[fail(
        display = "package structure anomaly: {} contains {} top-level entries (expected exactly one directory)",
        archive, found
    )]
    PackageStructureAnomaly { archive: String, found: usize },

    #[fail(
        display = "install looks broken: `{}` missing under {}",
        marker, symlink
    )]
    MissingMarker { symlink: String, marker: String },
}

/// What to install and where to point the stable symlink.
#[derive(Debug, Clone)]
pub struct ArtifactSpec {
    /// Short name used in messages and scratch paths ("jdk", "hadoop", "spark").
    pub name: String,
    pub url: String,
    pub install_base: PathBuf,
    /// Stable version-independent symlink, e.g. `/opt/hadoop`.
    pub symlink: PathBuf,
    /// Path relative to the symlink that must exist after a successful install.
    pub marker_exe: String,
}

#[derive(Debug, PartialEq)]
pub enum InstallOutcome {
    Installed(PathBuf),
    /// The versioned target already existed and `force` was off; nothing was written to it.
    SkippedExisting(PathBuf),
}

pub fn ensure_installed(
    spec: &ArtifactSpec,
    cache_dir: &Path,
    force: bool,
) -> Result<InstallOutcome, failure::Error> {
    std::fs::create_dir_all(cache_dir)?;
    std::fs::create_dir_all(&spec.install_base)?;

    let tarball = cache_dir.join(url_basename(&spec.url)?);
    if !tarball.exists() {
        download(&spec.url, &tarball)?;
    } else {
        debug!("{}: using cached {}", spec.name, tarball.display());
    }

    // Readability gate: a corrupt or partial archive fails the whole install rather than
    // leaving a half-extracted tree behind.
    let listing = list_archive(&tarball)?;
    let topdir = single_topdir(&tarball, &listing)?;

    let version = version_suffix(&spec.name, &topdir);
    let target = spec.install_base.join(format!("{}-{}", spec.name, version));

    if target.exists() && !force {
        info!(
            "{}: {} already installed, skipping (use --force to reinstall)",
            spec.name,
            target.display()
        );
        repoint_symlink(&spec.symlink, &target)?;
        check_marker(spec)?;
        return Ok(InstallOutcome::SkippedExisting(target));
    }

    info!("{}: installing {} -> {}", spec.name, topdir, target.display());

    // Extract to a scratch directory on the same filesystem as the target so the final move is
    // a rename.
    let scratch = spec.install_base.join(format!(".{}-extract", spec.name));
    if scratch.exists() {
        std::fs::remove_dir_all(&scratch)?;
    }
    std::fs::create_dir_all(&scratch)?;

    run_local(
        "tar extract",
        Command::new("tar")
            .arg("-xzf")
            .arg(&tarball)
            .arg("-C")
            .arg(&scratch),
    )?;

    let extracted = extracted_topdir(&tarball, &scratch)?;

    if target.exists() {
        std::fs::remove_dir_all(&target)?;
    }
    std::fs::rename(&extracted, &target)?;
    std::fs::remove_dir_all(&scratch)?;

    repoint_symlink(&spec.symlink, &target)?;
    check_marker(spec)?;

    Ok(InstallOutcome::Installed(target))
}

fn download(url: &str, dest: &Path) -> Result<(), failure::Error> {
    info!("downloading {}", url);

    // Download to a .part file and rename on success so an interrupted transfer never
    // poisons the cache.
    let part = dest.with_extension("part");
    run_local(
        "download",
        Command::new("curl")
            .arg("-fSL")
            .arg("--retry")
            .arg("2")
            .arg("-o")
            .arg(&part)
            .arg(url),
    )?;
    std::fs::rename(&part, dest)?;

    Ok(())
}

fn list_archive(tarball: &Path) -> Result<Vec<String>, failure::Error> {
    let out = run_local(
        "tar list",
        Command::new("tar").arg("-tzf").arg(tarball),
    )
    .map_err(|_| InstallError::CorruptArchive {
        path: tarball.display().to_string(),
    })?;

    Ok(String::from_utf8_lossy(&out.stdout)
        .lines()
        .map(|l| l.to_owned())
        .collect())
}

/// The single top-level directory named by every entry of the archive.
fn single_topdir(tarball: &Path, listing: &[String]) -> Result<String, failure::Error> {
    let mut tops: Vec<&str> = listing
        .iter()
        .filter_map(|entry| entry.split('/').next())
        .filter(|t| !t.is_empty())
        .collect();
    tops.sort_unstable();
    tops.dedup();

    if tops.len() != 1 {
        return Err(InstallError::PackageStructureAnomaly {
            archive: tarball.display().to_string(),
            found: tops.len(),
        }
        .into());
    }

    Ok(tops[0].to_owned())
}

/// The version suffix from the archive's top-level directory name: `hadoop-3.3.6` installed as
/// artifact `hadoop` yields `3.3.6`; names that don't lead with the artifact name fall back to
/// the text after the last dash.
fn version_suffix(name: &str, topdir: &str) -> String {
    match topdir.strip_prefix(&format!("{}-", name)) {
        Some(rest) => rest.to_owned(),
        None => topdir.rsplit('-').next().unwrap_or(topdir).to_owned(),
    }
}

fn url_basename(url: &str) -> Result<&str, InstallError> {
    match url.rsplit('/').next() {
        Some(name) if !name.is_empty() && name != url => Ok(name),
        _ => Err(InstallError::BadUrl { url: url.into() }),
    }
}

fn extracted_topdir(tarball: &Path, scratch: &Path) -> Result<PathBuf, failure::Error> {
    let mut dirs = Vec::new();
    for entry in std::fs::read_dir(scratch)? {
        dirs.push(entry?.path());
    }

    match dirs.as_slice() {
        [single] if single.is_dir() => Ok(single.clone()),
        _ => Err(InstallError::PackageStructureAnomaly {
            archive: tarball.display().to_string(),
            found: dirs.len(),
        }
        .into()),
    }
}

/// Point the stable symlink at `target`. Remove-then-create, not an atomic rename: a crash
/// between the two steps leaves the symlink absent. Accepted, since installs are manual and
/// never concurrent.
fn repoint_symlink(symlink: &Path, target: &Path) -> Result<(), failure::Error> {
    if let Ok(existing) = std::fs::read_link(symlink) {
        if existing == *target {
            return Ok(());
        }
    }

    if symlink.symlink_metadata().is_ok() {
        std::fs::remove_file(symlink)?;
    }
    std::os::unix::fs::symlink(target, symlink)?;
    debug!("{} -> {}", symlink.display(), target.display());

    Ok(())
}

/// After a successful install the symlink must resolve to a tree containing the artifact's
/// marker executable.
fn check_marker(spec: &ArtifactSpec) -> Result<(), failure::Error> {
    if !spec.symlink.join(&spec.marker_exe).exists() {
        return Err(InstallError::MissingMarker {
            symlink: spec.symlink.display().to_string(),
            marker: spec.marker_exe.clone(),
        }
        .into());
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn url_basenames() {
        assert_eq!(
            url_basename("https://example.com/dl/hadoop-3.3.6.tar.gz").unwrap(),
            "hadoop-3.3.6.tar.gz"
        );
        assert!(url_basename("hadoop-3.3.6.tar.gz").is_err());
        assert!(url_basename("https://example.com/dl/").is_err());
    }

    #[test]
    fn version_suffixes() {
        assert_eq!(version_suffix("hadoop", "hadoop-3.3.6"), "3.3.6");
        assert_eq!(version_suffix("jdk", "jdk-17.0.2"), "17.0.2");
        // Spark's top-level dir embeds the Hadoop flavor; the whole remainder is the version.
        assert_eq!(
            version_suffix("spark", "spark-3.5.1-bin-hadoop3"),
            "3.5.1-bin-hadoop3"
        );
        // Unrecognized leading name: fall back to the last dash-separated field.
        assert_eq!(version_suffix("jdk", "openjdk17u-build"), "build");
    }

    #[test]
    fn single_topdir_rejects_anomalies() {
        let tarball = Path::new("x.tar.gz");

        let ok = vec![
            "hadoop-3.3.6/".to_owned(),
            "hadoop-3.3.6/bin/".to_owned(),
            "hadoop-3.3.6/bin/hdfs".to_owned(),
        ];
        assert_eq!(single_topdir(tarball, &ok).unwrap(), "hadoop-3.3.6");

        let two = vec!["a/x".to_owned(), "b/y".to_owned()];
        assert!(single_topdir(tarball, &two).is_err());

        let none: Vec<String> = vec![];
        assert!(single_topdir(tarball, &none).is_err());
    }

    #[test]
    fn repoint_replaces_stale_symlink() {
        let dir = tempfile::tempdir().unwrap();
        let old = dir.path().join("app-1.0");
        let new = dir.path().join("app-2.0");
        std::fs::create_dir(&old).unwrap();
        std::fs::create_dir(&new).unwrap();

        let link = dir.path().join("app");
        repoint_symlink(&link, &old).unwrap();
        assert_eq!(std::fs::read_link(&link).unwrap(), old);

        repoint_symlink(&link, &new).unwrap();
        assert_eq!(std::fs::read_link(&link).unwrap(), new);

        // Re-pointing at the same target is a no-op.
        repoint_symlink(&link, &new).unwrap();
        assert_eq!(std::fs::read_link(&link).unwrap(), new);
    }

    /// End-to-end over a real (tiny) tarball pre-placed in the cache, so no network is touched.
    #[test]
    fn install_skip_and_force() {
        let dir = tempfile::tempdir().unwrap();
        let cache = dir.path().join("cache");
        let base = dir.path().join("opt");
        std::fs::create_dir_all(&cache).unwrap();

        // Build `widget-1.2.tar.gz` containing widget-1.2/bin/widget.
        let build = dir.path().join("build");
        std::fs::create_dir_all(build.join("widget-1.2/bin")).unwrap();
        std::fs::write(build.join("widget-1.2/bin/widget"), "v1\n").unwrap();
        let status = std::process::Command::new("tar")
            .arg("-czf")
            .arg(cache.join("widget-1.2.tar.gz"))
            .arg("-C")
            .arg(&build)
            .arg("widget-1.2")
            .status()
            .unwrap();
        assert!(status.success());

        let spec = ArtifactSpec {
            name: "widget".into(),
            url: "https://example.com/widget-1.2.tar.gz".into(),
            install_base: base.clone(),
            symlink: base.join("widget"),
            marker_exe: "bin/widget".into(),
        };

        // Fresh install.
        let outcome = ensure_installed(&spec, &cache, false).unwrap();
        let target = base.join("widget-1.2");
        assert_eq!(outcome, InstallOutcome::Installed(target.clone()));
        assert_eq!(std::fs::read_link(&spec.symlink).unwrap(), target);
        assert_eq!(
            std::fs::read_to_string(target.join("bin/widget")).unwrap(),
            "v1\n"
        );

        // Second run skips and leaves the tree untouched.
        std::fs::write(target.join("bin/widget"), "locally modified\n").unwrap();
        let outcome = ensure_installed(&spec, &cache, false).unwrap();
        assert_eq!(outcome, InstallOutcome::SkippedExisting(target.clone()));
        assert_eq!(
            std::fs::read_to_string(target.join("bin/widget")).unwrap(),
            "locally modified\n"
        );

        // Force fully replaces the install.
        let outcome = ensure_installed(&spec, &cache, true).unwrap();
        assert_eq!(outcome, InstallOutcome::Installed(target.clone()));
        assert_eq!(
            std::fs::read_to_string(target.join("bin/widget")).unwrap(),
            "v1\n"
        );
    }
}
