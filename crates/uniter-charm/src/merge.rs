//! Three-way merge of charm trees.
//!
//! The merge works path by path over three manifests: the common ancestor
//! (`base`, the last committed revision), the working copy (`ours`) and the
//! new revision (`theirs`). For each path:
//!
//! - if ours and theirs agree, keep it;
//! - if only one side changed it relative to base, take that side;
//! - otherwise both changed it differently: a conflict.
//!
//! Forced merges settle every conflict in favour of theirs. Unforced merges
//! record the conflict and leave a best-effort result in the tree: text
//! files get conflict markers, everything else keeps our version.
//!
//! A second pass catches file/directory clashes (one side has a file where
//! the other has a directory) that the per-path rule cannot see.

use std::collections::BTreeSet;

use crate::error::Result;
use crate::manifest::{FileEntry, Manifest};
use crate::objects::ObjectStore;

/// The outcome of a three-way merge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeResult {
    /// The tree to check out.
    pub manifest: Manifest,
    /// Paths that could not be merged, in order.
    pub conflicts: Vec<String>,
}

impl MergeResult {
    /// Returns true if the merge produced no conflicts.
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.conflicts.is_empty()
    }
}

/// Merge `ours` and `theirs` against their common ancestor `base`.
///
/// # Errors
///
/// Returns `CharmError::Io` if object contents needed for conflict markers
/// cannot be read or stored.
pub fn merge(
    base: &Manifest,
    ours: &Manifest,
    theirs: &Manifest,
    forced: bool,
    objects: &ObjectStore,
) -> Result<MergeResult> {
    let paths: BTreeSet<&String> = base.paths().chain(ours.paths()).chain(theirs.paths()).collect();

    let mut manifest = Manifest::new();
    let mut conflicts = BTreeSet::new();
    for path in paths {
        let (b, o, t) = (base.get(path), ours.get(path), theirs.get(path));
        let merged = if o == t || b == o {
            t.cloned()
        } else if b == t {
            o.cloned()
        } else if forced {
            t.cloned()
        } else {
            conflicts.insert(path.clone());
            conflicted_entry(o, t, objects)?
        };
        if let Some(entry) = merged {
            manifest.insert(path.clone(), entry);
        }
    }

    resolve_clashes(&mut manifest, ours, theirs, forced, &mut conflicts);

    Ok(MergeResult {
        manifest,
        conflicts: conflicts.into_iter().collect(),
    })
}

/// What to leave in the working tree for a path both sides changed.
fn conflicted_entry(
    ours: Option<&FileEntry>,
    theirs: Option<&FileEntry>,
    objects: &ObjectStore,
) -> Result<Option<FileEntry>> {
    let (Some(o), Some(t)) = (ours, theirs) else {
        // One side deleted the file: keep whichever side still has it.
        return Ok(ours.or(theirs).cloned());
    };
    let ours_data = objects.get(&o.object)?;
    let theirs_data = objects.get(&t.object)?;
    let (Ok(ours_text), Ok(theirs_text)) = (
        std::str::from_utf8(&ours_data),
        std::str::from_utf8(&theirs_data),
    ) else {
        return Ok(Some(o.clone()));
    };
    let marked = conflict_markers(ours_text, theirs_text);
    Ok(Some(FileEntry {
        object: objects.put(marked.as_bytes())?,
        executable: o.executable,
    }))
}

fn conflict_markers(ours: &str, theirs: &str) -> String {
    let mut out = String::from("<<<<<<< ours\n");
    out.push_str(ours);
    if !ours.is_empty() && !ours.ends_with('\n') {
        out.push('\n');
    }
    out.push_str("=======\n");
    out.push_str(theirs);
    if !theirs.is_empty() && !theirs.ends_with('\n') {
        out.push('\n');
    }
    out.push_str(">>>>>>> theirs\n");
    out
}

/// Fix paths that are a file in the result while also being a directory of
/// other files in the result.
fn resolve_clashes(
    manifest: &mut Manifest,
    ours: &Manifest,
    theirs: &Manifest,
    forced: bool,
    conflicts: &mut BTreeSet<String>,
) {
    loop {
        let clashes = find_clashes(manifest);
        if clashes.is_empty() {
            return;
        }
        for (file, nested) in clashes {
            for path in [file, nested] {
                let current = manifest.get(&path).cloned();
                let keep = if forced {
                    theirs.get(&path).cloned()
                } else {
                    ours.get(&path).cloned()
                };
                if current == keep {
                    continue;
                }
                match keep {
                    Some(entry) => manifest.insert(path.clone(), entry),
                    None => {
                        manifest.remove(&path);
                    }
                }
                if !forced {
                    conflicts.insert(path);
                }
            }
        }
    }
}

/// Pairs of `(file, path under it)` that cannot coexist on disk.
fn find_clashes(manifest: &Manifest) -> Vec<(String, String)> {
    let mut clashes = Vec::new();
    for path in manifest.paths() {
        let mut end = 0;
        while let Some(pos) = path[end..].find('/') {
            let ancestor = &path[..end + pos];
            if manifest.contains(ancestor) {
                clashes.push((ancestor.to_string(), path.clone()));
            }
            end += pos + 1;
        }
    }
    clashes
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bundle::BundleFile;
    use tempfile::TempDir;

    fn tree(objects: &ObjectStore, files: &[(&str, &str)]) -> Manifest {
        let files: Vec<BundleFile> = files
            .iter()
            .map(|(path, data)| BundleFile {
                path: (*path).to_string(),
                executable: false,
                data: data.as_bytes().to_vec(),
            })
            .collect();
        Manifest::stage(&files, objects).unwrap()
    }

    fn contents(objects: &ObjectStore, manifest: &Manifest, path: &str) -> String {
        String::from_utf8(objects.get(&manifest.get(path).unwrap().object).unwrap()).unwrap()
    }

    fn setup() -> (TempDir, ObjectStore) {
        let dir = TempDir::new().unwrap();
        let objects = ObjectStore::open(dir.path()).unwrap();
        (dir, objects)
    }

    #[test]
    fn clean_merge_combines_both_sides() {
        let (_dir, objects) = setup();
        let base = tree(&objects, &[("hooks/start", "v0"), ("readme", "r0")]);
        let ours = tree(
            &objects,
            &[("hooks/start", "v0"), ("readme", "r0-local"), ("data", "STARTDATA\n")],
        );
        let theirs = tree(&objects, &[("hooks/start", "v1"), ("readme", "r0"), ("new", "n")]);

        let result = merge(&base, &ours, &theirs, false, &objects).unwrap();
        assert!(result.is_clean());
        assert_eq!(contents(&objects, &result.manifest, "hooks/start"), "v1");
        assert_eq!(contents(&objects, &result.manifest, "readme"), "r0-local");
        assert_eq!(contents(&objects, &result.manifest, "data"), "STARTDATA\n");
        assert_eq!(contents(&objects, &result.manifest, "new"), "n");
    }

    #[test]
    fn deletions_follow_the_changing_side() {
        let (_dir, objects) = setup();
        let base = tree(&objects, &[("a", "1"), ("b", "1")]);
        let ours = tree(&objects, &[("b", "1")]);
        let theirs = tree(&objects, &[("a", "1")]);

        let result = merge(&base, &ours, &theirs, false, &objects).unwrap();
        assert!(result.is_clean());
        assert!(result.manifest.is_empty());
    }

    #[test]
    fn both_added_differently_conflicts_with_markers() {
        let (_dir, objects) = setup();
        let base = tree(&objects, &[]);
        let ours = tree(&objects, &[("data", "STARTDATA\n")]);
        let theirs = tree(&objects, &[("data", "nelson\n"), ("ignore", "anything")]);

        let result = merge(&base, &ours, &theirs, false, &objects).unwrap();
        assert_eq!(result.conflicts, ["data"]);
        assert_eq!(
            contents(&objects, &result.manifest, "data"),
            "<<<<<<< ours\nSTARTDATA\n=======\nnelson\n>>>>>>> theirs\n"
        );
        assert_eq!(contents(&objects, &result.manifest, "ignore"), "anything");
    }

    #[test]
    fn forced_merge_takes_theirs_and_keeps_untouched_files() {
        let (_dir, objects) = setup();
        let base = tree(&objects, &[("conf", "base")]);
        let ours = tree(&objects, &[("conf", "mine"), ("notes", "user")]);
        let theirs = tree(&objects, &[("conf", "theirs")]);

        let result = merge(&base, &ours, &theirs, true, &objects).unwrap();
        assert!(result.is_clean());
        assert_eq!(contents(&objects, &result.manifest, "conf"), "theirs");
        assert_eq!(contents(&objects, &result.manifest, "notes"), "user");
    }

    #[test]
    fn modify_delete_conflict_keeps_surviving_side() {
        let (_dir, objects) = setup();
        let base = tree(&objects, &[("conf", "base")]);
        let ours = tree(&objects, &[("conf", "mine")]);
        let theirs = tree(&objects, &[]);

        let result = merge(&base, &ours, &theirs, false, &objects).unwrap();
        assert_eq!(result.conflicts, ["conf"]);
        assert_eq!(contents(&objects, &result.manifest, "conf"), "mine");

        let forced = merge(&base, &ours, &theirs, true, &objects).unwrap();
        assert!(forced.is_clean());
        assert!(!forced.manifest.contains("conf"));
    }

    #[test]
    fn file_directory_clash() {
        let (_dir, objects) = setup();
        let base = tree(&objects, &[]);
        let ours = tree(&objects, &[("data/mine", "user")]);
        let theirs = tree(&objects, &[("data", "file")]);

        let result = merge(&base, &ours, &theirs, false, &objects).unwrap();
        assert_eq!(result.conflicts, ["data"]);
        assert!(!result.manifest.contains("data"));
        assert!(result.manifest.contains("data/mine"));

        let forced = merge(&base, &ours, &theirs, true, &objects).unwrap();
        assert!(forced.is_clean());
        assert!(forced.manifest.contains("data"));
        assert!(!forced.manifest.contains("data/mine"));
    }
}
