use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Read, Write};
use std::path::{Component, Path, PathBuf};

use serde::Serialize;
use tracing::{debug, warn};

use crate::error::PathError;

type Result<T> = std::result::Result<T, PathError>;

/// What the caller intends to do with a path.  Only writes tolerate
/// missing segments, since their parents are created on demand.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Intent {
    Read,
    Write,
    Delete,
    List,
}

impl Intent {
    fn allows_missing(self) -> bool {
        matches!(self, Intent::Write)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryKind {
    File,
    Dir,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ListEntry {
    pub name: String,
    pub kind: EntryKind,
}

impl fmt::Display for ListEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            EntryKind::File => write!(f, "[file] {}", self.name),
            EntryKind::Dir => write!(f, "[dir] {}", self.name),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WriteOutcome {
    pub bytes_written: usize,
    pub path: String,
}

/// Scratch-root filesystem.  All file I/O is confined to one directory and
/// no operation ever follows a symbolic link.
///
/// Nothing is cached between calls: every operation re-runs the full check
/// because the tree can change underneath us.
#[derive(Debug, Clone)]
pub struct ScratchFs {
    root: PathBuf,
}

impl ScratchFs {
    /// The root is made absolute and normalized once.  It is not created
    /// here; the first write creates it.
    pub fn new(root: impl AsRef<Path>) -> Result<Self> {
        let root = normalize(&std::path::absolute(root.as_ref())?);
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve a caller-supplied path for the given intent.  Returns the real
    /// (symlink-free) absolute path inside the scratch root.
    pub fn resolve(&self, raw: &str, intent: Intent) -> Result<PathBuf> {
        if raw.trim().is_empty() {
            return Err(PathError::EmptyPath);
        }

        if has_traversal(raw) {
            warn!(path = %raw, root = %self.root.display(), "path traversal rejected");
            return Err(PathError::TraversalRejected(raw.to_string()));
        }

        let candidate = self.candidate(raw)?;
        if candidate == self.root && intent != Intent::List {
            return Err(PathError::NotAFile(raw.to_string()));
        }

        self.reject_symlinks(&candidate, intent.allows_missing(), raw)?;

        if intent == Intent::Write {
            if let Some(parent) = candidate.parent() {
                fs::create_dir_all(parent)?;
            }
            // A link may have been planted between the walk and the mkdir.
            self.reject_symlinks(&candidate, true, raw)?;
        }

        let real = self.confine(&candidate, raw)?;
        check_kind(&real, intent, raw)?;
        debug!(path = %raw, resolved = %real.display(), ?intent, "path resolved");
        Ok(real)
    }

    pub fn read_to_string(&self, raw: &str) -> Result<String> {
        let real = self.resolve(raw, Intent::Read)?;
        let mut file = open_nofollow(&real, OpenOptions::new().read(true))?;
        let mut contents = String::new();
        file.read_to_string(&mut contents)?;
        Ok(contents)
    }

    pub fn write(&self, raw: &str, data: &[u8]) -> Result<WriteOutcome> {
        let real = self.resolve(raw, Intent::Write)?;
        let mut file = open_nofollow(
            &real,
            OpenOptions::new().write(true).create(true).truncate(true),
        )?;
        file.write_all(data)?;
        Ok(WriteOutcome {
            bytes_written: data.len(),
            path: self.display_path(&real),
        })
    }

    /// Remove a file.  `remove_file` unlinks the entry itself and never
    /// follows a link.
    pub fn delete(&self, raw: &str) -> Result<String> {
        let real = self.resolve(raw, Intent::Delete)?;
        fs::remove_file(&real)?;
        Ok(self.display_path(&real))
    }

    /// List a directory (the scratch root when `raw` is absent or blank).
    /// Symbolic links are omitted from the listing.
    pub fn list(&self, raw: Option<&str>) -> Result<Vec<ListEntry>> {
        let raw = raw.map(str::trim).filter(|s| !s.is_empty());
        let dir = match raw {
            Some(p) => self.resolve(p, Intent::List)?,
            None => {
                if fs::symlink_metadata(&self.root).is_err() {
                    return Ok(Vec::new());
                }
                self.resolve(".", Intent::List)?
            }
        };

        let mut entries = Vec::new();
        for entry in fs::read_dir(&dir)? {
            let entry = entry?;
            let file_type = entry.file_type()?;
            let name = entry.file_name().to_string_lossy().into_owned();
            let kind = if file_type.is_symlink() {
                debug!(name = %name, "skipping symlink in listing");
                continue;
            } else if file_type.is_dir() {
                EntryKind::Dir
            } else {
                EntryKind::File
            };
            entries.push(ListEntry { name, kind });
        }
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }

    /// Scratch-relative, `/`-separated form of a resolved path.
    pub fn display_path(&self, real: &Path) -> String {
        let real_root = fs::canonicalize(&self.root).unwrap_or_else(|_| self.root.clone());
        let rel = real
            .strip_prefix(&real_root)
            .or_else(|_| real.strip_prefix(&self.root))
            .unwrap_or(real);
        rel.components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/")
    }

    /// Lexical absolute form of `raw`.  Absolute inputs are accepted only
    /// when they already sit under the root (in its given or real form).
    fn candidate(&self, raw: &str) -> Result<PathBuf> {
        let p = Path::new(raw);
        if !p.is_absolute() {
            return Ok(normalize(&self.root.join(p)));
        }

        let abs = normalize(p);
        if abs.starts_with(&self.root) {
            return Ok(abs);
        }
        if let Ok(real_root) = fs::canonicalize(&self.root) {
            if let Ok(rest) = abs.strip_prefix(&real_root) {
                return Ok(self.root.join(rest));
            }
        }

        warn!(path = %raw, root = %self.root.display(), "absolute path outside scratch root");
        Err(PathError::EscapesRoot(raw.to_string()))
    }

    /// `lstat` every segment below the root, failing on the first link.
    fn reject_symlinks(&self, candidate: &Path, allow_missing: bool, raw: &str) -> Result<()> {
        let rel = candidate
            .strip_prefix(&self.root)
            .map_err(|_| PathError::EscapesRoot(raw.to_string()))?;

        let mut current = self.root.clone();
        for component in rel.components() {
            current.push(component);
            match fs::symlink_metadata(&current) {
                Ok(meta) if meta.file_type().is_symlink() => {
                    warn!(
                        path = %raw,
                        link = %current.display(),
                        "symbolic link in path rejected"
                    );
                    return Err(PathError::SymlinkRejected(raw.to_string()));
                }
                Ok(_) => {}
                Err(e) if e.kind() == ErrorKind::NotFound => {
                    if allow_missing {
                        return Ok(());
                    }
                    return Err(PathError::NotFound(raw.to_string()));
                }
                Err(e) if e.kind() == ErrorKind::NotADirectory => {
                    return Err(PathError::NotADirectory(raw.to_string()));
                }
                Err(e) => return Err(PathError::Io(e)),
            }
        }
        Ok(())
    }

    /// Compare real paths of the root and the candidate's parent.
    fn confine(&self, candidate: &Path, raw: &str) -> Result<PathBuf> {
        let real_root = canonicalize(&self.root, raw)?;
        if candidate == self.root {
            return Ok(real_root);
        }

        let (Some(parent), Some(name)) = (candidate.parent(), candidate.file_name()) else {
            return Err(PathError::EscapesRoot(raw.to_string()));
        };
        let real_parent = canonicalize(parent, raw)?;
        if !real_parent.starts_with(&real_root) {
            warn!(
                path = %raw,
                resolved_parent = %real_parent.display(),
                root = %real_root.display(),
                "path escapes scratch root"
            );
            return Err(PathError::EscapesRoot(raw.to_string()));
        }
        Ok(real_parent.join(name))
    }
}

fn check_kind(real: &Path, intent: Intent, raw: &str) -> Result<()> {
    let meta = match fs::symlink_metadata(real) {
        Ok(meta) => meta,
        Err(e) if e.kind() == ErrorKind::NotFound => {
            return match intent {
                Intent::Write => Ok(()),
                _ => Err(PathError::NotFound(raw.to_string())),
            };
        }
        Err(e) => return Err(PathError::Io(e)),
    };

    if meta.file_type().is_symlink() {
        return Err(PathError::SymlinkRejected(raw.to_string()));
    }
    match intent {
        Intent::List if !meta.is_dir() => Err(PathError::NotADirectory(raw.to_string())),
        Intent::Read | Intent::Delete if !meta.is_file() => {
            Err(PathError::NotAFile(raw.to_string()))
        }
        Intent::Write if meta.is_dir() => Err(PathError::NotAFile(raw.to_string())),
        _ => Ok(()),
    }
}

fn canonicalize(path: &Path, raw: &str) -> Result<PathBuf> {
    fs::canonicalize(path).map_err(|e| match e.kind() {
        ErrorKind::NotFound => PathError::NotFound(raw.to_string()),
        _ => PathError::Io(e),
    })
}

/// `..` as a segment, with either separator.
fn has_traversal(raw: &str) -> bool {
    raw.split(['/', '\\']).any(|segment| segment == "..")
}

/// Drop `.` segments and fold `..` lexically.  Caller input never reaches
/// here with `..`; only the configured root can carry one.
fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other),
        }
    }
    out
}

fn open_nofollow(path: &Path, opts: &mut OpenOptions) -> std::io::Result<File> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        opts.custom_flags(libc::O_NOFOLLOW);
    }
    opts.open(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch() -> (tempfile::TempDir, ScratchFs) {
        let tmp = tempfile::tempdir().unwrap();
        let fs = ScratchFs::new(tmp.path().join("scratch")).unwrap();
        (tmp, fs)
    }

    #[test]
    fn write_then_read_round_trip() {
        let (_tmp, sfs) = scratch();
        let out = sfs.write("notes/today.txt", b"hello").unwrap();
        assert_eq!(out.bytes_written, 5);
        assert_eq!(out.path, "notes/today.txt");
        assert_eq!(sfs.read_to_string("notes/today.txt").unwrap(), "hello");
    }

    #[test]
    fn empty_path_rejected() {
        let (_tmp, sfs) = scratch();
        assert!(matches!(sfs.resolve("", Intent::Read), Err(PathError::EmptyPath)));
        assert!(matches!(sfs.resolve("   ", Intent::Write), Err(PathError::EmptyPath)));
    }

    #[test]
    fn traversal_rejected_before_any_io() {
        let (tmp, sfs) = scratch();
        for p in ["../etc/passwd", "a/../../escape.txt", "..", "a/..", "..\\etc\\passwd"] {
            assert!(
                matches!(sfs.resolve(p, Intent::Write), Err(PathError::TraversalRejected(_))),
                "{p} should be rejected"
            );
        }
        // Nothing was created, not even the root.
        assert!(!tmp.path().join("scratch").exists());
        assert!(!tmp.path().join("escape.txt").exists());
    }

    #[test]
    fn dotted_names_are_not_traversal() {
        let (_tmp, sfs) = scratch();
        assert!(sfs.write("..hidden", b"x").is_ok());
        assert!(sfs.write("a/...b/c.txt", b"x").is_ok());
        assert!(sfs.write("./plain.txt", b"x").is_ok());
        assert_eq!(sfs.read_to_string("plain.txt").unwrap(), "x");
    }

    #[test]
    fn absolute_path_outside_root_rejected() {
        let (_tmp, sfs) = scratch();
        assert!(matches!(
            sfs.resolve("/etc/passwd", Intent::Read),
            Err(PathError::EscapesRoot(_))
        ));
        assert!(matches!(
            sfs.resolve("/tmp/elsewhere.txt", Intent::Write),
            Err(PathError::EscapesRoot(_))
        ));
    }

    #[test]
    fn absolute_path_inside_root_accepted() {
        let (_tmp, sfs) = scratch();
        sfs.write("inside.txt", b"ok").unwrap();
        let abs = sfs.root().join("inside.txt");
        assert_eq!(sfs.read_to_string(abs.to_str().unwrap()).unwrap(), "ok");
    }

    #[test]
    fn root_itself_is_not_a_file_target() {
        let (_tmp, sfs) = scratch();
        sfs.write("x.txt", b"x").unwrap();
        let root = sfs.root().to_str().unwrap().to_string();
        assert!(matches!(sfs.resolve(&root, Intent::Read), Err(PathError::NotAFile(_))));
        assert!(matches!(sfs.resolve(".", Intent::Delete), Err(PathError::NotAFile(_))));
        assert!(sfs.resolve(".", Intent::List).is_ok());
    }

    #[test]
    fn read_missing_is_not_found() {
        let (_tmp, sfs) = scratch();
        assert!(matches!(sfs.read_to_string("nope.txt"), Err(PathError::NotFound(_))));
        sfs.write("exists.txt", b"").unwrap();
        assert!(matches!(sfs.read_to_string("dir/nope.txt"), Err(PathError::NotFound(_))));
    }

    #[test]
    fn type_mismatch_errors() {
        let (_tmp, sfs) = scratch();
        sfs.write("dir/file.txt", b"data").unwrap();
        assert!(matches!(sfs.read_to_string("dir"), Err(PathError::NotAFile(_))));
        assert!(matches!(sfs.delete("dir"), Err(PathError::NotAFile(_))));
        assert!(matches!(sfs.write("dir", b"x"), Err(PathError::NotAFile(_))));
        assert!(matches!(sfs.list(Some("dir/file.txt")), Err(PathError::NotADirectory(_))));
    }

    #[test]
    fn delete_removes_file() {
        let (_tmp, sfs) = scratch();
        sfs.write("bye.txt", b"bye").unwrap();
        assert_eq!(sfs.delete("bye.txt").unwrap(), "bye.txt");
        assert!(matches!(sfs.delete("bye.txt"), Err(PathError::NotFound(_))));
    }

    #[test]
    fn list_tags_entries_sorted() {
        let (_tmp, sfs) = scratch();
        assert!(sfs.list(None).unwrap().is_empty());
        sfs.write("b.txt", b"").unwrap();
        sfs.write("a/inner.txt", b"").unwrap();
        let entries = sfs.list(None).unwrap();
        let rendered: Vec<String> = entries.iter().map(|e| e.to_string()).collect();
        assert_eq!(rendered, vec!["[dir] a", "[file] b.txt"]);
        let inner = sfs.list(Some("a")).unwrap();
        assert_eq!(inner[0].name, "inner.txt");
        assert_eq!(inner[0].kind, EntryKind::File);
    }

    #[cfg(unix)]
    #[test]
    fn symlinked_directory_defeated_for_every_intent() {
        let (_tmp, sfs) = scratch();
        sfs.write("tmp/keep.txt", b"").unwrap();
        std::os::unix::fs::symlink("/etc", sfs.root().join("tmp/link")).unwrap();

        assert!(matches!(sfs.read_to_string("tmp/link/passwd"), Err(PathError::SymlinkRejected(_))));
        assert!(matches!(sfs.write("tmp/link/passwd", b"x"), Err(PathError::SymlinkRejected(_))));
        assert!(matches!(sfs.delete("tmp/link/passwd"), Err(PathError::SymlinkRejected(_))));
        assert!(matches!(sfs.list(Some("tmp/link")), Err(PathError::SymlinkRejected(_))));
    }

    #[cfg(unix)]
    #[test]
    fn symlinked_file_defeated() {
        let (tmp, sfs) = scratch();
        let outside = tmp.path().join("outside.txt");
        std::fs::write(&outside, "secret").unwrap();
        sfs.write("keep.txt", b"").unwrap();
        std::os::unix::fs::symlink(&outside, sfs.root().join("alias.txt")).unwrap();

        assert!(matches!(sfs.read_to_string("alias.txt"), Err(PathError::SymlinkRejected(_))));
        assert!(matches!(sfs.write("alias.txt", b"pwned"), Err(PathError::SymlinkRejected(_))));
        assert!(matches!(sfs.delete("alias.txt"), Err(PathError::SymlinkRejected(_))));
        assert_eq!(std::fs::read_to_string(&outside).unwrap(), "secret");

        // The link is not listed either.
        let names: Vec<String> = sfs.list(None).unwrap().into_iter().map(|e| e.name).collect();
        assert_eq!(names, vec!["keep.txt"]);
    }

    #[cfg(unix)]
    #[test]
    fn symlinked_root_parent_still_confined() {
        let tmp = tempfile::tempdir().unwrap();
        let real = tmp.path().join("real");
        std::fs::create_dir_all(&real).unwrap();
        let alias = tmp.path().join("alias");
        std::os::unix::fs::symlink(&real, &alias).unwrap();

        // A root reached through a link is fine; only links below it are refused.
        let sfs = ScratchFs::new(&alias).unwrap();
        sfs.write("f.txt", b"ok").unwrap();
        assert_eq!(std::fs::read_to_string(real.join("f.txt")).unwrap(), "ok");
        let via_real = real.join("f.txt");
        assert_eq!(sfs.read_to_string(via_real.to_str().unwrap()).unwrap(), "ok");
    }

    #[test]
    fn file_as_intermediate_directory() {
        let (_tmp, sfs) = scratch();
        sfs.write("plain.txt", b"").unwrap();
        assert!(sfs.read_to_string("plain.txt/child").is_err());
        assert!(sfs.write("plain.txt/child", b"x").is_err());
    }
}
