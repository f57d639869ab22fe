//! Interned path components ([`Atom`]) and paths ([`Path`]).
//!
//! Both tables are process wide and append only. Interning a string twice
//! returns the same handle, so equality is pointer identity and a `Path`
//! is a cheap `Copy` value that can be stored in maps and passed across
//! threads freely. Interned data is never freed.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Mutex;

use lazy_static::lazy_static;

#[derive(thiserror::Error, Debug)]
pub enum PathError {
    #[error("invalid path {0:?}")]
    InvalidPath(String),
}

/// An interned, immutable path component.
///
/// Total order is byte-wise on the component string; equality is pointer
/// identity.
#[derive(Clone, Copy)]
pub struct Atom(&'static str);

lazy_static! {
    static ref ATOMS: Mutex<HashMap<String, &'static str>> = Mutex::new(HashMap::new());
    static ref PATHS: Mutex<HashMap<String, &'static PathData>> = Mutex::new(HashMap::new());
    static ref ROOT: &'static PathData = Box::leak(Box::new(PathData {
        parent: None,
        name: Atom::lookup(""),
        depth: 0,
        full: "",
    }));
}

impl Atom {
    /// Intern a component string.
    pub fn lookup(s: &str) -> Atom {
        let mut table = ATOMS.lock().unwrap();
        if let Some(&interned) = table.get(s) {
            return Atom(interned);
        }
        let leaked: &'static str = Box::leak(s.to_string().into_boxed_str());
        table.insert(s.to_string(), leaked);
        Atom(leaked)
    }

    pub fn as_str(&self) -> &'static str {
        self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl PartialEq for Atom {
    fn eq(&self, other: &Atom) -> bool {
        std::ptr::eq(self.0, other.0)
    }
}

impl Eq for Atom {}

impl PartialOrd for Atom {
    fn partial_cmp(&self, other: &Atom) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Atom {
    fn cmp(&self, other: &Atom) -> Ordering {
        self.0.as_bytes().cmp(other.0.as_bytes())
    }
}

impl Hash for Atom {
    fn hash<H: Hasher>(&self, state: &mut H) {
        state.write_usize(self.0.as_ptr() as usize);
    }
}

impl fmt::Display for Atom {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.0)
    }
}

impl fmt::Debug for Atom {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Atom({:?})", self.0)
    }
}

struct PathData {
    parent: Option<Path>,
    name: Atom,
    depth: u32,
    full: &'static str,
}

/// An interned path: a chain of [`Atom`]s with a precomputed depth and a
/// cached full string.
///
/// The root is the empty string with depth zero. Paths are interned by
/// their canonical string form, so `"a"` and `"/a"` are distinct paths
/// even though both are direct children of the root.
#[derive(Clone, Copy)]
pub struct Path(&'static PathData);

// The drive letter of an absolute native path becomes a first level
// child of the implicit root.
#[cfg(windows)]
fn normalize(s: &str) -> String {
    let mut out = s.replace('\\', "/");
    while out.ends_with('/') {
        out.pop();
    }
    out
}

#[cfg(not(windows))]
fn normalize(s: &str) -> String {
    let mut out = s.to_string();
    while out.ends_with('/') {
        out.pop();
    }
    out
}

/// Parent directory of a canonical path string.
///
/// `dirname("/a")` and `dirname("/a/b/")` style inputs behave as:
///
/// ```text
/// dirname("/a")   -> Some("")      the root
/// dirname("/a/b") -> Some("/a")
/// dirname("a/b")  -> Some("a")
/// dirname("a")    -> None
/// dirname("")     -> None
/// dirname("Z:")   -> Some("")      drive-letter platforms only
/// ```
fn dirname(s: &str) -> Option<&str> {
    if s.is_empty() {
        return None;
    }
    // a bare drive letter is a first level child of the implicit root
    #[cfg(windows)]
    if s.len() == 2 && s.as_bytes()[1] == b':' && s.as_bytes()[0].is_ascii_alphabetic() {
        return Some("");
    }
    match s.rfind('/') {
        Some(0) => Some(""),
        Some(i) => Some(&s[..i]),
        None => None,
    }
}

fn intern(canonical: &str) -> Path {
    if canonical.is_empty() {
        return Path::root();
    }
    if let Some(&data) = PATHS.lock().unwrap().get(canonical) {
        return Path(data);
    }
    let parent = match dirname(canonical) {
        Some(dir) => intern(dir),
        None => Path::root(),
    };
    let name = match canonical.rfind('/') {
        Some(i) => &canonical[i + 1..],
        None => canonical,
    };
    let name = Atom::lookup(name);

    let mut table = PATHS.lock().unwrap();
    // raced with another interner while the lock was released
    if let Some(&data) = table.get(canonical) {
        return Path(data);
    }
    let full: &'static str = Box::leak(canonical.to_string().into_boxed_str());
    let data: &'static PathData = Box::leak(Box::new(PathData {
        parent: Some(parent),
        name,
        depth: parent.0.depth + 1,
        full,
    }));
    table.insert(canonical.to_string(), data);
    Path(data)
}

impl Path {
    pub fn root() -> Path {
        Path(*ROOT)
    }

    /// Intern a path from its string form.
    ///
    /// Separators are normalised, trailing slashes stripped and all
    /// ancestors interned recursively. Paths containing NUL or newline
    /// bytes are rejected.
    pub fn lookup(s: &str) -> Result<Path, PathError> {
        if s.contains('\0') || s.contains('\n') {
            return Err(PathError::InvalidPath(s.to_string()));
        }
        // collapse empty components, keeping absoluteness
        let normalized = normalize(s);
        let absolute = normalized.starts_with('/');
        let joined = normalized
            .split('/')
            .filter(|c| !c.is_empty())
            .collect::<Vec<_>>()
            .join("/");
        let canonical = if absolute {
            format!("/{}", joined)
        } else {
            joined
        };
        Ok(intern(&normalize(&canonical)))
    }

    pub fn is_root(&self) -> bool {
        self.0.depth == 0
    }

    pub fn parent(&self) -> Option<Path> {
        self.0.parent
    }

    pub fn depth(&self) -> usize {
        self.0.depth as usize
    }

    pub fn name(&self) -> Atom {
        self.0.name
    }

    pub fn as_str(&self) -> &'static str {
        self.0.full
    }

    /// The ancestor with the given depth, or `None` if this path is
    /// shallower. `parent_at_depth(depth())` is the path itself.
    pub fn parent_at_depth(&self, depth: usize) -> Option<Path> {
        if depth > self.depth() {
            return None;
        }
        let mut p = *self;
        while p.depth() > depth {
            p = p.parent()?;
        }
        Some(p)
    }

    /// The component atoms from the root down to this path.
    pub fn components(&self) -> Vec<Atom> {
        let mut atoms = Vec::with_capacity(self.depth());
        let mut p = *self;
        while !p.is_root() {
            atoms.push(p.name());
            p = p.parent().unwrap();
        }
        atoms.reverse();
        atoms
    }

    /// The relative path made of the components from index `from` to the
    /// end; `None` when nothing remains.
    pub fn subpath(&self, from: usize) -> Option<Path> {
        let n = self.depth();
        if from >= n {
            return None;
        }
        self.subpath_range(from, n - from)
    }

    /// The relative path made of `len` components starting at `from`.
    /// A zero `len` yields `None`, not the root.
    pub fn subpath_range(&self, from: usize, len: usize) -> Option<Path> {
        if len == 0 || from + len > self.depth() {
            return None;
        }
        let atoms = self.components();
        let joined = atoms[from..from + len]
            .iter()
            .map(|a| a.as_str())
            .collect::<Vec<_>>()
            .join("/");
        Some(intern(&joined))
    }

    /// Append one or more components.
    pub fn append(&self, s: &str) -> Result<Path, PathError> {
        if self.is_root() {
            return Path::lookup(s);
        }
        Path::lookup(&format!("{}/{}", self.0.full, s))
    }

    /// The path placed below `dir`: `p.prepend(d)` is `d/p`.
    pub fn prepend(&self, dir: Path) -> Path {
        if self.is_root() {
            return dir;
        }
        if dir.is_root() {
            return *self;
        }
        let tail = self.0.full.trim_start_matches('/');
        intern(&format!("{}/{}", dir.0.full, tail))
    }

    /// The same final component grafted under a new parent.
    pub fn reparent(&self, new_parent: Path) -> Path {
        if self.is_root() {
            return new_parent;
        }
        if new_parent.is_root() {
            return intern(self.0.name.as_str());
        }
        intern(&format!("{}/{}", new_parent.0.full, self.0.name))
    }

    /// Deepest ancestor shared by both paths; `None` when only the root
    /// is shared.
    pub fn common_prefix(a: Path, b: Path) -> Option<Path> {
        let d = a.depth().min(b.depth());
        let mut pa = a.parent_at_depth(d)?;
        let mut pb = b.parent_at_depth(d)?;
        while pa != pb {
            pa = pa.parent()?;
            pb = pb.parent()?;
        }
        if pa.is_root() {
            None
        } else {
            Some(pa)
        }
    }
}

impl PartialEq for Path {
    fn eq(&self, other: &Path) -> bool {
        std::ptr::eq(self.0, other.0)
    }
}

impl Eq for Path {}

impl Hash for Path {
    fn hash<H: Hasher>(&self, state: &mut H) {
        state.write_usize(self.0 as *const PathData as usize);
    }
}

impl fmt::Display for Path {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.0.full)
    }
}

impl fmt::Debug for Path {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Path({:?})", self.0.full)
    }
}

/// Drop the canonical tables so benchmarks and test scaffolds do not
/// accumulate interned strings across runs. Handles created earlier stay
/// valid but are no longer canonical.
#[doc(hidden)]
pub fn reset_interners() {
    ATOMS.lock().unwrap().clear();
    PATHS.lock().unwrap().clear();
}
