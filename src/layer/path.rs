//! Lexical path cleaning for layer entries.

/// Why a path cannot be used inside a layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathProblem {
    /// Cleans to the layer root itself (`""`, `.`, `/`, `a/..`).
    Root,
    /// Climbs above the layer root (`../etc/passwd`).
    EscapesRoot,
    /// Contains a NUL byte.
    Nul,
}

impl std::fmt::Display for PathProblem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PathProblem::Root => write!(f, "path resolves to the layer root"),
            PathProblem::EscapesRoot => write!(f, "path escapes the layer root"),
            PathProblem::Nul => write!(f, "path contains a NUL byte"),
        }
    }
}

/// Clean `name` into a relative, slash-separated layer path.
///
/// Redundant separators and `.` components are dropped and `..` is resolved
/// lexically. A leading `/` is treated as the layer root. The result never
/// starts or ends with `/`.
pub fn normalize(name: &str) -> Result<String, PathProblem> {
    if name.contains('\0') {
        return Err(PathProblem::Nul);
    }

    let mut parts: Vec<&str> = Vec::new();
    for component in name.split('/') {
        match component {
            "" | "." => {}
            ".." => {
                if parts.pop().is_none() {
                    return Err(PathProblem::EscapesRoot);
                }
            }
            other => parts.push(other),
        }
    }

    if parts.is_empty() {
        return Err(PathProblem::Root);
    }
    Ok(parts.join("/"))
}
