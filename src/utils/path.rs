use std::io::ErrorKind;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use log::error;

fn is_executable_file(path: &Path) -> bool {
    match path.metadata() {
        Ok(meta) => meta.is_file() && meta.permissions().mode() & 0o111 != 0,
        Err(e) => {
            if e.kind() != ErrorKind::NotFound {
                error!("jobsh: metadata error: {}: {}", path.display(), e);
            }
            false
        }
    }
}

fn candidates<'a>(filename: &'a str, search_path: &'a str) -> impl Iterator<Item = PathBuf> + 'a {
    let valid = !filename.is_empty() && !filename.contains('/');
    search_path
        .split(':')
        .filter(move |_| valid)
        .map(|dir| if dir.is_empty() { Path::new(".") } else { Path::new(dir) })
        .map(move |dir| dir.join(filename))
}

/// Resolves `filename` against a colon separated search path. An empty
/// entry means the current directory.
pub fn find_in_path(filename: &str, search_path: &str) -> Option<PathBuf> {
    candidates(filename, search_path).find(|candidate| is_executable_file(candidate))
}

/// Like [`find_in_path`], but without an executable match the first plain
/// file of that name is returned, so running it fails with a permission
/// error instead of "not found".
pub fn resolve_command(filename: &str, search_path: &str) -> Option<PathBuf> {
    find_in_path(filename, search_path).or_else(|| {
        candidates(filename, search_path).find(|candidate| candidate.is_file())
    })
}
