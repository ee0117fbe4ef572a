//! Mapping of client-supplied file names onto the output folder.
//!
//! Names are cleaned as if they were rooted, so `..` can never climb above
//! the output folder. Only `/` separates segments.

use std::path::{Path, PathBuf};

/// Cleans a `/`-separated name: empty and `.` segments are dropped and `..`
/// removes the previous segment (or nothing, at the root).
pub fn clean_name(name: &str) -> String {
    let mut segments: Vec<&str> = Vec::new();
    for segment in name.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                segments.pop();
            }
            other => segments.push(other),
        }
    }
    segments.join("/")
}

/// Final location of an upload.
pub fn destination_path(output_root: &Path, name: &str) -> PathBuf {
    output_root.join(clean_name(name))
}

/// Hidden sibling the atomic mode writes to before renaming. The dot is
/// prefixed to the whole cleaned name, so `a/b.txt` stages at `.a/b.txt`.
pub fn staging_path(output_root: &Path, name: &str) -> PathBuf {
    output_root.join(clean_name(&format!(".{}", clean_name(name))))
}
