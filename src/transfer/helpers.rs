use std::path::{Path, PathBuf};

use super::enumeration::FileEntry;

/// Final path component of a remote path string.
pub fn basename(path: &str) -> &str {
    path.trim_end_matches('/').rsplit('/').next().unwrap_or(path)
}

/// Whether the destination should be treated as a directory to copy into.
pub fn dest_is_dir(dest: &str) -> bool {
    dest.ends_with('/') || Path::new(dest).is_dir()
}

/// Map one enumerated file to its local target.
///
/// `literal_single` is the narrow case where the destination names the
/// output file itself: exactly one source argument, no wildcard, and the
/// enumeration produced exactly one file from a non-directory root. In
/// every other case the destination acts as a directory: directory roots
/// keep their top-level name (`dest/<root>/<relative>`), loose files from
/// wildcard matches land flat (`dest/<basename>`).
pub fn local_target_for(file: &FileEntry, dest: &str, literal_single: bool) -> PathBuf {
    let dest_path = Path::new(dest);
    if literal_single {
        if dest_is_dir(dest) {
            return dest_path.join(basename(&file.relative_path));
        }
        return dest_path.to_path_buf();
    }
    if file.matched_root_is_dir {
        dest_path.join(basename(&file.matched_root)).join(&file.relative_path)
    } else {
        dest_path.join(basename(&file.full_path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(full: &str, rel: &str, root: &str, root_is_dir: bool) -> FileEntry {
        FileEntry {
            relative_path: rel.to_string(),
            full_path: full.to_string(),
            size: 1,
            mode: 0o644,
            mtime: 0,
            matched_root: root.to_string(),
            matched_root_is_dir: root_is_dir,
        }
    }

    #[test]
    fn basename_handles_plain_and_trailing_slash() {
        assert_eq!(basename("/srv/dir"), "dir");
        assert_eq!(basename("/srv/dir/"), "dir");
        assert_eq!(basename("file.txt"), "file.txt");
    }

    #[test]
    fn literal_single_uses_dest_as_filename() {
        let f = entry("/srv/data/readme.txt", "readme.txt", "/srv/data/readme.txt", false);
        assert_eq!(
            local_target_for(&f, "./renamed.txt", true),
            PathBuf::from("./renamed.txt")
        );
    }

    #[test]
    fn literal_single_into_directory_keeps_basename() {
        let f = entry("/srv/data/readme.txt", "readme.txt", "/srv/data/readme.txt", false);
        assert_eq!(
            local_target_for(&f, "./out/", true),
            PathBuf::from("./out/readme.txt")
        );
    }

    #[test]
    fn directory_root_preserves_top_level_name() {
        let f = entry("/srv/dir/sub/b.txt", "sub/b.txt", "/srv/dir", true);
        assert_eq!(
            local_target_for(&f, "./dl", false),
            PathBuf::from("./dl/dir/sub/b.txt")
        );
    }

    #[test]
    fn loose_wildcard_matches_copy_flat() {
        let f = entry("/srv/x.log", "x.log", "/srv/x.log", false);
        assert_eq!(local_target_for(&f, "./dl", false), PathBuf::from("./dl/x.log"));
    }
}
