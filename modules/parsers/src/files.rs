//! `find -printf '%m\t%p\n'` output: octal permission bits, a tab, then the path.

use fleetaudit_core::FileEntry;

pub fn parse_file_listing(output: &str) -> Vec<FileEntry> {
    output
        .lines()
        .filter_map(|line| {
            let (mode, path) = line.trim_end_matches('\r').split_once('\t')?;
            let permissions = u32::from_str_radix(mode.trim(), 8).ok()?;
            if path.is_empty() {
                return None;
            }
            Some(FileEntry { path: path.to_string(), permissions })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_modes_and_paths_with_spaces() {
        let files = parse_file_listing("644\t/etc/passwd\n600\t/root/my notes.txt\n4755\t/usr/bin/sudo\n");
        assert_eq!(files.len(), 3);
        assert_eq!(files[0], FileEntry { path: "/etc/passwd".into(), permissions: 0o644 });
        assert_eq!(files[1].path, "/root/my notes.txt");
        assert_eq!(files[2].permissions, 0o4755);
    }

    #[test]
    fn skips_noise() {
        let files = parse_file_listing("find: '/proc/1/fd': Permission denied\n999\t/x\n\t/y\n644\t\n");
        assert!(files.is_empty());
    }
}
