use std::path::{Path, PathBuf};

pub const STORE_DIR: [&str; 2] = [".convo_guard", "conversations"];

#[must_use]
pub fn store_root(base: &Path) -> PathBuf {
    base.join(STORE_DIR[0]).join(STORE_DIR[1])
}

#[must_use]
pub fn sanitize_for_filename(value: &str) -> String {
    value
        .chars()
        .map(|c| match c {
            ':' | '/' | '\\' | ' ' | '.' => '-',
            _ => c,
        })
        .collect()
}

#[must_use]
pub fn conversation_file_name(conversation_id: &str) -> String {
    format!("{}.jsonl", sanitize_for_filename(conversation_id))
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use super::{conversation_file_name, store_root};

    #[test]
    fn file_names_cannot_escape_the_store_root() {
        assert_eq!(conversation_file_name("../etc/passwd"), "---etc-passwd.jsonl");
        assert_eq!(conversation_file_name("abc-123"), "abc-123.jsonl");
    }

    #[test]
    fn store_root_is_nested_under_base() {
        assert_eq!(
            store_root(Path::new("/srv/app")),
            Path::new("/srv/app/.convo_guard/conversations")
        );
    }
}
