/// Sanitize a filename to remove characters hostile to common filesystems.
pub fn sanitize_filename(filename: &str) -> String {
    filename
        .chars()
        .map(|c| match c {
            '<' | '>' | ':' | '"' | '/' | '\\' | '|' | '?' | '*' => '_',
            _ => c,
        })
        .collect::<String>()
        .trim()
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize_filename() {
        assert_eq!(sanitize_filename("s01/ep1.mp4"), "s01_ep1.mp4");
        assert_eq!(sanitize_filename("normal-name.mp4"), "normal-name.mp4");
        assert_eq!(sanitize_filename("  padded "), "padded");
    }
}
