// === Constants ===

/// Linux backs `shm_open` with this tmpfs mount.
pub const DEFAULT_SHM_DIR: &str = "/dev/shm";

/// Owner read/write only.
pub const DEFAULT_SEGMENT_MODE: u32 = 0o600;

/// Longest segment name accepted, in bytes (POSIX NAME_MAX).
pub const NAME_MAX: usize = 255;

// === Segment names ===

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum NameError {
    #[error("name is empty")]
    Empty,
    #[error("name must not contain '/' after the leading one")]
    Slash,
    #[error("name must not contain NUL bytes")]
    Nul,
    #[error("name is longer than {} bytes", NAME_MAX)]
    TooLong,
    #[error("name is reserved")]
    Reserved,
}

/// Validate a segment name and strip the optional leading `/` of the
/// `shm_open` spelling, so `"/demo"` and `"demo"` name the same segment.
pub fn normalize_segment_name(name: &str) -> Result<&str, NameError> {
    let bare = name.strip_prefix('/').unwrap_or(name);
    if bare.is_empty() {
        return Err(NameError::Empty);
    }
    if bare.contains('/') {
        return Err(NameError::Slash);
    }
    if bare.contains('\0') {
        return Err(NameError::Nul);
    }
    if bare.len() > NAME_MAX {
        return Err(NameError::TooLong);
    }
    if bare == "." || bare == ".." {
        return Err(NameError::Reserved);
    }
    Ok(bare)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_strips_leading_slash() {
        assert_eq!(normalize_segment_name("/demo"), Ok("demo"));
        assert_eq!(normalize_segment_name("demo"), Ok("demo"));
    }

    #[test]
    fn test_normalize_rejects_bad_names() {
        assert_eq!(normalize_segment_name(""), Err(NameError::Empty));
        assert_eq!(normalize_segment_name("/"), Err(NameError::Empty));
        assert_eq!(normalize_segment_name("a/b"), Err(NameError::Slash));
        assert_eq!(normalize_segment_name("//a"), Err(NameError::Slash));
        assert_eq!(normalize_segment_name("a\0b"), Err(NameError::Nul));
        assert_eq!(normalize_segment_name(".."), Err(NameError::Reserved));

        let long = "x".repeat(NAME_MAX + 1);
        assert_eq!(normalize_segment_name(&long), Err(NameError::TooLong));
        let max = "x".repeat(NAME_MAX);
        assert!(normalize_segment_name(&max).is_ok());
    }
}
