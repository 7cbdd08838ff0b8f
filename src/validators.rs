//! Input validation and sanitization primitives
//!
//! Field-level checks shared by the rule validator and configuration
//! loading. Everything that ends up on a firewall command line passes through
//! here first.

/// Maximum length of a rule description
pub const MAX_DESCRIPTION_LEN: usize = 256;

/// Sanitizes a description for safe use in backend rule comments.
///
/// Removes control characters, quotes, and shell metacharacters.
/// Limits length to 64 bytes (ASCII characters only).
///
/// # Examples
///
/// ```
/// use hostfw::validators::sanitize_comment;
///
/// let safe = sanitize_comment("Web frontends");
/// assert_eq!(safe, "Web frontends");
///
/// let unsafe_comment = "Test\nNewline\"Quote";
/// let safe = sanitize_comment(unsafe_comment);
/// assert!(!safe.contains('\n'));
/// assert!(!safe.contains('"'));
/// ```
pub fn sanitize_comment(input: &str) -> String {
    input
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || matches!(c, ' ' | '-' | '_' | '.'))
        .take(64)
        .collect::<String>()
        .trim()
        .to_string()
}

/// Validates a free-text description.
///
/// # Errors
///
/// Returns `Err` if the description exceeds [`MAX_DESCRIPTION_LEN`] bytes or
/// contains control characters.
pub fn validate_description(input: &str) -> Result<String, String> {
    let trimmed = input.trim();
    if trimmed.len() > MAX_DESCRIPTION_LEN {
        return Err(format!(
            "Description too long (max {MAX_DESCRIPTION_LEN} characters)"
        ));
    }
    if trimmed.chars().any(char::is_control) {
        return Err("Description contains control characters".to_string());
    }
    Ok(trimmed.to_string())
}

/// Validates a single port number.
///
/// # Errors
///
/// Returns `Err` if port is 0 (reserved).
pub fn validate_port(port: u16) -> Result<u16, String> {
    if port == 0 {
        Err("Port must be between 1 and 65535".to_string())
    } else {
        Ok(port)
    }
}

/// Validates a port range.
///
/// # Errors
///
/// Returns `Err` if:
/// - Either port is 0
/// - Start port is greater than end port
pub fn validate_port_range(start: u16, end: u16) -> Result<(u16, u16), String> {
    validate_port(start)?;
    validate_port(end)?;

    if start > end {
        Err("Start port must be less than or equal to end port".to_string())
    } else {
        Ok((start, end))
    }
}

/// Parses a port number, rejecting anything outside 1–65535.
///
/// # Errors
///
/// Returns `Err` if the text is not a number in range.
pub fn parse_port(text: &str) -> Result<u16, String> {
    let text = text.trim();
    if text.is_empty() {
        return Err("Port is empty".to_string());
    }
    match text.parse::<u32>() {
        Ok(n) if (1..=65535).contains(&n) => validate_port(u16::try_from(n).unwrap_or(0)),
        Ok(_) => Err(format!("Port {text} is out of range (1-65535)")),
        Err(_) => Err(format!("'{text}' is not a port number")),
    }
}

/// Validates an nftables table or iptables chain name.
///
/// Names reach backend command lines verbatim, so only a conservative
/// character set is allowed.
///
/// # Errors
///
/// Returns `Err` if the name is empty, longer than `max_len`, or contains
/// characters other than ASCII alphanumerics, `_` and `-`.
pub fn validate_object_name(name: &str, max_len: usize) -> Result<String, String> {
    if name.is_empty() {
        return Err("Name cannot be empty".to_string());
    }

    if name.len() > max_len {
        return Err(format!("Name too long (max {max_len} characters)"));
    }

    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-'))
    {
        return Err("Name contains invalid characters (use only a-z, 0-9, _, -)".to_string());
    }

    Ok(name.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize_comment_normal() {
        assert_eq!(sanitize_comment("Normal Label"), "Normal Label");
        assert_eq!(sanitize_comment("Rule_123"), "Rule_123");
    }

    #[test]
    fn test_sanitize_comment_removes_control_chars() {
        assert_eq!(sanitize_comment("Test\nNewline"), "TestNewline");
        assert_eq!(sanitize_comment("Test\0Null"), "TestNull");
    }

    #[test]
    fn test_sanitize_comment_removes_shell_metacharacters() {
        assert_eq!(sanitize_comment("Test$Dollar"), "TestDollar");
        assert_eq!(sanitize_comment("Test`Backtick"), "TestBacktick");
        assert_eq!(sanitize_comment("Test;Semicolon"), "TestSemicolon");
        assert_eq!(sanitize_comment("a:b"), "ab");
    }

    #[test]
    fn test_sanitize_comment_length_limit() {
        let long = "a".repeat(100);
        assert_eq!(sanitize_comment(&long).len(), 64);
    }

    #[test]
    fn test_validate_description() {
        assert_eq!(validate_description("  web  ").unwrap(), "web");
        assert!(validate_description(&"x".repeat(300)).is_err());
        assert!(validate_description("line\nbreak").is_err());
    }

    #[test]
    fn test_validate_port_range() {
        assert!(validate_port_range(80, 443).is_ok());
        assert!(validate_port_range(443, 80).is_err());
        assert!(validate_port_range(0, 80).is_err());
    }

    #[test]
    fn test_parse_port() {
        assert_eq!(parse_port("8080"), Ok(8080));
        assert_eq!(parse_port(" 22 "), Ok(22));
        assert!(parse_port("0").is_err());
        assert!(parse_port("65536").is_err());
        assert!(parse_port("http").is_err());
        assert!(parse_port("").is_err());
    }

    #[test]
    fn test_validate_object_name() {
        assert!(validate_object_name("hostfw", 32).is_ok());
        assert!(validate_object_name("HOSTFW-IN", 28).is_ok());
        assert!(validate_object_name("", 32).is_err());
        assert!(validate_object_name("a b", 32).is_err());
        assert!(validate_object_name("x;rm", 32).is_err());
        assert!(validate_object_name(&"a".repeat(29), 28).is_err());
    }
}
