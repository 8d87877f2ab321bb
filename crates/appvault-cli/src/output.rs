//! Formatted output helpers for CLI commands.
//!
//! Provides the terminal colors used by every command and human-readable
//! byte formatting for image sizes.

pub const BOLD: &str = "\x1b[1m";
pub const DIM: &str = "\x1b[2m";
pub const GREEN: &str = "\x1b[32m";
pub const CYAN: &str = "\x1b[36m";
pub const YELLOW: &str = "\x1b[33m";
pub const RED: &str = "\x1b[31m";
pub const RESET: &str = "\x1b[0m";

/// Formats a byte count into a human-readable string (e.g., "128 MiB").
#[allow(clippy::cast_precision_loss)]
#[must_use]
pub fn format_bytes(bytes: u64) -> String {
    const KIB: u64 = 1024;
    const MIB: u64 = KIB * 1024;
    const GIB: u64 = MIB * 1024;
    const TIB: u64 = GIB * 1024;

    if bytes >= TIB {
        format!("{:.1} TiB", bytes as f64 / TIB as f64)
    } else if bytes >= GIB {
        format!("{:.1} GiB", bytes as f64 / GIB as f64)
    } else if bytes >= MIB {
        format!("{:.1} MiB", bytes as f64 / MIB as f64)
    } else if bytes >= KIB {
        format!("{:.1} KiB", bytes as f64 / KIB as f64)
    } else {
        format!("{bytes} B")
    }
}

/// Renders a yes/no state as a colored word.
#[must_use]
pub fn flag(on: bool, yes: &str, no: &str) -> String {
    if on {
        format!("{GREEN}{yes}{RESET}")
    } else {
        format!("{DIM}{no}{RESET}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_bytes_displays_bytes() {
        assert_eq!(format_bytes(512), "512 B");
    }

    #[test]
    fn format_bytes_displays_mib() {
        assert_eq!(format_bytes(134_217_728), "128.0 MiB");
    }

    #[test]
    fn format_bytes_displays_tib() {
        assert_eq!(format_bytes(10 * 1024 * 1024 * 1024 * 1024), "10.0 TiB");
    }

    #[test]
    fn flag_wraps_the_matching_word() {
        assert!(flag(true, "mounted", "-").contains("mounted"));
        assert!(flag(false, "mounted", "-").ends_with(&format!("-{RESET}")));
    }
}
