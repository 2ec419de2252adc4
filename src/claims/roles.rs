//! Privilege levels used by the permission resolver.
//!
//! Subjects carry simple numeric levels that map to human-readable roles. Higher values
//! imply a superset of lower capabilities. Use [role_name] for display.

/// Role / privilege level constants
pub const LEVEL_PLAYER: u8 = 1;
pub const LEVEL_TRUSTED: u8 = 5;
pub const LEVEL_ADMIN: u8 = 10;

/// Return the human-readable role name for a numeric level.
///
/// Levels ≥10 are treated as "Administrator", ≥5 as "Trusted", otherwise "Player".
pub fn role_name(level: u8) -> &'static str {
    match level {
        l if l >= LEVEL_ADMIN => "Administrator",
        l if l >= LEVEL_TRUSTED => "Trusted",
        _ => "Player",
    }
}

/// Trusted players and administrators bypass every territory check.
pub fn is_privileged(level: u8) -> bool {
    level >= LEVEL_TRUSTED
}
