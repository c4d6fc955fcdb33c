//! Size strings such as `10G` or `512Mi`.

use crate::ResourceError;

pub const KIB: u64 = 1024;
pub const MIB: u64 = 1024 * KIB;
pub const GIB: u64 = 1024 * MIB;
pub const TIB: u64 = 1024 * GIB;

/// Parse a size string into bytes.
///
/// Units are binary and case-insensitive: `K`, `M`, `G`, `T`, each optionally
/// followed by `i`, `B`, or `iB`. A bare number is bytes.
pub fn parse_size(input: &str) -> Result<u64, ResourceError> {
    let s = input.trim();
    let split = s
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(s.len());
    let (digits, unit) = s.split_at(split);

    if digits.is_empty() {
        return Err(ResourceError::InvalidSize(input.to_string()));
    }
    let value: u64 = digits
        .parse()
        .map_err(|_| ResourceError::InvalidSize(input.to_string()))?;

    let multiplier = match unit.to_ascii_lowercase().as_str() {
        "" | "b" => 1,
        "k" | "ki" | "kb" | "kib" => KIB,
        "m" | "mi" | "mb" | "mib" => MIB,
        "g" | "gi" | "gb" | "gib" => GIB,
        "t" | "ti" | "tb" | "tib" => TIB,
        _ => return Err(ResourceError::InvalidSize(input.to_string())),
    };

    value
        .checked_mul(multiplier)
        .ok_or_else(|| ResourceError::InvalidSize(input.to_string()))
}

/// Format bytes using the largest whole binary unit (`10G`, `1536M`).
pub fn format_size(bytes: u64) -> String {
    for (unit, factor) in [("T", TIB), ("G", GIB), ("M", MIB), ("K", KIB)] {
        if bytes >= factor && bytes % factor == 0 {
            return format!("{}{}", bytes / factor, unit);
        }
    }
    bytes.to_string()
}
